//! Cross-process checkpoint barrier
//!
//! Rendezvous primitive used to choreograph multi-process scenarios:
//! namespace propagation checks, IPC handshakes, epoll edge-trigger
//! races. Slot ids are integers in `[0, N)` shared by every process in
//! one test's tree only.
//!
//! A slot is a rendezvous, not a mailbox. Waiters take FIFO tickets; a
//! wake blocks until a parked waiter exists, then releases the oldest
//! ticket and returns. A wake is never banked for a future wait, and a
//! process can never consume a wake it delivered itself: releasing only
//! targets tickets issued before the waker's own. `wake_and_wait`
//! performs its handoff and takes its own ticket inside a single
//! critical section, which is what makes same-slot ping-pong
//! handshakes work. There is no ordering across distinct slots, and
//! exclusive use of a slot is a protocol convention, not enforced here.
//!
//! A timed-out wait or wake is always BROK: desynchronization of the
//! process tree is harness-fatal, never a soft failure.

use std::sync::Arc;
use std::time::Duration;

use kerncheck_core::{Reporter, Result, TestError};

use crate::shared::{SharedRegion, Slot};

/// Handle to the slot table in the shared region.
#[derive(Debug, Clone)]
pub struct CheckpointPool {
    region: Arc<SharedRegion>,
}

/// Absolute CLOCK_REALTIME deadline for `timeout` from now.
fn deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + libc::c_long::from(timeout.subsec_nanos());
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

/// Block on the slot condvar until `done` holds or `abs` passes.
///
/// Must be entered with the slot mutex held; returns with it held on
/// success and released on error.
unsafe fn cond_wait_until(
    slot: *mut Slot,
    abs: &libc::timespec,
    on_timeout: impl FnOnce() -> TestError,
    on_failure: impl FnOnce(i32) -> TestError,
    mut done: impl FnMut() -> bool,
) -> Result<()> {
    loop {
        if done() {
            return Ok(());
        }

        let rc = libc::pthread_cond_timedwait(
            std::ptr::addr_of_mut!((*slot).cond),
            std::ptr::addr_of_mut!((*slot).mutex),
            abs,
        );
        if rc == libc::ETIMEDOUT {
            libc::pthread_mutex_unlock(std::ptr::addr_of_mut!((*slot).mutex));
            return Err(on_timeout());
        }
        if rc != 0 && rc != libc::EINTR {
            libc::pthread_mutex_unlock(std::ptr::addr_of_mut!((*slot).mutex));
            return Err(on_failure(rc));
        }
    }
}

impl CheckpointPool {
    /// Pool over the given region's slot table.
    pub fn new(region: Arc<SharedRegion>) -> Self {
        CheckpointPool { region }
    }

    /// Number of usable slot ids.
    pub fn slot_count(&self) -> usize {
        self.region.slot_count()
    }

    #[track_caller]
    fn checked_slot(&self, reporter: &Reporter, id: usize) -> Result<*mut Slot> {
        if id >= self.region.slot_count() {
            return Err(reporter.broken(format!(
                "checkpoint id {id} out of range (have {} slots)",
                self.region.slot_count()
            )));
        }
        Ok(self.region.slot(id))
    }

    /// Block until a wake from another process releases this waiter.
    ///
    /// Genuinely blocking (condvar, no spin-polling). Timeout expiry
    /// reports BROK and unwinds.
    #[track_caller]
    pub fn wait(&self, reporter: &Reporter, id: usize, timeout: Duration) -> Result<()> {
        let slot = self.checked_slot(reporter, id)?;
        let abs = deadline(timeout);

        unsafe {
            let rc = libc::pthread_mutex_lock(std::ptr::addr_of_mut!((*slot).mutex));
            if rc != 0 {
                return Err(reporter.broken(format!("checkpoint mutex lock failed: {rc}")));
            }

            let ticket = (*slot).wait_seq;
            (*slot).wait_seq += 1;
            libc::pthread_cond_broadcast(std::ptr::addr_of_mut!((*slot).cond));

            cond_wait_until(
                slot,
                &abs,
                || reporter.broken(format!("checkpoint {id} wait timed out after {timeout:?}")),
                |rc| reporter.broken(format!("checkpoint wait failed: {rc}")),
                || (*slot).wake_seq > ticket,
            )?;
            libc::pthread_mutex_unlock(std::ptr::addr_of_mut!((*slot).mutex));
        }
        Ok(())
    }

    /// Release the slot's oldest parked waiter.
    ///
    /// Blocks until a waiter exists; a wake with nobody to receive it
    /// within `timeout` is BROK.
    #[track_caller]
    pub fn wake(&self, reporter: &Reporter, id: usize, timeout: Duration) -> Result<()> {
        let slot = self.checked_slot(reporter, id)?;
        let abs = deadline(timeout);

        unsafe {
            let rc = libc::pthread_mutex_lock(std::ptr::addr_of_mut!((*slot).mutex));
            if rc != 0 {
                return Err(reporter.broken(format!("checkpoint mutex lock failed: {rc}")));
            }

            cond_wait_until(
                slot,
                &abs,
                || {
                    reporter.broken(format!(
                        "checkpoint {id} wake found no waiter within {timeout:?}"
                    ))
                },
                |rc| reporter.broken(format!("checkpoint wake failed: {rc}")),
                || (*slot).wait_seq > (*slot).wake_seq,
            )?;
            (*slot).wake_seq += 1;
            libc::pthread_cond_broadcast(std::ptr::addr_of_mut!((*slot).cond));
            libc::pthread_mutex_unlock(std::ptr::addr_of_mut!((*slot).mutex));
        }
        Ok(())
    }

    /// Release the oldest parked waiter, then block for the slot's
    /// next wake.
    ///
    /// The handoff and the caller's own ticket form one critical
    /// section, so the released peer observes the caller already
    /// waiting when it resumes.
    #[track_caller]
    pub fn wake_and_wait(&self, reporter: &Reporter, id: usize, timeout: Duration) -> Result<()> {
        let slot = self.checked_slot(reporter, id)?;
        let abs = deadline(timeout);

        unsafe {
            let rc = libc::pthread_mutex_lock(std::ptr::addr_of_mut!((*slot).mutex));
            if rc != 0 {
                return Err(reporter.broken(format!("checkpoint mutex lock failed: {rc}")));
            }

            cond_wait_until(
                slot,
                &abs,
                || {
                    reporter.broken(format!(
                        "checkpoint {id} wake found no waiter within {timeout:?}"
                    ))
                },
                |rc| reporter.broken(format!("checkpoint wake failed: {rc}")),
                || (*slot).wait_seq > (*slot).wake_seq,
            )?;
            (*slot).wake_seq += 1;

            let ticket = (*slot).wait_seq;
            (*slot).wait_seq += 1;
            libc::pthread_cond_broadcast(std::ptr::addr_of_mut!((*slot).cond));

            cond_wait_until(
                slot,
                &abs,
                || reporter.broken(format!("checkpoint {id} wait timed out after {timeout:?}")),
                |rc| reporter.broken(format!("checkpoint wait failed: {rc}")),
                || (*slot).wake_seq > ticket,
            )?;
            libc::pthread_mutex_unlock(std::ptr::addr_of_mut!((*slot).mutex));
        }
        Ok(())
    }
}
