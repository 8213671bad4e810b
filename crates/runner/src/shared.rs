//! Memory shared across the test's process tree
//!
//! One anonymous `MAP_SHARED` mapping is created before any fork and
//! inherited by every process the test spawns. It carries the run's
//! result counters at its head, followed by the checkpoint slot table.
//! Counters are plain atomics; each slot is a process-shared pthread
//! mutex/condvar pair plus two rendezvous ticket counters.
//!
//! Forked children leave via `process::exit` and never run the
//! teardown; the single in-process owner destroys the slots and unmaps
//! on drop.

use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::Arc;

use kerncheck_core::{CounterSnapshot, CounterStore, Counters, Result, ResultKind, TestError};

/// One checkpoint rendezvous slot.
///
/// `wait_seq` counts tickets taken by waiters, `wake_seq` counts
/// tickets released by wakes; `wait_seq - wake_seq` is the number of
/// parked waiters. A waiter holding ticket `t` runs once
/// `wake_seq > t`; a wake requires `wait_seq > wake_seq` before it may
/// advance `wake_seq`. Both are only touched under the slot mutex.
#[repr(C)]
pub(crate) struct Slot {
    pub(crate) mutex: libc::pthread_mutex_t,
    pub(crate) cond: libc::pthread_cond_t,
    pub(crate) wait_seq: u32,
    pub(crate) wake_seq: u32,
}

impl Slot {
    /// Initialize a slot in place for cross-process use.
    unsafe fn init(slot: *mut Slot) -> std::result::Result<(), i32> {
        let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        libc::pthread_mutexattr_init(mattr.as_mut_ptr());
        libc::pthread_mutexattr_setpshared(mattr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_mutex_init(ptr::addr_of_mut!((*slot).mutex), mattr.as_ptr());
        libc::pthread_mutexattr_destroy(mattr.as_mut_ptr());
        if rc != 0 {
            return Err(rc);
        }

        let mut cattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        libc::pthread_condattr_init(cattr.as_mut_ptr());
        libc::pthread_condattr_setpshared(cattr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_cond_init(ptr::addr_of_mut!((*slot).cond), cattr.as_ptr());
        libc::pthread_condattr_destroy(cattr.as_mut_ptr());
        if rc != 0 {
            libc::pthread_mutex_destroy(ptr::addr_of_mut!((*slot).mutex));
            return Err(rc);
        }

        (*slot).wait_seq = 0;
        (*slot).wake_seq = 0;
        Ok(())
    }

    unsafe fn destroy(slot: *mut Slot) {
        libc::pthread_cond_destroy(ptr::addr_of_mut!((*slot).cond));
        libc::pthread_mutex_destroy(ptr::addr_of_mut!((*slot).mutex));
    }
}

/// The shared mapping: counters header plus checkpoint slot table.
pub struct SharedRegion {
    base: *mut u8,
    len: usize,
    slots: usize,
    slot_offset: usize,
}

// The mapping is shared across processes by construction; in-process
// access goes through atomics and the per-slot mutexes.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map a fresh region with room for `slots` checkpoint slots.
    ///
    /// Must happen before the test tree forks; the mapping is inherited
    /// by every child.
    pub fn new(slots: usize) -> Result<Arc<Self>> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let align = mem::align_of::<Slot>();
        let slot_offset = (mem::size_of::<Counters>() + align - 1) / align * align;
        let want = slot_offset + slots * mem::size_of::<Slot>();
        let len = (want + page - 1) / page * page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(TestError::broken_errno("mmap(shared results region) failed"));
        }
        let base = base as *mut u8;

        unsafe {
            ptr::write(base as *mut Counters, Counters::new());
        }

        let region = SharedRegion {
            base,
            len,
            slots,
            slot_offset,
        };

        for id in 0..slots {
            if let Err(rc) = unsafe { Slot::init(region.slot(id)) } {
                for done in 0..id {
                    unsafe { Slot::destroy(region.slot(done)) };
                }
                unsafe { libc::munmap(base as *mut libc::c_void, len) };
                mem::forget(region);
                return Err(TestError::broken(format!(
                    "checkpoint slot init failed: {}",
                    std::io::Error::from_raw_os_error(rc)
                )));
            }
        }

        Ok(Arc::new(region))
    }

    /// Number of checkpoint slots in the table.
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    fn counters(&self) -> &Counters {
        unsafe { &*(self.base as *const Counters) }
    }

    /// Raw slot pointer; `id` must be below [`Self::slot_count`].
    pub(crate) fn slot(&self, id: usize) -> *mut Slot {
        debug_assert!(id < self.slots);
        unsafe { self.base.add(self.slot_offset).cast::<Slot>().add(id) }
    }
}

impl CounterStore for SharedRegion {
    fn record(&self, kind: ResultKind) {
        self.counters().record(kind);
    }

    fn snapshot(&self) -> CounterSnapshot {
        self.counters().snapshot()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        for id in 0..self.slots {
            unsafe { Slot::destroy(self.slot(id)) };
        }
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len", &self.len)
            .field("slots", &self.slots)
            .field("counters", &self.snapshot())
            .finish()
    }
}
