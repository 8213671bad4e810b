//! Test driver
//!
//! Owns the per-test lifecycle: INIT → SETUP → RUNNING → CLEANUP →
//! EXITED. Cleanup executes exactly once on every path, including a
//! BROK unwind out of setup or a sub-case; a FAIL only marks its
//! sub-case and the remaining sub-cases still run, maximizing
//! diagnostic yield per run.
//!
//! [`Driver::execute`] runs the lifecycle in the calling process and
//! is what unit and integration tests drive. [`Driver::run`] is the
//! guarded production path: the lifecycle runs in a forked child with
//! its own process group, and the parent enforces the whole-test
//! wall-clock timeout by SIGKILLing the group on expiry. There is no
//! way to cooperatively cancel an already-blocked process tree, so the
//! group kill is the timeout of last resort.

use std::io::Write;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setpgid, ForkResult, Pid, Uid};
use tracing::debug;

use kerncheck_core::{
    CounterSnapshot, CounterStore, ExitStatus, LocalCounters, Reporter, Result, TestError,
};
use kerncheck_sys::{HugepageNegotiator, HugepagePolicy, HugepageRequest};

use crate::checkpoint::CheckpointPool;
use crate::context::TestContext;
use crate::plan::{RunMode, TestPlan};
use crate::shared::SharedRegion;

/// Outcome of one in-process lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    /// Final classification.
    pub exit: ExitStatus,
    /// Accounting at exit, including forked children's records.
    pub counters: CounterSnapshot,
}

/// The test lifecycle orchestrator.
pub struct Driver;

impl Driver {
    /// Run the whole lifecycle in the current process.
    pub fn execute(plan: TestPlan) -> RunReport {
        Self::execute_inner(plan, None)
    }

    /// As [`Driver::execute`], with the result stream captured into
    /// `sink` instead of stderr.
    pub fn execute_with_sink(plan: TestPlan, sink: Box<dyn Write + Send>) -> RunReport {
        Self::execute_inner(plan, Some(sink))
    }

    fn execute_inner(plan: TestPlan, sink: Option<Box<dyn Write + Send>>) -> RunReport {
        let TestPlan {
            needs_root,
            checkpoint_slots,
            forks_child,
            hugepages,
            save_restore,
            timeout: _,
            mut setup,
            mut cleanup,
            mut mode,
            hugepage_paths,
        } = plan;

        // INIT: the shared region must exist before anything forks.
        let region = match SharedRegion::new(checkpoint_slots) {
            Ok(region) => region,
            Err(e) => {
                let counters: Arc<dyn CounterStore> = Arc::new(LocalCounters::new());
                let reporter = match sink {
                    Some(sink) => Reporter::with_sink(counters, sink),
                    None => Reporter::new(counters),
                };
                let _ = reporter.broken(format!("cannot set up test ipc: {e}"));
                reporter.summary();
                return RunReport {
                    exit: ExitStatus::Broken,
                    counters: reporter.snapshot(),
                };
            }
        };

        let counters: Arc<dyn CounterStore> = region.clone();
        let reporter = Arc::new(match sink {
            Some(sink) => Reporter::with_sink(counters, sink),
            None => Reporter::new(counters),
        });

        let mut terminal: Option<TestError> = None;

        if let RunMode::Cases { count: 0, .. } = mode {
            terminal = Some(reporter.broken("test plan declares zero sub-cases"));
        }

        if terminal.is_none() && needs_root && !Uid::effective().is_root() {
            terminal = Some(reporter.not_supported("test needs to be run as root"));
        }

        // Scratch dir before any fork so every process sees one path.
        let scratch = match tempfile::Builder::new().prefix("kerncheck-").tempdir() {
            Ok(dir) => Some(dir),
            Err(e) => {
                if terminal.is_none() {
                    terminal = Some(reporter.broken(format!("cannot create scratch dir: {e}")));
                }
                None
            }
        };

        let checkpoints =
            (checkpoint_slots > 0).then(|| CheckpointPool::new(Arc::clone(&region)));
        let negotiator = match hugepage_paths {
            Some((ctrl, meminfo)) => HugepageNegotiator::with_paths(ctrl, meminfo),
            None => HugepageNegotiator::new(),
        };
        let mut ctx = TestContext::new(
            Arc::clone(&reporter),
            checkpoints,
            forks_child,
            negotiator,
            scratch,
        );

        let mut setup_entered = false;
        if terminal.is_none() {
            // SETUP
            setup_entered = true;
            debug!("setup");
            let setup_result = (|| -> Result<()> {
                ctx.apply_save_restore(&save_restore)?;
                match hugepages {
                    HugepageRequest::None => {}
                    HugepageRequest::Request(n) => {
                        ctx.request_hugepages(n, HugepagePolicy::Request)?;
                    }
                    HugepageRequest::Needs(n) => {
                        ctx.request_hugepages(n, HugepagePolicy::Needs)?;
                    }
                }
                if let Some(hook) = setup.as_mut() {
                    hook(&mut ctx)?;
                }
                Ok(())
            })();

            match setup_result {
                // RUNNING: only entered when setup went through; a
                // BROK/CONF out of setup means zero sub-cases run.
                Ok(()) => {
                    debug!("running");
                    if let Err(e) = Self::run_body(&mut ctx, &mut mode) {
                        terminal = Some(e);
                    }
                }
                Err(e) => terminal = Some(e),
            }
        }

        // CLEANUP: exactly once, also after an unwind. BROKs raised
        // while it runs are downgraded to WARN so a broken cleanup
        // step cannot restart the unwind.
        debug!("cleanup");
        reporter.set_cleanup_mode(true);
        if setup_entered {
            if let Some(hook) = cleanup.as_mut() {
                if let Err(e) = hook(&mut ctx) {
                    tracing::warn!(error = %e, "cleanup hook failed");
                }
            }
        }
        ctx.config.restore_all(&reporter, false);
        ctx.remove_scratch();
        reporter.set_cleanup_mode(false);

        // EXITED
        let counters = reporter.snapshot();
        let exit = ExitStatus::classify(&counters, terminal.as_ref());
        reporter.summary();
        RunReport { exit, counters }
    }

    /// Run the plan's body. BROK/CONF short-circuits remaining
    /// sub-cases; declared children are reaped after each sub-case.
    fn run_body(ctx: &mut TestContext, mode: &mut RunMode) -> Result<()> {
        match mode {
            RunMode::Single(run) => {
                run(ctx)?;
                ctx.reap_children()?;
            }
            RunMode::Cases { count, run } => {
                for i in 0..*count {
                    run(ctx, i)?;
                    ctx.reap_children()?;
                }
            }
        }
        Ok(())
    }

    /// Guarded run: fork the lifecycle into its own process group and
    /// enforce the plan's wall-clock timeout from the parent.
    pub fn run(plan: TestPlan) -> ExitStatus {
        let timeout = plan.timeout();

        match unsafe { fork() } {
            Err(e) => {
                eprintln!("cannot fork test process: {e}");
                ExitStatus::Broken
            }
            Ok(ForkResult::Child) => {
                let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
                let report = Self::execute(plan);
                std::process::exit(report.exit.code());
            }
            Ok(ForkResult::Parent { child }) => {
                // Mirror the child's setpgid to close the window where
                // a group kill would miss it.
                let _ = setpgid(child, child);

                let (tx, rx) = mpsc::channel();
                let waiter = thread::spawn(move || {
                    let _ = tx.send(waitpid(child, None));
                });

                let status = match rx.recv_timeout(timeout) {
                    Ok(status) => status,
                    Err(RecvTimeoutError::Timeout) => {
                        eprintln!("Test timed out after {timeout:?}, sending SIGKILL");
                        let _ = killpg(child, Signal::SIGKILL);
                        // The group was killed by the harness: the run
                        // is broken no matter how the child died.
                        let _ = rx.recv();
                        let _ = waiter.join();
                        return ExitStatus::Broken;
                    }
                    Err(RecvTimeoutError::Disconnected) => Err(nix::errno::Errno::ECHILD),
                };
                let _ = waiter.join();

                match status {
                    Ok(WaitStatus::Exited(_, code)) => {
                        ExitStatus::from_code(code).unwrap_or(ExitStatus::Broken)
                    }
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        eprintln!("Test killed by {signal}!");
                        ExitStatus::Broken
                    }
                    _ => ExitStatus::Broken,
                }
            }
        }
    }
}
