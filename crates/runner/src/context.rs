//! Per-test context
//!
//! Everything a test body touches hangs off one explicit context owned
//! by the driver: the reporter, the config store, the hugepage
//! negotiator and the checkpoint pool. Two independent contexts share
//! nothing, so several test lifecycles can coexist in one address
//! space without cross-talk.
//!
//! The config store inside the context is process-local: a forked
//! child that mutates tunables restores its own mutations; only the
//! result counters and the checkpoint slots live in shared memory.

use std::path::Path;
use std::sync::Arc;

use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid};
use tempfile::TempDir;

use kerncheck_core::{ExitStatus, Reporter, Result};
use kerncheck_sys::{
    safe_fork, safe_waitpid, ConfigStore, HugepageNegotiator, HugepagePolicy, SaveFlags,
};

use crate::checkpoint::CheckpointPool;
use crate::plan::SaveRestore;

/// State owned by one test lifecycle.
pub struct TestContext {
    reporter: Arc<Reporter>,
    checkpoints: Option<CheckpointPool>,
    /// Save/restore store for kernel tunables.
    pub config: ConfigStore,
    hugepages: HugepageNegotiator,
    scratch: Option<TempDir>,
    forks_child: bool,
    children: Vec<Pid>,
}

impl TestContext {
    pub(crate) fn new(
        reporter: Arc<Reporter>,
        checkpoints: Option<CheckpointPool>,
        forks_child: bool,
        hugepages: HugepageNegotiator,
        scratch: Option<TempDir>,
    ) -> Self {
        TestContext {
            reporter,
            checkpoints,
            config: ConfigStore::new(),
            hugepages,
            scratch,
            forks_child,
            children: Vec::new(),
        }
    }

    /// The context's reporter.
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Record a PASS.
    #[track_caller]
    pub fn pass(&self, message: impl Into<String>) {
        self.reporter.pass(message);
    }

    /// Record a FAIL; execution continues.
    #[track_caller]
    pub fn fail(&self, message: impl Into<String>) {
        self.reporter.fail(message);
    }

    /// Record an INFO diagnostic.
    #[track_caller]
    pub fn info(&self, message: impl Into<String>) {
        self.reporter.info(message);
    }

    /// Record a WARN diagnostic.
    #[track_caller]
    pub fn warn(&self, message: impl Into<String>) {
        self.reporter.warn(message);
    }

    /// The checkpoint pool, BROK if the plan did not request one.
    #[track_caller]
    pub fn checkpoints(&self) -> Result<&CheckpointPool> {
        match &self.checkpoints {
            Some(pool) => Ok(pool),
            None => Err(self
                .reporter
                .broken("checkpoints were not requested by the test plan")),
        }
    }

    /// The test's private scratch directory, removed during cleanup.
    #[track_caller]
    pub fn scratch_dir(&self) -> Result<&Path> {
        match &self.scratch {
            Some(dir) => Ok(dir.path()),
            None => Err(self.reporter.broken("scratch directory is not available")),
        }
    }

    /// Remove the scratch directory and everything in it.
    pub(crate) fn remove_scratch(&mut self) {
        if let Some(dir) = self.scratch.take() {
            if let Err(e) = dir.close() {
                self.reporter.warn(format!("failed to remove scratch dir: {e}"));
            }
        }
    }

    /// Save `path` for restoration at cleanup.
    #[track_caller]
    pub fn save_tunable(&mut self, path: impl AsRef<Path>, flags: SaveFlags) -> Result<bool> {
        self.config.save(&self.reporter, path, flags)
    }

    /// Save `path`, then write `value` to it.
    #[track_caller]
    pub fn save_and_set_tunable(
        &mut self,
        path: impl AsRef<Path>,
        value: &str,
        flags: SaveFlags,
    ) -> Result<()> {
        self.config.save_and_set(&self.reporter, path, value, flags)
    }

    /// The hugepage reservation negotiated so far, if any.
    pub fn hugepage_reservation(&self) -> Option<&kerncheck_sys::HugepageReservation> {
        self.hugepages.reservation()
    }

    /// Negotiate hugepages through the context's config store.
    #[track_caller]
    pub fn request_hugepages(&mut self, count: u64, policy: HugepagePolicy) -> Result<u64> {
        self.hugepages
            .request(&self.reporter, &mut self.config, count, policy)
    }

    /// Apply the plan's save/restore list in declaration order.
    pub(crate) fn apply_save_restore(&mut self, list: &[SaveRestore]) -> Result<()> {
        for entry in list {
            match &entry.new_value {
                Some(value) => {
                    self.config
                        .save_and_set(&self.reporter, &entry.path, value, entry.flags)?
                }
                None => {
                    self.config.save(&self.reporter, &entry.path, entry.flags)?;
                }
            }
        }
        Ok(())
    }

    /// Fork a declared child running `body`.
    ///
    /// The child exits with the verdict code of `body`; its records
    /// land in the shared counters either way. BROK if the plan did
    /// not declare `forks_child`.
    #[track_caller]
    pub fn fork_child(
        &mut self,
        body: impl FnOnce(&mut TestContext) -> Result<()>,
    ) -> Result<Pid> {
        if !self.forks_child {
            return Err(self.reporter.broken("test plan must declare forks_child"));
        }

        match safe_fork(&self.reporter)? {
            ForkResult::Child => {
                // The parent's bookkeeping is not ours, and the
                // inherited entry stack would restore the parent's
                // tunables out from under it.
                self.children.clear();
                self.config = ConfigStore::new();
                let status = match body(self) {
                    Ok(()) => ExitStatus::Passed,
                    Err(e) => ExitStatus::from_error(&e),
                };
                // Each process restores its own mutations; the scratch
                // dir stays with the parent (exit skips Drop).
                self.config.restore_all(&self.reporter, false);
                std::process::exit(status.code());
            }
            ForkResult::Parent { child } => {
                tracing::debug!(%child, "forked test child");
                self.children.push(child);
                Ok(child)
            }
        }
    }

    /// Wait for every declared child, folding verdicts into the run.
    ///
    /// A child that was signaled or exited with an unknown code is
    /// BROK; a child BROK/CONF re-raises here. A child FAIL needs no
    /// action: its records already sit in the shared counters.
    pub fn reap_children(&mut self) -> Result<()> {
        while let Some(pid) = self.children.pop() {
            let status = safe_waitpid(&self.reporter, pid)?;
            self.check_child_status(pid, status)?;
        }
        Ok(())
    }

    fn check_child_status(&self, pid: Pid, status: WaitStatus) -> Result<()> {
        match status {
            WaitStatus::Exited(_, code) => match ExitStatus::from_code(code) {
                Some(ExitStatus::Passed) | Some(ExitStatus::Failed) => Ok(()),
                Some(ExitStatus::Broken) => {
                    Err(self.reporter.broken(format!("reported by child ({pid})")))
                }
                Some(ExitStatus::NotApplicable) => Err(self
                    .reporter
                    .not_supported(format!("reported by child ({pid})"))),
                None => Err(self
                    .reporter
                    .broken(format!("invalid child ({pid}) exit value {code}"))),
            },
            WaitStatus::Signaled(_, signal, _) => Err(self
                .reporter
                .broken(format!("child ({pid}) killed by {signal}"))),
            other => Err(self
                .reporter
                .broken(format!("child ({pid}) wait returned {other:?}"))),
        }
    }
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("forks_child", &self.forks_child)
            .field("children", &self.children)
            .field("pending_restores", &self.config.len())
            .finish()
    }
}
