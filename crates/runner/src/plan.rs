//! Declarative test plan
//!
//! A plan states everything the driver needs to know up front: required
//! privileges, checkpoint slots, forked children, hugepage needs, the
//! tunables to save/restore, lifecycle hooks, the execution mode and
//! the whole-test timeout.
//!
//! The execution mode is a sum type: a plan is either one whole-test
//! entry point or N numbered sub-cases, never an ambiguous set of
//! optional function pointers.

use std::path::PathBuf;
use std::time::Duration;

use kerncheck_core::Result;
use kerncheck_sys::{HugepageRequest, SaveFlags};

use crate::context::TestContext;

/// Default whole-test wall-clock timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Lifecycle hook: setup, cleanup, or a whole-test body.
pub type Hook = Box<dyn FnMut(&mut TestContext) -> Result<()>>;
/// Numbered sub-case body.
pub type CaseHook = Box<dyn FnMut(&mut TestContext, usize) -> Result<()>>;

/// How the test's body executes.
pub enum RunMode {
    /// One whole-test entry point.
    Single(Hook),
    /// `count` numbered sub-cases, invoked in order.
    Cases {
        /// Number of sub-cases.
        count: usize,
        /// The per-sub-case body.
        run: CaseHook,
    },
}

impl std::fmt::Debug for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Single(_) => f.write_str("Single"),
            RunMode::Cases { count, .. } => write!(f, "Cases({count})"),
        }
    }
}

/// One tunable to save (and optionally set) during SETUP.
#[derive(Debug, Clone)]
pub struct SaveRestore {
    /// Absolute proc/sys path.
    pub path: PathBuf,
    /// Value to write after saving; `None` saves only.
    pub new_value: Option<String>,
    /// Tolerance flags (`?` and `!` sigils).
    pub flags: SaveFlags,
}

/// The declarative descriptor the driver consumes.
pub struct TestPlan {
    pub(crate) needs_root: bool,
    pub(crate) checkpoint_slots: usize,
    pub(crate) forks_child: bool,
    pub(crate) hugepages: HugepageRequest,
    pub(crate) save_restore: Vec<SaveRestore>,
    pub(crate) timeout: Duration,
    pub(crate) setup: Option<Hook>,
    pub(crate) cleanup: Option<Hook>,
    pub(crate) mode: RunMode,
    pub(crate) hugepage_paths: Option<(PathBuf, PathBuf)>,
}

impl TestPlan {
    /// Plan with one whole-test entry point.
    pub fn single(test: impl FnMut(&mut TestContext) -> Result<()> + 'static) -> TestPlanBuilder {
        TestPlanBuilder::new(RunMode::Single(Box::new(test)))
    }

    /// Plan with `count` numbered sub-cases.
    pub fn cases(
        count: usize,
        test: impl FnMut(&mut TestContext, usize) -> Result<()> + 'static,
    ) -> TestPlanBuilder {
        TestPlanBuilder::new(RunMode::Cases {
            count,
            run: Box::new(test),
        })
    }

    /// The whole-test wall-clock timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for TestPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPlan")
            .field("needs_root", &self.needs_root)
            .field("checkpoint_slots", &self.checkpoint_slots)
            .field("forks_child", &self.forks_child)
            .field("hugepages", &self.hugepages)
            .field("save_restore", &self.save_restore)
            .field("timeout", &self.timeout)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Builder for [`TestPlan`].
pub struct TestPlanBuilder {
    plan: TestPlan,
}

impl TestPlanBuilder {
    fn new(mode: RunMode) -> Self {
        TestPlanBuilder {
            plan: TestPlan {
                needs_root: false,
                checkpoint_slots: 0,
                forks_child: false,
                hugepages: HugepageRequest::None,
                save_restore: Vec::new(),
                timeout: DEFAULT_TIMEOUT,
                setup: None,
                cleanup: None,
                mode,
                hugepage_paths: None,
            },
        }
    }

    /// The test must run as root; anything else is CONF.
    pub fn needs_root(mut self) -> Self {
        self.plan.needs_root = true;
        self
    }

    /// Allocate `slots` checkpoint slots in the shared region.
    pub fn checkpoints(mut self, slots: usize) -> Self {
        self.plan.checkpoint_slots = slots;
        self
    }

    /// The test forks children through the context.
    pub fn forks_child(mut self) -> Self {
        self.plan.forks_child = true;
        self
    }

    /// Declare a hugepage requirement.
    pub fn hugepages(mut self, request: HugepageRequest) -> Self {
        self.plan.hugepages = request;
        self
    }

    /// Save `path` during SETUP and write `new_value` to it if given.
    pub fn save_restore(
        mut self,
        path: impl Into<PathBuf>,
        new_value: Option<&str>,
        flags: SaveFlags,
    ) -> Self {
        self.plan.save_restore.push(SaveRestore {
            path: path.into(),
            new_value: new_value.map(str::to_owned),
            flags,
        });
        self
    }

    /// Override the whole-test wall-clock timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.plan.timeout = timeout;
        self
    }

    /// Setup hook, run after save/restore and hugepage negotiation.
    pub fn setup(mut self, hook: impl FnMut(&mut TestContext) -> Result<()> + 'static) -> Self {
        self.plan.setup = Some(Box::new(hook));
        self
    }

    /// Cleanup hook, run before the store restores tunables.
    pub fn cleanup(mut self, hook: impl FnMut(&mut TestContext) -> Result<()> + 'static) -> Self {
        self.plan.cleanup = Some(Box::new(hook));
        self
    }

    /// Point hugepage negotiation at scratch files instead of /proc.
    pub fn hugepage_paths(mut self, ctrl: impl Into<PathBuf>, meminfo: impl Into<PathBuf>) -> Self {
        self.plan.hugepage_paths = Some((ctrl.into(), meminfo.into()));
        self
    }

    /// Finish the plan.
    pub fn build(self) -> TestPlan {
        self.plan
    }
}
