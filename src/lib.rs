//! kerncheck - kernel regression test harness
//!
//! kerncheck is the reusable core of a Linux syscall conformance suite:
//! a test declares what it needs (privileges, tunables, hugepages,
//! checkpoint slots, children) in a [`TestPlan`], and the [`Driver`]
//! runs its lifecycle with guaranteed cleanup, shared-memory result
//! accounting across the whole process tree, and a wall-clock timeout
//! of last resort.
//!
//! # Quick Start
//!
//! ```ignore
//! use kerncheck::{Driver, TestPlan};
//!
//! let plan = TestPlan::cases(2, |ctx, i| {
//!     if do_the_thing(i) {
//!         ctx.pass("syscall behaved");
//!     } else {
//!         ctx.fail("syscall misbehaved");
//!     }
//!     Ok(())
//! })
//! .build();
//!
//! std::process::exit(Driver::run(plan).code());
//! ```
//!
//! # Architecture
//!
//! Results, verdicts and errors live in [`kerncheck_core`]; syscall
//! wrappers, the tunable save/restore store and hugepage negotiation in
//! [`kerncheck_sys`]; the lifecycle driver, test context and checkpoint
//! barrier in [`kerncheck_runner`]. This facade re-exports the surface
//! a test binary needs.

pub use kerncheck_core::{
    CounterSnapshot, ErrnoCapture, ExitStatus, Reporter, Result, ResultKind, TestError, TestResult,
};
pub use kerncheck_runner::{
    CheckpointPool, Driver, RunReport, TestContext, TestPlan, TestPlanBuilder, DEFAULT_TIMEOUT,
};
pub use kerncheck_sys::{
    ConfigStore, FailureClass, HugepagePolicy, HugepageRequest, HugepageReservation, SaveFlags,
};
pub use kerncheck_sys::{
    safe_accept, safe_bind, safe_fork, safe_kill, safe_listen, safe_mkdir, safe_open,
    safe_read, safe_read_file, safe_socket, safe_unlink, safe_waitpid, safe_write,
    safe_write_file,
};
