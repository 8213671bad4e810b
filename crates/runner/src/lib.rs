//! Test lifecycle driver for kerncheck.
//!
//! This crate turns a declarative [`TestPlan`] into a run: it maps the
//! shared results region, negotiates resources, executes setup, the
//! test body and cleanup in order, reaps declared children, and folds
//! everything into a single [`ExitStatus`](kerncheck_core::ExitStatus).
//! The checkpoint pool lets the processes of one test tree rendezvous
//! without polling.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod checkpoint;
mod context;
mod driver;
mod plan;
mod shared;

pub use checkpoint::CheckpointPool;
pub use context::TestContext;
pub use driver::{Driver, RunReport};
pub use plan::{CaseHook, Hook, RunMode, SaveRestore, TestPlan, TestPlanBuilder, DEFAULT_TIMEOUT};
pub use shared::SharedRegion;
