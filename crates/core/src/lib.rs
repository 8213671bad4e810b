//! Core types for the kerncheck harness
//!
//! This crate defines the foundational pieces every other layer builds
//! on:
//! - ResultKind/TestResult: the PASS/FAIL/BROK/CONF/WARN/INFO taxonomy
//! - ErrnoCapture: decode-and-attach errno provenance
//! - Reporter: line-oriented result stream plus run accounting
//! - CounterStore: accounting seam (process-local or shared mapping)
//! - TestError: the BROK/CONF unwind channel
//! - ExitStatus: fixed exit-code classification policy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod exit;
pub mod reporter;
pub mod result;

// Re-export commonly used types
pub use error::{Result, TestError};
pub use exit::ExitStatus;
pub use reporter::{CounterSnapshot, CounterStore, Counters, LocalCounters, Reporter};
pub use result::{ErrnoCapture, ResultKind, TestResult};
