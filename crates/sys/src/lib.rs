//! OS-facing layer of the kerncheck harness
//!
//! This crate wraps the syscalls tests lean on during setup, mutates
//! and restores kernel tunables, and negotiates quota-bound shared
//! resources:
//! - safe: the safe syscall wrapper layer
//! - classify: the (syscall, errno) failure classification table
//! - config: save/restore store for proc/sys tunables
//! - hugepage: best-effort negotiator for the hugepage pool

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod config;
pub mod hugepage;
pub mod safe;

// Re-export commonly used types
pub use classify::{classify, FailureClass};
pub use config::{ConfigStore, SaveFlags, SavedConfigEntry};
pub use hugepage::{
    HugepageNegotiator, HugepagePolicy, HugepageRequest, HugepageReservation, MEMINFO,
    NR_HUGEPAGES,
};
pub use safe::{
    safe_accept, safe_bind, safe_fork, safe_kill, safe_listen, safe_mkdir, safe_open,
    safe_read, safe_read_file, safe_socket, safe_unlink, safe_waitpid, safe_write,
    safe_write_file,
};
