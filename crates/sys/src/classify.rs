//! Failure classification for wrapped syscalls
//!
//! One table maps `(syscall, errno)` to "the environment does not
//! support this" versus "the harness is broken". Wrapper call sites
//! never compare errno values inline; they ask this table. The table
//! is also the single place the unsupported errno sets are documented.
//!
//! `ENOSYS` means unsupported for every call. The per-call extras
//! cover calls where a specific errno conventionally signals a missing
//! kernel or filesystem feature rather than a defect, e.g. `EOPNOTSUPP`
//! from `open(O_TMPFILE)` on a filesystem without tmpfile support.

use std::collections::HashMap;

use nix::errno::Errno;
use once_cell::sync::Lazy;

/// What a wrapped syscall failure means for the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Report CONF and unwind; the test is skipped, not failed.
    Unsupported,
    /// Report BROK and unwind; the harness cannot continue.
    Fatal,
}

/// Per-call errno values that signal a missing feature.
static UNSUPPORTED: Lazy<HashMap<&'static str, &'static [Errno]>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, &'static [Errno]> = HashMap::new();
    table.insert("open", &[Errno::EOPNOTSUPP]);
    table.insert("fallocate", &[Errno::EOPNOTSUPP]);
    table.insert("setxattr", &[Errno::ENOTSUP]);
    table.insert("mount", &[Errno::EOPNOTSUPP, Errno::ENODEV]);
    table.insert(
        "socket",
        &[
            Errno::EPROTONOSUPPORT,
            Errno::ESOCKTNOSUPPORT,
            Errno::EOPNOTSUPP,
            Errno::EPFNOSUPPORT,
            Errno::EAFNOSUPPORT,
        ],
    );
    table
});

/// Classify a failure of `call` with `errno`.
pub fn classify(call: &str, errno: Errno) -> FailureClass {
    if errno == Errno::ENOSYS {
        return FailureClass::Unsupported;
    }

    match UNSUPPORTED.get(call) {
        Some(set) if set.contains(&errno) => FailureClass::Unsupported,
        _ => FailureClass::Fatal,
    }
}
