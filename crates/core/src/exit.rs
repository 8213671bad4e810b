//! Exit status classification
//!
//! The numeric mapping is fixed policy, chosen once and documented
//! here rather than inferred from any particular kernel or libc:
//!
//! | code | meaning                          |
//! |------|----------------------------------|
//! | 0    | passed                           |
//! | 1    | subject failure observed         |
//! | 2    | harness or environment broken    |
//! | 4    | not applicable (CONF-only run)   |
//!
//! Forked children exit with the same codes, which is how a child's
//! BROK/CONF verdict propagates to the parent that reaps it.

use crate::error::TestError;
use crate::reporter::CounterSnapshot;

/// Final process exit classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitStatus {
    /// All verdicts were PASS (or only diagnostics were emitted).
    Passed = 0,
    /// At least one FAIL was recorded.
    Failed = 1,
    /// The harness or environment broke.
    Broken = 2,
    /// Only CONF verdicts: the test does not apply to this system.
    NotApplicable = 4,
}

impl ExitStatus {
    /// The process exit code for this status.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode an exit code produced by [`ExitStatus::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitStatus::Passed),
            1 => Some(ExitStatus::Failed),
            2 => Some(ExitStatus::Broken),
            4 => Some(ExitStatus::NotApplicable),
            _ => None,
        }
    }

    /// The status a terminal unwind error maps to on its own.
    pub fn from_error(err: &TestError) -> Self {
        if err.is_broken() {
            ExitStatus::Broken
        } else {
            ExitStatus::NotApplicable
        }
    }

    /// Derive the final status from the run accounting plus the
    /// terminal error, if the run unwound.
    ///
    /// Precedence: any BROK wins, then any FAIL, then CONF-only, then
    /// success. CONF records never count against the run.
    pub fn classify(snapshot: &CounterSnapshot, terminal: Option<&TestError>) -> Self {
        if matches!(terminal, Some(e) if e.is_broken()) {
            return ExitStatus::Broken;
        }

        if snapshot.failed > 0 {
            return ExitStatus::Failed;
        }

        if matches!(terminal, Some(TestError::NotSupported { .. })) {
            return ExitStatus::NotApplicable;
        }

        if snapshot.skipped > 0 && snapshot.passed == 0 {
            return ExitStatus::NotApplicable;
        }

        ExitStatus::Passed
    }
}
