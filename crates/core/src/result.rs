//! Result taxonomy for harness records
//!
//! Every assertion a test makes produces one [`TestResult`]. The kind
//! discriminates between subject outcomes (PASS/FAIL), harness or
//! environment outcomes (BROK/CONF) and non-verdict diagnostics
//! (WARN/INFO). CONF is never counted as a failure: it means the
//! environment cannot run the test, not that the subject is defective.

use std::fmt;
use std::panic::Location;

use nix::errno::Errno;

/// Kind of a single harness record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    /// Subject behaved as expected.
    Pass,
    /// Subject misbehaved. Recorded, execution continues to the next
    /// sub-case.
    Fail,
    /// Harness or environment is broken. Unwinds straight to cleanup.
    Brok,
    /// Environment does not support the tested feature. Excluded from
    /// failure accounting.
    Conf,
    /// Non-verdict warning.
    Warn,
    /// Non-verdict informational note.
    Info,
}

impl ResultKind {
    /// Upper-case tag used in the result stream.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::Pass => "PASS",
            ResultKind::Fail => "FAIL",
            ResultKind::Brok => "BROK",
            ResultKind::Conf => "CONF",
            ResultKind::Warn => "WARN",
            ResultKind::Info => "INFO",
        }
    }

    /// Whether this kind participates in the final verdict at all.
    ///
    /// WARN and INFO are diagnostics; they influence the summary but
    /// never the pass/fail classification.
    pub fn is_verdict(self) -> bool {
        matches!(
            self,
            ResultKind::Pass | ResultKind::Fail | ResultKind::Brok | ResultKind::Conf
        )
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded errno attached to a record.
///
/// Captured at the instant the record is created, before any other call
/// can clobber the thread's errno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrnoCapture {
    /// Raw errno number.
    pub number: i32,
    /// Symbolic name, e.g. `ENOSYS`.
    pub name: String,
}

impl ErrnoCapture {
    /// Capture the calling thread's current errno.
    pub fn last() -> Self {
        Self::from_errno(Errno::last())
    }

    /// Decode a known errno value.
    pub fn from_errno(errno: Errno) -> Self {
        ErrnoCapture {
            number: errno as i32,
            name: format!("{errno:?}"),
        }
    }

    /// Decode a raw errno number.
    pub fn from_raw(raw: i32) -> Self {
        Self::from_errno(Errno::from_raw(raw))
    }

    /// Decode the OS error carried by an `io::Error`, if any.
    pub fn from_io(err: &std::io::Error) -> Option<Self> {
        err.raw_os_error().map(Self::from_raw)
    }
}

impl fmt::Display for ErrnoCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}: {}", self.number, self.name)
    }
}

/// One harness record: kind, message, optional errno, provenance.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Record kind.
    pub kind: ResultKind,
    /// Human-readable message.
    pub message: String,
    /// Errno captured when the record was created.
    pub errno: Option<ErrnoCapture>,
    /// File:line of the call site that produced the record.
    pub location: &'static Location<'static>,
}

impl TestResult {
    /// Create a record attributed to the caller's location.
    #[track_caller]
    pub fn new(kind: ResultKind, message: impl Into<String>) -> Self {
        Self::at(Location::caller(), kind, message)
    }

    /// Create a record attributed to an explicit location.
    ///
    /// Used by the safe wrapper layer, which forwards its own caller's
    /// location rather than its internals.
    pub fn at(
        location: &'static Location<'static>,
        kind: ResultKind,
        message: impl Into<String>,
    ) -> Self {
        TestResult {
            kind,
            message: message.into(),
            errno: None,
            location,
        }
    }

    /// Attach an already-captured errno.
    pub fn with_errno(mut self, errno: ErrnoCapture) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Attach the calling thread's current errno.
    pub fn with_last_errno(self) -> Self {
        self.with_errno(ErrnoCapture::last())
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {}: {}",
            self.location.file(),
            self.location.line(),
            self.kind,
            self.message
        )?;
        if let Some(errno) = &self.errno {
            write!(f, " ({errno})")?;
        }
        Ok(())
    }
}
