//! Result reporter and run accounting
//!
//! The reporter formats records into the line-oriented result stream
//! (`file:line: KIND: message (errno N: NAME)`) and feeds a counter
//! store that the driver classifies the final exit status from.
//!
//! The counter store is a trait seam: single-process runs use
//! [`LocalCounters`]; the runner substitutes a store backed by a
//! shared mapping so records emitted by forked children land in the
//! same accounting as the parent's.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TestError;
use crate::result::{ErrnoCapture, ResultKind, TestResult};

/// Run accounting, one counter per verdict-relevant kind.
///
/// `#[repr(C)]` with atomic fields so the struct can live at the head
/// of a memory mapping shared across a forked process tree.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Counters {
    passed: AtomicU32,
    failed: AtomicU32,
    skipped: AtomicU32,
    warnings: AtomicU32,
}

impl Counters {
    /// Fresh, zeroed counters.
    pub const fn new() -> Self {
        Counters {
            passed: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            skipped: AtomicU32::new(0),
            warnings: AtomicU32::new(0),
        }
    }

    /// Bump the counter matching `kind`.
    ///
    /// BROK does not have a counter of its own: brokenness propagates
    /// as a terminal error (and as a child exit code), never as a
    /// tally.
    pub fn record(&self, kind: ResultKind) {
        match kind {
            ResultKind::Pass => self.passed.fetch_add(1, Ordering::Relaxed),
            ResultKind::Fail => self.failed.fetch_add(1, Ordering::Relaxed),
            ResultKind::Conf => self.skipped.fetch_add(1, Ordering::Relaxed),
            ResultKind::Warn => self.warnings.fetch_add(1, Ordering::Relaxed),
            ResultKind::Brok | ResultKind::Info => return,
        };
    }

    /// Consistent point-in-time copy of the counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            passed: self.passed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// PASS records.
    pub passed: u32,
    /// FAIL records.
    pub failed: u32,
    /// CONF records.
    pub skipped: u32,
    /// WARN records.
    pub warnings: u32,
}

/// Where run accounting lives.
pub trait CounterStore: Send + Sync {
    /// Bump the counter matching `kind`.
    fn record(&self, kind: ResultKind);
    /// Read the current counts.
    fn snapshot(&self) -> CounterSnapshot;
}

/// Process-local counter store.
#[derive(Debug, Default)]
pub struct LocalCounters(Counters);

impl LocalCounters {
    /// Fresh, zeroed store.
    pub fn new() -> Self {
        LocalCounters(Counters::new())
    }
}

impl CounterStore for LocalCounters {
    fn record(&self, kind: ResultKind) {
        self.0.record(kind);
    }

    fn snapshot(&self) -> CounterSnapshot {
        self.0.snapshot()
    }
}

/// Formats and routes records, and keeps the running accounting.
pub struct Reporter {
    sink: Mutex<Box<dyn Write + Send>>,
    counters: Arc<dyn CounterStore>,
    cleanup_mode: AtomicBool,
}

impl Reporter {
    /// Reporter writing to stderr.
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self::with_sink(counters, Box::new(io::stderr()))
    }

    /// Reporter writing to an explicit sink. Tests use this to capture
    /// the result stream.
    pub fn with_sink(counters: Arc<dyn CounterStore>, sink: Box<dyn Write + Send>) -> Self {
        Reporter {
            sink: Mutex::new(sink),
            counters,
            cleanup_mode: AtomicBool::new(false),
        }
    }

    /// Emit a record attributed to the caller.
    #[track_caller]
    pub fn report(&self, kind: ResultKind, message: impl Into<String>) {
        self.submit(TestResult::new(kind, message));
    }

    /// Emit a record decorated with the calling thread's errno.
    ///
    /// The errno is captured as the very first action, before anything
    /// else can clobber it.
    #[track_caller]
    pub fn report_errno(&self, kind: ResultKind, message: impl Into<String>) {
        let errno = ErrnoCapture::last();
        self.submit(TestResult::new(kind, message).with_errno(errno));
    }

    /// Emit a fully-built record.
    ///
    /// While cleanup runs, BROK records are downgraded to WARN: a
    /// broken cleanup step must not re-enter the unwind machinery, only
    /// leave a trace.
    pub fn submit(&self, mut result: TestResult) {
        if result.kind == ResultKind::Brok && self.cleanup_mode.load(Ordering::Relaxed) {
            result.kind = ResultKind::Warn;
        }

        self.counters.record(result.kind);

        let mut sink = self.sink.lock();
        let _ = writeln!(sink, "{result}");
    }

    /// PASS convenience.
    #[track_caller]
    pub fn pass(&self, message: impl Into<String>) {
        self.report(ResultKind::Pass, message);
    }

    /// FAIL convenience. Recorded; execution continues.
    #[track_caller]
    pub fn fail(&self, message: impl Into<String>) {
        self.report(ResultKind::Fail, message);
    }

    /// FAIL with captured errno.
    #[track_caller]
    pub fn fail_errno(&self, message: impl Into<String>) {
        self.report_errno(ResultKind::Fail, message);
    }

    /// INFO convenience.
    #[track_caller]
    pub fn info(&self, message: impl Into<String>) {
        self.report(ResultKind::Info, message);
    }

    /// WARN convenience.
    #[track_caller]
    pub fn warn(&self, message: impl Into<String>) {
        self.report(ResultKind::Warn, message);
    }

    /// Record a BROK and hand back the error that unwinds to cleanup.
    #[track_caller]
    pub fn broken(&self, message: impl Into<String>) -> TestError {
        let message = message.into();
        self.report(ResultKind::Brok, message.clone());
        TestError::broken(message)
    }

    /// Record a BROK with captured errno and hand back the unwind
    /// error.
    #[track_caller]
    pub fn broken_errno(&self, message: impl Into<String>) -> TestError {
        let errno = ErrnoCapture::last();
        let message = message.into();
        self.submit(TestResult::new(ResultKind::Brok, message.clone()).with_errno(errno.clone()));
        TestError::Broken {
            message,
            errno: Some(errno),
        }
    }

    /// Record a CONF and hand back the unwind error.
    #[track_caller]
    pub fn not_supported(&self, message: impl Into<String>) -> TestError {
        let message = message.into();
        self.report(ResultKind::Conf, message.clone());
        TestError::not_supported(message)
    }

    /// Current accounting.
    pub fn snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Switch BROK-to-WARN downgrading on or off.
    pub fn set_cleanup_mode(&self, on: bool) {
        self.cleanup_mode.store(on, Ordering::Relaxed);
    }

    /// Write the end-of-run summary block to the sink.
    pub fn summary(&self) {
        let snap = self.snapshot();
        let mut sink = self.sink.lock();
        let _ = writeln!(sink);
        let _ = writeln!(sink, "Summary:");
        let _ = writeln!(sink, "passed   {}", snap.passed);
        let _ = writeln!(sink, "failed   {}", snap.failed);
        let _ = writeln!(sink, "skipped  {}", snap.skipped);
        let _ = writeln!(sink, "warnings {}", snap.warnings);
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("counters", &self.snapshot())
            .field("cleanup_mode", &self.cleanup_mode.load(Ordering::Relaxed))
            .finish()
    }
}
