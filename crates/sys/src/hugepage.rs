//! Hugepage resource negotiator
//!
//! Hugepages are the concrete exemplar of a constrained, ceiling-bound
//! shared resource: the system-wide pool is quota-limited and shared
//! with everything else on the machine, so a test must never assume it
//! gets what it asked for. The negotiator acquires best-effort, reports
//! the actually-granted amount, and leaves teardown to the config
//! store's restoration of the underlying tunable.
//!
//! The control and meminfo paths are injectable so the negotiation
//! protocol itself is testable against scratch files.

use std::fs;
use std::path::PathBuf;

use kerncheck_core::{Reporter, Result};

use crate::config::{ConfigStore, SaveFlags};

/// Default tunable holding the system-wide hugepage count.
pub const NR_HUGEPAGES: &str = "/proc/sys/vm/nr_hugepages";
/// Default source for the free-memory-derived ceiling.
pub const MEMINFO: &str = "/proc/meminfo";

/// How hard the test depends on its reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugepagePolicy {
    /// Best-effort: the test copes with any grant, including zero.
    Request,
    /// The test cannot run without the full reservation; a short grant
    /// raises CONF.
    Needs,
}

/// Declarative hugepage requirement on a test plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HugepageRequest {
    /// No hugepages involved.
    #[default]
    None,
    /// Best-effort request for this many pages.
    Request(u64),
    /// Hard requirement for this many pages.
    Needs(u64),
}

/// Outcome of one negotiation, cached per test context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HugepageReservation {
    /// What the test asked for.
    pub requested: u64,
    /// What was actually granted.
    pub granted: u64,
    /// The policy the request was made under.
    pub policy: HugepagePolicy,
}

/// Best-effort negotiator for the system-wide hugepage pool.
#[derive(Debug)]
pub struct HugepageNegotiator {
    ctrl_path: PathBuf,
    meminfo_path: PathBuf,
    reservation: Option<HugepageReservation>,
}

impl Default for HugepageNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl HugepageNegotiator {
    /// Negotiator against the real /proc paths.
    pub fn new() -> Self {
        Self::with_paths(NR_HUGEPAGES, MEMINFO)
    }

    /// Negotiator against explicit paths (scratch files in tests).
    pub fn with_paths(ctrl: impl Into<PathBuf>, meminfo: impl Into<PathBuf>) -> Self {
        HugepageNegotiator {
            ctrl_path: ctrl.into(),
            meminfo_path: meminfo.into(),
            reservation: None,
        }
    }

    /// The reservation negotiated so far, if any.
    pub fn reservation(&self) -> Option<&HugepageReservation> {
        self.reservation.as_ref()
    }

    /// Negotiate `count` hugepages under `policy`.
    ///
    /// Idempotent per context: a second call returns the cached grant
    /// without recomputing the ceiling or touching the tunable. The
    /// grant never exceeds `count` nor the free-memory-derived ceiling;
    /// a request above the ceiling is clamped to 80% of it with an INFO
    /// record. A read-back mismatch after the write is BROK: that is a
    /// negotiation-protocol violation, not a subject failure.
    #[track_caller]
    pub fn request(
        &mut self,
        reporter: &Reporter,
        store: &mut ConfigStore,
        count: u64,
        policy: HugepagePolicy,
    ) -> Result<u64> {
        if let Some(r) = self.reservation {
            return Ok(r.granted);
        }

        if count == 0 {
            return Ok(self.cache(0, 0, policy));
        }

        let Some(ceiling) = self.ceiling()? else {
            return match policy {
                HugepagePolicy::Request => {
                    reporter.info("hugepages not supported on this system");
                    Ok(self.cache(count, 0, policy))
                }
                HugepagePolicy::Needs => {
                    self.cache(count, 0, policy);
                    Err(reporter.not_supported("test needs hugepages, none available"))
                }
            };
        };

        let granted = if count > ceiling {
            let clamped = ceiling * 4 / 5;
            reporter.info(format!(
                "requested {count} hugepages exceeds safe ceiling {ceiling}, clamping to {clamped}"
            ));
            clamped
        } else {
            count
        };

        if granted == 0 {
            return match policy {
                HugepagePolicy::Request => Ok(self.cache(count, 0, policy)),
                HugepagePolicy::Needs => {
                    self.cache(count, 0, policy);
                    Err(reporter.not_supported(format!(
                        "test needs {count} hugepages, system can spare none"
                    )))
                }
            };
        }

        // Best-effort save; restoring the tunable at cleanup is the
        // reservation's teardown.
        store.save(reporter, &self.ctrl_path, SaveFlags::SKIP_MISSING)?;
        store.set(reporter, &self.ctrl_path, &granted.to_string())?;

        let readback = self.read_ctrl(reporter)?;
        if readback != granted {
            return Err(reporter.broken(format!(
                "negotiated {granted} hugepages but kernel reports {readback}"
            )));
        }

        if policy == HugepagePolicy::Needs && granted < count {
            self.cache(count, granted, policy);
            return Err(reporter.not_supported(format!(
                "test needs {count} hugepages, only {granted} granted"
            )));
        }

        tracing::debug!(requested = count, granted, "hugepage reservation");
        Ok(self.cache(count, granted, policy))
    }

    fn cache(&mut self, requested: u64, granted: u64, policy: HugepagePolicy) -> u64 {
        self.reservation = Some(HugepageReservation {
            requested,
            granted,
            policy,
        });
        granted
    }

    /// Free-memory-derived ceiling, or `None` when the system has no
    /// hugepage support at all.
    fn ceiling(&self) -> Result<Option<u64>> {
        if !self.ctrl_path.exists() {
            return Ok(None);
        }

        let meminfo = match fs::read_to_string(&self.meminfo_path) {
            Ok(content) => content,
            Err(_) => return Ok(None),
        };

        let Some(page_kb) = parse_meminfo(&meminfo, "Hugepagesize:") else {
            return Ok(None);
        };
        if page_kb == 0 {
            return Ok(None);
        }

        let free_kb = parse_meminfo(&meminfo, "MemFree:").unwrap_or(0);

        // Half of free memory is the most a test may tie up in pages.
        Ok(Some(free_kb / 2 / page_kb))
    }

    fn read_ctrl(&self, reporter: &Reporter) -> Result<u64> {
        let content = fs::read_to_string(&self.ctrl_path)
            .map_err(|e| reporter.broken(format!("reading {}: {e}", self.ctrl_path.display())))?;
        content.trim().parse::<u64>().map_err(|_| {
            reporter.broken(format!(
                "{} holds non-numeric content {:?}",
                self.ctrl_path.display(),
                content.trim()
            ))
        })
    }
}

/// Extract a kB-valued field from meminfo-format content.
fn parse_meminfo(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.trim().split_whitespace().next())
        .and_then(|num| num.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kerncheck_core::LocalCounters;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct CaptureSink(Arc<Mutex<Vec<u8>>>);

    impl CaptureSink {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl Write for CaptureSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_reporter() -> (Reporter, CaptureSink) {
        let sink = CaptureSink::default();
        let reporter =
            Reporter::with_sink(Arc::new(LocalCounters::new()), Box::new(sink.clone()));
        (reporter, sink)
    }

    /// Scratch /proc stand-in: ctrl file plus meminfo with the given
    /// free memory and hugepage size.
    fn scratch(free_kb: u64, page_kb: u64) -> (TempDir, HugepageNegotiator) {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = dir.path().join("nr_hugepages");
        let meminfo = dir.path().join("meminfo");
        fs::write(&ctrl, "0\n").unwrap();
        fs::write(
            &meminfo,
            format!(
                "MemTotal:       {} kB\nMemFree:        {} kB\nHugepagesize:   {} kB\n",
                free_kb * 2,
                free_kb,
                page_kb
            ),
        )
        .unwrap();
        let negotiator = HugepageNegotiator::with_paths(&ctrl, &meminfo);
        (dir, negotiator)
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16384 kB\nMemFree:        8192 kB\nHugepagesize:   2048 kB\n";
        assert_eq!(parse_meminfo(content, "MemFree:"), Some(8192));
        assert_eq!(parse_meminfo(content, "Hugepagesize:"), Some(2048));
        assert_eq!(parse_meminfo(content, "SwapFree:"), None);
    }

    #[test]
    fn test_grant_within_ceiling() {
        // free 40960 kB, page 2048 kB: ceiling = 40960/2/2048 = 10.
        let (_dir, mut negotiator) = scratch(40960, 2048);
        let (reporter, _sink) = capture_reporter();
        let mut store = ConfigStore::new();

        let granted = negotiator
            .request(&reporter, &mut store, 4, HugepagePolicy::Request)
            .unwrap();
        assert_eq!(granted, 4);
        assert_eq!(store.len(), 1);

        let r = negotiator.reservation().unwrap();
        assert_eq!(r.requested, 4);
        assert_eq!(r.granted, 4);
    }

    #[test]
    fn test_clamp_to_80_percent_of_ceiling_with_info() {
        // Ceiling 10; an absurd request clamps to 8.
        let (_dir, mut negotiator) = scratch(40960, 2048);
        let (reporter, sink) = capture_reporter();
        let mut store = ConfigStore::new();

        let granted = negotiator
            .request(&reporter, &mut store, 10_000_000, HugepagePolicy::Request)
            .unwrap();
        assert_eq!(granted, 8);
        assert!(sink.contents().contains("INFO"));
        assert!(sink.contents().contains("clamping to 8"));
    }

    #[test]
    fn test_tiny_ceiling_floors_to_zero() {
        // free 8192 kB, page 2048 kB: ceiling = 2; 80% of 2 floors to 1.
        let (_dir, mut negotiator) = scratch(8192, 2048);
        let (reporter, sink) = capture_reporter();
        let mut store = ConfigStore::new();

        let granted = negotiator
            .request(&reporter, &mut store, 3, HugepagePolicy::Request)
            .unwrap();
        assert!(granted <= 1);
        assert!(sink.contents().contains("INFO"));
    }

    #[test]
    fn test_request_is_idempotent() {
        let (dir, mut negotiator) = scratch(40960, 2048);
        let (reporter, _sink) = capture_reporter();
        let mut store = ConfigStore::new();

        let first = negotiator
            .request(&reporter, &mut store, 4, HugepagePolicy::Request)
            .unwrap();

        // Shrink the apparent ceiling; the cached grant must win.
        fs::write(
            dir.path().join("meminfo"),
            "MemFree:        0 kB\nHugepagesize:   2048 kB\n",
        )
        .unwrap();

        let second = negotiator
            .request(&reporter, &mut store, 4, HugepagePolicy::Request)
            .unwrap();
        assert_eq!(first, second);
        // No second save either.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unsupported_system_grants_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut negotiator = HugepageNegotiator::with_paths(
            dir.path().join("missing_ctrl"),
            dir.path().join("missing_meminfo"),
        );
        let (reporter, _sink) = capture_reporter();
        let mut store = ConfigStore::new();

        let granted = negotiator
            .request(&reporter, &mut store, 8, HugepagePolicy::Request)
            .unwrap();
        assert_eq!(granted, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_needs_policy_conf_when_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let mut negotiator = HugepageNegotiator::with_paths(
            dir.path().join("missing_ctrl"),
            dir.path().join("missing_meminfo"),
        );
        let (reporter, sink) = capture_reporter();
        let mut store = ConfigStore::new();

        let err = negotiator
            .request(&reporter, &mut store, 8, HugepagePolicy::Needs)
            .unwrap_err();
        assert!(!err.is_broken());
        assert!(sink.contents().contains("CONF"));
    }

    #[test]
    fn test_restore_tears_down_reservation() {
        let (dir, mut negotiator) = scratch(40960, 2048);
        let (reporter, _sink) = capture_reporter();
        let mut store = ConfigStore::new();

        negotiator
            .request(&reporter, &mut store, 4, HugepagePolicy::Request)
            .unwrap();
        let ctrl = dir.path().join("nr_hugepages");
        assert_eq!(fs::read_to_string(&ctrl).unwrap().trim(), "4");

        store.restore_all(&reporter, false);
        assert_eq!(fs::read_to_string(&ctrl).unwrap(), "0\n");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The grant never exceeds the request nor the ceiling, and
            /// clamped grants stay within 80% of the ceiling.
            #[test]
            fn grant_bounded_by_request_and_ceiling(
                free_kb in 0u64..1_000_000,
                count in 1u64..100_000,
            ) {
                let page_kb = 2048u64;
                let (_dir, mut negotiator) = scratch(free_kb, page_kb);
                let (reporter, _sink) = capture_reporter();
                let mut store = ConfigStore::new();

                let ceiling = free_kb / 2 / page_kb;
                let granted = negotiator
                    .request(&reporter, &mut store, count, HugepagePolicy::Request)
                    .unwrap();

                prop_assert!(granted <= count);
                prop_assert!(granted <= ceiling);
                if count > ceiling {
                    prop_assert!(granted <= ceiling * 4 / 5);
                }
            }
        }
    }
}
