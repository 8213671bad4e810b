//! End-to-end lifecycle runs through the public facade: setup,
//! sub-cases, cleanup ordering, tunable restoration, forked children
//! and the guarded timeout path.

use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kerncheck::{Driver, ExitStatus, HugepageRequest, SaveFlags, TestPlan};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

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

#[test]
fn test_passing_run_reports_pass_lines_and_summary() {
    init_tracing();
    let sink = CaptureSink::default();
    let plan = TestPlan::cases(2, |ctx, i| {
        ctx.pass(format!("sub-case {i} behaved"));
        Ok(())
    })
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(sink.clone()));

    assert_eq!(report.exit, ExitStatus::Passed);
    assert_eq!(report.counters.passed, 2);
    let out = sink.contents();
    assert!(out.contains("PASS"));
    assert!(out.contains("Summary:"));
}

#[test]
fn test_brok_in_setup_skips_body_and_still_cleans_up() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let tunable = dir.path().join("msgmax");
    fs::write(&tunable, "5\n").unwrap();

    let body_runs = Arc::new(AtomicUsize::new(0));
    let cleanup_runs = Arc::new(AtomicUsize::new(0));
    let body_counter = Arc::clone(&body_runs);
    let cleanup_counter = Arc::clone(&cleanup_runs);

    let plan = TestPlan::cases(3, move |_ctx, _i| {
        body_counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .save_restore(&tunable, Some("99"), SaveFlags::empty())
    .setup(|ctx| Err(ctx.reporter().broken("environment check blew up")))
    .cleanup(move |_ctx| {
        cleanup_counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));

    assert_eq!(report.exit, ExitStatus::Broken);
    // No sub-case ran, cleanup ran exactly once.
    assert_eq!(body_runs.load(Ordering::SeqCst), 0);
    assert_eq!(cleanup_runs.load(Ordering::SeqCst), 1);
    // The mutation made before setup failed was rolled back.
    assert_eq!(fs::read_to_string(&tunable).unwrap(), "5\n");
}

#[test]
fn test_cleanup_runs_once_after_brok_in_sub_case() {
    let cleanup_runs = Arc::new(AtomicUsize::new(0));
    let cleanup_counter = Arc::clone(&cleanup_runs);

    let plan = TestPlan::cases(4, |ctx, i| {
        if i == 1 {
            return Err(ctx.reporter().broken("sub-case 1 lost the environment"));
        }
        ctx.pass("fine");
        Ok(())
    })
    .cleanup(move |_ctx| {
        cleanup_counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));

    assert_eq!(report.exit, ExitStatus::Broken);
    assert_eq!(report.counters.passed, 1);
    assert_eq!(cleanup_runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_save_restore_descriptor_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let tunable = dir.path().join("shmmax");
    fs::write(&tunable, "5\n").unwrap();

    let seen = Arc::new(Mutex::new(String::new()));
    let seen_in_body = Arc::clone(&seen);
    let body_path = tunable.clone();

    let plan = TestPlan::single(move |ctx| {
        *seen_in_body.lock() = fs::read_to_string(&body_path).unwrap_or_default();
        ctx.pass("tunable held the test value");
        Ok(())
    })
    .save_restore(&tunable, Some("99"), SaveFlags::empty())
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));

    assert_eq!(report.exit, ExitStatus::Passed);
    // The body saw the value the plan set; cleanup put the old one back.
    assert_eq!(seen.lock().as_str(), "99");
    assert_eq!(fs::read_to_string(&tunable).unwrap(), "5\n");
}

#[test]
fn test_scratch_dir_lives_for_the_body_and_is_removed_after() {
    let scratch_path = Arc::new(Mutex::new(std::path::PathBuf::new()));
    let seen_in_body = Arc::clone(&scratch_path);

    let plan = TestPlan::single(move |ctx| {
        let dir = ctx.scratch_dir()?.to_path_buf();
        fs::write(dir.join("workfile"), "payload").unwrap();
        assert!(dir.join("workfile").is_file());
        *seen_in_body.lock() = dir;
        ctx.pass("scratch dir usable");
        Ok(())
    })
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));

    assert_eq!(report.exit, ExitStatus::Passed);
    let dir = scratch_path.lock().clone();
    assert!(!dir.as_os_str().is_empty());
    // Cleanup removed the directory with its contents.
    assert!(!dir.exists());
}

#[test]
fn test_tunable_saved_through_context_is_restored() {
    let dir = tempfile::tempdir().unwrap();
    let tunable = dir.path().join("overcommit_memory");
    fs::write(&tunable, "5\n").unwrap();

    let body_path = tunable.clone();
    let plan = TestPlan::single(move |ctx| {
        ctx.save_and_set_tunable(&body_path, "99", SaveFlags::empty())?;
        assert_eq!(fs::read_to_string(&body_path).unwrap(), "99");
        ctx.pass("tunable set through the context");
        Ok(())
    })
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));

    assert_eq!(report.exit, ExitStatus::Passed);
    assert_eq!(fs::read_to_string(&tunable).unwrap(), "5\n");
}

#[test]
fn test_forked_child_restores_only_its_own_tunables() {
    let dir = tempfile::tempdir().unwrap();
    let parent_tunable = dir.path().join("shmmni");
    let child_tunable = dir.path().join("msgmnb");
    fs::write(&parent_tunable, "5\n").unwrap();
    fs::write(&child_tunable, "7\n").unwrap();

    let parent_path = parent_tunable.clone();
    let child_path = child_tunable.clone();
    let parent_check_path = parent_tunable.clone();

    let plan = TestPlan::single(move |ctx| {
        ctx.save_and_set_tunable(&parent_path, "99", SaveFlags::empty())?;

        let in_child = child_path.clone();
        ctx.fork_child(move |ctx| {
            // The child's own mutation is rolled back when it exits.
            ctx.save_and_set_tunable(&in_child, "42", SaveFlags::empty())?;
            assert_eq!(fs::read_to_string(&in_child).unwrap(), "42");
            ctx.pass("child set its tunable");
            Ok(())
        })?;
        ctx.reap_children()?;

        // The child must not have restored the parent's entry.
        assert_eq!(fs::read_to_string(&parent_check_path).unwrap(), "99");
        assert_eq!(fs::read_to_string(&child_path).unwrap(), "7\n");
        ctx.pass("parent entry survived the child's exit");
        Ok(())
    })
    .forks_child()
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));

    assert_eq!(report.exit, ExitStatus::Passed);
    assert_eq!(report.counters.passed, 2);
    // Parent cleanup restored its own entry at the end.
    assert_eq!(fs::read_to_string(&parent_tunable).unwrap(), "5\n");
    assert_eq!(fs::read_to_string(&child_tunable).unwrap(), "7\n");
}

#[test]
fn test_needs_root_gate() {
    let plan = TestPlan::single(|ctx| {
        ctx.pass("ran with privileges");
        Ok(())
    })
    .needs_root()
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));

    if nix::unistd::Uid::effective().is_root() {
        assert_eq!(report.exit, ExitStatus::Passed);
    } else {
        assert_eq!(report.exit, ExitStatus::NotApplicable);
        assert_eq!(report.counters.passed, 0);
    }
}

#[test]
fn test_forked_child_results_land_in_parent_counters() {
    let plan = TestPlan::single(|ctx| {
        ctx.fork_child(|ctx| {
            ctx.pass("child-side check held");
            ctx.fail("child-side check broke");
            Ok(())
        })?;
        ctx.pass("parent-side check held");
        Ok(())
    })
    .forks_child()
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));

    assert_eq!(report.exit, ExitStatus::Failed);
    assert_eq!(report.counters.passed, 2);
    assert_eq!(report.counters.failed, 1);
}

#[test]
fn test_child_brok_propagates_to_parent() {
    let plan = TestPlan::single(|ctx| {
        ctx.fork_child(|ctx| Err(ctx.reporter().broken("child lost its footing")))?;
        Ok(())
    })
    .forks_child()
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));
    assert_eq!(report.exit, ExitStatus::Broken);
}

#[test]
fn test_undeclared_fork_is_brok() {
    let plan = TestPlan::single(|ctx| {
        ctx.fork_child(|_ctx| Ok(())).map(|_| ())
    })
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));
    assert_eq!(report.exit, ExitStatus::Broken);
}

#[test]
fn test_hugepage_negotiation_and_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let ctrl = dir.path().join("nr_hugepages");
    let meminfo = dir.path().join("meminfo");
    fs::write(&ctrl, "0\n").unwrap();
    // Ceiling: 40960 kB free / 2 / 2048 kB per page = 10 pages.
    fs::write(
        &meminfo,
        "MemFree:        40960 kB\nHugepagesize:   2048 kB\n",
    )
    .unwrap();

    let granted = Arc::new(AtomicUsize::new(usize::MAX));
    let granted_in_body = Arc::clone(&granted);
    let ctrl_in_body = ctrl.clone();

    let plan = TestPlan::single(move |ctx| {
        let reservation = ctx.hugepage_reservation().copied();
        if let Some(r) = reservation {
            granted_in_body.store(r.granted as usize, Ordering::SeqCst);
        }
        // The tunable holds the grant while the body runs.
        assert_eq!(
            fs::read_to_string(&ctrl_in_body).unwrap().trim(),
            "4"
        );
        ctx.pass("reservation in place");
        Ok(())
    })
    .hugepages(HugepageRequest::Request(4))
    .hugepage_paths(&ctrl, &meminfo)
    .build();

    let report = Driver::execute_with_sink(plan, Box::new(Vec::new()));

    assert_eq!(report.exit, ExitStatus::Passed);
    assert_eq!(granted.load(Ordering::SeqCst), 4);
    // Cleanup restored the pool size.
    assert_eq!(fs::read_to_string(&ctrl).unwrap(), "0\n");
}

#[test]
fn test_guarded_run_propagates_verdict() {
    let plan = TestPlan::single(|ctx| {
        ctx.fail("deliberate subject failure");
        Ok(())
    })
    .build();

    assert_eq!(Driver::run(plan), ExitStatus::Failed);
}

#[test]
fn test_guarded_run_kills_hung_test() {
    let plan = TestPlan::single(|_ctx| {
        std::thread::sleep(Duration::from_secs(30));
        Ok(())
    })
    .timeout(Duration::from_secs(1))
    .build();

    let start = Instant::now();
    let exit = Driver::run(plan);
    let elapsed = start.elapsed();

    assert_eq!(exit, ExitStatus::Broken);
    // The hung body never ran to completion.
    assert!(elapsed < Duration::from_secs(20));
}
