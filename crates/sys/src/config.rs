//! System config save/restore store
//!
//! Tests mutate kernel tunables under /proc and /sys; the store records
//! the prior content of every mutated path and writes it back at
//! cleanup. Content is an opaque newline-terminated scalar string,
//! never parsed.
//!
//! The store is owned by one test context: each process in a test's
//! tree manages and restores its own mutations, so there is no
//! cross-process coordination here at all.

use std::fs;
use std::io::ErrorKind;
use std::panic::Location;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use nix::unistd::{access, AccessFlags};

use kerncheck_core::{Reporter, Result, ResultKind, TestResult};

use crate::safe::syscall_failed;

bitflags! {
    /// Per-path tolerance flags (the `?` and `!` descriptor sigils).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaveFlags: u8 {
        /// `?`: a missing path is skipped with an INFO note instead of
        /// raising CONF.
        const SKIP_MISSING = 1 << 0;
        /// `!`: a read-only path is skipped with an INFO note instead
        /// of raising BROK on the write.
        const SKIP_UNWRITABLE = 1 << 1;
    }
}

/// Prior content of one mutated tunable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedConfigEntry {
    /// Absolute proc/sys path.
    pub path: PathBuf,
    /// Content captured before the first mutation.
    pub original: String,
}

/// Stack of saved tunables, restored most-recent-first.
#[derive(Debug, Default)]
pub struct ConfigStore {
    entries: Vec<SavedConfigEntry>,
}

impl ConfigStore {
    /// Empty store.
    pub fn new() -> Self {
        ConfigStore::default()
    }

    /// Number of entries pending restore.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether anything is pending restore.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the current content of `path`.
    ///
    /// Returns `true` when an entry was pushed, `false` when the path
    /// was skipped per `flags`. A path that is missing without
    /// `SKIP_MISSING` raises CONF (the environment lacks the tunable);
    /// any other read error raises BROK.
    #[track_caller]
    pub fn save(
        &mut self,
        reporter: &Reporter,
        path: impl AsRef<Path>,
        flags: SaveFlags,
    ) -> Result<bool> {
        let loc = Location::caller();
        let path = path.as_ref();

        let original = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if flags.contains(SaveFlags::SKIP_MISSING) {
                    reporter.submit(TestResult::at(
                        loc,
                        ResultKind::Info,
                        format!("{} does not exist, skipping", path.display()),
                    ));
                    return Ok(false);
                }
                reporter.submit(TestResult::at(
                    loc,
                    ResultKind::Conf,
                    format!("{} does not exist", path.display()),
                ));
                return Err(kerncheck_core::TestError::not_supported(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
            Err(e) => {
                let errno = e
                    .raw_os_error()
                    .map(nix::errno::Errno::from_raw)
                    .unwrap_or(nix::errno::Errno::UnknownErrno);
                return Err(syscall_failed(
                    reporter,
                    loc,
                    "open",
                    &path.display().to_string(),
                    errno,
                ));
            }
        };

        if flags.contains(SaveFlags::SKIP_UNWRITABLE) && access(path, AccessFlags::W_OK).is_err() {
            reporter.submit(TestResult::at(
                loc,
                ResultKind::Info,
                format!("{} is not writable, skipping", path.display()),
            ));
            return Ok(false);
        }

        tracing::debug!(path = %path.display(), "saved tunable");
        self.entries.push(SavedConfigEntry {
            path: path.to_path_buf(),
            original,
        });
        Ok(true)
    }

    /// Save `path`, then write `value` to it.
    ///
    /// A write failure is reported per `flags`, but the saved entry
    /// stays either way: restore is still attempted at cleanup.
    #[track_caller]
    pub fn save_and_set(
        &mut self,
        reporter: &Reporter,
        path: impl AsRef<Path>,
        value: &str,
        flags: SaveFlags,
    ) -> Result<()> {
        let loc = Location::caller();
        let path = path.as_ref();

        if !self.save(reporter, path, flags)? {
            return Ok(());
        }

        if let Err(e) = fs::write(path, value) {
            if flags.contains(SaveFlags::SKIP_UNWRITABLE) {
                reporter.submit(TestResult::at(
                    loc,
                    ResultKind::Info,
                    format!("cannot write {}, skipping", path.display()),
                ));
                return Ok(());
            }
            let errno = e
                .raw_os_error()
                .map(nix::errno::Errno::from_raw)
                .unwrap_or(nix::errno::Errno::UnknownErrno);
            return Err(syscall_failed(
                reporter,
                loc,
                "write",
                &path.display().to_string(),
                errno,
            ));
        }

        Ok(())
    }

    /// Write `value` to an already-managed tunable, BROK on failure.
    #[track_caller]
    pub fn set(&self, reporter: &Reporter, path: impl AsRef<Path>, value: &str) -> Result<()> {
        let loc = Location::caller();
        let path = path.as_ref();

        fs::write(path, value).map_err(|e| {
            let errno = e
                .raw_os_error()
                .map(nix::errno::Errno::from_raw)
                .unwrap_or(nix::errno::Errno::UnknownErrno);
            syscall_failed(reporter, loc, "write", &path.display().to_string(), errno)
        })
    }

    /// Write every saved entry back, most-recent-first.
    ///
    /// Each saved path is attempted exactly once. A failed write is
    /// reported as WARN and never stops the remaining restores; one
    /// stuck tunable must not suppress restoration of the rest.
    pub fn restore_all(&mut self, reporter: &Reporter, verbose: bool) {
        while let Some(entry) = self.entries.pop() {
            match fs::write(&entry.path, &entry.original) {
                Ok(()) => {
                    if verbose {
                        reporter.info(format!("restored {}", entry.path.display()));
                    }
                }
                Err(e) => {
                    reporter.warn(format!(
                        "failed to restore {}: {}",
                        entry.path.display(),
                        e
                    ));
                }
            }
        }
    }
}
