//! Error types for the harness core
//!
//! This module defines the unwind channel used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! Only two situations travel as errors: the harness is broken (BROK)
//! or the environment cannot run the test (CONF). A subject FAIL is
//! *not* an error; it is recorded through the reporter and execution
//! continues with the next sub-case.

use std::io;

use thiserror::Error;

use crate::result::ErrnoCapture;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, TestError>;

/// Terminal conditions that unwind a test to cleanup.
#[derive(Debug, Error)]
pub enum TestError {
    /// The harness or its environment is broken (BROK). Always unwinds
    /// to cleanup; never recovered locally.
    #[error("harness broken: {message}")]
    Broken {
        /// What went wrong.
        message: String,
        /// Errno captured when the condition was detected.
        errno: Option<ErrnoCapture>,
    },

    /// The environment does not support what the test needs (CONF).
    /// Unwinds to cleanup but is excluded from failure accounting.
    #[error("not supported: {message}")]
    NotSupported {
        /// Why the test does not apply here.
        message: String,
    },
}

impl TestError {
    /// A BROK condition without errno context.
    pub fn broken(message: impl Into<String>) -> Self {
        TestError::Broken {
            message: message.into(),
            errno: None,
        }
    }

    /// A BROK condition decorated with the calling thread's current
    /// errno, captured immediately.
    pub fn broken_errno(message: impl Into<String>) -> Self {
        let errno = ErrnoCapture::last();
        TestError::Broken {
            message: message.into(),
            errno: Some(errno),
        }
    }

    /// A CONF condition.
    pub fn not_supported(message: impl Into<String>) -> Self {
        TestError::NotSupported {
            message: message.into(),
        }
    }

    /// Whether this error is a BROK (as opposed to a CONF).
    pub fn is_broken(&self) -> bool {
        matches!(self, TestError::Broken { .. })
    }
}

impl From<io::Error> for TestError {
    fn from(e: io::Error) -> Self {
        let errno = ErrnoCapture::from_io(&e);
        TestError::Broken {
            message: e.to_string(),
            errno,
        }
    }
}

impl From<nix::errno::Errno> for TestError {
    fn from(e: nix::errno::Errno) -> Self {
        TestError::Broken {
            message: e.desc().to_string(),
            errno: Some(ErrnoCapture::from_errno(e)),
        }
    }
}
