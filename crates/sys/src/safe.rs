//! Safe syscall wrapper layer
//!
//! Every `safe_*` function invokes one syscall and applies a single
//! policy to failure: consult the classification table, report CONF or
//! BROK through the reporter (with decoded errno, the call's name and
//! arguments, and the caller's file:line), and hand back the unwind
//! error. Success passes the return value through untouched.
//!
//! Test bodies therefore never branch on setup-phase errors: every
//! wrapped call either worked or the test has already stopped.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::panic::Location;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrLike};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use kerncheck_core::{Reporter, Result, ResultKind, TestError, TestResult};

use crate::classify::{classify, FailureClass};

/// Report a wrapped-call failure and build the matching unwind error.
///
/// `loc` is the wrapper's caller, so the emitted record points at the
/// test body, not at this module.
pub(crate) fn syscall_failed(
    reporter: &Reporter,
    loc: &'static Location<'static>,
    call: &str,
    detail: &str,
    errno: Errno,
) -> TestError {
    let capture = kerncheck_core::ErrnoCapture::from_errno(errno);
    let message = format!("{call}({detail}) failed");

    match classify(call, errno) {
        FailureClass::Unsupported => {
            reporter.submit(
                TestResult::at(loc, ResultKind::Conf, format!("{message}: not supported"))
                    .with_errno(capture),
            );
            TestError::not_supported(message)
        }
        FailureClass::Fatal => {
            reporter.submit(
                TestResult::at(loc, ResultKind::Brok, message.clone()).with_errno(capture.clone()),
            );
            TestError::Broken {
                message,
                errno: Some(capture),
            }
        }
    }
}

fn io_errno(err: &io::Error) -> Errno {
    err.raw_os_error()
        .map(Errno::from_raw)
        .unwrap_or(Errno::UnknownErrno)
}

/// Open a file with explicit options.
#[track_caller]
pub fn safe_open(reporter: &Reporter, path: &Path, opts: &OpenOptions) -> Result<File> {
    let loc = Location::caller();
    opts.open(path).map_err(|e| {
        syscall_failed(reporter, loc, "open", &path.display().to_string(), io_errno(&e))
    })
}

/// Read a whole file into a string.
#[track_caller]
pub fn safe_read_file(reporter: &Reporter, path: &Path) -> Result<String> {
    let loc = Location::caller();
    std::fs::read_to_string(path).map_err(|e| {
        syscall_failed(reporter, loc, "open", &path.display().to_string(), io_errno(&e))
    })
}

/// Overwrite a file with `contents`. The file is created if absent.
#[track_caller]
pub fn safe_write_file(reporter: &Reporter, path: &Path, contents: &str) -> Result<()> {
    let loc = Location::caller();
    std::fs::write(path, contents).map_err(|e| {
        syscall_failed(reporter, loc, "write", &path.display().to_string(), io_errno(&e))
    })
}

/// Read from an open stream, retrying on EINTR.
#[track_caller]
pub fn safe_read(reporter: &Reporter, src: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let loc = Location::caller();
    loop {
        match src.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(syscall_failed(reporter, loc, "read", "", io_errno(&e))),
        }
    }
}

/// Write a whole buffer to an open stream.
#[track_caller]
pub fn safe_write(reporter: &Reporter, dst: &mut impl Write, buf: &[u8]) -> Result<()> {
    let loc = Location::caller();
    dst.write_all(buf)
        .map_err(|e| syscall_failed(reporter, loc, "write", "", io_errno(&e)))
}

/// Create a directory.
#[track_caller]
pub fn safe_mkdir(reporter: &Reporter, path: &Path) -> Result<()> {
    let loc = Location::caller();
    std::fs::create_dir(path).map_err(|e| {
        syscall_failed(reporter, loc, "mkdir", &path.display().to_string(), io_errno(&e))
    })
}

/// Remove a file.
#[track_caller]
pub fn safe_unlink(reporter: &Reporter, path: &Path) -> Result<()> {
    let loc = Location::caller();
    std::fs::remove_file(path).map_err(|e| {
        syscall_failed(reporter, loc, "unlink", &path.display().to_string(), io_errno(&e))
    })
}

/// Fork the current process.
///
/// # Safety
///
/// This is as unsafe as `fork` always is in a threaded program; the
/// runner's context wrapper (which also enforces the plan's
/// `forks_child` declaration) is the intended entry point.
#[track_caller]
pub fn safe_fork(reporter: &Reporter) -> Result<ForkResult> {
    let loc = Location::caller();
    unsafe { fork() }.map_err(|e| syscall_failed(reporter, loc, "fork", "", e))
}

/// Wait for one child, retrying on EINTR.
#[track_caller]
pub fn safe_waitpid(reporter: &Reporter, pid: Pid) -> Result<WaitStatus> {
    let loc = Location::caller();
    loop {
        match waitpid(pid, None) {
            Ok(status) => return Ok(status),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(syscall_failed(
                    reporter,
                    loc,
                    "waitpid",
                    &pid.to_string(),
                    e,
                ))
            }
        }
    }
}

/// Send a signal to a process.
#[track_caller]
pub fn safe_kill(reporter: &Reporter, pid: Pid, signal: Signal) -> Result<()> {
    let loc = Location::caller();
    kill(pid, signal).map_err(|e| {
        syscall_failed(reporter, loc, "kill", &format!("{pid}, {signal}"), e)
    })
}

/// Create a socket. Unknown families and types are CONF, not BROK.
#[track_caller]
pub fn safe_socket(
    reporter: &Reporter,
    domain: AddressFamily,
    ty: SockType,
    flags: SockFlag,
    protocol: Option<SockProtocol>,
) -> Result<OwnedFd> {
    let loc = Location::caller();
    socket::socket(domain, ty, flags, protocol).map_err(|e| {
        syscall_failed(reporter, loc, "socket", &format!("{domain:?}, {ty:?}"), e)
    })
}

/// Bind a socket to an address.
#[track_caller]
pub fn safe_bind(reporter: &Reporter, sock: &impl AsFd, addr: &impl SockaddrLike) -> Result<()> {
    let loc = Location::caller();
    let fd = sock.as_fd().as_raw_fd();
    socket::bind(fd, addr)
        .map_err(|e| syscall_failed(reporter, loc, "bind", &format!("fd {fd}"), e))
}

/// Mark a bound socket as accepting connections.
#[track_caller]
pub fn safe_listen(reporter: &Reporter, sock: &impl AsFd, backlog: i32) -> Result<()> {
    let loc = Location::caller();
    let fd = sock.as_fd().as_raw_fd();
    let backlog = Backlog::new(backlog)
        .map_err(|e| syscall_failed(reporter, loc, "listen", &format!("backlog {backlog}"), e))?;
    socket::listen(sock, backlog)
        .map_err(|e| syscall_failed(reporter, loc, "listen", &format!("fd {fd}"), e))
}

/// Accept one connection, BROK if none arrives within `timeout`.
///
/// The deadline keeps a test whose peer never connects from eating the
/// whole plan timeout before the runner steps in.
#[track_caller]
pub fn safe_accept(reporter: &Reporter, sock: &impl AsFd, timeout: Duration) -> Result<OwnedFd> {
    let loc = Location::caller();
    let fd = sock.as_fd().as_raw_fd();

    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    loop {
        let mut fds = [PollFd::new(sock.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => {
                let message = format!("accept(fd {fd}) timed out after {timeout:?}");
                reporter.submit(TestResult::at(loc, ResultKind::Brok, message.clone()));
                return Err(TestError::broken(message));
            }
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(syscall_failed(reporter, loc, "poll", &format!("fd {fd}"), e))
            }
        }
    }

    loop {
        match socket::accept(fd) {
            Ok(conn) => return Ok(unsafe { OwnedFd::from_raw_fd(conn) }),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(syscall_failed(reporter, loc, "accept", &format!("fd {fd}"), e))
            }
        }
    }
}
