// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error kinds.
//!
//! One flat namespace shared by every component; the ABI maps each kind
//! to an errno-class `c_int` so generated C can test codes directly.

use thiserror::Error;

/// Error kinds surfaced by runtime operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RtError {
    /// API contract violation: null argument, size mismatch, bad handle.
    #[error("invalid argument")]
    Inval,
    /// Allocation failure.
    #[error("out of memory")]
    Nomem,
    /// Non-blocking operation would block, or buffer full with drop-new.
    #[error("operation would block")]
    Again,
    /// Deadline expired before the operation completed.
    #[error("operation timed out")]
    TimedOut,
    /// The governing deadline was cancelled.
    #[error("operation cancelled")]
    Cancelled,
    /// Operation on a closed channel or shut-down executor.
    #[error("channel closed")]
    Pipe,
    /// Bad file descriptor.
    #[error("bad file descriptor")]
    Badf,
    /// I/O failure without a more specific errno.
    #[error("i/o error")]
    Io,
    /// Operation not supported on this object (e.g. read_all on a pipe).
    #[error("operation not supported")]
    NotSup,
    /// The runtime deadlock guard fired.
    #[error("deadlock detected")]
    Deadlock,
    /// Passthrough errno from a syscall.
    #[error("os error {0}")]
    Os(i32),
}

impl RtError {
    /// Errno-class code for the C ABI. `Os` passes its errno through.
    pub fn code(self) -> i32 {
        match self {
            RtError::Inval => libc::EINVAL,
            RtError::Nomem => libc::ENOMEM,
            RtError::Again => libc::EAGAIN,
            RtError::TimedOut => libc::ETIMEDOUT,
            RtError::Cancelled => libc::ECANCELED,
            RtError::Pipe => libc::EPIPE,
            RtError::Badf => libc::EBADF,
            RtError::Io => libc::EIO,
            RtError::NotSup => libc::EOPNOTSUPP,
            RtError::Deadlock => libc::EDEADLK,
            RtError::Os(e) => e,
        }
    }

    /// Inverse of [`code`](Self::code). Unknown codes come back as `Os`.
    pub fn from_code(code: i32) -> Self {
        match code {
            c if c == libc::EINVAL => RtError::Inval,
            c if c == libc::ENOMEM => RtError::Nomem,
            c if c == libc::EAGAIN => RtError::Again,
            c if c == libc::ETIMEDOUT => RtError::TimedOut,
            c if c == libc::ECANCELED => RtError::Cancelled,
            c if c == libc::EPIPE => RtError::Pipe,
            c if c == libc::EBADF => RtError::Badf,
            c if c == libc::EIO => RtError::Io,
            c if c == libc::EOPNOTSUPP => RtError::NotSup,
            c if c == libc::EDEADLK => RtError::Deadlock,
            c => RtError::Os(c),
        }
    }

    /// Turn an ABI status code into a `Result`. `0` is success.
    pub fn check(code: i32) -> Result<(), RtError> {
        if code == 0 {
            Ok(())
        } else {
            Err(RtError::from_code(code))
        }
    }

    /// Capture the thread's current `errno`.
    pub fn last_os_error() -> Self {
        RtError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}
