// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Status codes at the ABI.
//!
//! Errno-class so generated C can compare against `<errno.h>` names
//! directly; syscall failures pass their errno through unchanged.

use std::ffi::c_int;

pub const CONCH_OK: c_int = 0;
pub const CONCH_INVAL: c_int = libc::EINVAL;
pub const CONCH_NOMEM: c_int = libc::ENOMEM;
pub const CONCH_AGAIN: c_int = libc::EAGAIN;
pub const CONCH_TIMED_OUT: c_int = libc::ETIMEDOUT;
pub const CONCH_CANCELLED: c_int = libc::ECANCELED;
pub const CONCH_PIPE: c_int = libc::EPIPE;
pub const CONCH_BADF: c_int = libc::EBADF;
pub const CONCH_IO: c_int = libc::EIO;
pub const CONCH_NOTSUP: c_int = libc::EOPNOTSUPP;
pub const CONCH_DEADLK: c_int = libc::EDEADLK;
