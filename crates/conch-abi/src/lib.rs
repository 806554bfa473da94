// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! C ABI for the Conch runtime.
//!
//! The compiler frontend lowers Conch constructs in C source to calls
//! against this surface. Everything here is a thin, validated wrapper:
//! the semantics live in `conch-rt`/`conch-aio`; this crate erases
//! types (elements become `elem_size` byte blobs), checks pointers and
//! sizes, and maps error kinds to errno-class codes.
//!
//! Conventions:
//! - every function is `conch_`-prefixed and `extern "C"`;
//! - status returns are `c_int` (0 ok, errno-class otherwise);
//! - objects are opaque pointers created/freed by this crate;
//! - a null required pointer is `EINVAL`, never a crash.

#![allow(non_camel_case_types)]

use std::ffi::c_void;

pub mod achan;
pub mod aio;
pub mod chan;
pub mod closure;
pub mod codes;
pub mod exec;
pub mod nursery;
pub mod sched;

/// Raw pointer that crosses threads. The C caller guarantees the
/// pointee outlives the operation, as with any fd or buffer handed to
/// an async syscall.
#[derive(Clone, Copy)]
pub(crate) struct SendPtr(pub *mut c_void);

// SAFETY: validity and lifetime of the pointee are the C caller's
// contract; the wrapper only moves the address between threads.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Size-erased channel element.
pub(crate) type RawMsg = Box<[u8]>;

/// Copy `size` bytes from a caller buffer into an owned message.
///
/// # Safety
/// `data` must be readable for `size` bytes.
pub(crate) unsafe fn msg_from_raw(data: *const c_void, size: usize) -> RawMsg {
    std::slice::from_raw_parts(data as *const u8, size)
        .to_vec()
        .into_boxed_slice()
}

/// Copy a message out to a caller buffer.
///
/// # Safety
/// `out` must be writable for `msg.len()` bytes.
pub(crate) unsafe fn msg_to_raw(msg: &RawMsg, out: *mut c_void) {
    std::ptr::copy_nonoverlapping(msg.as_ptr(), out as *mut u8, msg.len());
}
