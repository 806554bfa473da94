// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Async handles and async channels.
//!
//! `await expr` in Conch source lowers to `conch_async_await` on the
//! handle the operation returned.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use conch_rt::async_chan::AsyncChannel;
use conch_rt::async_handle::AsyncHandle;
use conch_rt::deadline::Deadline;

use crate::chan::{conch_slice_t, CONCH_SLICE_SUB, CONCH_SLICE_UNIQUE};
use crate::codes::{CONCH_INVAL, CONCH_OK};
use crate::{msg_from_raw, msg_to_raw, RawMsg, SendPtr};

/// Opaque async completion handle.
pub struct conch_async_t {
    pub(crate) handle: AsyncHandle,
}

impl conch_async_t {
    pub(crate) fn into_raw(handle: AsyncHandle) -> *mut conch_async_t {
        Box::into_raw(Box::new(conch_async_t { handle }))
    }
}

/// Fresh unfired handle — for custom completers (backends implemented
/// in C).
#[no_mangle]
pub extern "C" fn conch_async_create() -> *mut conch_async_t {
    conch_async_t::into_raw(AsyncHandle::new())
}

/// Announce completion with a status code. Only the first call wins.
#[no_mangle]
pub unsafe extern "C" fn conch_async_complete(op: *mut conch_async_t, code: c_int) -> bool {
    match op.as_ref() {
        Some(op) => op.handle.complete(code),
        None => false,
    }
}

/// Block until the operation completes; returns its status code.
#[no_mangle]
pub unsafe extern "C" fn conch_async_await(op: *mut conch_async_t) -> c_int {
    let Some(op) = op.as_ref() else {
        return CONCH_INVAL;
    };
    match op.handle.wait_code() {
        Ok(code) => code,
        Err(e) => e.code(),
    }
}

/// Bounded await; `ETIMEDOUT`/`ECANCELED` if the deadline wins.
#[no_mangle]
pub unsafe extern "C" fn conch_async_await_deadline(op: *mut conch_async_t, d: Deadline) -> c_int {
    let Some(op) = op.as_ref() else {
        return CONCH_INVAL;
    };
    match op.handle.wait_deadline(d) {
        Ok(()) => CONCH_OK,
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_async_free(op: *mut conch_async_t) {
    if !op.is_null() {
        drop(Box::from_raw(op));
    }
}

// --- async channels ---

/// Opaque async channel.
pub struct conch_async_chan_t {
    chan: Arc<AsyncChannel<RawMsg>>,
    elem_size: AtomicUsize,
    allow_take: bool,
}

unsafe fn achan_ref<'a>(ch: *mut conch_async_chan_t) -> Option<&'a conch_async_chan_t> {
    ch.as_ref()
}

fn ensure_elem(ch: &conch_async_chan_t, size: usize) -> Result<(), conch_rt::RtError> {
    use std::sync::atomic::Ordering;
    if size == 0 {
        return Err(conch_rt::RtError::Inval);
    }
    match ch
        .elem_size
        .compare_exchange(0, size, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => Ok(()),
        Err(existing) if existing == size => Ok(()),
        Err(_) => Err(conch_rt::RtError::Inval),
    }
}

/// Create an async channel. Capacity 0 is a rendezvous queue.
#[no_mangle]
pub extern "C" fn conch_async_chan_create(
    capacity: usize,
    mode: c_int,
    allow_take: bool,
) -> *mut conch_async_chan_t {
    let mode = match mode {
        0 => conch_rt::channel::Backpressure::Block,
        1 => conch_rt::channel::Backpressure::DropNew,
        2 => conch_rt::channel::Backpressure::DropOld,
        _ => return ptr::null_mut(),
    };
    Box::into_raw(Box::new(conch_async_chan_t {
        chan: AsyncChannel::new(capacity, mode),
        elem_size: AtomicUsize::new(0),
        allow_take,
    }))
}

/// Close: every parked op completes with `EPIPE`.
#[no_mangle]
pub unsafe extern "C" fn conch_async_chan_close(ch: *mut conch_async_chan_t) {
    if let Some(ch) = achan_ref(ch) {
        ch.chan.close();
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_async_chan_free(ch: *mut conch_async_chan_t) {
    if !ch.is_null() {
        drop(Box::from_raw(ch));
    }
}

/// Submit a send; returns the completion handle (null on bad args).
#[no_mangle]
pub unsafe extern "C" fn conch_async_chan_send(
    ch: *mut conch_async_chan_t,
    data: *const c_void,
    size: usize,
) -> *mut conch_async_t {
    let Some(ch) = achan_ref(ch) else {
        return ptr::null_mut();
    };
    if data.is_null() || ensure_elem(ch, size).is_err() {
        return ptr::null_mut();
    }
    conch_async_t::into_raw(ch.chan.send(msg_from_raw(data, size)))
}

/// Submit a receive into `out`; the handle completes once the value has
/// been written there. `out` must stay valid until then.
#[no_mangle]
pub unsafe extern "C" fn conch_async_chan_recv(
    ch: *mut conch_async_chan_t,
    out: *mut c_void,
    size: usize,
) -> *mut conch_async_t {
    let Some(ch) = achan_ref(ch) else {
        return ptr::null_mut();
    };
    if out.is_null() || ensure_elem(ch, size).is_err() {
        return ptr::null_mut();
    }
    let out = SendPtr(out);
    let handle = ch.chan.recv_with(Box::new(move |msg: RawMsg| {
        // SAFETY: caller keeps `out` valid until the handle completes.
        unsafe { msg_to_raw(&msg, out.0) };
    }));
    conch_async_t::into_raw(handle)
}

/// Take-transfer a unique, movable slice through the async channel.
#[no_mangle]
pub unsafe extern "C" fn conch_async_chan_send_take_slice(
    ch: *mut conch_async_chan_t,
    slice: *const conch_slice_t,
) -> *mut conch_async_t {
    let Some(ch) = achan_ref(ch) else {
        return ptr::null_mut();
    };
    let Some(slice_ref) = slice.as_ref() else {
        return ptr::null_mut();
    };
    if !ch.allow_take
        || slice_ref.flags & CONCH_SLICE_UNIQUE == 0
        || slice_ref.flags & CONCH_SLICE_SUB != 0
        || ensure_elem(ch, std::mem::size_of::<conch_slice_t>()).is_err()
    {
        return ptr::null_mut();
    }
    conch_async_t::into_raw(
        ch.chan
            .send(msg_from_raw(slice as *const c_void, std::mem::size_of::<conch_slice_t>())),
    )
}

/// Synchronous deadline send (retry loop over the non-parking path).
#[no_mangle]
pub unsafe extern "C" fn conch_async_chan_send_deadline(
    ch: *mut conch_async_chan_t,
    data: *const c_void,
    size: usize,
    d: Deadline,
) -> c_int {
    let Some(ch) = achan_ref(ch) else {
        return CONCH_INVAL;
    };
    if data.is_null() {
        return CONCH_INVAL;
    }
    if let Err(e) = ensure_elem(ch, size) {
        return e.code();
    }
    match ch.chan.send_deadline(msg_from_raw(data, size), d) {
        Ok(()) => CONCH_OK,
        Err(e) => e.kind().code(),
    }
}

/// Synchronous deadline recv.
#[no_mangle]
pub unsafe extern "C" fn conch_async_chan_recv_deadline(
    ch: *mut conch_async_chan_t,
    out: *mut c_void,
    size: usize,
    d: Deadline,
) -> c_int {
    let Some(ch) = achan_ref(ch) else {
        return CONCH_INVAL;
    };
    if out.is_null() {
        return CONCH_INVAL;
    }
    if let Err(e) = ensure_elem(ch, size) {
        return e.code();
    }
    match ch.chan.recv_deadline(d) {
        Ok(msg) => {
            msg_to_raw(&msg, out);
            CONCH_OK
        }
        Err(e) => e.kind().code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn await_round_trip() {
        unsafe {
            let op = conch_async_create();
            assert!(conch_async_complete(op, 0));
            assert!(!conch_async_complete(op, 5));
            assert_eq!(conch_async_await(op), 0);
            conch_async_free(op);
        }
    }

    #[test]
    fn await_deadline_times_out() {
        unsafe {
            let op = conch_async_create();
            assert_eq!(
                conch_async_await_deadline(op, Deadline::after_ms(10)),
                libc::ETIMEDOUT
            );
            conch_async_free(op);
        }
    }

    #[test]
    fn async_chan_send_recv() {
        unsafe {
            let ch = conch_async_chan_create(2, 0, false);
            let v: i32 = 33;
            let send_op = conch_async_chan_send(ch, &v as *const i32 as *const c_void, 4);
            assert_eq!(conch_async_await(send_op), 0);
            conch_async_free(send_op);

            let mut out: i32 = 0;
            let recv_op = conch_async_chan_recv(ch, &mut out as *mut i32 as *mut c_void, 4);
            assert_eq!(conch_async_await(recv_op), 0);
            assert_eq!(out, 33);
            conch_async_free(recv_op);

            conch_async_chan_close(ch);
            conch_async_chan_free(ch);
        }
    }

    #[test]
    fn close_completes_parked_recv() {
        unsafe {
            let ch = conch_async_chan_create(1, 0, false);
            let mut out: i32 = 0;
            let recv_op = conch_async_chan_recv(ch, &mut out as *mut i32 as *mut c_void, 4);
            conch_async_chan_close(ch);
            assert_eq!(conch_async_await(recv_op), libc::EPIPE);
            conch_async_free(recv_op);
            conch_async_chan_free(ch);
        }
    }

    #[test]
    fn take_slice_needs_flag() {
        unsafe {
            let ch = conch_async_chan_create(2, 0, true);
            let s = conch_slice_t {
                data: ptr::null_mut(),
                len: 1,
                elem_size: 1,
                flags: 0, // not unique
                uid: 1,
            };
            assert!(conch_async_chan_send_take_slice(ch, &s).is_null());
            conch_async_chan_free(ch);
        }
    }
}
