// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Nursery entry points.

use std::ffi::{c_int, c_void};
use std::sync::Arc;

use conch_rt::deadline::Deadline;
use conch_rt::nursery::Nursery;

use crate::chan::{chan_ref, conch_chan_t, conch_tx_t};
use crate::closure::{conch_closure0_t, conch_closure1_t, conch_closure2_t, thunk0, thunk1, thunk2};
use crate::codes::{CONCH_INVAL, CONCH_OK};
use crate::sched::conch_task_fn_t;
use crate::SendPtr;

/// Opaque nursery handle.
pub struct conch_nursery_t {
    pub(crate) nursery: Arc<Nursery>,
}

pub(crate) unsafe fn nursery_ref<'a>(n: *mut conch_nursery_t) -> Option<&'a conch_nursery_t> {
    n.as_ref()
}

#[no_mangle]
pub extern "C" fn conch_nursery_create() -> *mut conch_nursery_t {
    Box::into_raw(Box::new(conch_nursery_t {
        nursery: Arc::new(Nursery::new()),
    }))
}

/// Spawn `func(arg)` as a child of the nursery.
#[no_mangle]
pub unsafe extern "C" fn conch_nursery_spawn(
    n: *mut conch_nursery_t,
    func: conch_task_fn_t,
    arg: *mut c_void,
) -> c_int {
    let Some(n) = nursery_ref(n) else {
        return CONCH_INVAL;
    };
    let Some(func) = func else {
        return CONCH_INVAL;
    };
    let arg = SendPtr(arg);
    // SAFETY: entry function and argument are the caller's contract.
    n.nursery.spawn(move || {
        unsafe { func(arg.0) };
    });
    CONCH_OK
}

#[no_mangle]
pub unsafe extern "C" fn conch_nursery_spawn_closure0(
    n: *mut conch_nursery_t,
    c: conch_closure0_t,
) -> c_int {
    let Some(n) = nursery_ref(n) else {
        return CONCH_INVAL;
    };
    let thunk = thunk0(c);
    n.nursery.spawn(move || {
        thunk();
    });
    CONCH_OK
}

#[no_mangle]
pub unsafe extern "C" fn conch_nursery_spawn_closure1(
    n: *mut conch_nursery_t,
    c: conch_closure1_t,
    a0: isize,
) -> c_int {
    let Some(n) = nursery_ref(n) else {
        return CONCH_INVAL;
    };
    let thunk = thunk1(c, a0);
    n.nursery.spawn(move || {
        thunk();
    });
    CONCH_OK
}

#[no_mangle]
pub unsafe extern "C" fn conch_nursery_spawn_closure2(
    n: *mut conch_nursery_t,
    c: conch_closure2_t,
    a0: isize,
    a1: isize,
) -> c_int {
    let Some(n) = nursery_ref(n) else {
        return CONCH_INVAL;
    };
    let thunk = thunk2(c, a0, a1);
    n.nursery.spawn(move || {
        thunk();
    });
    CONCH_OK
}

#[no_mangle]
pub unsafe extern "C" fn conch_nursery_cancel(n: *mut conch_nursery_t) {
    if let Some(n) = nursery_ref(n) {
        n.nursery.cancel();
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_nursery_set_deadline(n: *mut conch_nursery_t, at_ns: u64) {
    if let Some(n) = nursery_ref(n) {
        n.nursery.set_deadline(at_ns);
    }
}

/// Scope deadline without the cancellation bit.
#[no_mangle]
pub unsafe extern "C" fn conch_nursery_deadline(
    n: *mut conch_nursery_t,
    out: *mut Deadline,
) -> c_int {
    let Some(n) = nursery_ref(n) else {
        return CONCH_INVAL;
    };
    if out.is_null() {
        return CONCH_INVAL;
    }
    *out = n.nursery.deadline();
    CONCH_OK
}

#[no_mangle]
pub unsafe extern "C" fn conch_nursery_is_cancelled(n: *mut conch_nursery_t) -> bool {
    nursery_ref(n).map(|n| n.nursery.is_cancelled()).unwrap_or(false)
}

/// Deadline snapshot including the cancellation bit.
#[no_mangle]
pub unsafe extern "C" fn conch_nursery_as_deadline(n: *mut conch_nursery_t) -> Deadline {
    nursery_ref(n)
        .map(|n| n.nursery.as_deadline())
        .unwrap_or_else(Deadline::none)
}

#[no_mangle]
pub unsafe extern "C" fn conch_nursery_add_closing_chan(
    n: *mut conch_nursery_t,
    ch: *mut conch_chan_t,
) -> c_int {
    let Some(n) = nursery_ref(n) else {
        return CONCH_INVAL;
    };
    let Some(ch) = chan_ref(ch) else {
        return CONCH_INVAL;
    };
    n.nursery.add_closing(ch.raw_channel().clone());
    CONCH_OK
}

#[no_mangle]
pub unsafe extern "C" fn conch_nursery_add_closing_tx(
    n: *mut conch_nursery_t,
    tx: conch_tx_t,
) -> c_int {
    conch_nursery_add_closing_chan(n, tx.chan)
}

/// Join all children in spawn order, then close registered channels.
/// Returns the first child failure code (0 otherwise).
#[no_mangle]
pub unsafe extern "C" fn conch_nursery_wait(n: *mut conch_nursery_t) -> c_int {
    let Some(n) = nursery_ref(n) else {
        return CONCH_INVAL;
    };
    match n.nursery.wait() {
        Ok(()) => CONCH_OK,
        Err(e) => e.kind().code(),
    }
}

/// Release the nursery. `conch_nursery_wait` must have run in normal
/// flow; any still-running children keep the shared state alive.
#[no_mangle]
pub unsafe extern "C" fn conch_nursery_free(n: *mut conch_nursery_t) {
    if !n.is_null() {
        drop(Box::from_raw(n));
    }
}
