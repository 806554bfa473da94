// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task and deadline entry points.

use std::ffi::{c_int, c_void};
use std::ptr;

use conch_rt::deadline::{self, Deadline};
use conch_rt::task::{self, TaskHandle};

use crate::codes::CONCH_INVAL;
use crate::SendPtr;

pub type conch_task_fn_t = Option<unsafe extern "C" fn(*mut c_void) -> *mut c_void>;

/// Opaque task handle.
pub struct conch_task_t {
    handle: Option<TaskHandle<SendPtr>>,
}

/// Spawn `func(arg)` as a task. Null `func` yields null.
#[no_mangle]
pub unsafe extern "C" fn conch_spawn(func: conch_task_fn_t, arg: *mut c_void) -> *mut conch_task_t {
    let Some(func) = func else {
        return ptr::null_mut();
    };
    let arg = SendPtr(arg);
    // SAFETY: the entry function and its argument are the caller's
    // contract, exactly as with pthread_create.
    let handle = task::spawn(move || SendPtr(unsafe { func(arg.0) }));
    Box::into_raw(Box::new(conch_task_t {
        handle: Some(handle),
    }))
}

/// Join the task, surfacing its result pointer. Null after the first
/// join, for a null task, or when the task panicked.
#[no_mangle]
pub unsafe extern "C" fn conch_task_join(task: *mut conch_task_t) -> *mut c_void {
    let Some(task) = task.as_mut() else {
        return ptr::null_mut();
    };
    match task.handle.take() {
        Some(h) => match h.join() {
            Ok(p) => p.0,
            Err(_) => ptr::null_mut(),
        },
        None => ptr::null_mut(),
    }
}

/// Release the handle. An un-joined task is detached, not killed.
#[no_mangle]
pub unsafe extern "C" fn conch_task_free(task: *mut conch_task_t) {
    if task.is_null() {
        return;
    }
    let task = Box::from_raw(task);
    if let Some(h) = task.handle {
        h.detach();
    }
}

#[no_mangle]
pub extern "C" fn conch_sleep_ms(ms: u64) {
    task::sleep_ms(ms);
}

// --- deadlines (passed by value; `Deadline` is repr(C)) ---

#[no_mangle]
pub extern "C" fn conch_deadline_none() -> Deadline {
    Deadline::none()
}

#[no_mangle]
pub extern "C" fn conch_deadline_after_ms(ms: u64) -> Deadline {
    Deadline::after_ms(ms)
}

#[no_mangle]
pub extern "C" fn conch_deadline_expired(d: Deadline) -> bool {
    d.expired()
}

/// Install `d` as the thread's current deadline; returns the previous
/// value for the matching [`conch_deadline_pop`].
#[no_mangle]
pub extern "C" fn conch_deadline_push(d: Deadline) -> Deadline {
    deadline::push(d)
}

#[no_mangle]
pub extern "C" fn conch_deadline_pop(prev: Deadline) {
    deadline::pop(prev);
}

/// Write the absolute time into `out`. Returns 0 and leaves `out`
/// untouched when the deadline is "none"; `EINVAL` for a null out.
#[no_mangle]
pub unsafe extern "C" fn conch_deadline_as_timespec(
    d: Deadline,
    out: *mut libc::timespec,
) -> c_int {
    if out.is_null() {
        return CONCH_INVAL;
    }
    match d.as_timespec() {
        Some(ts) => {
            *out = ts;
            1
        }
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn conch_cancel_current() {
    deadline::cancel_current();
}

#[no_mangle]
pub extern "C" fn conch_is_cancelled_current() -> bool {
    deadline::is_cancelled_current()
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn triple(arg: *mut c_void) -> *mut c_void {
        ((arg as usize) * 3) as *mut c_void
    }

    #[test]
    fn spawn_join_free() {
        unsafe {
            let t = conch_spawn(Some(triple), 7 as *mut c_void);
            assert!(!t.is_null());
            assert_eq!(conch_task_join(t) as usize, 21);
            // Second join yields null.
            assert!(conch_task_join(t).is_null());
            conch_task_free(t);
        }
    }

    #[test]
    fn null_entry_is_rejected() {
        unsafe {
            assert!(conch_spawn(None, ptr::null_mut()).is_null());
            assert!(conch_task_join(ptr::null_mut()).is_null());
            conch_task_free(ptr::null_mut());
        }
    }

    #[test]
    fn deadline_round_trip() {
        let d = conch_deadline_after_ms(1000);
        assert!(!conch_deadline_expired(d));
        let prev = conch_deadline_push(d);
        assert!(!conch_is_cancelled_current());
        conch_cancel_current();
        assert!(conch_is_cancelled_current());
        conch_deadline_pop(prev);
        assert!(!conch_is_cancelled_current());

        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            assert_eq!(conch_deadline_as_timespec(d, &mut ts), 1);
            assert!(ts.tv_sec > 0);
            assert_eq!(conch_deadline_as_timespec(conch_deadline_none(), &mut ts), 0);
        }
    }
}
