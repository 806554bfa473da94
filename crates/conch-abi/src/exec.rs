// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Executor entry points.

use std::ffi::{c_int, c_void};
use std::sync::Arc;

use conch_rt::executor::Executor;

use crate::codes::{CONCH_INVAL, CONCH_OK};
use crate::SendPtr;

pub type conch_job_fn_t = Option<unsafe extern "C" fn(*mut c_void)>;

/// Opaque executor handle.
pub struct conch_exec_t {
    pub(crate) exec: Arc<Executor>,
}

/// Create an executor. Zero selects the defaults (4 workers, queue 128).
#[no_mangle]
pub extern "C" fn conch_exec_create(workers: usize, queue_cap: usize) -> *mut conch_exec_t {
    Box::into_raw(Box::new(conch_exec_t {
        exec: Arc::new(Executor::new(workers, queue_cap)),
    }))
}

/// Enqueue `func(arg)`. `EAGAIN` when the queue is full, `EPIPE` after
/// shutdown.
#[no_mangle]
pub unsafe extern "C" fn conch_exec_submit(
    exec: *mut conch_exec_t,
    func: conch_job_fn_t,
    arg: *mut c_void,
) -> c_int {
    let Some(exec) = exec.as_ref() else {
        return CONCH_INVAL;
    };
    let Some(func) = func else {
        return CONCH_INVAL;
    };
    let arg = SendPtr(arg);
    // SAFETY: job function and argument validity are the caller's contract.
    match exec.exec.submit(move || unsafe { func(arg.0) }) {
        Ok(()) => CONCH_OK,
        Err(e) => e.code(),
    }
}

/// Stop accepting jobs and join the workers. Idempotent.
#[no_mangle]
pub unsafe extern "C" fn conch_exec_shutdown(exec: *mut conch_exec_t) {
    if let Some(exec) = exec.as_ref() {
        exec.exec.shutdown();
    }
}

/// Release the handle. Must follow `conch_exec_shutdown` in normal flow
/// (dropping also shuts down as a backstop).
#[no_mangle]
pub unsafe extern "C" fn conch_exec_free(exec: *mut conch_exec_t) {
    if exec.is_null() {
        return;
    }
    drop(Box::from_raw(exec));
}

pub(crate) unsafe fn exec_ref<'a>(exec: *mut conch_exec_t) -> Option<&'a conch_exec_t> {
    exec.as_ref()
}

/// Wrap an existing executor (the async runtime's shared one) in a
/// heap handle.
pub(crate) fn wrap_shared(exec: Arc<Executor>) -> *mut conch_exec_t {
    Box::into_raw(Box::new(conch_exec_t { exec }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe extern "C" fn bump(arg: *mut c_void) {
        (*(arg as *const AtomicUsize)).fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn submit_runs_jobs() {
        let count = AtomicUsize::new(0);
        let arg = &count as *const AtomicUsize as *mut c_void;
        unsafe {
            let e = conch_exec_create(2, 16);
            for _ in 0..5 {
                assert_eq!(conch_exec_submit(e, Some(bump), arg), CONCH_OK);
            }
            conch_exec_shutdown(e);
            assert_eq!(count.load(Ordering::SeqCst), 5);
            conch_exec_free(e);
        }
    }

    #[test]
    fn invalid_arguments() {
        unsafe {
            assert_eq!(
                conch_exec_submit(ptr::null_mut(), Some(bump), ptr::null_mut()),
                CONCH_INVAL
            );
            let e = conch_exec_create(1, 4);
            assert_eq!(conch_exec_submit(e, None, ptr::null_mut()), CONCH_INVAL);
            conch_exec_shutdown(e);
            assert_eq!(
                conch_exec_submit(e, Some(bump), ptr::null_mut()),
                libc::EPIPE
            );
            conch_exec_free(e);
        }
    }
}
