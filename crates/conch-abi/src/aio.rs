// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Async runtime registry and file I/O entry points.
//!
//! Synchronous ops return status + out-parameters; `_async` variants
//! return a completion handle and write results through caller pointers
//! that must stay valid until the handle completes. `read_all` hands
//! back a `malloc`'d buffer the caller releases with `free(3)`.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::os::unix::io::RawFd;
use std::ptr;

use conch_aio::runtime::{self, Backend};
use conch_aio::{fs, poll};
use conch_rt::async_handle::AsyncHandle;
use conch_rt::deadline::Deadline;
use conch_rt::error::RtError;

use crate::achan::conch_async_t;
use crate::codes::{CONCH_INVAL, CONCH_OK};
use crate::SendPtr;

pub const CONCH_BACKEND_EXECUTOR: c_int = 0;
pub const CONCH_BACKEND_POLL: c_int = 1;

#[no_mangle]
pub extern "C" fn conch_async_runtime_init(workers: usize, queue_cap: usize) {
    runtime::init(workers, queue_cap);
}

#[no_mangle]
pub extern "C" fn conch_async_runtime_set_backend(backend: c_int) -> c_int {
    match backend {
        CONCH_BACKEND_EXECUTOR => runtime::set_backend(Backend::Executor),
        CONCH_BACKEND_POLL => runtime::set_backend(Backend::Poll),
        _ => return CONCH_INVAL,
    }
    CONCH_OK
}

#[no_mangle]
pub extern "C" fn conch_async_runtime_backend() -> c_int {
    match runtime::backend() {
        Backend::Executor => CONCH_BACKEND_EXECUTOR,
        Backend::Poll => CONCH_BACKEND_POLL,
    }
}

#[no_mangle]
pub extern "C" fn conch_async_runtime_backend_name() -> *const c_char {
    match runtime::backend() {
        Backend::Executor => b"executor\0".as_ptr() as *const c_char,
        Backend::Poll => b"poll\0".as_ptr() as *const c_char,
    }
}

/// Handle onto the shared executor (created on demand). The returned
/// wrapper is freed with `conch_exec_free`; shutting it down shuts the
/// shared executor itself.
#[no_mangle]
pub extern "C" fn conch_async_runtime_exec() -> *mut crate::exec::conch_exec_t {
    crate::exec::wrap_shared(runtime::shared_executor())
}

#[no_mangle]
pub extern "C" fn conch_async_runtime_shutdown() {
    runtime::shutdown();
}

// --- synchronous file ops ---

unsafe fn path_from(path: *const c_char) -> Result<&'static str, RtError> {
    if path.is_null() {
        return Err(RtError::Inval);
    }
    CStr::from_ptr(path).to_str().map_err(|_| RtError::Inval)
}

#[no_mangle]
pub unsafe extern "C" fn conch_file_open(
    path: *const c_char,
    flags: c_int,
    mode: u32,
    out_fd: *mut c_int,
) -> c_int {
    if out_fd.is_null() {
        return CONCH_INVAL;
    }
    let path = match path_from(path) {
        Ok(p) => p,
        Err(e) => return e.code(),
    };
    match fs::open(path, flags, mode) {
        Ok(fd) => {
            *out_fd = fd;
            CONCH_OK
        }
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub extern "C" fn conch_file_close(fd: c_int) -> c_int {
    match fs::close(fd) {
        Ok(()) => CONCH_OK,
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_file_read(
    fd: c_int,
    buf: *mut c_void,
    len: usize,
    out_n: *mut usize,
) -> c_int {
    if buf.is_null() || out_n.is_null() {
        return CONCH_INVAL;
    }
    let slice = std::slice::from_raw_parts_mut(buf as *mut u8, len);
    match fs::read(fd, slice) {
        Ok(n) => {
            *out_n = n;
            CONCH_OK
        }
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_file_write(
    fd: c_int,
    data: *const c_void,
    len: usize,
    out_n: *mut usize,
) -> c_int {
    if data.is_null() || out_n.is_null() {
        return CONCH_INVAL;
    }
    let slice = std::slice::from_raw_parts(data as *const u8, len);
    match fs::write(fd, slice) {
        Ok(n) => {
            *out_n = n;
            CONCH_OK
        }
        Err(e) => e.code(),
    }
}

/// Copy a Vec into a `malloc`'d buffer for the C side.
unsafe fn vec_to_malloc(data: &[u8], out_data: *mut *mut c_void, out_len: *mut usize) -> c_int {
    let buf = libc::malloc(data.len().max(1));
    if buf.is_null() {
        return libc::ENOMEM;
    }
    ptr::copy_nonoverlapping(data.as_ptr(), buf as *mut u8, data.len());
    *out_data = buf;
    *out_len = data.len();
    CONCH_OK
}

/// Read to EOF into a `malloc`'d buffer (caller frees). Regular files
/// only.
#[no_mangle]
pub unsafe extern "C" fn conch_file_read_all(
    fd: c_int,
    out_data: *mut *mut c_void,
    out_len: *mut usize,
) -> c_int {
    if out_data.is_null() || out_len.is_null() {
        return CONCH_INVAL;
    }
    match fs::read_all(fd) {
        Ok(data) => vec_to_malloc(&data, out_data, out_len),
        Err(e) => e.code(),
    }
}

/// Read one line (newline excluded) into the caller's buffer.
#[no_mangle]
pub unsafe extern "C" fn conch_file_read_line(
    fd: c_int,
    buf: *mut c_void,
    cap: usize,
    out_n: *mut usize,
) -> c_int {
    if buf.is_null() || out_n.is_null() {
        return CONCH_INVAL;
    }
    match fs::read_line(fd) {
        Ok(line) => {
            if line.len() > cap {
                return libc::ENOMEM;
            }
            ptr::copy_nonoverlapping(line.as_ptr(), buf as *mut u8, line.len());
            *out_n = line.len();
            CONCH_OK
        }
        Err(e) => e.code(),
    }
}

// --- async variants ---

/// Submit `op` on the shared executor; completion carries its status.
fn submit_op(
    op: impl FnOnce() -> Result<(), RtError> + Send + 'static,
) -> *mut conch_async_t {
    let exec = runtime::shared_executor();
    let handle = AsyncHandle::new();
    let done = handle.clone();
    let submitted = exec.submit(move || {
        let code = match op() {
            Ok(()) => CONCH_OK,
            Err(e) => e.code(),
        };
        done.complete(code);
    });
    match submitted {
        Ok(()) => conch_async_t::into_raw(handle),
        Err(_) => ptr::null_mut(),
    }
}

fn use_poll() -> bool {
    runtime::backend() == Backend::Poll
}

#[no_mangle]
pub unsafe extern "C" fn conch_file_open_async(
    path: *const c_char,
    flags: c_int,
    mode: u32,
    out_fd: *mut c_int,
    d: Deadline,
) -> *mut conch_async_t {
    if out_fd.is_null() {
        return ptr::null_mut();
    }
    let Ok(path) = path_from(path) else {
        return ptr::null_mut();
    };
    let path = path.to_string();
    let out = SendPtr(out_fd as *mut c_void);
    submit_op(move || {
        let fd = if use_poll() {
            poll::open(&path, flags, mode, d)?
        } else {
            fs::open(&path, flags, mode)?
        };
        // SAFETY: caller keeps out_fd valid until completion.
        unsafe { *(out.0 as *mut c_int) = fd };
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn conch_file_close_async(fd: c_int) -> *mut conch_async_t {
    submit_op(move || fs::close(fd))
}

#[no_mangle]
pub unsafe extern "C" fn conch_file_read_async(
    fd: c_int,
    buf: *mut c_void,
    len: usize,
    out_n: *mut usize,
    d: Deadline,
) -> *mut conch_async_t {
    if buf.is_null() || out_n.is_null() {
        return ptr::null_mut();
    }
    let buf = SendPtr(buf);
    let out = SendPtr(out_n as *mut c_void);
    submit_op(move || {
        // SAFETY: caller keeps buf/out_n valid until completion.
        let slice = unsafe { std::slice::from_raw_parts_mut(buf.0 as *mut u8, len) };
        let n = if use_poll() {
            poll::read(fd, slice, d)?
        } else {
            fs::read(fd, slice)?
        };
        unsafe { *(out.0 as *mut usize) = n };
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn conch_file_read_all_async(
    fd: c_int,
    out_data: *mut *mut c_void,
    out_len: *mut usize,
    d: Deadline,
) -> *mut conch_async_t {
    if out_data.is_null() || out_len.is_null() {
        return ptr::null_mut();
    }
    let out_data = SendPtr(out_data as *mut c_void);
    let out_len = SendPtr(out_len as *mut c_void);
    submit_op(move || {
        let data = if use_poll() {
            poll::read_all(fd, d)?
        } else {
            fs::read_all(fd)?
        };
        // SAFETY: caller keeps the out-pointers valid until completion.
        let code = unsafe {
            vec_to_malloc(
                &data,
                out_data.0 as *mut *mut c_void,
                out_len.0 as *mut usize,
            )
        };
        RtError::check(code)
    })
}

#[no_mangle]
pub unsafe extern "C" fn conch_file_read_line_async(
    fd: c_int,
    buf: *mut c_void,
    cap: usize,
    out_n: *mut usize,
    d: Deadline,
) -> *mut conch_async_t {
    if buf.is_null() || out_n.is_null() {
        return ptr::null_mut();
    }
    let buf = SendPtr(buf);
    let out = SendPtr(out_n as *mut c_void);
    submit_op(move || {
        let line = if use_poll() {
            poll::read_line(fd, d)?
        } else {
            fs::read_line(fd)?
        };
        if line.len() > cap {
            return Err(RtError::Nomem);
        }
        // SAFETY: caller keeps buf/out_n valid until completion.
        unsafe {
            ptr::copy_nonoverlapping(line.as_ptr(), buf.0 as *mut u8, line.len());
            *(out.0 as *mut usize) = line.len();
        }
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn conch_file_write_async(
    fd: c_int,
    data: *const c_void,
    len: usize,
    out_n: *mut usize,
    d: Deadline,
) -> *mut conch_async_t {
    if data.is_null() || out_n.is_null() {
        return ptr::null_mut();
    }
    let data = SendPtr(data as *mut c_void);
    let out = SendPtr(out_n as *mut c_void);
    submit_op(move || {
        // SAFETY: caller keeps data/out_n valid until completion.
        let slice = unsafe { std::slice::from_raw_parts(data.0 as *const u8, len) };
        let n = if use_poll() {
            poll::write(fd, slice, d)?
        } else {
            fs::write(fd, slice)?
        };
        unsafe { *(out.0 as *mut usize) = n };
        Ok(())
    })
}
