// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Closure descriptors and trampolines.
//!
//! A closure is `{ fn, env, drop }` with a heap-owned env. The
//! trampoline guarantees `drop(env)` runs exactly once after the final
//! invocation — including when the body panics. Captures written before
//! the spawn are published to the worker by the spawn's own
//! happens-before edge (the env pointer moves into the task closure).

use std::ffi::c_void;
use std::ptr;

use conch_rt::task;

use crate::SendPtr;

pub type conch_fn0_t = Option<unsafe extern "C" fn(*mut c_void) -> *mut c_void>;
pub type conch_fn1_t = Option<unsafe extern "C" fn(*mut c_void, isize) -> *mut c_void>;
pub type conch_fn2_t = Option<unsafe extern "C" fn(*mut c_void, isize, isize) -> *mut c_void>;
pub type conch_drop_t = Option<unsafe extern "C" fn(*mut c_void)>;

/// Zero-argument closure: `fn(env) -> void*`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct conch_closure0_t {
    pub func: conch_fn0_t,
    pub env: *mut c_void,
    pub drop_env: conch_drop_t,
}

/// One integer-sized argument.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct conch_closure1_t {
    pub func: conch_fn1_t,
    pub env: *mut c_void,
    pub drop_env: conch_drop_t,
}

/// Two integer-sized arguments.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct conch_closure2_t {
    pub func: conch_fn2_t,
    pub env: *mut c_void,
    pub drop_env: conch_drop_t,
}

#[no_mangle]
pub extern "C" fn conch_closure0_make(
    func: conch_fn0_t,
    env: *mut c_void,
    drop_env: conch_drop_t,
) -> conch_closure0_t {
    conch_closure0_t { func, env, drop_env }
}

#[no_mangle]
pub extern "C" fn conch_closure1_make(
    func: conch_fn1_t,
    env: *mut c_void,
    drop_env: conch_drop_t,
) -> conch_closure1_t {
    conch_closure1_t { func, env, drop_env }
}

#[no_mangle]
pub extern "C" fn conch_closure2_make(
    func: conch_fn2_t,
    env: *mut c_void,
    drop_env: conch_drop_t,
) -> conch_closure2_t {
    conch_closure2_t { func, env, drop_env }
}

/// Invoke without consuming: the env stays alive (hook-style reuse).
#[no_mangle]
pub unsafe extern "C" fn conch_closure1_call(c: conch_closure1_t, a0: isize) -> *mut c_void {
    match c.func {
        Some(f) => f(c.env, a0),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_closure2_call(
    c: conch_closure2_t,
    a0: isize,
    a1: isize,
) -> *mut c_void {
    match c.func {
        Some(f) => f(c.env, a0, a1),
        None => ptr::null_mut(),
    }
}

/// Owns a closure env until the trampoline is done with it.
pub(crate) struct EnvGuard {
    env: *mut c_void,
    drop_env: conch_drop_t,
}

// SAFETY: the env is single-owner; the guard moves it to the worker
// thread and releases it exactly once there.
unsafe impl Send for EnvGuard {}

impl EnvGuard {
    fn new(env: *mut c_void, drop_env: conch_drop_t) -> Self {
        Self { env, drop_env }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(drop_env) = self.drop_env {
            // SAFETY: single-owner env, dropped exactly once here.
            unsafe { drop_env(self.env) };
        }
    }
}

/// Turn a descriptor into a spawnable thunk. The guard drops the env
/// after the call even if the body panics.
pub(crate) fn thunk0(c: conch_closure0_t) -> impl FnOnce() -> SendPtr + Send + 'static {
    let guard = EnvGuard::new(c.env, c.drop_env);
    let func = c.func;
    move || {
        let guard = guard;
        let out = match func {
            // SAFETY: env is valid until the guard drops, after this call.
            Some(f) => unsafe { f(guard.env) },
            None => ptr::null_mut(),
        };
        SendPtr(out)
    }
}

pub(crate) fn thunk1(c: conch_closure1_t, a0: isize) -> impl FnOnce() -> SendPtr + Send + 'static {
    let guard = EnvGuard::new(c.env, c.drop_env);
    let func = c.func;
    move || {
        let guard = guard;
        let out = match func {
            // SAFETY: as in thunk0.
            Some(f) => unsafe { f(guard.env, a0) },
            None => ptr::null_mut(),
        };
        SendPtr(out)
    }
}

pub(crate) fn thunk2(
    c: conch_closure2_t,
    a0: isize,
    a1: isize,
) -> impl FnOnce() -> SendPtr + Send + 'static {
    let guard = EnvGuard::new(c.env, c.drop_env);
    let func = c.func;
    move || {
        let guard = guard;
        let out = match func {
            // SAFETY: as in thunk0.
            Some(f) => unsafe { f(guard.env, a0, a1) },
            None => ptr::null_mut(),
        };
        SendPtr(out)
    }
}

/// Spawn the closure as a task, block on it, return 0 (or `EIO` if the
/// body panicked). The closure's pointer result is dropped.
#[no_mangle]
pub extern "C" fn conch_run_blocking_closure0(c: conch_closure0_t) -> std::ffi::c_int {
    match task::spawn(thunk0(c)).join() {
        Ok(_) => 0,
        Err(e) => e.kind().code(),
    }
}

/// As above but surfaces the closure's `void*` result directly. NULL is
/// not interpreted by the runtime; a panicked body also yields NULL.
#[no_mangle]
pub extern "C" fn conch_run_blocking_closure0_ptr(c: conch_closure0_t) -> *mut c_void {
    match task::spawn(thunk0(c)).join() {
        Ok(p) => p.0,
        Err(_) => ptr::null_mut(),
    }
}
