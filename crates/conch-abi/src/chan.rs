// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channel entry points.
//!
//! Elements are `elem_size` byte blobs; the size is latched by
//! `conch_chan_init_elem` or the first send/recv, and every later op
//! must agree (mixing plain sends with slice takes is therefore an
//! error by construction). Take transfers move the pointer or the
//! slice header by value — the runtime never touches the pointee.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use conch_rt::channel::{Backpressure, Channel, DEFAULT_CAPACITY};
use conch_rt::deadline::Deadline;
use conch_rt::error::RtError;
use conch_rt::pool::{PoolHooks, ResourcePool};
use conch_rt::select::{self, CaseStatus, MatchCase, SelectFuture};

use crate::closure::{conch_closure0_t, conch_closure1_t};
use crate::codes::{CONCH_INVAL, CONCH_OK};
use crate::exec::{conch_exec_t, exec_ref};
use crate::nursery::{conch_nursery_t, nursery_ref};
use crate::achan::conch_async_t;
use crate::{msg_from_raw, msg_to_raw, RawMsg, SendPtr};

pub const CONCH_CHAN_BLOCK: c_int = 0;
pub const CONCH_CHAN_DROP_NEW: c_int = 1;
pub const CONCH_CHAN_DROP_OLD: c_int = 2;

/// Slice header as laid out by the frontend's slice lowering.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct conch_slice_t {
    pub data: *mut c_void,
    pub len: usize,
    pub elem_size: usize,
    pub flags: u32,
    pub uid: u64,
}

/// The slice is the unique owner of its storage (movable).
pub const CONCH_SLICE_UNIQUE: u32 = 1 << 0;
/// The slice borrows a sub-range of another slice.
pub const CONCH_SLICE_SUB: u32 = 1 << 1;

/// Hooks for owned channels. Envs are released once, on channel free.
pub(crate) struct OwnedHooks {
    create: conch_closure0_t,
    reset: conch_closure1_t,
    destroy: conch_closure1_t,
}

// SAFETY: hook functions must be callable from any thread — the same
// contract the C side already accepts for task entry functions.
unsafe impl Send for OwnedHooks {}
unsafe impl Sync for OwnedHooks {}

impl Drop for OwnedHooks {
    fn drop(&mut self) {
        // SAFETY: single-owner envs, released exactly once here.
        unsafe {
            if let Some(d) = self.create.drop_env {
                d(self.create.env);
            }
            if let Some(d) = self.reset.drop_env {
                d(self.reset.env);
            }
            if let Some(d) = self.destroy.drop_env {
                d(self.destroy.env);
            }
        }
    }
}

/// Descriptor copies used inside the pool closures; they borrow the
/// envs owned by [`OwnedHooks`] and never drop them.
#[derive(Clone, Copy)]
struct HookSet {
    create: conch_closure0_t,
    reset: conch_closure1_t,
    destroy: conch_closure1_t,
}

// SAFETY: see OwnedHooks.
unsafe impl Send for HookSet {}
unsafe impl Sync for HookSet {}

/// Opaque channel. `pool`/`hooks` are set on owned channels only;
/// field order keeps the pool (which calls the hook functions) alive
/// for teardown before the hook envs are released.
pub struct conch_chan_t {
    chan: Arc<Channel<RawMsg>>,
    elem_size: AtomicUsize,
    pool: Option<ResourcePool<SendPtr>>,
    hooks: Option<OwnedHooks>,
}

/// Send handle: a thin nominal wrapper, copied freely by value.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct conch_tx_t {
    pub chan: *mut conch_chan_t,
}

/// Recv handle.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct conch_rx_t {
    pub chan: *mut conch_chan_t,
}

fn mode_from(mode: c_int) -> Option<Backpressure> {
    match mode {
        CONCH_CHAN_BLOCK => Some(Backpressure::Block),
        CONCH_CHAN_DROP_NEW => Some(Backpressure::DropNew),
        CONCH_CHAN_DROP_OLD => Some(Backpressure::DropOld),
        _ => None,
    }
}

fn new_chan(capacity: usize, mode: Backpressure, allow_take: bool) -> *mut conch_chan_t {
    let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
    match Channel::new(capacity, mode, allow_take) {
        Ok(chan) => Box::into_raw(Box::new(conch_chan_t {
            chan,
            elem_size: AtomicUsize::new(0),
            pool: None,
            hooks: None,
        })),
        Err(_) => ptr::null_mut(),
    }
}

pub(crate) unsafe fn chan_ref<'a>(ch: *mut conch_chan_t) -> Option<&'a conch_chan_t> {
    ch.as_ref()
}

impl conch_chan_t {
    pub(crate) fn raw_channel(&self) -> &Arc<Channel<RawMsg>> {
        &self.chan
    }
}

/// Latch (or verify) the element size.
fn ensure_elem(ch: &conch_chan_t, size: usize) -> Result<(), RtError> {
    if size == 0 {
        return Err(RtError::Inval);
    }
    match ch
        .elem_size
        .compare_exchange(0, size, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => Ok(()),
        Err(existing) if existing == size => Ok(()),
        Err(_) => Err(RtError::Inval),
    }
}

// --- construction / teardown ---

/// Default channel: capacity 64, block on full, no take.
#[no_mangle]
pub extern "C" fn conch_chan_create() -> *mut conch_chan_t {
    new_chan(DEFAULT_CAPACITY, Backpressure::Block, false)
}

#[no_mangle]
pub extern "C" fn conch_chan_create_mode(capacity: usize, mode: c_int) -> *mut conch_chan_t {
    match mode_from(mode) {
        Some(mode) => new_chan(capacity, mode, false),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn conch_chan_create_take(
    capacity: usize,
    mode: c_int,
    allow_take: bool,
) -> *mut conch_chan_t {
    match mode_from(mode) {
        Some(mode) => new_chan(capacity, mode, allow_take),
        None => ptr::null_mut(),
    }
}

/// Owned channel: elements are pointers to pooled resources managed by
/// `create`/`reset`/`destroy`. Take is implied; element size is the
/// pointer size.
#[no_mangle]
pub extern "C" fn conch_chan_create_owned(
    capacity: usize,
    mode: c_int,
    create: conch_closure0_t,
    destroy: conch_closure1_t,
    reset: conch_closure1_t,
) -> *mut conch_chan_t {
    let Some(mode) = mode_from(mode) else {
        return ptr::null_mut();
    };
    if create.func.is_none() {
        return ptr::null_mut();
    }
    let ch = new_chan(capacity, mode, true);
    if ch.is_null() {
        return ch;
    }
    let hooks = HookSet {
        create,
        reset,
        destroy,
    };
    let pool = ResourcePool::new(PoolHooks {
        create: Box::new(move || {
            // SAFETY: hook contract (callable from any thread, env alive
            // until the channel is freed).
            SendPtr(unsafe { hooks.create.func.unwrap()(hooks.create.env) })
        }),
        reset: Box::new(move |p: &mut SendPtr| {
            if let Some(f) = hooks.reset.func {
                // SAFETY: as above.
                unsafe { f(hooks.reset.env, p.0 as isize) };
            }
        }),
        destroy: Box::new(move |p: SendPtr| {
            if let Some(f) = hooks.destroy.func {
                // SAFETY: as above.
                unsafe { f(hooks.destroy.env, p.0 as isize) };
            }
        }),
    });
    // SAFETY: ch was just allocated above and is uniquely ours.
    unsafe {
        (*ch).pool = Some(pool);
        (*ch).hooks = Some(OwnedHooks {
            create,
            reset,
            destroy,
        });
        (*ch).elem_size
            .store(std::mem::size_of::<*mut c_void>(), Ordering::Release);
    }
    ch
}

/// Create a channel plus its two nominal handles.
#[no_mangle]
pub unsafe extern "C" fn conch_chan_pair_create(
    tx: *mut conch_tx_t,
    rx: *mut conch_rx_t,
    capacity: usize,
    mode: c_int,
) -> c_int {
    if tx.is_null() || rx.is_null() {
        return CONCH_INVAL;
    }
    let ch = conch_chan_create_mode(capacity, mode);
    if ch.is_null() {
        return CONCH_INVAL;
    }
    (*tx).chan = ch;
    (*rx).chan = ch;
    CONCH_OK
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_init_elem(ch: *mut conch_chan_t, elem_size: usize) -> c_int {
    let Some(ch) = chan_ref(ch) else {
        return CONCH_INVAL;
    };
    match ensure_elem(ch, elem_size) {
        Ok(()) => CONCH_OK,
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_close(ch: *mut conch_chan_t) {
    if let Some(ch) = chan_ref(ch) {
        ch.chan.close();
    }
}

/// Release the channel. The caller guarantees no thread still sends or
/// receives on it. Owned channels destroy buffered and idle elements.
#[no_mangle]
pub unsafe extern "C" fn conch_chan_free(ch: *mut conch_chan_t) {
    if ch.is_null() {
        return;
    }
    let ch = Box::from_raw(ch);
    if let Some(pool) = &ch.pool {
        ch.chan.close();
        // Undelivered elements own pooled resources; reclaim them.
        while let Ok(msg) = ch.chan.try_recv() {
            pool.destroy(SendPtr(decode_ptr(&msg)));
        }
    }
    // Drop order: pool (destroys idle elements via the hook fns), then
    // hooks (releases the hook envs).
    drop(ch);
}

// --- plain byte-blob send/recv ---

unsafe fn do_send(
    ch: *mut conch_chan_t,
    data: *const c_void,
    size: usize,
    send: impl FnOnce(&Arc<Channel<RawMsg>>, RawMsg) -> c_int,
) -> c_int {
    let Some(ch) = chan_ref(ch) else {
        return CONCH_INVAL;
    };
    if data.is_null() {
        return CONCH_INVAL;
    }
    if let Err(e) = ensure_elem(ch, size) {
        return e.code();
    }
    send(&ch.chan, msg_from_raw(data, size))
}

unsafe fn do_recv(
    ch: *mut conch_chan_t,
    out: *mut c_void,
    size: usize,
    recv: impl FnOnce(&Arc<Channel<RawMsg>>) -> Result<RawMsg, c_int>,
) -> c_int {
    let Some(ch) = chan_ref(ch) else {
        return CONCH_INVAL;
    };
    if out.is_null() {
        return CONCH_INVAL;
    }
    if let Err(e) = ensure_elem(ch, size) {
        return e.code();
    }
    match recv(&ch.chan) {
        Ok(msg) => {
            msg_to_raw(&msg, out);
            CONCH_OK
        }
        Err(code) => code,
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_send(
    ch: *mut conch_chan_t,
    data: *const c_void,
    size: usize,
) -> c_int {
    do_send(ch, data, size, |chan, msg| match chan.send(msg) {
        Ok(()) => CONCH_OK,
        Err(e) => e.kind().code(),
    })
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_try_send(
    ch: *mut conch_chan_t,
    data: *const c_void,
    size: usize,
) -> c_int {
    do_send(ch, data, size, |chan, msg| match chan.try_send(msg) {
        Ok(()) => CONCH_OK,
        Err(e) => e.kind().code(),
    })
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_timed_send(
    ch: *mut conch_chan_t,
    data: *const c_void,
    size: usize,
    at_ns: u64,
) -> c_int {
    do_send(ch, data, size, |chan, msg| {
        match chan.send_timed(msg, at_ns) {
            Ok(()) => CONCH_OK,
            Err(e) => e.kind().code(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_deadline_send(
    ch: *mut conch_chan_t,
    data: *const c_void,
    size: usize,
    d: Deadline,
) -> c_int {
    do_send(ch, data, size, |chan, msg| {
        match chan.send_deadline(msg, d) {
            Ok(()) => CONCH_OK,
            Err(e) => e.kind().code(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_recv(
    ch: *mut conch_chan_t,
    out: *mut c_void,
    size: usize,
) -> c_int {
    do_recv(ch, out, size, |chan| chan.recv().map_err(|e| e.kind().code()))
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_try_recv(
    ch: *mut conch_chan_t,
    out: *mut c_void,
    size: usize,
) -> c_int {
    do_recv(ch, out, size, |chan| {
        chan.try_recv().map_err(|e| e.kind().code())
    })
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_timed_recv(
    ch: *mut conch_chan_t,
    out: *mut c_void,
    size: usize,
    at_ns: u64,
) -> c_int {
    do_recv(ch, out, size, |chan| {
        chan.recv_timed(at_ns).map_err(|e| e.kind().code())
    })
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_deadline_recv(
    ch: *mut conch_chan_t,
    out: *mut c_void,
    size: usize,
    d: Deadline,
) -> c_int {
    do_recv(ch, out, size, |chan| {
        chan.recv_deadline(d).map_err(|e| e.kind().code())
    })
}

// --- take transfers ---

pub(crate) fn encode_ptr(p: *mut c_void) -> RawMsg {
    (p as usize).to_ne_bytes().to_vec().into_boxed_slice()
}

pub(crate) fn decode_ptr(msg: &RawMsg) -> *mut c_void {
    let mut bytes = [0u8; std::mem::size_of::<usize>()];
    bytes.copy_from_slice(msg);
    usize::from_ne_bytes(bytes) as *mut c_void
}

/// Transfer ownership of `ptr`. The sender must not touch the pointee
/// afterwards.
#[no_mangle]
pub unsafe extern "C" fn conch_chan_send_take(ch: *mut conch_chan_t, ptr_: *mut c_void) -> c_int {
    let Some(ch) = chan_ref(ch) else {
        return CONCH_INVAL;
    };
    if !ch.chan.allow_take() {
        return CONCH_INVAL;
    }
    if let Err(e) = ensure_elem(ch, std::mem::size_of::<*mut c_void>()) {
        return e.code();
    }
    match ch.chan.send(encode_ptr(ptr_)) {
        Ok(()) => CONCH_OK,
        Err(e) => e.kind().code(),
    }
}

/// Transfer a unique, movable slice by value. The receiver observes the
/// full header (uid included); the sender's copy is dead.
#[no_mangle]
pub unsafe extern "C" fn conch_chan_send_take_slice(
    ch: *mut conch_chan_t,
    slice: *const conch_slice_t,
) -> c_int {
    let Some(ch) = chan_ref(ch) else {
        return CONCH_INVAL;
    };
    let Some(slice_ref) = slice.as_ref() else {
        return CONCH_INVAL;
    };
    if !ch.chan.allow_take() {
        return CONCH_INVAL;
    }
    if slice_ref.flags & CONCH_SLICE_UNIQUE == 0 || slice_ref.flags & CONCH_SLICE_SUB != 0 {
        return CONCH_INVAL;
    }
    if let Err(e) = ensure_elem(ch, std::mem::size_of::<conch_slice_t>()) {
        return e.code();
    }
    match ch
        .chan
        .send(msg_from_raw(slice as *const c_void, std::mem::size_of::<conch_slice_t>()))
    {
        Ok(()) => CONCH_OK,
        Err(e) => e.kind().code(),
    }
}

// --- owned-channel element checkout ---

/// Check a pooled resource out of an owned channel.
#[no_mangle]
pub unsafe extern "C" fn conch_chan_acquire(ch: *mut conch_chan_t) -> *mut c_void {
    match chan_ref(ch).and_then(|c| c.pool.as_ref()) {
        Some(pool) => pool.acquire_raw().0,
        None => ptr::null_mut(),
    }
}

/// Return a resource to the pool (reset, then recycled).
#[no_mangle]
pub unsafe extern "C" fn conch_chan_release(ch: *mut conch_chan_t, elem: *mut c_void) -> c_int {
    match chan_ref(ch).and_then(|c| c.pool.as_ref()) {
        Some(pool) => {
            pool.release(SendPtr(elem));
            CONCH_OK
        }
        None => CONCH_INVAL,
    }
}

// --- async submission ---

#[no_mangle]
pub unsafe extern "C" fn conch_chan_send_async(
    ch: *mut conch_chan_t,
    data: *const c_void,
    size: usize,
    exec: *mut conch_exec_t,
    d: Deadline,
) -> *mut conch_async_t {
    let (Some(ch), Some(exec)) = (chan_ref(ch), exec_ref(exec)) else {
        return ptr::null_mut();
    };
    if data.is_null() || ensure_elem(ch, size).is_err() {
        return ptr::null_mut();
    }
    let msg = msg_from_raw(data, size);
    match ch.chan.send_async(msg, &exec.exec, d) {
        Ok(handle) => conch_async_t::into_raw(handle),
        Err(_) => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_recv_async(
    ch: *mut conch_chan_t,
    out: *mut c_void,
    size: usize,
    exec: *mut conch_exec_t,
    d: Deadline,
) -> *mut conch_async_t {
    let (Some(ch), Some(exec)) = (chan_ref(ch), exec_ref(exec)) else {
        return ptr::null_mut();
    };
    if out.is_null() || ensure_elem(ch, size).is_err() {
        return ptr::null_mut();
    }
    let chan = ch.chan.clone();
    let out = SendPtr(out);
    let handle = conch_rt::async_handle::AsyncHandle::new();
    let done = handle.clone();
    let submitted = exec.exec.submit(move || {
        let code = match chan.recv_deadline(d) {
            Ok(msg) => {
                // SAFETY: the caller keeps `out` valid until completion.
                unsafe { msg_to_raw(&msg, out.0) };
                CONCH_OK
            }
            Err(e) => e.kind().code(),
        };
        done.complete(code);
    });
    match submitted {
        Ok(()) => conch_async_t::into_raw(handle),
        Err(_) => ptr::null_mut(),
    }
}

// --- nursery-bound helpers ---

#[no_mangle]
pub unsafe extern "C" fn conch_chan_nursery_send(
    ch: *mut conch_chan_t,
    data: *const c_void,
    size: usize,
    nursery: *mut conch_nursery_t,
) -> c_int {
    let Some(n) = nursery_ref(nursery) else {
        return CONCH_INVAL;
    };
    conch_chan_deadline_send(ch, data, size, n.nursery.as_deadline())
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_nursery_recv(
    ch: *mut conch_chan_t,
    out: *mut c_void,
    size: usize,
    nursery: *mut conch_nursery_t,
) -> c_int {
    let Some(n) = nursery_ref(nursery) else {
        return CONCH_INVAL;
    };
    conch_chan_deadline_recv(ch, out, size, n.nursery.as_deadline())
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_nursery_send_take(
    ch: *mut conch_chan_t,
    ptr_: *mut c_void,
    nursery: *mut conch_nursery_t,
) -> c_int {
    let Some(ch_ref) = chan_ref(ch) else {
        return CONCH_INVAL;
    };
    let Some(n) = nursery_ref(nursery) else {
        return CONCH_INVAL;
    };
    if !ch_ref.chan.allow_take() {
        return CONCH_INVAL;
    }
    if let Err(e) = ensure_elem(ch_ref, std::mem::size_of::<*mut c_void>()) {
        return e.code();
    }
    match ch_ref
        .chan
        .send_deadline(encode_ptr(ptr_), n.nursery.as_deadline())
    {
        Ok(()) => CONCH_OK,
        Err(e) => e.kind().code(),
    }
}

// --- multi-way match ---

/// One arm of a `@match`. `buf` is the outbound value for send arms and
/// the destination for recv arms.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct conch_match_case_t {
    pub chan: *mut conch_chan_t,
    pub buf: *mut c_void,
    pub elem_size: usize,
    pub is_send: bool,
}

struct RawRecvCase {
    chan: Arc<Channel<RawMsg>>,
    out: SendPtr,
}

impl MatchCase for RawRecvCase {
    fn attempt(&mut self) -> CaseStatus {
        match self.chan.try_recv() {
            Ok(msg) => {
                // SAFETY: the caller keeps the case buffer valid for the
                // duration of the match.
                unsafe { msg_to_raw(&msg, self.out.0) };
                CaseStatus::Fired
            }
            Err(conch_rt::channel::RecvError::Empty) => CaseStatus::NotReady,
            Err(_) => CaseStatus::Closed,
        }
    }
}

struct RawSendCase {
    chan: Arc<Channel<RawMsg>>,
    msg: Option<RawMsg>,
}

impl MatchCase for RawSendCase {
    fn attempt(&mut self) -> CaseStatus {
        let Some(msg) = self.msg.take() else {
            return CaseStatus::NotReady;
        };
        match self.chan.try_send(msg) {
            Ok(()) => CaseStatus::Fired,
            Err(conch_rt::channel::SendError::Full(m)) => {
                self.msg = Some(m);
                CaseStatus::NotReady
            }
            Err(e) => {
                self.msg = Some(e.into_inner());
                CaseStatus::Closed
            }
        }
    }
}

/// Validate and lift the C cases into owned match cases.
unsafe fn build_cases(
    cases: *const conch_match_case_t,
    n: usize,
) -> Result<Vec<Box<dyn MatchCase>>, RtError> {
    if cases.is_null() || n == 0 {
        return Err(RtError::Inval);
    }
    let cases = std::slice::from_raw_parts(cases, n);
    let mut built: Vec<Box<dyn MatchCase>> = Vec::with_capacity(n);
    for case in cases {
        let Some(ch) = chan_ref(case.chan) else {
            return Err(RtError::Inval);
        };
        if case.buf.is_null() {
            return Err(RtError::Inval);
        }
        ensure_elem(ch, case.elem_size)?;
        if case.is_send {
            built.push(Box::new(RawSendCase {
                chan: ch.chan.clone(),
                msg: Some(msg_from_raw(case.buf, case.elem_size)),
            }));
        } else {
            built.push(Box::new(RawRecvCase {
                chan: ch.chan.clone(),
                out: SendPtr(case.buf),
            }));
        }
    }
    Ok(built)
}

unsafe fn match_with(
    cases: *const conch_match_case_t,
    n: usize,
    ready: *mut usize,
    run: impl FnOnce(&mut [&mut dyn MatchCase]) -> Result<usize, RtError>,
) -> c_int {
    if ready.is_null() {
        return CONCH_INVAL;
    }
    let mut built = match build_cases(cases, n) {
        Ok(b) => b,
        Err(e) => return e.code(),
    };
    let mut refs: Vec<&mut dyn MatchCase> = Vec::with_capacity(built.len());
    for c in built.iter_mut() {
        refs.push(&mut **c);
    }
    match run(&mut refs) {
        Ok(idx) => {
            *ready = idx;
            CONCH_OK
        }
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_match_try(
    cases: *const conch_match_case_t,
    n: usize,
    ready: *mut usize,
) -> c_int {
    match_with(cases, n, ready, select::match_try)
}

#[no_mangle]
pub unsafe extern "C" fn conch_chan_match_deadline(
    cases: *const conch_match_case_t,
    n: usize,
    ready: *mut usize,
    d: Deadline,
) -> c_int {
    match_with(cases, n, ready, |refs| select::match_deadline(refs, d))
}

/// Blocking form; bounded by the thread's current deadline scope.
#[no_mangle]
pub unsafe extern "C" fn conch_chan_match_select(
    cases: *const conch_match_case_t,
    n: usize,
    ready: *mut usize,
) -> c_int {
    match_with(cases, n, ready, select::match_select)
}

/// Submit the polling loop to `exec`. On completion `*ready` holds the
/// fired index and `op` is completed with the status code. The caller
/// keeps `ready` and every case buffer alive until then.
#[no_mangle]
pub unsafe extern "C" fn conch_chan_match_select_async(
    cases: *const conch_match_case_t,
    n: usize,
    exec: *mut conch_exec_t,
    d: Deadline,
    ready: *mut usize,
) -> *mut conch_async_t {
    let Some(exec) = exec_ref(exec) else {
        return ptr::null_mut();
    };
    if ready.is_null() {
        return ptr::null_mut();
    }
    let built = match build_cases(cases, n) {
        Ok(b) => b,
        Err(_) => return ptr::null_mut(),
    };
    let handle = conch_rt::async_handle::AsyncHandle::new();
    let done = handle.clone();
    let ready = SendPtr(ready as *mut c_void);
    let submitted = exec.exec.submit(move || {
        let mut built = built;
        let mut refs: Vec<&mut dyn MatchCase> = Vec::with_capacity(built.len());
        for c in built.iter_mut() {
            refs.push(&mut **c);
        }
        let code = match select::match_deadline(&mut refs, d) {
            Ok(idx) => {
                // SAFETY: caller keeps the ready slot valid until completion.
                unsafe { *(ready.0 as *mut usize) = idx };
                CONCH_OK
            }
            Err(e) => e.code(),
        };
        done.complete(code);
    });
    match submitted {
        Ok(()) => conch_async_t::into_raw(handle),
        Err(_) => ptr::null_mut(),
    }
}

/// Opaque select future.
pub struct conch_future_t {
    fut: SelectFuture,
}

/// Future-returning select. Wait with [`conch_future_wait`].
#[no_mangle]
pub unsafe extern "C" fn conch_chan_match_select_future(
    cases: *const conch_match_case_t,
    n: usize,
    exec: *mut conch_exec_t,
    d: Deadline,
) -> *mut conch_future_t {
    let Some(exec) = exec_ref(exec) else {
        return ptr::null_mut();
    };
    let built = match build_cases(cases, n) {
        Ok(b) => b,
        Err(_) => return ptr::null_mut(),
    };
    match select::match_select_future(built, &exec.exec, d) {
        Ok(fut) => Box::into_raw(Box::new(conch_future_t { fut })),
        Err(_) => ptr::null_mut(),
    }
}

/// Block until the select resolves; `*ready` gets the fired index.
#[no_mangle]
pub unsafe extern "C" fn conch_future_wait(fut: *mut conch_future_t, ready: *mut usize) -> c_int {
    let Some(fut) = fut.as_ref() else {
        return CONCH_INVAL;
    };
    if ready.is_null() {
        return CONCH_INVAL;
    }
    match fut.fut.wait() {
        Ok(idx) => {
            *ready = idx;
            CONCH_OK
        }
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn conch_future_free(fut: *mut conch_future_t) {
    if !fut.is_null() {
        drop(Box::from_raw(fut));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elem_size_is_latched() {
        unsafe {
            let ch = conch_chan_create();
            let v: i32 = 5;
            assert_eq!(conch_chan_send(ch, &v as *const i32 as *const c_void, 4), CONCH_OK);
            // A different size is rejected.
            let w: i64 = 5;
            assert_eq!(
                conch_chan_send(ch, &w as *const i64 as *const c_void, 8),
                CONCH_INVAL
            );
            let mut out: i32 = 0;
            assert_eq!(conch_chan_recv(ch, &mut out as *mut i32 as *mut c_void, 4), CONCH_OK);
            assert_eq!(out, 5);
            conch_chan_free(ch);
        }
    }

    #[test]
    fn try_recv_empty_is_again() {
        unsafe {
            let ch = conch_chan_create_mode(2, CONCH_CHAN_BLOCK);
            let mut out: i32 = 0;
            assert_eq!(
                conch_chan_try_recv(ch, &mut out as *mut i32 as *mut c_void, 4),
                libc::EAGAIN
            );
            conch_chan_free(ch);
        }
    }

    #[test]
    fn close_makes_send_pipe() {
        unsafe {
            let ch = conch_chan_create();
            let v: i32 = 1;
            conch_chan_close(ch);
            assert_eq!(
                conch_chan_send(ch, &v as *const i32 as *const c_void, 4),
                libc::EPIPE
            );
            conch_chan_free(ch);
        }
    }

    #[test]
    fn take_requires_take_channel() {
        unsafe {
            let plain = conch_chan_create();
            assert_eq!(conch_chan_send_take(plain, 8 as *mut c_void), CONCH_INVAL);
            conch_chan_free(plain);

            let ch = conch_chan_create_take(4, CONCH_CHAN_BLOCK, true);
            assert_eq!(conch_chan_send_take(ch, 0x1234 as *mut c_void), CONCH_OK);
            let mut out: *mut c_void = ptr::null_mut();
            assert_eq!(
                conch_chan_recv(
                    ch,
                    &mut out as *mut *mut c_void as *mut c_void,
                    std::mem::size_of::<*mut c_void>()
                ),
                CONCH_OK
            );
            assert_eq!(out as usize, 0x1234);
            conch_chan_free(ch);
        }
    }

    #[test]
    fn take_slice_checks_flags() {
        unsafe {
            let ch = conch_chan_create_take(4, CONCH_CHAN_BLOCK, true);
            let mut s = conch_slice_t {
                data: ptr::null_mut(),
                len: 3,
                elem_size: 1,
                flags: CONCH_SLICE_UNIQUE,
                uid: 99,
            };
            assert_eq!(conch_chan_send_take_slice(ch, &s), CONCH_OK);

            // Receiver sees the full header, uid included.
            let mut out = conch_slice_t {
                data: ptr::null_mut(),
                len: 0,
                elem_size: 0,
                flags: 0,
                uid: 0,
            };
            assert_eq!(
                conch_chan_recv(
                    ch,
                    &mut out as *mut conch_slice_t as *mut c_void,
                    std::mem::size_of::<conch_slice_t>()
                ),
                CONCH_OK
            );
            assert_eq!(out.uid, 99);
            assert_eq!(out.len, 3);

            // Non-unique and sub-slices are rejected.
            s.flags = 0;
            assert_eq!(conch_chan_send_take_slice(ch, &s), CONCH_INVAL);
            s.flags = CONCH_SLICE_UNIQUE | CONCH_SLICE_SUB;
            assert_eq!(conch_chan_send_take_slice(ch, &s), CONCH_INVAL);
            conch_chan_free(ch);
        }
    }

    #[test]
    fn match_try_first_wins() {
        unsafe {
            let a = conch_chan_create_mode(1, CONCH_CHAN_BLOCK);
            let b = conch_chan_create_mode(1, CONCH_CHAN_BLOCK);
            let v: i32 = 42;
            conch_chan_send(a, &v as *const i32 as *const c_void, 4);

            let mut out_a: i32 = 0;
            let mut out_b: i32 = 0;
            let cases = [
                conch_match_case_t {
                    chan: a,
                    buf: &mut out_a as *mut i32 as *mut c_void,
                    elem_size: 4,
                    is_send: false,
                },
                conch_match_case_t {
                    chan: b,
                    buf: &mut out_b as *mut i32 as *mut c_void,
                    elem_size: 4,
                    is_send: false,
                },
            ];
            let mut ready = usize::MAX;
            assert_eq!(conch_chan_match_try(cases.as_ptr(), 2, &mut ready), CONCH_OK);
            assert_eq!(ready, 0);
            assert_eq!(out_a, 42);

            // Drained: nothing ready.
            assert_eq!(
                conch_chan_match_try(cases.as_ptr(), 2, &mut ready),
                libc::EAGAIN
            );
            // Short deadline times out.
            assert_eq!(
                conch_chan_match_deadline(cases.as_ptr(), 2, &mut ready, Deadline::after_ms(10)),
                libc::ETIMEDOUT
            );
            conch_chan_free(a);
            conch_chan_free(b);
        }
    }

    #[test]
    fn pair_create_shares_one_channel() {
        unsafe {
            let mut tx = conch_tx_t { chan: ptr::null_mut() };
            let mut rx = conch_rx_t { chan: ptr::null_mut() };
            assert_eq!(conch_chan_pair_create(&mut tx, &mut rx, 4, CONCH_CHAN_BLOCK), CONCH_OK);
            assert_eq!(tx.chan, rx.chan);
            let v: i32 = 9;
            assert_eq!(conch_chan_send(tx.chan, &v as *const i32 as *const c_void, 4), CONCH_OK);
            let mut out: i32 = 0;
            assert_eq!(conch_chan_recv(rx.chan, &mut out as *mut i32 as *mut c_void, 4), CONCH_OK);
            assert_eq!(out, 9);
            conch_chan_free(tx.chan);
        }
    }

    #[test]
    fn owned_channel_lifecycle() {
        use std::sync::atomic::AtomicUsize;
        static CREATES: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn make(_env: *mut c_void) -> *mut c_void {
            CREATES.fetch_add(1, Ordering::SeqCst);
            libc::malloc(32)
        }
        unsafe extern "C" fn wipe(env: *mut c_void, p: isize) -> *mut c_void {
            // env carries the destroy counter.
            if !env.is_null() {
                (*(env as *const AtomicUsize)).fetch_add(1, Ordering::SeqCst);
            }
            libc::free(p as *mut c_void);
            ptr::null_mut()
        }
        unsafe extern "C" fn zero(_env: *mut c_void, p: isize) -> *mut c_void {
            libc::memset(p as *mut c_void, 0, 32);
            ptr::null_mut()
        }

        let destroys = std::sync::atomic::AtomicUsize::new(0);
        unsafe {
            let ch = conch_chan_create_owned(
                2,
                CONCH_CHAN_BLOCK,
                crate::closure::conch_closure0_make(Some(make), ptr::null_mut(), None),
                crate::closure::conch_closure1_make(
                    Some(wipe),
                    &destroys as *const AtomicUsize as *mut c_void,
                    None,
                ),
                crate::closure::conch_closure1_make(Some(zero), ptr::null_mut(), None),
            );
            assert!(!ch.is_null());

            let elem = conch_chan_acquire(ch);
            assert!(!elem.is_null());
            assert_eq!(conch_chan_send_take(ch, elem), CONCH_OK);

            let mut got: *mut c_void = ptr::null_mut();
            assert_eq!(
                conch_chan_recv(
                    ch,
                    &mut got as *mut *mut c_void as *mut c_void,
                    std::mem::size_of::<*mut c_void>()
                ),
                CONCH_OK
            );
            assert_eq!(got, elem);
            assert_eq!(conch_chan_release(ch, got), CONCH_OK);

            // A buffered element left behind is destroyed at free time.
            let elem2 = conch_chan_acquire(ch);
            assert_eq!(conch_chan_send_take(ch, elem2), CONCH_OK);
            conch_chan_free(ch);
        }
        // The single (recycled) element was in the buffer at free time.
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }
}
