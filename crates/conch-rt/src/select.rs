// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-way send/recv match.
//!
//! Cases are polled in listed order, so the lowest ready index wins and
//! there is no fairness guarantee across repeated calls. The blocking
//! forms retry on a 1 ms quantum.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::async_handle::AsyncHandle;
use crate::channel::{Receiver, RecvError, SendError, Sender};
use crate::deadline::{self, Deadline};
use crate::error::RtError;
use crate::executor::Executor;

/// Retry quantum for the polling forms.
pub const POLL_QUANTUM: Duration = Duration::from_millis(1);

/// Sentinel ready-index before any case has fired.
pub const NO_CASE: usize = usize::MAX;

/// Outcome of a single non-blocking case attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseStatus {
    /// The operation completed.
    Fired,
    /// Would block right now.
    NotReady,
    /// The case's channel is closed (and drained, for recv).
    Closed,
}

/// One arm of a match. Implementations must not block in `attempt`.
pub trait MatchCase: Send {
    fn attempt(&mut self) -> CaseStatus;
}

/// Recv arm; the received value lands in a shared slot so the case can
/// be handed to the async forms and read afterwards.
pub struct RecvCase<T> {
    rx: Receiver<T>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> RecvCase<T> {
    pub fn new(rx: Receiver<T>) -> Self {
        Self {
            rx,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Clone of the delivery slot (survives moving the case away).
    pub fn slot(&self) -> Arc<Mutex<Option<T>>> {
        self.slot.clone()
    }

    /// Take the value delivered by a fired attempt.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().unwrap().take()
    }
}

impl<T: Send> MatchCase for RecvCase<T> {
    fn attempt(&mut self) -> CaseStatus {
        match self.rx.try_recv() {
            Ok(v) => {
                *self.slot.lock().unwrap() = Some(v);
                CaseStatus::Fired
            }
            Err(RecvError::Empty) => CaseStatus::NotReady,
            Err(_) => CaseStatus::Closed,
        }
    }
}

/// Send arm; holds the outbound value until it fires.
pub struct SendCase<T> {
    tx: Sender<T>,
    value: Option<T>,
}

impl<T> SendCase<T> {
    pub fn new(tx: Sender<T>, value: T) -> Self {
        Self {
            tx,
            value: Some(value),
        }
    }
}

impl<T: Send> MatchCase for SendCase<T> {
    fn attempt(&mut self) -> CaseStatus {
        let Some(v) = self.value.take() else {
            // Already fired; an exhausted arm never fires again.
            return CaseStatus::NotReady;
        };
        match self.tx.try_send(v) {
            Ok(()) => CaseStatus::Fired,
            Err(SendError::Full(v)) => {
                self.value = Some(v);
                CaseStatus::NotReady
            }
            Err(SendError::Closed(v)) => {
                self.value = Some(v);
                CaseStatus::Closed
            }
            Err(SendError::TimedOut(v)) | Err(SendError::Cancelled(v)) => {
                // try_send cannot produce these; keep the value anyway.
                self.value = Some(v);
                CaseStatus::NotReady
            }
        }
    }
}

/// Single pass over the cases in index order. `Ok(index)` for the first
/// case that fires, `Pipe` if a closed case is hit first, `Again` when
/// nothing is ready.
pub fn match_try(cases: &mut [&mut dyn MatchCase]) -> Result<usize, RtError> {
    for (i, case) in cases.iter_mut().enumerate() {
        match case.attempt() {
            CaseStatus::Fired => return Ok(i),
            CaseStatus::Closed => return Err(RtError::Pipe),
            CaseStatus::NotReady => {}
        }
    }
    Err(RtError::Again)
}

/// Poll until a case fires or the deadline is reached.
pub fn match_deadline(cases: &mut [&mut dyn MatchCase], d: Deadline) -> Result<usize, RtError> {
    loop {
        match match_try(cases) {
            Err(RtError::Again) => {
                if d.cancelled {
                    return Err(RtError::Cancelled);
                }
                match d.remaining() {
                    Some(left) if left.is_zero() => return Err(RtError::TimedOut),
                    Some(left) => thread::sleep(left.min(POLL_QUANTUM)),
                    None => thread::sleep(POLL_QUANTUM),
                }
            }
            other => return other,
        }
    }
}

/// Blocking form; bounded by the thread-local current deadline, if any.
pub fn match_select(cases: &mut [&mut dyn MatchCase]) -> Result<usize, RtError> {
    match_deadline(cases, deadline::current())
}

/// Handle to an in-flight asynchronous select.
pub struct SelectFuture {
    handle: AsyncHandle,
    ready: Arc<AtomicUsize>,
}

impl SelectFuture {
    pub fn handle(&self) -> &AsyncHandle {
        &self.handle
    }

    /// The fired case, once the handle has completed.
    pub fn ready_index(&self) -> Option<usize> {
        match self.ready.load(Ordering::Acquire) {
            NO_CASE => None,
            i => Some(i),
        }
    }

    /// Await completion; returns the fired case index.
    pub fn wait(&self) -> Result<usize, RtError> {
        self.handle.wait()?;
        self.ready_index().ok_or(RtError::Inval)
    }
}

/// Run the polling loop as an executor job; completion and the ready
/// index are published through the supplied handle and slot.
pub fn match_select_async(
    mut cases: Vec<Box<dyn MatchCase>>,
    exec: &Executor,
    d: Deadline,
    handle: AsyncHandle,
    ready: Arc<AtomicUsize>,
) -> Result<(), RtError> {
    exec.submit(move || {
        let mut refs: Vec<&mut dyn MatchCase> = Vec::with_capacity(cases.len());
        for c in cases.iter_mut() {
            refs.push(&mut **c);
        }
        let code = match match_deadline(&mut refs, d) {
            Ok(i) => {
                ready.store(i, Ordering::Release);
                0
            }
            Err(e) => e.code(),
        };
        handle.complete(code);
    })
}

/// Future-returning form of [`match_select_async`].
pub fn match_select_future(
    cases: Vec<Box<dyn MatchCase>>,
    exec: &Executor,
    d: Deadline,
) -> Result<SelectFuture, RtError> {
    let handle = AsyncHandle::new();
    let ready = Arc::new(AtomicUsize::new(NO_CASE));
    match_select_async(cases, exec, d, handle.clone(), ready.clone())?;
    Ok(SelectFuture { handle, ready })
}
