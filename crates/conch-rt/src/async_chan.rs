// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Request-queue channels.
//!
//! Send/recv never block the caller: each call returns (or completes) an
//! async handle. Ops that cannot make progress are parked in pending
//! queues processed front-first; close completes every parked op with a
//! pipe error. Matching order on send: queued receivers, then the
//! buffer, then park (block mode). Recv drains the buffer first so the
//! per-channel FIFO order survives parked senders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::async_handle::{AsyncHandle, AsyncRecv};
use crate::channel::{Backpressure, RecvError, SendError};
use crate::deadline::Deadline;
use crate::error::RtError;

/// Retry quantum for the deadline variants.
const RETRY_QUANTUM: Duration = Duration::from_millis(1);

/// Delivery sink for a matched receive.
pub type Deliver<T> = Box<dyn FnOnce(T) + Send>;

struct PendingSend<T> {
    value: T,
    handle: AsyncHandle,
}

struct PendingRecv<T> {
    deliver: Deliver<T>,
    handle: AsyncHandle,
}

struct AsyncState<T> {
    buf: VecDeque<T>,
    pending_sends: VecDeque<PendingSend<T>>,
    pending_recvs: VecDeque<PendingRecv<T>>,
    closed: bool,
}

/// Non-blocking channel flavor; same back-pressure modes as the base
/// channel. Capacity 0 is allowed here — every transfer then matches
/// through the pending queues (rendezvous).
pub struct AsyncChannel<T> {
    capacity: usize,
    mode: Backpressure,
    state: Mutex<AsyncState<T>>,
}

impl<T> AsyncChannel<T> {
    pub fn new(capacity: usize, mode: Backpressure) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            mode,
            state: Mutex::new(AsyncState {
                buf: VecDeque::with_capacity(capacity),
                pending_sends: VecDeque::new(),
                pending_recvs: VecDeque::new(),
                closed: false,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mode(&self) -> Backpressure {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Submit a send. The returned handle completes when the value has
    /// been buffered, matched with a waiting receiver, or rejected.
    pub fn send(&self, value: T) -> AsyncHandle {
        let handle = AsyncHandle::new();
        let mut matched: Option<(PendingRecv<T>, T)> = None;
        let mut code: Option<i32> = None;
        {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                code = Some(RtError::Pipe.code());
            } else if let Some(pr) = st.pending_recvs.pop_front() {
                matched = Some((pr, value));
                code = Some(0);
            } else if st.buf.len() < self.capacity {
                st.buf.push_back(value);
                code = Some(0);
            } else {
                match self.mode {
                    Backpressure::DropNew => code = Some(RtError::Again.code()),
                    Backpressure::DropOld => {
                        st.buf.pop_front();
                        st.buf.push_back(value);
                        code = Some(0);
                    }
                    Backpressure::Block => {
                        st.pending_sends.push_back(PendingSend {
                            value,
                            handle: handle.clone(),
                        });
                    }
                }
            }
        }
        // User code (delivery sinks) runs outside the channel lock.
        if let Some((pr, v)) = matched {
            (pr.deliver)(v);
            pr.handle.complete(0);
        }
        if let Some(c) = code {
            handle.complete(c);
        }
        handle
    }

    /// Submit a receive with an explicit delivery sink. The handle
    /// completes once a value has been passed to `deliver` (or the
    /// channel closed).
    pub fn recv_with(&self, deliver: Deliver<T>) -> AsyncHandle {
        let handle = AsyncHandle::new();
        let mut deliver_now: Option<(Deliver<T>, T)> = None;
        let mut unparked: Option<AsyncHandle> = None;
        let mut code: Option<i32> = None;
        {
            let mut st = self.state.lock().unwrap();
            if let Some(v) = st.buf.pop_front() {
                // Refill the freed slot from the pending-send queue.
                if let Some(ps) = st.pending_sends.pop_front() {
                    let PendingSend { value, handle } = ps;
                    st.buf.push_back(value);
                    unparked = Some(handle);
                }
                deliver_now = Some((deliver, v));
                code = Some(0);
            } else if let Some(ps) = st.pending_sends.pop_front() {
                // Empty buffer, parked sender: rendezvous.
                let PendingSend { value, handle } = ps;
                deliver_now = Some((deliver, value));
                unparked = Some(handle);
                code = Some(0);
            } else if st.closed {
                code = Some(RtError::Pipe.code());
            } else {
                st.pending_recvs.push_back(PendingRecv {
                    deliver,
                    handle: handle.clone(),
                });
            }
        }
        if let Some((deliver, v)) = deliver_now {
            deliver(v);
        }
        if let Some(h) = unparked {
            h.complete(0);
        }
        if let Some(c) = code {
            handle.complete(c);
        }
        handle
    }

    /// Submit a receive; the value lands in the returned op's slot.
    pub fn recv(&self) -> AsyncRecv<T>
    where
        T: Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let handle = self.recv_with(Box::new(move |v| {
            *out.lock().unwrap() = Some(v);
        }));
        AsyncRecv::new(slot, handle)
    }

    /// Non-parking send attempt (deadline variants retry on this).
    pub fn try_send(&self, value: T) -> Result<(), SendError<T>> {
        let mut matched: Option<(PendingRecv<T>, T)> = None;
        {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return Err(SendError::Closed(value));
            }
            if let Some(pr) = st.pending_recvs.pop_front() {
                matched = Some((pr, value));
            } else if st.buf.len() < self.capacity {
                st.buf.push_back(value);
            } else {
                match self.mode {
                    Backpressure::DropOld => {
                        st.buf.pop_front();
                        st.buf.push_back(value);
                    }
                    Backpressure::Block | Backpressure::DropNew => {
                        return Err(SendError::Full(value));
                    }
                }
            }
        }
        if let Some((pr, v)) = matched {
            (pr.deliver)(v);
            pr.handle.complete(0);
        }
        Ok(())
    }

    /// Non-parking recv attempt.
    pub fn try_recv(&self) -> Result<T, RecvError> {
        let mut unparked: Option<AsyncHandle> = None;
        let out;
        {
            let mut st = self.state.lock().unwrap();
            if let Some(v) = st.buf.pop_front() {
                if let Some(ps) = st.pending_sends.pop_front() {
                    let PendingSend { value, handle } = ps;
                    st.buf.push_back(value);
                    unparked = Some(handle);
                }
                out = Ok(v);
            } else if let Some(ps) = st.pending_sends.pop_front() {
                let PendingSend { value, handle } = ps;
                unparked = Some(handle);
                out = Ok(value);
            } else if st.closed {
                out = Err(RecvError::Closed);
            } else {
                out = Err(RecvError::Empty);
            }
        }
        if let Some(h) = unparked {
            h.complete(0);
        }
        out
    }

    /// Synchronous send bounded by a deadline; retries on a short sleep.
    pub fn send_deadline(&self, value: T, d: Deadline) -> Result<(), SendError<T>> {
        let mut value = value;
        loop {
            match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(SendError::Full(v)) => {
                    if d.cancelled {
                        return Err(SendError::Cancelled(v));
                    }
                    match d.remaining() {
                        Some(left) if left.is_zero() => return Err(SendError::TimedOut(v)),
                        Some(left) => thread::sleep(left.min(RETRY_QUANTUM)),
                        None => thread::sleep(RETRY_QUANTUM),
                    }
                    value = v;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Synchronous recv bounded by a deadline; retries on a short sleep.
    pub fn recv_deadline(&self, d: Deadline) -> Result<T, RecvError> {
        loop {
            match self.try_recv() {
                Ok(v) => return Ok(v),
                Err(RecvError::Empty) => {
                    if d.cancelled {
                        return Err(RecvError::Cancelled);
                    }
                    match d.remaining() {
                        Some(left) if left.is_zero() => return Err(RecvError::TimedOut),
                        Some(left) => thread::sleep(left.min(RETRY_QUANTUM)),
                        None => thread::sleep(RETRY_QUANTUM),
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Close the channel. Every parked op completes with a pipe error;
    /// buffered values stay receivable until drained.
    pub fn close(&self) {
        let (sends, recvs) = {
            let mut st = self.state.lock().unwrap();
            st.closed = true;
            (
                st.pending_sends.drain(..).collect::<Vec<_>>(),
                st.pending_recvs.drain(..).collect::<Vec<_>>(),
            )
        };
        for ps in sends {
            ps.handle.complete(RtError::Pipe.code());
        }
        for pr in recvs {
            pr.handle.complete(RtError::Pipe.code());
        }
    }
}
