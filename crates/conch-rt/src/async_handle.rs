// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot completion handles.
//!
//! An async handle is a tiny capacity-1 status channel plus a latch that
//! keeps completion single-shot. `await` in generated code is a recv on
//! the done-channel, so it inherits deadline-scope behavior for free.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::{Backpressure, Channel};
use crate::deadline::Deadline;
use crate::error::RtError;

struct HandleInner {
    done: Arc<Channel<i32>>,
    completed: AtomicBool,
}

/// Completion handle for an asynchronous operation. The payload is the
/// operation's status code (0 = success, errno-class otherwise).
#[derive(Clone)]
pub struct AsyncHandle {
    inner: Arc<HandleInner>,
}

impl AsyncHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                done: Channel::new_unchecked(1, Backpressure::Block, false),
                completed: AtomicBool::new(false),
            }),
        }
    }

    /// Announce completion. Exactly the first call wins; later calls are
    /// ignored and report `false`.
    pub fn complete(&self, code: i32) -> bool {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Capacity 1 and single completion: this cannot reject.
        let _ = self.inner.done.try_send(code);
        true
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Block until completion; surface the operation's status code.
    /// One-shot: a second wait on the same handle blocks forever.
    pub fn wait_code(&self) -> Result<i32, RtError> {
        self.inner.done.recv().map_err(|e| e.kind())
    }

    /// Block until completion; fold the status code into a `Result`.
    pub fn wait(&self) -> Result<(), RtError> {
        RtError::check(self.wait_code()?)
    }

    pub fn wait_deadline(&self, d: Deadline) -> Result<(), RtError> {
        let code = self.inner.done.recv_deadline(d).map_err(|e| e.kind())?;
        RtError::check(code)
    }

    /// Non-blocking poll. `None` while the operation is in flight.
    pub fn try_wait(&self) -> Option<Result<(), RtError>> {
        match self.inner.done.try_recv() {
            Ok(code) => Some(RtError::check(code)),
            Err(_) => None,
        }
    }
}

impl Default for AsyncHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-style async op: a completion handle plus the slot the value
/// is delivered into.
pub struct AsyncRecv<T> {
    slot: Arc<Mutex<Option<T>>>,
    handle: AsyncHandle,
}

impl<T> AsyncRecv<T> {
    /// Assemble an op from its slot and completion handle. The completer
    /// must fill the slot before completing the handle with 0.
    pub fn new(slot: Arc<Mutex<Option<T>>>, handle: AsyncHandle) -> Self {
        Self { slot, handle }
    }

    pub fn handle(&self) -> &AsyncHandle {
        &self.handle
    }

    /// Await completion and take the delivered value.
    pub fn wait(&self) -> Result<T, RtError> {
        self.handle.wait()?;
        self.slot.lock().unwrap().take().ok_or(RtError::Inval)
    }

    pub fn wait_deadline(&self, d: Deadline) -> Result<T, RtError> {
        self.handle.wait_deadline(d)?;
        self.slot.lock().unwrap().take().ok_or(RtError::Inval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_then_wait() {
        let h = AsyncHandle::new();
        assert!(h.complete(0));
        h.wait().unwrap();
    }

    #[test]
    fn completion_is_single_shot() {
        let h = AsyncHandle::new();
        assert!(h.complete(0));
        assert!(!h.complete(5));
        assert!(h.is_completed());
    }

    #[test]
    fn error_code_surfaces() {
        let h = AsyncHandle::new();
        h.complete(libc::EPIPE);
        assert_eq!(h.wait(), Err(RtError::Pipe));
    }

    #[test]
    fn try_wait_pending() {
        let h = AsyncHandle::new();
        assert!(h.try_wait().is_none());
        h.complete(0);
        assert_eq!(h.try_wait(), Some(Ok(())));
    }

    #[test]
    fn wait_across_tasks() {
        let h = AsyncHandle::new();
        let h2 = h.clone();
        let t = crate::task::spawn(move || {
            crate::task::sleep_ms(10);
            h2.complete(0);
        });
        h.wait().unwrap();
        t.join().unwrap();
    }

    #[test]
    fn wait_deadline_times_out() {
        let h = AsyncHandle::new();
        assert_eq!(
            h.wait_deadline(Deadline::after_ms(10)),
            Err(RtError::TimedOut)
        );
    }
}
