// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task primitive: spawn/join/detach.
//!
//! One task per OS thread. The handle is consumed by `join` (so a task is
//! joined at most once by construction) or `detach`. Thread-local runtime
//! state does not cross `spawn`; the nursery installs its own slot inside
//! the child entry.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::error::RtError;

/// Error returned by `join()` when the task failed.
#[derive(Debug, Error)]
pub enum JoinError {
    /// Task panicked with the given message.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl JoinError {
    /// ABI mapping. A panicked task surfaces as an I/O-class fault; the
    /// C side has no panic concept.
    pub fn kind(&self) -> RtError {
        RtError::Io
    }
}

/// Handle to a spawned task. Owns the underlying thread until consumed.
pub struct TaskHandle<T> {
    inner: JoinHandle<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task to exit and surface its result.
    pub fn join(self) -> Result<T, JoinError> {
        match self.inner.join() {
            Ok(Ok(val)) => Ok(val),
            Ok(Err(msg)) => Err(JoinError::Panicked(msg)),
            Err(_) => Err(JoinError::Panicked("task thread panicked".to_string())),
        }
    }

    /// Fire-and-forget. The task keeps running; its result is dropped.
    pub fn detach(self) {
        drop(self.inner);
    }

    /// Whether the task has already exited (join would not block).
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

/// Spawn a task on a fresh OS thread.
///
/// The entry function runs exactly once; panics are captured and become
/// [`JoinError::Panicked`] at the join site.
pub fn spawn<T, F>(f: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let inner = thread::Builder::new()
        .name("conch-task".to_string())
        .spawn(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(val) => Ok(val),
            Err(e) => Err(panic_message(&e)),
        })
        .expect("failed to spawn task thread");
    TaskHandle { inner }
}

/// Block the calling task for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

pub(crate) fn panic_message(e: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
