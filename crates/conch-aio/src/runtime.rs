// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Backend registry and lifecycle.
//!
//! One slot per process. Probed once from `RUNTIME_BACKEND` unless the
//! program chose explicitly; `shutdown` resets the selection so tests
//! and re-initialising hosts get a clean slate.

use std::sync::{Arc, Mutex};

use conch_rt::executor::Executor;

/// Which implementation backs the async file operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Offload synchronous syscalls to the shared executor.
    Executor,
    /// Non-blocking fds driven by `poll(2)`.
    Poll,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Executor => "executor",
            Backend::Poll => "poll",
        }
    }
}

struct RuntimeState {
    backend: Option<Backend>,
    probed: bool,
    exec: Option<Arc<Executor>>,
}

static STATE: Mutex<RuntimeState> = Mutex::new(RuntimeState {
    backend: None,
    probed: false,
    exec: None,
});

/// Serializes tests that reconfigure the process-global registry.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

/// The active backend. First call without an explicit selection probes
/// `RUNTIME_BACKEND` (`executor` | `poll`); unset defaults to `poll`.
pub fn backend() -> Backend {
    let mut st = STATE.lock().unwrap();
    if st.backend.is_none() && !st.probed {
        st.probed = true;
        st.backend = Some(match std::env::var("RUNTIME_BACKEND").ok().as_deref() {
            Some("executor") => Backend::Executor,
            Some("poll") => Backend::Poll,
            _ => Backend::Poll,
        });
    }
    st.backend.unwrap_or(Backend::Poll)
}

/// Explicit selection; wins over the environment probe.
pub fn set_backend(b: Backend) {
    let mut st = STATE.lock().unwrap();
    st.backend = Some(b);
    st.probed = true;
}

pub fn backend_name() -> &'static str {
    backend().name()
}

/// Create the shared executor up front. Zero selects the defaults.
/// A no-op if one already exists.
pub fn init(workers: usize, queue_cap: usize) {
    let mut st = STATE.lock().unwrap();
    if st.exec.is_none() {
        st.exec = Some(Arc::new(Executor::new(workers, queue_cap)));
    }
}

/// The shared executor, created on demand with defaults.
pub fn shared_executor() -> Arc<Executor> {
    let mut st = STATE.lock().unwrap();
    if st.exec.is_none() {
        st.exec = Some(Arc::new(Executor::new(0, 0)));
    }
    st.exec.as_ref().unwrap().clone()
}

/// Tear down the executor and reset the backend selection.
pub fn shutdown() {
    let exec = {
        let mut st = STATE.lock().unwrap();
        st.backend = None;
        st.probed = false;
        st.exec.take()
    };
    // Join workers outside the registry lock.
    if let Some(exec) = exec {
        exec.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test: the registry is process-global state, and parallel test
    // threads would race a split version.
    #[test]
    fn registry_lifecycle() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        set_backend(Backend::Executor);
        assert_eq!(backend(), Backend::Executor);
        assert_eq!(backend_name(), "executor");
        set_backend(Backend::Poll);
        assert_eq!(backend(), Backend::Poll);

        let a = shared_executor();
        let b = shared_executor();
        assert!(Arc::ptr_eq(&a, &b));

        shutdown();
        // Selection was reset; next query re-probes (or defaults).
        assert_eq!(backend(), Backend::Poll);
        shutdown();
    }
}
