// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Structured-concurrency scope.
//!
//! A nursery owns its child tasks and, optionally, channels to close on
//! scope exit. `wait` joins children in spawn order and only then closes
//! the registered channels — producers never race a close from their own
//! scope. No child outlives its nursery in normal flow.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config;
use crate::deadline::{monotonic_now_ns, Deadline};
use crate::diag;
use crate::task::{self, JoinError, TaskHandle};

static NEXT_NURSERY_ID: AtomicU64 = AtomicU64::new(1);

/// Something a nursery can close when its scope exits.
pub trait CloseOnExit: Send {
    fn close_now(&self);

    /// Record the owning nursery for the deadlock guard. Default: no-op
    /// (not every closable object participates in the guard).
    fn tag_autoclose(&self, _nursery_id: u64) {}
}

/// State shared with child tasks (and readable through the thread-local
/// current-nursery slot).
pub(crate) struct NurseryShared {
    id: u64,
    cancelled: AtomicBool,
    /// Absolute monotonic ns; 0 = no deadline.
    deadline_ns: AtomicU64,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<NurseryShared>>> = const { RefCell::new(None) };
}

/// Id of the nursery whose task is currently executing, if any.
pub(crate) fn current_id() -> Option<u64> {
    CURRENT.with(|c| c.borrow().as_ref().map(|s| s.id))
}

/// Whether the current task's nursery has been cancelled.
pub fn current_is_cancelled() -> bool {
    CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .map(|s| shared_is_cancelled(s))
            .unwrap_or(false)
    })
}

fn shared_is_cancelled(s: &NurseryShared) -> bool {
    if s.cancelled.load(Ordering::Acquire) {
        return true;
    }
    let d = s.deadline_ns.load(Ordering::Acquire);
    d != 0 && monotonic_now_ns() >= d
}

/// Installs a nursery as the thread's current one for the duration of a
/// child body.
struct CurrentScope {
    prev: Option<Arc<NurseryShared>>,
}

impl CurrentScope {
    fn enter(shared: Arc<NurseryShared>) -> Self {
        Self {
            prev: CURRENT.with(|c| c.borrow_mut().replace(shared)),
        }
    }
}

impl Drop for CurrentScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

/// Structured scope: spawned children are joined on [`wait`](Nursery::wait),
/// then registered channels are closed.
pub struct Nursery {
    shared: Arc<NurseryShared>,
    children: Mutex<Vec<TaskHandle<()>>>,
    closing: Mutex<Vec<Box<dyn CloseOnExit>>>,
}

impl Nursery {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(NurseryShared {
                id: NEXT_NURSERY_ID.fetch_add(1, Ordering::Relaxed),
                cancelled: AtomicBool::new(false),
                deadline_ns: AtomicU64::new(0),
            }),
            children: Mutex::new(Vec::new()),
            closing: Mutex::new(Vec::new()),
        }
    }

    /// Stable id used for autoclose-owner tagging.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Spawn a child task. The nursery is visible as the thread-local
    /// current nursery inside the child body.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let timing = config::spawn_timing_enabled();
        let t0 = if timing { monotonic_now_ns() } else { 0 };

        let shared = self.shared.clone();
        let body = move || {
            let _scope = CurrentScope::enter(shared);
            f();
        };
        let t1 = if timing { monotonic_now_ns() } else { 0 };

        let handle = task::spawn(body);
        let t2 = if timing { monotonic_now_ns() } else { 0 };

        self.children.lock().unwrap().push(handle);

        if timing {
            let t3 = monotonic_now_ns();
            timing_record(t1 - t0, t2 - t1, t3 - t2);
        }
    }

    /// Request cooperative cancellation of the scope.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    /// Install an absolute deadline (monotonic ns).
    pub fn set_deadline(&self, at_ns: u64) {
        self.shared.deadline_ns.store(at_ns, Ordering::Release);
    }

    pub fn set_deadline_after_ms(&self, ms: u64) {
        self.set_deadline(Deadline::after_ms(ms).at_ns);
    }

    /// The scope deadline without the cancellation bit.
    pub fn deadline(&self) -> Deadline {
        Deadline::at(self.shared.deadline_ns.load(Ordering::Acquire))
    }

    /// Cancelled, or past the scope deadline.
    pub fn is_cancelled(&self) -> bool {
        shared_is_cancelled(&self.shared)
    }

    /// Deadline snapshot including the cancellation bit — what the
    /// nursery-bound channel helpers run under.
    pub fn as_deadline(&self) -> Deadline {
        Deadline {
            at_ns: self.shared.deadline_ns.load(Ordering::Acquire),
            cancelled: self.shared.cancelled.load(Ordering::Acquire),
        }
    }

    /// Register a channel to close after the children have been joined.
    /// The first registration tags the channel with this nursery as its
    /// autoclose owner.
    pub fn add_closing<C>(&self, chan: C)
    where
        C: CloseOnExit + 'static,
    {
        chan.tag_autoclose(self.shared.id);
        self.closing.lock().unwrap().push(Box::new(chan));
    }

    /// Register via a send handle. Only the underlying channel is
    /// retained — the nursery never holds a counted handle open.
    pub fn add_closing_tx<T: Send + 'static>(&self, tx: &crate::channel::Sender<T>) {
        self.add_closing(tx.channel().clone());
    }

    /// Register via a recv handle.
    pub fn add_closing_rx<T: Send + 'static>(&self, rx: &crate::channel::Receiver<T>) {
        self.add_closing(rx.channel().clone());
    }

    /// Join all children in spawn order (children spawned while waiting
    /// are joined too), then close registered channels. The first join
    /// error is returned; later ones are dropped.
    pub fn wait(&self) -> Result<(), JoinError> {
        let mut first_err: Option<JoinError> = None;
        loop {
            let batch: Vec<TaskHandle<()>> = {
                let mut children = self.children.lock().unwrap();
                if children.is_empty() {
                    break;
                }
                children.drain(..).collect()
            };
            for child in batch {
                if let Err(e) = child.join() {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        let closing: Vec<Box<dyn CloseOnExit>> = self.closing.lock().unwrap().drain(..).collect();
        for chan in &closing {
            chan.close_now();
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Default for Nursery {
    fn default() -> Self {
        Self::new()
    }
}

// --- spawn timing instrumentation (SPAWN_TIMING=1) ---

static TIMING_COUNT: AtomicU64 = AtomicU64::new(0);
static TIMING_THUNK_NS: AtomicU64 = AtomicU64::new(0);
static TIMING_CREATE_NS: AtomicU64 = AtomicU64::new(0);
static TIMING_BOOK_NS: AtomicU64 = AtomicU64::new(0);

fn timing_record(thunk_ns: u64, create_ns: u64, book_ns: u64) {
    TIMING_COUNT.fetch_add(1, Ordering::Relaxed);
    TIMING_THUNK_NS.fetch_add(thunk_ns, Ordering::Relaxed);
    TIMING_CREATE_NS.fetch_add(create_ns, Ordering::Relaxed);
    TIMING_BOOK_NS.fetch_add(book_ns, Ordering::Relaxed);
}

/// Dump accumulated spawn-latency decomposition to stderr.
pub fn dump_spawn_timing() {
    let count = TIMING_COUNT.load(Ordering::Relaxed);
    if count == 0 {
        diag::note("spawn timing: no samples (set SPAWN_TIMING=1)");
        return;
    }
    let thunk = TIMING_THUNK_NS.load(Ordering::Relaxed);
    let create = TIMING_CREATE_NS.load(Ordering::Relaxed);
    let book = TIMING_BOOK_NS.load(Ordering::Relaxed);
    diag::note(&format!(
        "spawn timing over {} spawns: thunk {}ns/spawn, task create {}ns/spawn, \
         bookkeeping {}ns/spawn",
        count,
        thunk / count,
        create / count,
        book / count,
    ));
}
