// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fixed-size worker pool over a bounded FIFO job queue.
//!
//! Workers park on a condvar when the queue is empty. `submit` never
//! blocks the caller; `submit_wait` does. Shutdown sets a flag, wakes
//! everyone, and joins the workers — jobs already dequeued finish, jobs
//! still queued are drained by the exiting workers.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::error::RtError;

/// A queued unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAP: usize = 128;

struct ExecState {
    queue: VecDeque<Job>,
    shutdown: bool,
}

struct ExecShared {
    state: Mutex<ExecState>,
    not_empty: Condvar,
    not_full: Condvar,
    queue_cap: usize,
}

/// Shared thread-pool executor used by the async submission paths.
pub struct Executor {
    shared: Arc<ExecShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Executor {
    /// Start `workers` threads with a queue of `queue_cap` entries.
    /// Zero selects the default for either parameter.
    pub fn new(workers: usize, queue_cap: usize) -> Self {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        let queue_cap = if queue_cap == 0 { DEFAULT_QUEUE_CAP } else { queue_cap };

        let shared = Arc::new(ExecShared {
            state: Mutex::new(ExecState {
                queue: VecDeque::with_capacity(queue_cap),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            queue_cap,
        });

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let shared = shared.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("conch-exec-{}", id))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn executor worker"),
            );
        }

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a job without blocking. `Again` when the queue is full,
    /// `Pipe` after shutdown.
    pub fn submit<F>(&self, job: F) -> Result<(), RtError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.shared.state.lock().unwrap();
        if st.shutdown {
            return Err(RtError::Pipe);
        }
        if st.queue.len() >= self.shared.queue_cap {
            return Err(RtError::Again);
        }
        st.queue.push_back(Box::new(job));
        drop(st);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue a job, blocking while the queue is full.
    pub fn submit_wait<F>(&self, job: F) -> Result<(), RtError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.shared.state.lock().unwrap();
        loop {
            if st.shutdown {
                return Err(RtError::Pipe);
            }
            if st.queue.len() < self.shared.queue_cap {
                st.queue.push_back(Box::new(job));
                drop(st);
                self.shared.not_empty.notify_one();
                return Ok(());
            }
            st = self.shared.not_full.wait(st).unwrap();
        }
    }

    /// Number of jobs currently queued (racy, for tests/introspection).
    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Stop accepting jobs, wake everyone, join the workers. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.shutdown = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &ExecShared) {
    loop {
        let job = {
            let mut st = shared.state.lock().unwrap();
            loop {
                if let Some(job) = st.queue.pop_front() {
                    shared.not_full.notify_one();
                    break Some(job);
                }
                if st.shutdown {
                    break None;
                }
                st = shared.not_empty.wait(st).unwrap();
            }
        };
        // Worker failure is a process-level fault: jobs run unguarded.
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}
