// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Conch runtime library.
//!
//! The Conch frontend rewrites structured-concurrency constructs in C
//! source into calls against this runtime. The crate is the typed core;
//! the size-erased C surface lives in `conch-abi`.
//!
//! Components:
//! - deadline — monotonic deadlines, thread-local current-deadline scope
//! - task — spawn/join/detach primitive (OS threads)
//! - executor — fixed worker pool over a bounded FIFO job queue
//! - channel — bounded MPMC channels with back-pressure modes
//! - select — multi-way send/recv match
//! - pool — owned channels over caller-managed pooled resources
//! - nursery — structured scope: join children, close owned channels
//! - async_handle / async_chan — completion handles and non-blocking
//!   request-queue channels

pub mod async_chan;
pub mod async_handle;
pub mod channel;
pub mod config;
pub mod deadline;
pub mod diag;
pub mod error;
pub mod executor;
pub mod nursery;
pub mod pool;
pub mod select;
pub mod task;

pub use error::RtError;
