// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Conch async I/O layer.
//!
//! A process-wide registry picks the backend for file operations:
//! `poll` (non-blocking fds driven by `poll(2)`, deadline-aware) or
//! `executor` (synchronous syscalls offloaded to the shared thread
//! pool). Both complete through the runtime's async handles, so
//! generated code is backend-agnostic.

pub mod file;
pub mod fs;
pub mod poll;
pub mod runtime;

pub use runtime::Backend;
