// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Async file operations.
//!
//! Every op becomes a job on the shared executor; the backend decides
//! whether that job drives the poll engine (deadline-aware) or plain
//! blocking syscalls (offload). Either way the caller gets an op handle
//! whose completion carries the status code and whose slot carries the
//! result.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use conch_rt::async_handle::{AsyncHandle, AsyncRecv};
use conch_rt::deadline::Deadline;
use conch_rt::error::RtError;

use crate::fs;
use crate::poll;
use crate::runtime::{self, Backend};

/// An in-flight file operation.
pub type FileOp<T> = AsyncRecv<T>;

fn run_op<T, F>(op: F) -> Result<FileOp<T>, RtError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RtError> + Send + 'static,
{
    let exec = runtime::shared_executor();
    let slot = Arc::new(Mutex::new(None));
    let handle = AsyncHandle::new();
    let out = slot.clone();
    let done = handle.clone();
    exec.submit(move || {
        let code = match op() {
            Ok(v) => {
                *out.lock().unwrap() = Some(v);
                0
            }
            Err(e) => e.code(),
        };
        done.complete(code);
    })?;
    Ok(AsyncRecv::new(slot, handle))
}

pub fn open_async(path: String, flags: i32, mode: u32, d: Deadline) -> Result<FileOp<RawFd>, RtError> {
    match runtime::backend() {
        Backend::Poll => run_op(move || poll::open(&path, flags, mode, d)),
        Backend::Executor => run_op(move || fs::open(&path, flags, mode)),
    }
}

pub fn close_async(fd: RawFd) -> Result<FileOp<()>, RtError> {
    run_op(move || fs::close(fd))
}

/// Read up to `len` bytes; the slot receives exactly what was read.
pub fn read_async(fd: RawFd, len: usize, d: Deadline) -> Result<FileOp<Vec<u8>>, RtError> {
    match runtime::backend() {
        Backend::Poll => run_op(move || {
            let mut buf = vec![0u8; len];
            let n = poll::read(fd, &mut buf, d)?;
            buf.truncate(n);
            Ok(buf)
        }),
        Backend::Executor => run_op(move || {
            let mut buf = vec![0u8; len];
            let n = fs::read(fd, &mut buf)?;
            buf.truncate(n);
            Ok(buf)
        }),
    }
}

pub fn read_all_async(fd: RawFd, d: Deadline) -> Result<FileOp<Vec<u8>>, RtError> {
    match runtime::backend() {
        Backend::Poll => run_op(move || poll::read_all(fd, d)),
        Backend::Executor => run_op(move || fs::read_all(fd)),
    }
}

pub fn read_line_async(fd: RawFd, d: Deadline) -> Result<FileOp<Vec<u8>>, RtError> {
    match runtime::backend() {
        Backend::Poll => run_op(move || poll::read_line(fd, d)),
        Backend::Executor => run_op(move || fs::read_line(fd)),
    }
}

pub fn write_async(fd: RawFd, data: Vec<u8>, d: Deadline) -> Result<FileOp<usize>, RtError> {
    match runtime::backend() {
        Backend::Poll => run_op(move || poll::write(fd, &data, d)),
        Backend::Executor => run_op(move || fs::write(fd, &data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    // Single test: the backend registry is process-global, and parallel
    // test threads switching it mid-flight would leave the executor
    // backend blocking on an empty pipe below.
    #[test]
    fn async_file_ops() {
        let _guard = runtime::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        async_round_trip_both_backends();
        async_read_line();
        poll_backend_read_deadline();
    }

    fn async_round_trip_both_backends() {
        for backend in [Backend::Executor, Backend::Poll] {
            runtime::set_backend(backend);

            let tmp = tempfile::NamedTempFile::new().unwrap();
            let path = tmp.path().to_str().unwrap().to_string();

            let fd = open_async(path.clone(), libc::O_WRONLY | libc::O_TRUNC, 0, Deadline::none())
                .unwrap()
                .wait()
                .unwrap();
            assert_eq!(
                write_async(fd, b"payload".to_vec(), Deadline::none())
                    .unwrap()
                    .wait()
                    .unwrap(),
                7
            );
            close_async(fd).unwrap().wait().unwrap();

            let fd = open_async(path, libc::O_RDONLY, 0, Deadline::none())
                .unwrap()
                .wait()
                .unwrap();
            let data = read_all_async(fd, Deadline::none()).unwrap().wait().unwrap();
            assert_eq!(data, b"payload");
            close_async(fd).unwrap().wait().unwrap();
        }
    }

    fn async_read_line() {
        runtime::set_backend(Backend::Poll);
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"line one\nline two\n").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let fd = open_async(path, libc::O_RDONLY, 0, Deadline::none())
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(
            read_line_async(fd, Deadline::none()).unwrap().wait().unwrap(),
            b"line one"
        );
        close_async(fd).unwrap().wait().unwrap();
    }

    fn poll_backend_read_deadline() {
        runtime::set_backend(Backend::Poll);
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let op = read_async(fds[0], 16, Deadline::after_ms(20)).unwrap();
        assert_eq!(op.wait(), Err(RtError::TimedOut));

        fs::close(fds[0]).unwrap();
        fs::close(fds[1]).unwrap();
    }
}
