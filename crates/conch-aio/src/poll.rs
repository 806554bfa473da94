// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `poll(2)` engine.
//!
//! Each operation flips the fd to non-blocking, then loops: wait for
//! readiness with a timeout derived from the deadline, perform one
//! syscall, treat `EAGAIN` as "wait again" and a zero read as EOF.
//! A cancelled deadline surfaces before a timed-out one.

use std::os::unix::io::RawFd;

use conch_rt::deadline::Deadline;
use conch_rt::error::RtError;

use crate::fs;

/// Put the fd into non-blocking mode (idempotent).
pub fn set_nonblocking(fd: RawFd) -> Result<(), RtError> {
    if fd < 0 {
        return Err(RtError::Badf);
    }
    // SAFETY: plain fcntl flag manipulation on a caller-owned fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(RtError::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(RtError::last_os_error());
    }
    Ok(())
}

/// Poll timeout in ms for a deadline: negative = no deadline,
/// errors out when the deadline is already cancelled or expired.
fn poll_timeout_ms(d: Deadline) -> Result<i32, RtError> {
    if d.cancelled {
        return Err(RtError::Cancelled);
    }
    match d.remaining() {
        None => Ok(-1),
        Some(left) if left.is_zero() => Err(RtError::TimedOut),
        Some(left) => {
            // Round up so we never spin on a sub-millisecond remainder.
            let ms = left.as_millis().min(i32::MAX as u128) as i32;
            Ok(ms.max(1))
        }
    }
}

/// Block in `poll(2)` until the fd is ready for `events`.
fn wait_ready(fd: RawFd, events: libc::c_short, d: Deadline) -> Result<(), RtError> {
    loop {
        let timeout = poll_timeout_ms(d)?;
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd array of length 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(RtError::last_os_error());
        }
        if rc == 0 {
            // poll's own timeout fired; re-derive to report Cancelled
            // correctly if the deadline was flagged meanwhile.
            poll_timeout_ms(d)?;
            return Err(RtError::TimedOut);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(RtError::Badf);
        }
        // POLLERR / POLLHUP: fall through and let the syscall report.
        return Ok(());
    }
}

/// Read up to `buf.len()` bytes; 0 means EOF.
pub fn read(fd: RawFd, buf: &mut [u8], d: Deadline) -> Result<usize, RtError> {
    set_nonblocking(fd)?;
    loop {
        wait_ready(fd, libc::POLLIN, d)?;
        // SAFETY: buf is a valid writable region of buf.len() bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
            _ => return Err(RtError::last_os_error()),
        }
    }
}

/// Write the whole buffer, waiting for writability between short writes.
pub fn write(fd: RawFd, buf: &[u8], d: Deadline) -> Result<usize, RtError> {
    set_nonblocking(fd)?;
    let mut written = 0;
    while written < buf.len() {
        wait_ready(fd, libc::POLLOUT, d)?;
        let rest = &buf[written..];
        // SAFETY: rest is a valid readable region of rest.len() bytes.
        let n = unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
        if n >= 0 {
            written += n as usize;
            continue;
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
            _ => return Err(RtError::last_os_error()),
        }
    }
    Ok(written)
}

/// Read to end of file. Regular files only (`NotSup` otherwise).
pub fn read_all(fd: RawFd, d: Deadline) -> Result<Vec<u8>, RtError> {
    if !fs::is_regular_file(fd)? {
        return Err(RtError::NotSup);
    }
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = read(fd, &mut chunk, d)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Read a line (newline excluded, EOF ends it); longer than
/// [`fs::READ_LINE_MAX`] fails with `Nomem`.
pub fn read_line(fd: RawFd, d: Deadline) -> Result<Vec<u8>, RtError> {
    set_nonblocking(fd)?;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = read(fd, &mut byte, d)?;
        if n == 0 || byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() >= fs::READ_LINE_MAX {
            return Err(RtError::Nomem);
        }
        line.push(byte[0]);
    }
}

/// Deadline-checked open. `open(2)` itself does not park on regular
/// files, so the deadline only gates entry.
pub fn open(path: &str, flags: i32, mode: u32, d: Deadline) -> Result<RawFd, RtError> {
    if d.cancelled {
        return Err(RtError::Cancelled);
    }
    if d.expired() {
        return Err(RtError::TimedOut);
    }
    fs::open(path, flags, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::{Duration, Instant};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn read_ready_data() {
        let (r, w) = pipe();
        fs::write(w, b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = read(r, &mut buf, Deadline::none()).unwrap();
        assert_eq!(&buf[..n], b"ping");
        fs::close(r).unwrap();
        fs::close(w).unwrap();
    }

    #[test]
    fn read_times_out_on_empty_pipe() {
        let (r, w) = pipe();
        let mut buf = [0u8; 4];
        let start = Instant::now();
        assert_eq!(
            read(r, &mut buf, Deadline::after_ms(30)),
            Err(RtError::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
        fs::close(r).unwrap();
        fs::close(w).unwrap();
    }

    #[test]
    fn cancelled_deadline_wins() {
        let (r, w) = pipe();
        let mut buf = [0u8; 4];
        let mut d = Deadline::after_ms(1000);
        d.cancelled = true;
        assert_eq!(read(r, &mut buf, d), Err(RtError::Cancelled));
        fs::close(r).unwrap();
        fs::close(w).unwrap();
    }

    #[test]
    fn eof_is_zero_read() {
        let (r, w) = pipe();
        fs::close(w).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read(r, &mut buf, Deadline::none()).unwrap(), 0);
        fs::close(r).unwrap();
    }

    #[test]
    fn read_all_regular_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abc def").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        let fd = fs::open(&path, libc::O_RDONLY, 0).unwrap();
        assert_eq!(read_all(fd, Deadline::none()).unwrap(), b"abc def");
        fs::close(fd).unwrap();
    }

    #[test]
    fn read_all_refuses_pipe() {
        let (r, w) = pipe();
        assert_eq!(read_all(r, Deadline::none()), Err(RtError::NotSup));
        fs::close(r).unwrap();
        fs::close(w).unwrap();
    }

    #[test]
    fn read_line_across_pipe() {
        let (r, w) = pipe();
        fs::write(w, b"one line\nrest").unwrap();
        assert_eq!(read_line(r, Deadline::none()).unwrap(), b"one line");
        fs::close(r).unwrap();
        fs::close(w).unwrap();
    }

    #[test]
    fn write_honors_deadline_on_full_pipe() {
        let (r, w) = pipe();
        // Fill the pipe buffer until a non-blocking write would park.
        set_nonblocking(w).unwrap();
        let chunk = vec![0u8; 65536];
        loop {
            let n = unsafe {
                libc::write(w, chunk.as_ptr() as *const libc::c_void, chunk.len())
            };
            if n < 0 {
                break;
            }
        }
        let start = Instant::now();
        assert_eq!(
            write(w, b"more", Deadline::after_ms(30)),
            Err(RtError::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
        fs::close(r).unwrap();
        fs::close(w).unwrap();
    }
}
