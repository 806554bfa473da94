// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Synchronous file operations over raw fds.
//!
//! These are the blocking primitives the executor backend offloads and
//! the frontend's `_ok/_err` result wrappers are generated around.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use conch_rt::error::RtError;

/// `read_line` scratch size; a longer line fails with `Nomem` rather
/// than silently truncating.
pub const READ_LINE_MAX: usize = 256;

fn check_fd(fd: RawFd) -> Result<(), RtError> {
    if fd < 0 {
        return Err(RtError::Badf);
    }
    Ok(())
}

/// Open `path`. Flags and mode are passed straight to `open(2)`.
pub fn open(path: &str, flags: i32, mode: u32) -> Result<RawFd, RtError> {
    let cpath = CString::new(path).map_err(|_| RtError::Inval)?;
    // SAFETY: cpath is NUL-terminated and outlives the call.
    let fd = unsafe { libc::open(cpath.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(RtError::last_os_error());
    }
    Ok(fd)
}

pub fn close(fd: RawFd) -> Result<(), RtError> {
    check_fd(fd)?;
    // SAFETY: fd validated non-negative; double-close is the caller's bug
    // and surfaces as EBADF.
    if unsafe { libc::close(fd) } < 0 {
        return Err(RtError::last_os_error());
    }
    Ok(())
}

/// One `read(2)`. Returns 0 at end of file.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, RtError> {
    check_fd(fd)?;
    loop {
        // SAFETY: buf is a valid writable region of buf.len() bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(RtError::last_os_error());
    }
}

/// Write the whole buffer, looping over short writes.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize, RtError> {
    check_fd(fd)?;
    let mut written = 0;
    while written < buf.len() {
        let rest = &buf[written..];
        // SAFETY: rest is a valid readable region of rest.len() bytes.
        let n = unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
        if n >= 0 {
            written += n as usize;
            continue;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(RtError::last_os_error());
    }
    Ok(written)
}

/// Whether the fd refers to a regular file.
pub fn is_regular_file(fd: RawFd) -> Result<bool, RtError> {
    check_fd(fd)?;
    // SAFETY: zeroed stat is a valid out-buffer for fstat.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(RtError::last_os_error());
    }
    Ok((st.st_mode & libc::S_IFMT) == libc::S_IFREG)
}

/// Read from the current position to end of file. Refuses non-regular
/// files — a pipe or socket has no "all".
pub fn read_all(fd: RawFd) -> Result<Vec<u8>, RtError> {
    if !is_regular_file(fd)? {
        return Err(RtError::NotSup);
    }
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = read(fd, &mut chunk)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Read up to (and excluding) the next newline. EOF ends the line.
/// Lines longer than [`READ_LINE_MAX`] fail with `Nomem`.
pub fn read_line(fd: RawFd) -> Result<Vec<u8>, RtError> {
    check_fd(fd)?;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = read(fd, &mut byte)?;
        if n == 0 || byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() >= READ_LINE_MAX {
            return Err(RtError::Nomem);
        }
        line.push(byte[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn write_then_read_all() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello conch\n").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let fd = open(&path, libc::O_RDONLY, 0).unwrap();
        let data = read_all(fd).unwrap();
        assert_eq!(data, b"hello conch\n");
        close(fd).unwrap();
    }

    #[test]
    fn read_line_stops_at_newline() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"first\nsecond\n").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let fd = open(&path, libc::O_RDONLY, 0).unwrap();
        assert_eq!(read_line(fd).unwrap(), b"first");
        assert_eq!(read_line(fd).unwrap(), b"second");
        // EOF: empty line.
        assert_eq!(read_line(fd).unwrap(), b"");
        close(fd).unwrap();
    }

    #[test]
    fn read_line_overflow_is_nomem() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![b'x'; READ_LINE_MAX + 10]).unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let fd = open(&path, libc::O_RDONLY, 0).unwrap();
        assert_eq!(read_line(fd), Err(RtError::Nomem));
        close(fd).unwrap();
    }

    #[test]
    fn read_all_refuses_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(read_all(fds[0]), Err(RtError::NotSup));
        close(fds[0]).unwrap();
        close(fds[1]).unwrap();
    }

    #[test]
    fn bad_fd_is_badf() {
        let mut buf = [0u8; 4];
        assert_eq!(read(-1, &mut buf), Err(RtError::Badf));
        assert_eq!(write(-1, b"x"), Err(RtError::Badf));
        assert_eq!(close(-1), Err(RtError::Badf));
    }

    #[test]
    fn open_missing_file_passes_errno() {
        match open("/definitely/not/here", libc::O_RDONLY, 0) {
            Err(RtError::Os(e)) => assert_eq!(e, libc::ENOENT),
            other => panic!("expected ENOENT, got {:?}", other),
        }
    }

    #[test]
    fn full_write_loop() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        let fd = open(&path, libc::O_WRONLY | libc::O_TRUNC, 0).unwrap();
        let data = vec![7u8; 100_000];
        assert_eq!(write(fd, &data).unwrap(), data.len());
        close(fd).unwrap();

        let fd = open(&path, libc::O_RDONLY, 0).unwrap();
        assert_eq!(read_all(fd).unwrap(), data);
        close(fd).unwrap();
    }
}
