//! Anonymous unidirectional pipe creation (C2).

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::options::PipeDirection;

#[cfg(unix)]
pub fn make_pipe(_direction: PipeDirection) -> Result<(Handle, Handle)> {
    let (read_fd, write_fd) = crate::posix::pipe2_cloexec()
        .map_err(|os_err| Error::PipeCreateFailed { os_err })?;
    // Inheritability for the end handed to the child is cleared just
    // before `dup2` in the launcher, once it is known which fd it is being
    // duplicated into; both ends start close-on-exec here so a pipe that
    // is never wired into a child never leaks into unrelated spawns.
    Ok((Handle::owned(read_fd), Handle::owned(write_fd)))
}

#[cfg(windows)]
pub fn make_pipe(direction: PipeDirection) -> Result<(Handle, Handle)> {
    let (read_raw, write_raw) = crate::win32::create_overlapped_pipe()
        .map_err(|os_err| Error::PipeCreateFailed { os_err })?;
    let _ = direction;
    Ok((Handle::owned(read_raw), Handle::owned(write_raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[cfg(unix)]
    #[test]
    fn pipe_roundtrips_bytes() {
        use std::os::unix::io::FromRawFd;

        let (read_end, write_end) = make_pipe(PipeDirection::ChildWrites).unwrap();
        let mut reader = unsafe { std::fs::File::from_raw_fd(read_end.as_raw()) };
        let mut writer = unsafe { std::fs::File::from_raw_fd(write_end.as_raw()) };
        // `File` now owns these fds for the duration of this test; make
        // sure the `Handle`s don't also try to close them.
        std::mem::forget(read_end);
        std::mem::forget(write_end);

        writer.write_all(b"hello").unwrap();
        drop(writer);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }
}
