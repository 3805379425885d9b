//! Thin, checked wrappers over the Unix syscalls the rest of the crate
//! needs. Each function mirrors its libc counterpart as closely as
//! possible; only error-checking and type conversions are added.

use std::ffi::{CString, OsStr, OsString};
use std::io::{Error, Result};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;

use crate::options::ExitStatus;

pub use libc::ECHILD;

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

fn os_to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

/// Create a pipe with both ends close-on-exec.
///
/// Prefers `pipe2(O_CLOEXEC)`; falls back to `pipe()` followed by
/// `fcntl(F_SETFD, FD_CLOEXEC)` on systems where `pipe2` is unavailable
/// (the fallback exists mainly for documentation purposes - every target
/// `libc` supports here also has `pipe2`, but the spec calls for the
/// fallback to be explicit rather than assumed).
pub fn pipe2_cloexec() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc == 0 {
        return Ok((fds[0], fds[1]));
    }
    let err = Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOSYS) {
        return Err(err);
    }
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    fcntl(fds[0], F_SETFD, Some(FD_CLOEXEC))?;
    fcntl(fds[1], F_SETFD, Some(FD_CLOEXEC))?;
    Ok((fds[0], fds[1]))
}

/// `fork()`. Returns `None` in the child, `Some(pid)` in the parent.
///
/// # Safety
/// Only async-signal-safe code may run between this call returning in the
/// child and the following `execve`/`_exit`.
pub unsafe fn fork() -> Result<Option<u32>> {
    let pid = check_err(unsafe { libc::fork() })?;
    Ok(if pid == 0 { None } else { Some(pid as u32) })
}

/// Resolves `cmd` into a C string plus a closure that `execve`s it with
/// `argv`/`envp` already prepared. Splitting resolution (which can fail
/// with `ENOENT`/allocate) from the actual call lets the caller do the
/// allocation before `fork`, keeping the post-fork child path allocation
/// free other than the `execve` itself.
pub fn prep_exec(
    cmd: &OsStr,
    argv: &[OsString],
    envp: Option<&[OsString]>,
) -> Result<impl FnOnce() -> Result<()> + use<>> {
    let cmd_c = os_to_cstring(cmd)?;
    let argv_c: Vec<CString> = argv
        .iter()
        .map(|a| os_to_cstring(a))
        .collect::<Result<_>>()?;
    let envp_c: Option<Vec<CString>> = envp
        .map(|env| env.iter().map(|e| os_to_cstring(e)).collect())
        .transpose()?;

    Ok(move || {
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv_c.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(ptr::null());

        match &envp_c {
            Some(envp_c) => {
                let mut envp_ptrs: Vec<*const libc::c_char> =
                    envp_c.iter().map(|e| e.as_ptr()).collect();
                envp_ptrs.push(ptr::null());
                check_err(unsafe {
                    libc::execve(cmd_c.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr())
                })?;
            }
            None => {
                check_err(unsafe { libc::execvp(cmd_c.as_ptr(), argv_ptrs.as_ptr()) })?;
            }
        }
        unreachable!("execve/execvp only returns on error, which is caught above")
    })
}

/// Searches `PATH` for `cmd` the way `execvp` would, without invoking it.
/// Returns the bare name unchanged if it contains a directory separator.
pub fn resolve_in_path(cmd: &OsStr) -> Option<OsString> {
    if cmd.as_bytes().contains(&b'/') {
        return if Path::new(cmd).exists() {
            Some(cmd.to_owned())
        } else {
            None
        };
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(cmd);
        if candidate.is_file() {
            return Some(candidate.into_os_string());
        }
    }
    None
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

pub const WNOHANG: i32 = libc::WNOHANG;

pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, ExitStatus)> {
    let mut status = 0 as libc::c_int;
    let pid_out = check_err(unsafe { libc::waitpid(pid as libc::pid_t, &mut status, flags) })?;
    Ok((pid_out as u32, decode_exit_status(status)))
}

fn decode_exit_status(status: i32) -> ExitStatus {
    if libc::WIFEXITED(status) {
        ExitStatus::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status))
    } else {
        ExitStatus::Other(status)
    }
}

pub const SIGTERM: i32 = libc::SIGTERM;
pub const SIGKILL: i32 = libc::SIGKILL;

pub fn kill(pid: u32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::kill(pid as libc::pid_t, signal) })?;
    Ok(())
}

/// Send a signal to the process *group* led by `pid`. Only meaningful if
/// the child was started with `new_process_group` set, making it its own
/// group leader.
pub fn killpg(pid: u32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::killpg(pid as libc::pid_t, signal) })?;
    Ok(())
}

pub fn setpgid(pid: u32, pgid: u32) -> Result<()> {
    check_err(unsafe { libc::setpgid(pid as libc::pid_t, pgid as libc::pid_t) })?;
    Ok(())
}

pub fn setuid(uid: u32) -> Result<()> {
    check_err(unsafe { libc::setuid(uid as libc::uid_t) })?;
    Ok(())
}

pub fn setgid(gid: u32) -> Result<()> {
    check_err(unsafe { libc::setgid(gid as libc::gid_t) })?;
    Ok(())
}

pub const F_GETFD: i32 = libc::F_GETFD;
pub const F_SETFD: i32 = libc::F_SETFD;
pub const FD_CLOEXEC: i32 = libc::FD_CLOEXEC;

pub fn fcntl(fd: RawFd, cmd: i32, arg1: Option<i32>) -> Result<i32> {
    check_err(unsafe {
        match arg1 {
            Some(arg1) => libc::fcntl(fd, cmd, arg1),
            None => libc::fcntl(fd, cmd),
        }
    })
}

pub fn set_cloexec(fd: RawFd, cloexec: bool) -> Result<()> {
    let old = fcntl(fd, F_GETFD, None)?;
    let new = if cloexec {
        old | FD_CLOEXEC
    } else {
        old & !FD_CLOEXEC
    };
    fcntl(fd, F_SETFD, Some(new))?;
    Ok(())
}

pub fn dup2(oldfd: RawFd, newfd: RawFd) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

/// Resets `SIGPIPE` to `SIG_DFL` and clears the inherited signal mask.
///
/// Called in the child between `fork` and `exec`. Quoting
/// `std::process::Command::do_exec`: libstd ignores `SIGPIPE` and
/// signal-handling libraries often set a mask; child processes inherit
/// ignored signals and the signal mask from their parent, but most Unix
/// programs do not reset these things on their own, so this cleans things
/// up to avoid confusing the program about to run.
pub fn reset_sigpipe() -> Result<()> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        check_err(libc::sigemptyset(&mut set))?;
        check_err(libc::pthread_sigmask(libc::SIG_SETMASK, &set, ptr::null_mut()))?;
        let ret = libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        if ret == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// Closes every open descriptor strictly greater than `keep_above` in the
/// child, so that accidentally-inherited fds (files opened by the parent
/// without `O_CLOEXEC`, listening sockets, etc.) never leak into it.
///
/// Tries, in order: iterating `/proc/self/fd` (accurate, Linux-only),
/// `close_range` (fast, modern kernels), and finally a brute-force loop up
/// to `sysconf(_SC_OPEN_MAX)`.
pub fn close_fds_above(keep_above: RawFd) {
    if close_fds_via_proc(keep_above).is_some() {
        return;
    }
    if close_range(keep_above).is_ok() {
        return;
    }
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd > 0 { max_fd as RawFd } else { 65536 };
    for fd in (keep_above + 1)..max_fd {
        unsafe {
            libc::close(fd);
        }
    }
}

fn close_fds_via_proc(keep_above: RawFd) -> Option<()> {
    use std::os::unix::io::AsRawFd;

    let dir = std::fs::read_dir("/proc/self/fd").ok()?;
    // Keep the directory's own fd alive (and excluded) until the scan below
    // is done reading from it.
    let self_dir_file = std::fs::File::open("/proc/self/fd").ok()?;
    let self_dir_fd = self_dir_file.as_raw_fd();

    let mut to_close = Vec::new();
    for entry in dir.flatten() {
        if let Some(name) = entry.file_name().to_str()
            && let Ok(fd) = name.parse::<RawFd>()
            && fd > keep_above
            && fd != self_dir_fd
        {
            to_close.push(fd);
        }
    }
    for fd in to_close {
        unsafe {
            libc::close(fd);
        }
    }
    Some(())
}

fn close_range(keep_above: RawFd) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                (keep_above + 1) as libc::c_uint,
                u32::MAX,
                0 as libc::c_uint,
            )
        };
        check_err(rc).map(|_| ())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(Error::from_raw_os_error(libc::ENOSYS))
    }
}

/// A `pollfd` slot, reused across iterations of the poll loop in
/// `communicate`.
pub struct PollFd(libc::pollfd);

impl PollFd {
    pub fn new(fd: Option<RawFd>, events: i16) -> PollFd {
        PollFd(libc::pollfd {
            fd: fd.unwrap_or(-1),
            events,
            revents: 0,
        })
    }

    pub fn test(&self, mask: i16) -> bool {
        self.0.revents & mask != 0
    }

    pub fn fd(&self) -> RawFd {
        self.0.fd
    }
}

pub use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI};

/// `poll()` with a millisecond timeout (`-1` blocks indefinitely). Retrying
/// on `EINTR` is the *caller's* responsibility, since only the caller knows
/// the deadline to recompute the timeout against.
pub fn poll(fds: &mut [PollFd], timeout_ms: i32) -> Result<usize> {
    let cnt = unsafe {
        libc::poll(
            fds.as_mut_ptr() as *mut libc::pollfd,
            fds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    check_err(cnt).map(|c| c as usize)
}

/// Opens a `pidfd` for `pid`, the Linux 5.3+ mechanism for observing a
/// process's exit via `poll`/`read` instead of a SIGCHLD-driven reaper
/// thread. Callers should treat any error here as "unavailable, fall back
/// to the self-pipe reaper" rather than a hard failure.
pub fn pidfd_open(pid: u32) -> Result<RawFd> {
    let rc = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    check_err(rc).map(|fd| fd as RawFd)
}

/// Cached probe for whether `pidfd_open` works on this kernel. Checked
/// once; the result only depends on the running kernel version.
pub fn pidfd_supported() -> bool {
    use std::sync::OnceLock;
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| match pidfd_open(getpid()) {
        Ok(fd) => {
            unsafe {
                libc::close(fd);
            }
            true
        }
        Err(_) => false,
    })
}

/// Sets `fd` non-blocking, used for the self-pipe read end so the reaper
/// thread's `poll`+`read` never blocks on a spurious wakeup.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    let old = fcntl(fd, libc::F_GETFL, None)?;
    let new = if nonblocking {
        old | libc::O_NONBLOCK
    } else {
        old & !libc::O_NONBLOCK
    };
    fcntl(fd, libc::F_SETFL, Some(new))?;
    Ok(())
}

pub fn getpid() -> u32 {
    unsafe { libc::getpid() as u32 }
}

pub fn os_string_from_bytes(bytes: Vec<u8>) -> OsString {
    OsString::from_vec(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_fds_are_distinct_and_cloexec() {
        let (r, w) = pipe2_cloexec().unwrap();
        assert_ne!(r, w);
        let flags_r = fcntl(r, F_GETFD, None).unwrap();
        let flags_w = fcntl(w, F_GETFD, None).unwrap();
        assert_eq!(flags_r & FD_CLOEXEC, FD_CLOEXEC);
        assert_eq!(flags_w & FD_CLOEXEC, FD_CLOEXEC);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn resolve_in_path_finds_sh() {
        let resolved = resolve_in_path(OsStr::new("sh"));
        assert!(resolved.is_some());
    }

    #[test]
    fn resolve_in_path_rejects_unknown() {
        assert!(resolve_in_path(OsStr::new("definitely-not-a-real-binary-xyz")).is_none());
    }

    #[test]
    fn waitpid_reaps_a_child_that_exits_immediately() {
        let pid = unsafe { fork() }.unwrap();
        match pid {
            None => _exit(7),
            Some(pid) => {
                let (got_pid, status) = waitpid(pid, 0).unwrap();
                assert_eq!(got_pid, pid);
                assert_eq!(status, ExitStatus::Exited(7));
            }
        }
    }
}
