//! SIGCHLD self-pipe fallback (Unix), used when `pidfd_open` is
//! unavailable (pre-5.3 kernels, or any OS error opening one).
//!
//! A single process-wide self-pipe and background thread arbitrate exit
//! notification for every child that falls back to this path. The
//! self-pipe's read end is what [`crate::process::ChildProcess`] hands
//! [`crate::communicate::drain_out_and_err`] as its third `poll` fd, so the
//! multiplexer's blocking `poll` remains the only blocking point even
//! without `pidfd` - per the design note preferring a self-pipe over a
//! dedicated `waitpid(-1, WNOHANG)` thread per child.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::options::ExitStatus;
use crate::posix;

static SELF_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

/// Pids this reaper is responsible for, plus the exit statuses it has
/// already collected. Reaping is scoped to exactly this set - a blind
/// `waitpid(-1, WNOHANG)` would also steal zombies belonging to children
/// tracked via `pidfd`, which reap themselves, causing those to spin
/// forever waiting for a status that already got consumed here.
struct Reaped {
    pending: Mutex<HashSet<u32>>,
    exited: Mutex<HashMap<u32, ExitStatus>>,
}

static REAPED: OnceLock<Reaped> = OnceLock::new();

fn reaped() -> &'static Reaped {
    REAPED.get_or_init(|| Reaped {
        pending: Mutex::new(HashSet::new()),
        exited: Mutex::new(HashMap::new()),
    })
}

extern "C" fn on_sigchld(_signum: libc::c_int) {
    // async-signal-safe: write a single byte, ignoring the result (the
    // pipe can't fill up meaningfully faster than the reaper drains it,
    // and even if it did, a coalesced wakeup just means one extra
    // `waitpid(-1, WNOHANG)` sweep next time).
    let fd = SELF_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, [0u8].as_ptr().cast(), 1);
        }
    }
}

static READ_FD: OnceLock<RawFd> = OnceLock::new();

/// Installs the `SIGCHLD` handler and starts the background reaper
/// thread, exactly once per process. Idempotent; cheap after the first
/// call.
fn ensure_installed() -> RawFd {
    *READ_FD.get_or_init(|| {
        let (read_fd, write_fd) =
            posix::pipe2_cloexec().expect("self-pipe creation failed");
        posix::set_nonblocking(read_fd, true).expect("self-pipe nonblocking");
        SELF_PIPE_WRITE.store(write_fd, Ordering::Relaxed);

        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_sigchld as usize;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = libc::SA_RESTART;
            if libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut()) != 0 {
                log::warn!(
                    "installing SIGCHLD handler failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }

        std::thread::Builder::new()
            .name("proc_core-reaper".into())
            .spawn(move || reaper_loop(read_fd))
            .expect("failed to spawn reaper thread");

        read_fd
    })
}

fn reaper_loop(read_fd: RawFd) -> ! {
    let mut fds = [posix::PollFd::new(Some(read_fd), posix::POLLIN)];
    loop {
        match posix::poll(&mut fds, -1) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("reaper thread poll failed: {e}");
                continue;
            }
        }
        drain_self_pipe(read_fd);
        reap_all();
    }
}

fn drain_self_pipe(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

fn reap_all() {
    let r = reaped();
    let pending: Vec<u32> = r.pending.lock().unwrap().iter().copied().collect();
    for pid in pending {
        match posix::waitpid(pid, posix::WNOHANG) {
            Ok((reaped_pid, status)) if reaped_pid == pid => {
                r.exited.lock().unwrap().insert(pid, status);
                r.pending.lock().unwrap().remove(&pid);
            }
            // Not exited yet (pid == 0), or already reaped by someone
            // else (ECHILD) - either way, nothing to record.
            _ => {}
        }
    }
}

/// Registers interest in `pid`'s exit via the self-pipe path. Installs the
/// handler and reaper thread on first use.
pub fn register(pid: u32) {
    ensure_installed();
    reaped().pending.lock().unwrap().insert(pid);
    // The child may already have exited between `fork` returning and this
    // call; run one sweep immediately so a `SIGCHLD` that arrived in that
    // window (and was handled before `pending` contained this pid) isn't
    // missed.
    reap_all();
}

/// The process-wide self-pipe's read end, suitable as a third `poll` fd
/// alongside a child's stdout/stderr pipes.
pub fn self_pipe_fd() -> RawFd {
    ensure_installed()
}

/// Non-blocking: has `pid` been reaped yet? Does not itself reap -
/// reaping only happens inside the background thread in response to
/// `SIGCHLD`, or synchronously in [`register`].
pub fn poll_exit(pid: u32) -> Option<ExitStatus> {
    reaped().exited.lock().unwrap().get(&pid).copied()
}

/// Drops interest in `pid`: makes one last non-blocking reap attempt, then
/// removes it from the pending set either way. Called when a
/// [`crate::process::ChildProcess`] using the self-pipe path is dropped
/// without ever calling `wait_for_exit`, so a lost race with the
/// background thread doesn't leave a permanently-stale pending entry.
pub fn forget(pid: u32) {
    let r = reaped();
    if r.exited.lock().unwrap().contains_key(&pid) {
        r.pending.lock().unwrap().remove(&pid);
        return;
    }
    if let Ok((reaped_pid, status)) = posix::waitpid(pid, posix::WNOHANG)
        && reaped_pid == pid
    {
        r.exited.lock().unwrap().insert(pid, status);
    }
    r.pending.lock().unwrap().remove(&pid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn reaper_observes_a_child_that_exits_immediately() {
        let pid = unsafe { posix::fork() }.unwrap();
        match pid {
            None => posix::_exit(3),
            Some(pid) => {
                register(pid);
                let deadline = Instant::now() + Duration::from_secs(5);
                loop {
                    if let Some(status) = poll_exit(pid) {
                        assert_eq!(status, ExitStatus::Exited(3));
                        break;
                    }
                    assert!(Instant::now() < deadline, "reaper never observed exit");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
}
