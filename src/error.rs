use std::fmt;
use std::io;

/// Result type used throughout `proc_core`.
pub type Result<T> = std::result::Result<T, Error>;

/// The stage at which a spawn failed, reported by the child across the
/// exec-fail pipe so the parent can say *where* things went wrong rather
/// than just that they did.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpawnStage {
    /// `fork()`/`posix_spawn()` itself failed.
    Fork,
    /// Changing the working directory in the child failed.
    Chdir,
    /// `dup2()`-ing a stdio slot into place failed.
    Dup2,
    /// `setuid`/`setgid`/`setpgid` failed.
    SetIds,
    /// The final `execve`/`CreateProcessW` call failed.
    Exec,
}

impl fmt::Display for SpawnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpawnStage::Fork => "fork",
            SpawnStage::Chdir => "chdir",
            SpawnStage::Dup2 => "dup2",
            SpawnStage::SetIds => "setuid/setgid/setpgid",
            SpawnStage::Exec => "exec",
        };
        f.write_str(s)
    }
}

/// Errors produced by `proc_core`.
///
/// Every variant preserves the underlying OS error where one exists, so
/// callers never lose the original `errno`/`GetLastError` value.
#[derive(Debug)]
pub enum Error {
    /// The executable could not be resolved to a path before spawning.
    ExecutableNotFound,
    /// Spawning failed at some point before the child's `exec`/
    /// `CreateProcess` call returned control to an independent process.
    SpawnFailed { stage: SpawnStage, os_err: io::Error },
    /// Anonymous pipe creation failed.
    PipeCreateFailed { os_err: io::Error },
    /// A multiplexer syscall (`poll`, `WaitForMultipleObjects`, ...) failed
    /// with a non-retryable error.
    PollFailed { os_err: io::Error },
    /// A deadline elapsed before the operation completed.
    Timeout,
    /// The operation is invalid because the child has already been reaped.
    ChildAlreadyReaped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ExecutableNotFound => write!(f, "executable not found"),
            Error::SpawnFailed { stage, os_err } => {
                write!(f, "spawn failed at {stage}: {os_err}")
            }
            Error::PipeCreateFailed { os_err } => write!(f, "pipe creation failed: {os_err}"),
            Error::PollFailed { os_err } => write!(f, "poll failed: {os_err}"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::ChildAlreadyReaped => write!(f, "child process has already been reaped"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SpawnFailed { os_err, .. }
            | Error::PipeCreateFailed { os_err }
            | Error::PollFailed { os_err } => Some(os_err),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::SpawnFailed { os_err, .. }
            | Error::PipeCreateFailed { os_err }
            | Error::PollFailed { os_err } => os_err,
            Error::Timeout => io::Error::from(io::ErrorKind::TimedOut),
            Error::ExecutableNotFound => io::Error::from(io::ErrorKind::NotFound),
            Error::ChildAlreadyReaped => io::Error::other(err.to_string()),
        }
    }
}
