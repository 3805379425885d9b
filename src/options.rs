//! Data model shared across the launcher, multiplexer, and process handle.

use std::ffi::OsString;
use std::fmt;
use std::time::Duration;

use crate::handle::Handle;

/// What to do with one of the child's standard streams.
///
/// `Borrowed` may be placed in more than one slot (e.g. a socketpair used
/// as both stdin and stdout of the child) - the same [`Handle`] is `dup2`'d
/// into each requested fd, in an order that never clobbers the source
/// before it has been copied (see [`crate::spawn`]).
#[derive(Debug, Clone)]
pub enum Stdio {
    /// Inherit the parent's corresponding standard stream.
    Inherit,
    /// Redirect to the platform null device (`/dev/null` or `NUL`).
    Null,
    /// Create an anonymous pipe; the parent-side end is returned from
    /// [`crate::spawn::start`] on the corresponding field of [`ChildStreams`].
    Pipe,
    /// Use a caller-supplied handle directly, without taking ownership of
    /// it beyond the duration of the spawn.
    Borrowed(Handle),
}

impl Default for Stdio {
    fn default() -> Stdio {
        Stdio::Inherit
    }
}

/// Caller-provided configuration for [`crate::spawn::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Executable path or bare name (searched on `PATH` if it has no
    /// directory separator).
    pub executable: OsString,
    /// `argv`, including `argv[0]`.
    pub argv: Vec<OsString>,
    /// `None` means inherit the parent's environment; `Some` replaces it
    /// entirely (keys are assumed unique - later duplicates win).
    pub env: Option<Vec<(OsString, OsString)>>,
    /// `None` means inherit the parent's current directory.
    pub cwd: Option<OsString>,
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
    /// Unix only: place the child in a new process group via
    /// `setpgid(0, 0)`, so that [`crate::process::ChildProcess::kill`] can
    /// target the whole group and orphaned grandchildren can be reached.
    /// Ignored on Windows, where the equivalent is the job object every
    /// child is unconditionally assigned to.
    pub new_process_group: bool,
}

impl StartOptions {
    /// A minimal configuration: run `argv[0]` with the given arguments,
    /// inheriting environment, cwd, and all three standard streams.
    pub fn new(argv: Vec<OsString>) -> StartOptions {
        let executable = argv
            .first()
            .cloned()
            .unwrap_or_else(|| OsString::from(""));
        StartOptions {
            executable,
            argv,
            env: None,
            cwd: None,
            stdin: Stdio::Inherit,
            stdout: Stdio::Inherit,
            stderr: Stdio::Inherit,
            new_process_group: false,
        }
    }
}

/// Direction of an anonymous pipe created by [`crate::pipe::make_pipe`],
/// i.e. which end the child is meant to use.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PipeDirection {
    /// The child reads from the pipe; the parent writes.
    ChildReads,
    /// The child writes to the pipe; the parent reads.
    ChildWrites,
}

/// Parent-side pipe ends left over after [`crate::spawn::start`], one per
/// stdio slot that was configured as [`Stdio::Pipe`].
#[derive(Debug, Default)]
pub struct ChildStreams {
    pub stdin: Option<Handle>,
    pub stdout: Option<Handle>,
    pub stderr: Option<Handle>,
}

/// Outcome of [`crate::process::ChildProcess::wait_for_exit`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    Timeout,
}

/// A child's exit status, decoded from the platform-native representation.
///
/// On Unix this distinguishes normal exit from signal termination; on
/// Windows every determined exit is a plain code (signals do not exist).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ExitStatus {
    /// The process called `exit()` (or returned from `main`) with this code.
    Exited(i32),
    /// Unix only: the process was terminated by this signal.
    Signaled(i32),
    /// The wait-status bits didn't decode as either of the above (Unix
    /// `WIFEXITED`/`WIFSIGNALED` both false, e.g. stopped/continued).
    Other(i32),
}

impl ExitStatus {
    /// True for a normal exit with code 0.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// The spec's flattened exit-code convention: a normal exit returns its
    /// code as-is; a signal termination returns `128 + signal`, matching
    /// the shell convention so callers that only care about a single
    /// integer don't need to match on the enum.
    pub fn code(&self) -> i32 {
        match *self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(sig) => 128 + sig,
            ExitStatus::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {code}"),
            ExitStatus::Signaled(sig) => write!(f, "signal {sig}"),
            ExitStatus::Other(raw) => write!(f, "unrecognized wait status {raw:#x}"),
        }
    }
}

/// Captured bytes returned by [`crate::communicate::drain_out_and_err`], one
/// entry per stream (empty if the corresponding slot wasn't
/// [`Stdio::Pipe`]).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DrainOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A deadline expressed relative to the moment it was created, so that a
/// loop re-entered after `EINTR` or a spurious wakeup can recompute the
/// remaining budget without drifting past the caller's original timeout.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Deadline(std::time::Instant);

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Deadline {
        Deadline(std::time::Instant::now() + timeout)
    }

    /// Remaining time, or `None` if the deadline has passed.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.0.checked_duration_since(std::time::Instant::now())
    }
}
