//! Cross-platform core for launching and supervising child processes.
//!
//! This crate is the low-level engine: given a fully-resolved
//! [`StartOptions`] (executable, argv, environment, working directory,
//! and three stdio slots), it starts the child, lets a caller concurrently
//! drain its stdout/stderr into memory without losing trailing output or
//! deadlocking on a full pipe buffer, and exposes a [`ChildProcess`] handle
//! for waiting on and terminating it.
//!
//! Argument tokenization, environment assembly helpers, a run-to-completion
//! builder API, and text decoding of captured output are intentionally
//! layered on top of this crate rather than inside it.
//!
//! # Example
//!
//! ```no_run
//! use proc_core::{Stdio, StartOptions};
//! use std::ffi::OsString;
//! use std::time::Duration;
//!
//! let options = StartOptions {
//!     stdout: Stdio::Pipe,
//!     stderr: Stdio::Pipe,
//!     ..StartOptions::new(vec![OsString::from("echo"), OsString::from("hello")])
//! };
//! let (process, streams) = proc_core::start(options)?;
//! let outcome = proc_core::drain_out_and_err(
//!     &process,
//!     streams.stdout,
//!     streams.stderr,
//!     Some(Duration::from_secs(5)),
//! )?;
//! assert_eq!(outcome.stdout, b"hello\n");
//! # Ok::<(), proc_core::Error>(())
//! ```

#![warn(missing_docs)]

extern crate libc;

#[cfg(windows)]
extern crate winapi;

mod communicate;
mod error;
mod handle;
mod options;
mod pipe;
mod process;
#[cfg(unix)]
mod posix;
#[cfg(unix)]
mod reaper;
mod spawn;
#[cfg(windows)]
mod win32;

pub use self::communicate::drain_out_and_err;
pub use self::error::{Error, Result, SpawnStage};
pub use self::handle::Handle;
pub use self::options::{
    ChildStreams, DrainOutcome, ExitStatus, PipeDirection, Stdio, StartOptions, WaitOutcome,
};
pub use self::pipe::make_pipe;
pub use self::process::ChildProcess;
pub use self::spawn::{resolve_executable, start};
