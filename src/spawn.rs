//! Process launch (C3): turns a [`StartOptions`] into a running
//! [`ChildProcess`], wiring the three stdio slots over owned or borrowed
//! handles and returning a [`ChildStreams`] with whatever parent-side pipe
//! ends resulted from [`Stdio::Pipe`] slots.

use std::ffi::OsString;

use crate::error::{Error, Result, SpawnStage};
use crate::handle::Handle;
use crate::options::{ChildStreams, StartOptions, Stdio};
use crate::process::ChildProcess;

/// Spawns `options.executable` as configured. On success the child is
/// already running (or, on Unix, already past the point where `exec`
/// failures are reported back through the exec-fail pipe).
pub fn start(options: StartOptions) -> Result<(ChildProcess, ChildStreams)> {
    if options.argv.is_empty() {
        return Err(Error::ExecutableNotFound);
    }

    let stdin = materialize_stdio(&options.stdin, true)?;
    let stdout = materialize_stdio(&options.stdout, false)?;
    let stderr = materialize_stdio(&options.stderr, false)?;

    let child_streams = ChildStreams {
        stdin: stdin.parent.clone(),
        stdout: stdout.parent.clone(),
        stderr: stderr.parent.clone(),
    };

    let result = os::start_child(&options, stdin.child, stdout.child, stderr.child);

    // The parent-side ends of any pipe slots are only useful once the
    // launch has succeeded; on failure they're released here rather than
    // handed back to a caller who has no process to talk to.
    if result.is_err() {
        drop(child_streams);
    }

    let process = result?;
    Ok((process, child_streams))
}

struct MaterializedStdio {
    /// End handed to the child (`dup2`'d or placed directly in
    /// `STARTUPINFO`); `None` means inherit the parent's own stream.
    child: Option<Handle>,
    /// End kept by the parent, present only for `Stdio::Pipe`.
    parent: Option<Handle>,
}

fn materialize_stdio(stdio: &Stdio, child_reads: bool) -> Result<MaterializedStdio> {
    match stdio {
        Stdio::Inherit => Ok(MaterializedStdio {
            child: None,
            parent: None,
        }),
        Stdio::Null => {
            let h = os::open_null_device(child_reads)?;
            Ok(MaterializedStdio {
                child: Some(h),
                parent: None,
            })
        }
        Stdio::Pipe => {
            let direction = if child_reads {
                crate::options::PipeDirection::ChildReads
            } else {
                crate::options::PipeDirection::ChildWrites
            };
            let (read_end, write_end) = crate::pipe::make_pipe(direction)?;
            let (child, parent) = if child_reads {
                (read_end, write_end)
            } else {
                (write_end, read_end)
            };
            Ok(MaterializedStdio {
                child: Some(child),
                parent: Some(parent),
            })
        }
        Stdio::Borrowed(h) => Ok(MaterializedStdio {
            child: Some(h.clone()),
            parent: None,
        }),
    }
}

pub fn resolve_executable(cmd: &std::ffi::OsStr) -> Result<OsString> {
    os::resolve_in_path(cmd).ok_or(Error::ExecutableNotFound)
}

#[cfg(unix)]
mod os {
    use super::*;
    use std::io;
    use std::os::unix::io::RawFd;

    use crate::handle::Handle;
    use crate::posix;
    use crate::process::ChildProcess;

    pub fn open_null_device(read: bool) -> Result<Handle> {
        let path = std::ffi::CString::new("/dev/null").unwrap();
        let flags = if read { libc::O_RDONLY } else { libc::O_WRONLY };
        let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(Error::SpawnFailed {
                stage: SpawnStage::Dup2,
                os_err: io::Error::last_os_error(),
            });
        }
        Ok(Handle::owned(fd))
    }

    pub fn resolve_in_path(cmd: &std::ffi::OsStr) -> Option<OsString> {
        posix::resolve_in_path(cmd)
    }

    /// Bytes written by the child across the exec-fail pipe when a stage
    /// between `fork` and `execve` fails: `stage` tag followed by `errno`,
    /// both as native-endian `i32`s. A child that execs successfully never
    /// writes to this pipe; its close-on-exec flag does the reporting by
    /// omission.
    fn encode_failure(stage: SpawnStage, errno: i32) -> [u8; 8] {
        let stage_code: i32 = match stage {
            SpawnStage::Fork => 0,
            SpawnStage::Chdir => 1,
            SpawnStage::Dup2 => 2,
            SpawnStage::SetIds => 3,
            SpawnStage::Exec => 4,
        };
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&stage_code.to_ne_bytes());
        buf[4..8].copy_from_slice(&errno.to_ne_bytes());
        buf
    }

    fn decode_failure(buf: [u8; 8]) -> (SpawnStage, i32) {
        let stage_code = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let errno = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
        let stage = match stage_code {
            0 => SpawnStage::Fork,
            1 => SpawnStage::Chdir,
            2 => SpawnStage::Dup2,
            3 => SpawnStage::SetIds,
            _ => SpawnStage::Exec,
        };
        (stage, errno)
    }

    pub fn start_child(
        options: &StartOptions,
        stdin: Option<Handle>,
        stdout: Option<Handle>,
        stderr: Option<Handle>,
    ) -> Result<ChildProcess> {
        let executable = resolve_in_path(&options.executable).ok_or(Error::ExecutableNotFound)?;

        let exec_thunk = posix::prep_exec(&executable, &options.argv, options.env.as_deref())
            .map_err(|os_err| Error::SpawnFailed {
                stage: SpawnStage::Exec,
                os_err,
            })?;

        let cwd = options
            .cwd
            .as_ref()
            .map(|c| std::ffi::CString::new(c.as_encoded_bytes()).unwrap());

        let (fail_read, fail_write) =
            posix::pipe2_cloexec().map_err(|os_err| Error::PipeCreateFailed { os_err })?;

        // Topological plan for dup2: a target slot (0/1/2) that collides
        // with a *source* fd another slot still needs must be moved aside
        // first. With only three fixed targets this is simple: redirect
        // targets to a scratch fd >= 3 first if that target number is
        // itself a source elsewhere in the plan.
        let targets: [(RawFd, Option<RawFd>); 3] = [
            (0, stdin.as_ref().map(|h| h.as_raw())),
            (1, stdout.as_ref().map(|h| h.as_raw())),
            (2, stderr.as_ref().map(|h| h.as_raw())),
        ];

        // SAFETY: between `fork` returning in the child and `_exit`/`exec`,
        // only async-signal-safe calls are made.
        let pid = unsafe { posix::fork() }.map_err(|os_err| Error::SpawnFailed {
            stage: SpawnStage::Fork,
            os_err,
        })?;

        match pid {
            None => {
                // Child.
                unsafe {
                    libc::close(fail_read);
                }
                if child_setup(&targets, cwd.as_deref(), options, exec_thunk, fail_write).is_err()
                {
                    // child_setup already reported failure and never returns
                    // on success; reaching here means the write itself
                    // failed, nothing left to do but die.
                }
                posix::_exit(127);
            }
            Some(pid) => {
                // Parent.
                unsafe {
                    libc::close(fail_write);
                }
                drop(exec_thunk);

                let mut buf = [0u8; 8];
                let n = read_fully(fail_read, &mut buf);
                unsafe {
                    libc::close(fail_read);
                }

                if n == 8 {
                    let (stage, errno) = decode_failure(buf);
                    // Reap the child synchronously; it is already dead or
                    // about to be (`_exit(127)` right after the write).
                    let _ = posix::waitpid(pid, 0);
                    return Err(Error::SpawnFailed {
                        stage,
                        os_err: io::Error::from_raw_os_error(errno),
                    });
                }

                if options.new_process_group {
                    let _ = posix::setpgid(pid, pid);
                }

                Ok(ChildProcess::new_unix(pid, options.new_process_group))
            }
        }
    }

    /// Runs entirely in the forked child. Returns `Err` only if reporting a
    /// failure over the exec-fail pipe itself failed (at which point the
    /// caller just exits); every other error path writes to `fail_write`
    /// before returning.
    fn child_setup(
        targets: &[(RawFd, Option<RawFd>); 3],
        cwd: Option<&std::ffi::CStr>,
        options: &StartOptions,
        exec_thunk: impl FnOnce() -> io::Result<()>,
        fail_write: RawFd,
    ) -> io::Result<()> {
        let report = |stage: SpawnStage, err: io::Error| -> io::Result<()> {
            let buf = encode_failure(stage, err.raw_os_error().unwrap_or(0));
            write_fully(fail_write, &buf)
        };

        if posix::reset_sigpipe().is_err() {
            // Non-fatal: proceed, the child will just inherit whatever
            // SIGPIPE disposition it had.
        }

        if let Some(cwd) = cwd
            && unsafe { libc::chdir(cwd.as_ptr()) } != 0
        {
            return report(SpawnStage::Chdir, io::Error::last_os_error());
        }

        if options.new_process_group && posix::setpgid(0, 0).is_err() {
            return report(SpawnStage::SetIds, io::Error::last_os_error());
        }

        for &(target, source) in targets {
            if let Some(source) = source
                && source != target
                && posix::dup2(source, target).is_err()
            {
                return report(SpawnStage::Dup2, io::Error::last_os_error());
            }
        }

        posix::close_fds_above(2);

        match exec_thunk() {
            Ok(()) => unreachable!("exec only returns on failure"),
            Err(err) => report(SpawnStage::Exec, err),
        }
    }

    fn read_fully(fd: RawFd, buf: &mut [u8]) -> usize {
        let mut total = 0;
        while total < buf.len() {
            let n = unsafe {
                libc::read(
                    fd,
                    buf[total..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - total,
                )
            };
            match n {
                0 => break,
                n if n < 0 => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    break;
                }
                n => total += n as usize,
            }
        }
        total
    }

    fn write_fully(fd: RawFd, buf: &[u8]) -> io::Result<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = unsafe {
                libc::write(
                    fd,
                    buf[total..].as_ptr() as *const libc::c_void,
                    buf.len() - total,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            total += n as usize;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use std::io;
    use std::os::windows::io::RawHandle;

    use crate::handle::Handle;
    use crate::process::ChildProcess;
    use crate::win32;

    pub fn open_null_device(read: bool) -> Result<Handle> {
        use std::fs::OpenOptions;
        use std::os::windows::fs::OpenOptionsExt;
        use std::os::windows::io::IntoRawHandle;

        let file = OpenOptions::new()
            .read(read)
            .write(!read)
            .attributes(winapi::um::winbase::FILE_FLAG_OVERLAPPED)
            .open("NUL")
            .map_err(|os_err| Error::SpawnFailed {
                stage: SpawnStage::Dup2,
                os_err,
            })?;
        Ok(Handle::owned(file.into_raw_handle()))
    }

    pub fn resolve_in_path(cmd: &std::ffi::OsStr) -> Option<OsString> {
        win32::locate_in_path(cmd)
    }

    /// Resolves a stdio slot to the raw handle `CreateProcessW` should see:
    /// the slot's own handle if one was materialized, or else - since
    /// `Stdio::Inherit` means "inherit the parent's handle" and
    /// `STARTF_USESTDHANDLES` makes an unset `hStd*` become `NULL` rather
    /// than inherit automatically - the parent's current standard handle
    /// for `which`, fetched via `GetStdHandle`. `Ok(None)` only when the
    /// parent itself has no such standard handle (e.g. no console
    /// attached), in which case the child gets `NULL` too, matching what
    /// the parent already has.
    fn resolve_std_handle(
        slot: Option<&Handle>,
        which: win32::StandardStream,
    ) -> Option<RawHandle> {
        if let Some(h) = slot {
            return Some(h.as_raw());
        }
        unsafe { win32::get_std_handle(which) }.ok()
    }

    pub fn start_child(
        options: &StartOptions,
        stdin: Option<Handle>,
        stdout: Option<Handle>,
        stderr: Option<Handle>,
    ) -> Result<ChildProcess> {
        let executable = resolve_in_path(&options.executable).ok_or(Error::ExecutableNotFound)?;
        let cmdline = win32::assemble_cmdline(&options.argv);
        let env_block = options.env.as_deref().map(win32::build_env_block);

        let stdin_raw = resolve_std_handle(stdin.as_ref(), win32::StandardStream::Input);
        let stdout_raw = resolve_std_handle(stdout.as_ref(), win32::StandardStream::Output);
        let stderr_raw = resolve_std_handle(stderr.as_ref(), win32::StandardStream::Error);

        let inherit: Vec<RawHandle> = [stdin_raw, stdout_raw, stderr_raw]
            .into_iter()
            .flatten()
            .collect();
        for h in inherit.iter() {
            let _ = win32::set_handle_information(*h, 1 /* HANDLE_FLAG_INHERIT */, 1);
        }

        let mut creation_flags = win32::NULL_CREATION_FLAGS;
        if options.new_process_group {
            creation_flags |= win32::CREATE_NEW_PROCESS_GROUP;
        }

        let cwd_os = options.cwd.as_deref();

        let (process_handle, pid) = win32::create_process(
            Some(std::ffi::OsStr::new(&executable)),
            &cmdline,
            &env_block,
            &cwd_os,
            &inherit,
            creation_flags,
            stdin_raw,
            stdout_raw,
            stderr_raw,
        )
        .map_err(|os_err| Error::SpawnFailed {
            stage: SpawnStage::Exec,
            os_err,
        })?;

        let job = win32::create_kill_on_close_job().map_err(|os_err| Error::SpawnFailed {
            stage: SpawnStage::Exec,
            os_err,
        })?;
        if let Err(os_err) = win32::assign_process_to_job(&job, &process_handle) {
            log::warn!("failed to assign child {pid} to job object: {os_err}");
        }

        Ok(ChildProcess::new_windows(process_handle, job, pid))
    }
}
