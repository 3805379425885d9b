#![allow(non_snake_case, non_camel_case_types)]
//! Low-level Windows primitives: overlapped-I/O pipes, process creation via
//! `CreateProcessW` with an explicit inheritable-handle list, job objects
//! for tying a child's whole descendant tree to its parent's lifetime, and
//! the wait/terminate primitives used by [`crate::process`].

use std::cell::UnsafeCell;
use std::ffi::OsStr;
use std::io::{Error, Result};
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::RawHandle;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use winapi::shared::{
    minwindef::{BOOL, DWORD, FALSE, LPVOID, TRUE},
    winerror::{
        ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, ERROR_IO_PENDING, ERROR_NOT_FOUND, WAIT_TIMEOUT,
    },
};
use winapi::um::fileapi::CreateFileW;
use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::ioapiset::GetOverlappedResult;
use winapi::um::jobapi2::{AssignProcessToJobObject, CreateJobObjectW, SetInformationJobObject};
use winapi::um::minwinbase::{LPSECURITY_ATTRIBUTES, OVERLAPPED, SECURITY_ATTRIBUTES};
use winapi::um::namedpipeapi::CreateNamedPipeW;
use winapi::um::processthreadsapi::{CreateProcessW, PROCESS_INFORMATION, STARTUPINFOW};
use winapi::um::synchapi::CreateEventW;
use winapi::um::winbase::{
    CREATE_UNICODE_ENVIRONMENT, FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED,
    PIPE_ACCESS_OUTBOUND, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
};
use winapi::um::winbase::{INFINITE, WAIT_ABANDONED, WAIT_ABANDONED_0, WAIT_FAILED, WAIT_OBJECT_0};
use winapi::um::winnt::{
    GENERIC_READ, JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOBOBJECT_BASIC_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use winapi::um::{fileapi, handleapi, processenv, processthreadsapi, synchapi};

pub use winapi::shared::winerror::{ERROR_ACCESS_DENIED, ERROR_BAD_PATHNAME};
pub const STILL_ACTIVE: u32 = 259;

use crate::handle::Handle;
use crate::options::ExitStatus;

fn check(status: BOOL) -> Result<()> {
    if status != 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

fn check_handle(raw_handle: RawHandle) -> Result<RawHandle> {
    if raw_handle != INVALID_HANDLE_VALUE && !raw_handle.is_null() {
        Ok(raw_handle)
    } else {
        Err(Error::last_os_error())
    }
}

fn to_nullterm(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0u16)).collect()
}

static PIPE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_pipe_name() -> Vec<u16> {
    let pid = std::process::id();
    let counter = PIPE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!(r"\\.\pipe\proc_core_{pid}_{counter}");
    name.encode_utf16().chain(iter::once(0u16)).collect()
}

/// Create a pipe where both ends support overlapped I/O.
///
/// There is no true anonymous pipe with `FILE_FLAG_OVERLAPPED` on Windows
/// (`CreatePipe` never supports it); a uniquely named, single-instance
/// named pipe is the standard stand-in and is what every real subprocess
/// library on this platform ends up using.
pub fn create_overlapped_pipe() -> Result<(RawHandle, RawHandle)> {
    let pipe_name = unique_pipe_name();
    const BUFFER_SIZE: DWORD = 4096;

    let mut sa = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };

    let write_handle = check_handle(unsafe {
        CreateNamedPipeW(
            pipe_name.as_ptr(),
            PIPE_ACCESS_OUTBOUND | FILE_FLAG_FIRST_PIPE_INSTANCE | FILE_FLAG_OVERLAPPED,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
            1,
            BUFFER_SIZE,
            BUFFER_SIZE,
            0,
            &mut sa as LPSECURITY_ATTRIBUTES,
        )
    })?;
    let read_handle = check_handle(unsafe {
        CreateFileW(
            pipe_name.as_ptr(),
            GENERIC_READ,
            0,
            &mut sa as LPSECURITY_ATTRIBUTES,
            fileapi::OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
            ptr::null_mut(),
        )
    })?;
    Ok((read_handle, write_handle))
}

fn create_event() -> Result<Handle> {
    let raw = unsafe { CreateEventW(ptr::null_mut(), TRUE, FALSE, ptr::null()) };
    check_handle(raw)?;
    Ok(Handle::owned(raw))
}

fn reset_event(event: &Handle) -> Result<()> {
    check(unsafe { synchapi::ResetEvent(event.as_raw()) })
}

fn get_overlapped_result(handle: RawHandle, overlapped: &mut OVERLAPPED, wait: bool) -> Result<u32> {
    let mut bytes_transferred: DWORD = 0;
    let result =
        unsafe { GetOverlappedResult(handle, overlapped, &mut bytes_transferred, wait as BOOL) };
    if result != 0 {
        Ok(bytes_transferred)
    } else {
        let err = Error::last_os_error();
        let code = err.raw_os_error();
        if code == Some(ERROR_BROKEN_PIPE as i32) || code == Some(ERROR_HANDLE_EOF as i32) {
            Ok(0)
        } else {
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingState {
    Pending,
    Completed(u32),
}

/// A pending overlapped read, used by [`crate::communicate`] to drain a
/// stdout/stderr pipe without blocking.
pub struct PendingRead {
    handle: RawHandle,
    overlapped: Box<OVERLAPPED>,
    event: Handle,
    buffer: UnsafeCell<Box<[u8]>>,
    state: PendingState,
}

unsafe impl Send for PendingRead {}

impl std::fmt::Debug for PendingRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRead")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PendingRead {
    pub fn is_ready(&self) -> bool {
        matches!(self.state, PendingState::Completed(_))
    }

    pub fn event(&self) -> &Handle {
        &self.event
    }

    pub fn complete(&mut self) -> Result<u32> {
        match self.state {
            PendingState::Completed(n) => Ok(n),
            PendingState::Pending => {
                let n = get_overlapped_result(self.handle, &mut self.overlapped, false)?;
                self.state = PendingState::Completed(n);
                Ok(n)
            }
        }
    }

    /// Data from a completed read. Panics if called before `complete()`.
    pub fn data(&self) -> &[u8] {
        match self.state {
            PendingState::Completed(n) => {
                // SAFETY: the OS only writes to this buffer until the
                // operation completes, which `self.state` tracks.
                let buffer = unsafe { &*self.buffer.get() };
                &buffer[..n as usize]
            }
            PendingState::Pending => panic!("called data() on pending read"),
        }
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        if !self.is_ready() {
            let _ = cancel_io_ex(self.handle, &mut self.overlapped);
            let _ = get_overlapped_result(self.handle, &mut self.overlapped, true);
        }
    }
}

/// Starts an overlapped read of up to `buffer_size` bytes.
pub fn read_file_overlapped(handle: RawHandle, buffer_size: usize) -> Result<PendingRead> {
    let event = create_event()?;
    let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { mem::zeroed() });
    overlapped.hEvent = event.as_raw();

    let buffer: Box<[u8]> = vec![0u8; buffer_size].into_boxed_slice();
    let mut pending = PendingRead {
        handle,
        overlapped,
        event,
        buffer: UnsafeCell::new(buffer),
        state: PendingState::Pending,
    };

    reset_event(&pending.event)?;
    let mut bytes_read: DWORD = 0;
    let result = unsafe {
        let buffer = &mut *pending.buffer.get();
        fileapi::ReadFile(
            handle,
            buffer.as_mut_ptr() as LPVOID,
            buffer.len() as DWORD,
            &mut bytes_read,
            pending.overlapped.as_mut() as _,
        )
    };
    if result != 0 {
        pending.state = PendingState::Completed(bytes_read);
    } else {
        let err = Error::last_os_error();
        let code = err.raw_os_error();
        if code == Some(ERROR_IO_PENDING as i32) {
            // left Pending
        } else if code == Some(ERROR_BROKEN_PIPE as i32) || code == Some(ERROR_HANDLE_EOF as i32) {
            pending.state = PendingState::Completed(0);
        } else {
            return Err(err);
        }
    }
    Ok(pending)
}

pub enum WaitResult {
    Object(usize),
    Timeout,
}

/// Waits on the child's process handle plus one event per still-pending
/// read, returning the index of whichever becomes signaled first.
pub fn wait_for_multiple_objects(
    handles: &[RawHandle],
    timeout: Option<Duration>,
) -> Result<WaitResult> {
    assert!(
        handles.len() <= 64,
        "WaitForMultipleObjects: max 64 handles"
    );

    let mut remaining_timeout = timeout;
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let (timeout_ms, overflow) = remaining_timeout
            .map(|timeout| {
                let timeout = timeout.as_millis();
                if timeout < INFINITE as u128 {
                    (timeout as u32, false)
                } else {
                    (INFINITE - 1, true)
                }
            })
            .unwrap_or((INFINITE, false));

        let result = unsafe {
            synchapi::WaitForMultipleObjects(
                handles.len() as DWORD,
                handles.as_ptr(),
                FALSE,
                timeout_ms,
            )
        };

        if result < WAIT_OBJECT_0 + handles.len() as u32 {
            return Ok(WaitResult::Object((result - WAIT_OBJECT_0) as usize));
        } else if result >= WAIT_ABANDONED_0 && result < WAIT_ABANDONED_0 + handles.len() as u32 {
            return Ok(WaitResult::Object((result - WAIT_ABANDONED_0) as usize));
        } else if result == WAIT_TIMEOUT {
            if !overflow {
                return Ok(WaitResult::Timeout);
            }
            let deadline = deadline.unwrap();
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitResult::Timeout);
            }
            remaining_timeout = Some(deadline - now);
            continue;
        } else if result == WAIT_FAILED {
            return Err(Error::last_os_error());
        } else {
            panic!("WaitForMultipleObjects returned unexpected value {result}");
        }
    }
}

pub fn set_handle_information(handle: RawHandle, mask: u32, flags: u32) -> Result<()> {
    check(unsafe { handleapi::SetHandleInformation(handle, mask, flags) })
}

/// Creates a job object with `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE` set, so
/// that closing the job's handle (which [`crate::process::ChildProcess`]
/// does on drop) terminates every process ever assigned to it - including
/// grandchildren the immediate child spawned, mirroring the process-group
/// semantics `setpgid`+`killpg` give on Unix.
pub fn create_kill_on_close_job() -> Result<Handle> {
    let raw = unsafe { CreateJobObjectW(ptr::null_mut(), ptr::null()) };
    check_handle(raw)?;
    let job = Handle::owned(raw);

    let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
    info.BasicLimitInformation = JOBOBJECT_BASIC_LIMIT_INFORMATION {
        LimitFlags: JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
        ..unsafe { mem::zeroed() }
    };
    check(unsafe {
        SetInformationJobObject(
            job.as_raw(),
            winapi::um::winnt::JobObjectExtendedLimitInformation,
            &mut info as *mut _ as LPVOID,
            mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
        )
    })?;
    Ok(job)
}

pub fn assign_process_to_job(job: &Handle, process: &Handle) -> Result<()> {
    check(unsafe { AssignProcessToJobObject(job.as_raw(), process.as_raw()) })
}

/// Builds a Win32 command line the way `CommandLineToArgvW` expects to
/// parse it back: each argument quoted only if needed, with the
/// backslash-doubling rule applied before a quote (literal or the closing
/// one).
pub fn assemble_cmdline(argv: &[std::ffi::OsString]) -> std::ffi::OsString {
    let mut cmdline = std::ffi::OsString::new();
    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            cmdline.push(" ");
        }
        append_quoted(&mut cmdline, arg);
    }
    cmdline
}

fn append_quoted(cmdline: &mut std::ffi::OsString, arg: &OsStr) {
    use std::os::windows::ffi::OsStrExt as _;

    let arg_bytes: Vec<u16> = arg.encode_wide().collect();
    let needs_quotes = arg_bytes.is_empty()
        || arg_bytes
            .iter()
            .any(|&c| c == b' ' as u16 || c == b'\t' as u16 || c == b'"' as u16);
    if !needs_quotes {
        cmdline.push(arg);
        return;
    }

    cmdline.push("\"");
    let mut backslashes = 0usize;
    for &c in &arg_bytes {
        if c == b'\\' as u16 {
            backslashes += 1;
            continue;
        }
        if c == b'"' as u16 {
            for _ in 0..backslashes * 2 + 1 {
                cmdline.push("\\");
            }
            backslashes = 0;
            cmdline.push("\"");
            continue;
        }
        for _ in 0..backslashes {
            cmdline.push("\\");
        }
        backslashes = 0;
        let ch = char::from_u32(c as u32).unwrap_or('?');
        let mut buf = [0u8; 4];
        cmdline.push(ch.encode_utf8(&mut buf));
    }
    for _ in 0..backslashes * 2 {
        cmdline.push("\\");
    }
    cmdline.push("\"");
}

/// Builds a `\0`-separated, doubly-`\0`-terminated environment block in the
/// format `CreateProcessW` requires when `CREATE_UNICODE_ENVIRONMENT` is set.
pub fn build_env_block(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> Vec<u16> {
    let mut block = Vec::new();
    for (key, value) in env {
        block.extend(key.encode_wide());
        block.push('=' as u16);
        block.extend(value.encode_wide());
        block.push(0);
    }
    block.push(0);
    block
}

pub fn locate_in_path(cmd: &OsStr) -> Option<std::ffi::OsString> {
    let cmd_str = cmd.to_str()?;
    if cmd_str.contains('\\') || cmd_str.contains('/') {
        return if std::path::Path::new(cmd).exists() {
            Some(cmd.to_owned())
        } else {
            None
        };
    }
    let path_var = std::env::var_os("PATH")?;
    let has_ext = std::path::Path::new(cmd_str).extension().is_some();
    let exts: &[&str] = if has_ext { &[""] } else { &[".exe", ".cmd", ".bat"] };
    for dir in std::env::split_paths(&path_var) {
        for ext in exts {
            let candidate = dir.join(format!("{cmd_str}{ext}"));
            if candidate.is_file() {
                return Some(candidate.into_os_string());
            }
        }
    }
    None
}

/// Spawns a process with an explicit inheritable-handle list via
/// `PROC_THREAD_ATTRIBUTE_LIST`, so that only the three stdio handles
/// (never any other inheritable handle open in this process) are visible
/// to the child even though `bInheritHandles` must be `TRUE`.
#[allow(clippy::too_many_arguments)]
pub fn create_process(
    appname: Option<&OsStr>,
    cmdline: &OsStr,
    env_block: &Option<Vec<u16>>,
    cwd: &Option<&OsStr>,
    inherit: &[RawHandle],
    mut creation_flags: u32,
    stdin: Option<RawHandle>,
    stdout: Option<RawHandle>,
    stderr: Option<RawHandle>,
) -> Result<(Handle, u32)> {
    let mut attr_list = AttrList::new(1)?;
    attr_list.update_handle_list(inherit)?;

    let mut sinfo_ex: winapi::um::processthreadsapi::STARTUPINFOEXW = unsafe { mem::zeroed() };
    sinfo_ex.StartupInfo.cb = mem::size_of_val(&sinfo_ex) as DWORD;
    sinfo_ex.StartupInfo.dwFlags = winapi::um::winbase::STARTF_USESTDHANDLES;
    sinfo_ex.StartupInfo.hStdInput = stdin.unwrap_or(ptr::null_mut());
    sinfo_ex.StartupInfo.hStdOutput = stdout.unwrap_or(ptr::null_mut());
    sinfo_ex.StartupInfo.hStdError = stderr.unwrap_or(ptr::null_mut());
    sinfo_ex.lpAttributeList = attr_list.as_mut_ptr();

    let mut pinfo: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    let mut cmdline = to_nullterm(cmdline);
    let wc_appname = appname.map(to_nullterm);
    let env_block_ptr = env_block.as_ref().map(|v| v.as_ptr()).unwrap_or(ptr::null()) as LPVOID;
    let cwd = cwd.map(to_nullterm);
    creation_flags |= CREATE_UNICODE_ENVIRONMENT | winapi::um::winbase::EXTENDED_STARTUPINFO_PRESENT;

    check(unsafe {
        CreateProcessW(
            wc_appname.as_ref().map(|v| v.as_ptr()).unwrap_or(ptr::null()),
            cmdline.as_mut_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            TRUE,
            creation_flags,
            env_block_ptr,
            cwd.as_ref().map(|v| v.as_ptr()).unwrap_or(ptr::null()),
            &mut sinfo_ex.StartupInfo,
            &mut pinfo,
        )
    })?;
    unsafe {
        handleapi::CloseHandle(pinfo.hThread);
        Ok((Handle::owned(pinfo.hProcess), pinfo.dwProcessId))
    }
}

/// Fixed-size-aligned storage for `PROC_THREAD_ATTRIBUTE_LIST`, plus the
/// handle list it points at, bundled so both are dropped together.
struct AttrList {
    buf: Vec<u8>,
    handles: Vec<RawHandle>,
}

impl AttrList {
    fn new(attribute_count: u32) -> Result<AttrList> {
        let mut size: winapi::shared::basetsd::SIZE_T = 0;
        unsafe {
            winapi::um::processthreadsapi::InitializeProcThreadAttributeList(
                ptr::null_mut(),
                attribute_count,
                0,
                &mut size,
            );
        }
        let mut buf = vec![0u8; size];
        check(unsafe {
            winapi::um::processthreadsapi::InitializeProcThreadAttributeList(
                buf.as_mut_ptr() as _,
                attribute_count,
                0,
                &mut size,
            )
        })?;
        Ok(AttrList {
            buf,
            handles: Vec::new(),
        })
    }

    fn as_mut_ptr(&mut self) -> winapi::um::processthreadsapi::LPPROC_THREAD_ATTRIBUTE_LIST {
        self.buf.as_mut_ptr() as _
    }

    fn update_handle_list(&mut self, inherit: &[RawHandle]) -> Result<()> {
        self.handles = inherit.to_vec();
        const PROC_THREAD_ATTRIBUTE_HANDLE_LIST: usize = 0x00020002;
        check(unsafe {
            winapi::um::processthreadsapi::UpdateProcThreadAttribute(
                self.as_mut_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_HANDLE_LIST,
                self.handles.as_mut_ptr() as LPVOID,
                self.handles.len() * mem::size_of::<RawHandle>(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        })
    }
}

impl Drop for AttrList {
    fn drop(&mut self) {
        unsafe {
            winapi::um::processthreadsapi::DeleteProcThreadAttributeList(self.as_mut_ptr());
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
pub enum WaitEvent {
    OBJECT_0,
    ABANDONED,
    TIMEOUT,
}

pub fn wait_for_single_object(handle: &Handle, mut timeout: Option<Duration>) -> Result<WaitEvent> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    let result = loop {
        let (timeout_ms, overflow) = timeout
            .map(|timeout| {
                let timeout = timeout.as_millis();
                if timeout < INFINITE as u128 {
                    (timeout as u32, false)
                } else {
                    (INFINITE - 1, true)
                }
            })
            .unwrap_or((INFINITE, false));

        let result = unsafe { synchapi::WaitForSingleObject(handle.as_raw(), timeout_ms) };
        if result != WAIT_TIMEOUT || !overflow {
            break result;
        }
        let deadline = deadline.unwrap();
        let now = Instant::now();
        if now >= deadline {
            break WAIT_TIMEOUT;
        }
        timeout = Some(deadline - now);
    };

    if result == WAIT_OBJECT_0 {
        Ok(WaitEvent::OBJECT_0)
    } else if result == WAIT_ABANDONED {
        Ok(WaitEvent::ABANDONED)
    } else if result == WAIT_TIMEOUT {
        Ok(WaitEvent::TIMEOUT)
    } else if result == WAIT_FAILED {
        Err(Error::last_os_error())
    } else {
        panic!("WaitForSingleObject returned {result}");
    }
}

pub fn get_exit_code_process(handle: &Handle) -> Result<ExitStatus> {
    let mut exit_code = 0u32;
    check(unsafe {
        processthreadsapi::GetExitCodeProcess(handle.as_raw(), &mut exit_code as *mut u32)
    })?;
    Ok(ExitStatus::Exited(exit_code as i32))
}

pub fn is_still_active(handle: &Handle) -> Result<bool> {
    let mut exit_code = 0u32;
    check(unsafe {
        processthreadsapi::GetExitCodeProcess(handle.as_raw(), &mut exit_code as *mut u32)
    })?;
    Ok(exit_code == STILL_ACTIVE)
}

pub fn terminate_process(handle: &Handle, exit_code: u32) -> Result<()> {
    check(unsafe { processthreadsapi::TerminateProcess(handle.as_raw(), exit_code) })
}

pub unsafe fn get_std_handle(which: StandardStream) -> Result<RawHandle> {
    use winapi::um::winbase::{STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE};
    let id = match which {
        StandardStream::Input => STD_INPUT_HANDLE,
        StandardStream::Output => STD_OUTPUT_HANDLE,
        StandardStream::Error => STD_ERROR_HANDLE,
    };
    check_handle(unsafe { processenv::GetStdHandle(id) })
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StandardStream {
    Input,
    Output,
    Error,
}

pub const CREATE_NEW_PROCESS_GROUP: u32 = winapi::um::winbase::CREATE_NEW_PROCESS_GROUP;
pub const NULL_CREATION_FLAGS: u32 = 0;

fn cancel_io_ex(handle: RawHandle, overlapped: &mut OVERLAPPED) -> Result<()> {
    let result = unsafe { winapi::um::ioapiset::CancelIoEx(handle, overlapped as _) };
    if result != 0 {
        Ok(())
    } else {
        let err = Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_NOT_FOUND as i32) {
            Ok(())
        } else {
            Err(err)
        }
    }
}
