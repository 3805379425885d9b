//! Integration tests covering the crate's testable properties end to end:
//! a real child process is spawned, drained, and waited on through the
//! public API exactly as an external caller would use it.

#![cfg(unix)]

use std::ffi::OsString;
use std::time::Duration;

use proc_core::{Stdio, WaitOutcome, start};

fn argv(words: &[&str]) -> Vec<OsString> {
    words.iter().map(OsString::from).collect()
}

/// Surfaces the crate's `log::warn!` diagnostics (e.g. the reaper thread's
/// install failures) under `RUST_LOG=debug cargo test -- --nocapture`.
/// Idempotent, so every test can call it regardless of run order.
fn init_logging() {
    let _ = env_logger::try_init();
}

fn start_piped(words: &[&str]) -> (proc_core::ChildProcess, proc_core::ChildStreams) {
    init_logging();

    let options = proc_core::StartOptions {
        stdout: Stdio::Pipe,
        stderr: Stdio::Pipe,
        ..proc_core::StartOptions::new(argv(words))
    };
    start(options).unwrap()
}

#[test]
fn echo_hello_matches_exactly() {
    let (process, streams) = start_piped(&["echo", "hello"]);
    let outcome = proc_core::drain_out_and_err(
        &process,
        streams.stdout,
        streams.stderr,
        Some(Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(outcome.stdout, b"hello\n");
    assert_eq!(outcome.stderr, b"");
    let exit = process
        .wait_for_exit(Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(
        exit,
        WaitOutcome::Exited(proc_core::ExitStatus::Exited(0))
    );
}

#[test]
fn large_interleaved_output_on_both_streams() {
    let script = "tr '\\0' 'A' < /dev/zero | head -c 200000 >&1 & \
                  tr '\\0' 'E' < /dev/zero | head -c 200000 >&2 & wait";
    let (process, streams) = start_piped(&["sh", "-c", script]);
    let outcome = proc_core::drain_out_and_err(
        &process,
        streams.stdout,
        streams.stderr,
        Some(Duration::from_secs(30)),
    )
    .unwrap();
    assert_eq!(outcome.stdout.len(), 200000);
    assert!(outcome.stdout.iter().all(|&b| b == b'A'));
    assert_eq!(outcome.stderr.len(), 200000);
    assert!(outcome.stderr.iter().all(|&b| b == b'E'));
}

#[test]
fn timeout_then_kill_then_wait_observes_termination() {
    init_logging();
    let options = proc_core::StartOptions {
        stdout: Stdio::Null,
        stderr: Stdio::Null,
        ..proc_core::StartOptions::new(argv(&["sleep", "60"]))
    };
    let (process, _streams) = start(options).unwrap();

    let outcome = process
        .wait_for_exit(Some(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Timeout);

    process.kill(false).unwrap();

    let outcome = process
        .wait_for_exit(Some(Duration::from_secs(5)))
        .unwrap();
    match outcome {
        WaitOutcome::Exited(status) => assert!(!status.success()),
        WaitOutcome::Timeout => panic!("process did not die after SIGKILL"),
    }
}

#[test]
fn nonexistent_executable_fails_cleanly() {
    init_logging();
    let options = proc_core::StartOptions::new(argv(&["/no/such/bin"]));
    let err = start(options).unwrap_err();
    match err {
        proc_core::Error::ExecutableNotFound => {}
        proc_core::Error::SpawnFailed { os_err, .. } => {
            assert_eq!(os_err.raw_os_error(), Some(libc::ENOENT));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn quick_exit_after_write_is_not_lost() {
    // Races the poll loop's first iteration against the child's exit -
    // the drain must still observe the 5 bytes written just before exit.
    let (process, streams) = start_piped(&["sh", "-c", "printf done"]);
    let outcome = proc_core::drain_out_and_err(
        &process,
        streams.stdout,
        streams.stderr,
        Some(Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(outcome.stdout, b"done");
}

#[test]
fn killing_process_group_leader_also_kills_orphaned_child() {
    init_logging();
    let options = proc_core::StartOptions {
        stdout: Stdio::Pipe,
        stderr: Stdio::Null,
        new_process_group: true,
        ..proc_core::StartOptions::new(argv(&[
            "sh",
            "-c",
            "sleep 60 & echo $!; wait",
        ]))
    };
    let (process, streams) = start(options).unwrap();

    // Read the grandchild's pid before killing the group; `sh` prints it
    // and then blocks in `wait`, so this line is available well before
    // either process exits on its own.
    let stdout = streams.stdout.unwrap();
    let mut buf = [0u8; 64];
    let n = unsafe {
        libc::read(
            stdout.as_raw(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    assert!(n > 0);
    let grandchild_pid: libc::pid_t = std::str::from_utf8(&buf[..n as usize])
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    process.kill(false).unwrap();
    let _ = process.wait_for_exit(Some(Duration::from_secs(5)));

    // Give the kernel a moment to reap the grandchild too, then confirm it
    // no longer exists - if `kill` only targeted the leader's pid, `sleep`
    // would still be alive here as an orphan.
    std::thread::sleep(Duration::from_millis(200));
    let rc = unsafe { libc::kill(grandchild_pid, 0) };
    assert_eq!(rc, -1);
    assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::ESRCH));
}

#[test]
fn socketpair_used_as_both_stdin_and_stdout() {
    init_logging();
    use proc_core::Handle;
    use std::os::unix::io::FromRawFd;

    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let (ours, theirs) = (fds[0], fds[1]);

    let options = proc_core::StartOptions {
        stdin: Stdio::Borrowed(Handle::borrowed(theirs)),
        stdout: Stdio::Borrowed(Handle::borrowed(theirs)),
        stderr: Stdio::Null,
        ..proc_core::StartOptions::new(argv(&["cat"]))
    };
    let (process, _streams) = start(options).unwrap();
    unsafe {
        libc::close(theirs);
    }

    let mut our_sock = unsafe { std::fs::File::from_raw_fd(ours) };
    use std::io::{Read, Write};
    our_sock.write_all(b"Hello World\n").unwrap();
    // `cat` only echoes what it reads once its stdin reaches EOF on this
    // socket; shutting down the write half (not closing the fd) lets us
    // still read the echoed bytes back over the same full-duplex socket.
    unsafe {
        libc::shutdown(ours, libc::SHUT_WR);
    }
    let mut got = Vec::new();
    our_sock.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"Hello World\n");

    let _ = process.wait_for_exit(Some(Duration::from_secs(5)));
}
