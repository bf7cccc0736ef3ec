#[cfg(unix)]
mod unix {
  use std::{
    io::{Read, Seek, SeekFrom},
    os::unix::io::AsRawFd,
    time::{Duration, Instant},
  };

  use crate::{ErrorKind, LaunchOptions, Popen, StreamSpec};

  fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), script.into()]
  }

  fn exit_code(status: i32) -> i32 {
    assert!(
      libc::WIFEXITED(status),
      "expected a normal exit, status={status:#x}"
    );
    libc::WEXITSTATUS(status)
  }

  fn wait_readable(fd: i32) {
    let mut pfd = libc::pollfd {
      fd,
      events: libc::POLLIN,
      revents: 0,
    };
    let r = unsafe { libc::poll(&mut pfd, 1, 5_000) };
    assert!(r > 0, "stream never became readable");
  }

  /// Reads a stream to EOF, waiting out would-block gaps on non-blocking
  /// pipes.
  fn drain_stdout(p: &mut Popen) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
      let n = p.read_stdout(&mut buf).unwrap();
      if n == 0 {
        if p.last_error().is_none() {
          break;
        }
        wait_readable(p.stdout_fd().unwrap());
        continue;
      }
      out.extend_from_slice(&buf[..n]);
    }
    out
  }

  fn drain_stderr(p: &mut Popen) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
      let n = p.read_stderr(&mut buf).unwrap();
      if n == 0 {
        if p.last_error().is_none() {
          break;
        }
        wait_readable(p.stderr_fd().unwrap());
        continue;
      }
      out.extend_from_slice(&buf[..n]);
    }
    out
  }

  #[test]
  fn empty_argv_is_rejected() {
    let mut p = Popen::new();
    let argv: [&str; 0] = [];
    let err = p.start(&argv, &LaunchOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(p.pid().is_none());
  }

  #[test]
  fn inherited_streams_run_to_exit() {
    let mut p = Popen::new();
    p.start(&["true"], &LaunchOptions::default()).unwrap();
    assert!(p.stdout_fd().is_none());
    assert!(p.stdin_fd().is_none());
    let status = p.wait().unwrap();
    assert_eq!(exit_code(status), 0);
    assert!(p.pid().is_none());
  }

  #[test]
  fn missing_binary_reports_child_errno() {
    let mut p = Popen::new();
    let err = p
      .start(&["/definitely/not/a/binary"], &LaunchOptions::piped())
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LaunchFailed);
    assert_eq!(err.code(), libc::ENOENT);
    assert_eq!(p.last_errno(), libc::ENOENT);
    assert!(!p.alive());
    assert!(p.pid().is_none());
    assert!(p.stdin_fd().is_none());

    // The handle is reusable once the failed launch has been cleaned up.
    p.start(&["true"], &LaunchOptions::default()).unwrap();
    assert_eq!(exit_code(p.wait().unwrap()), 0);
  }

  #[test]
  fn cat_round_trip_preserves_bytes() {
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let mut p = Popen::new();
    let mut opts = LaunchOptions::piped();
    opts.stderr = StreamSpec::Inherit;
    p.start(&["cat"], &opts).unwrap();

    let mut sent = 0;
    while sent < payload.len() {
      sent += p.write_stdin(&payload[sent..]).unwrap();
    }
    p.close_stdin();

    let out = drain_stdout(&mut p);
    assert_eq!(out, payload);
    assert_eq!(exit_code(p.wait().unwrap()), 0);
  }

  #[test]
  fn split_streams_deliver_in_order() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::piped();
    opts.parent_nonblock = true;
    p.start(
      &sh("while read L; do echo OUT:$L; echo ERR:$L 1>&2; done"),
      &opts,
    )
    .unwrap();

    assert_eq!(p.write_stdin(b"hello\n").unwrap(), 6);
    p.close_stdin();

    assert_eq!(drain_stdout(&mut p), b"OUT:hello\n");
    assert_eq!(drain_stderr(&mut p), b"ERR:hello\n");
    assert_eq!(exit_code(p.wait().unwrap()), 0);
  }

  #[test]
  fn use_fd_redirects_stdout_to_file() {
    let mut file = tempfile::tempfile().unwrap();
    let mut p = Popen::new();
    let mut opts = LaunchOptions::default();
    opts.stdout = StreamSpec::UseFd(file.as_raw_fd());
    p.start(&["echo", "hello"], &opts).unwrap();
    assert_eq!(exit_code(p.wait().unwrap()), 0);

    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "hello\n");
  }

  #[test]
  fn nonblocking_read_reports_would_block() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::piped();
    opts.stderr = StreamSpec::Inherit;
    opts.parent_nonblock = true;
    p.start(&["cat"], &opts).unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(p.read_stdout(&mut buf).unwrap(), 0);
    assert_eq!(p.last_error().unwrap().kind(), ErrorKind::WouldBlock);

    p.close_stdin();
    assert!(drain_stdout(&mut p).is_empty());
    assert_eq!(exit_code(p.wait().unwrap()), 0);
  }

  #[test]
  fn slow_reader_fills_the_pipe() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::piped();
    opts.stdout = StreamSpec::Inherit;
    opts.stderr = StreamSpec::Inherit;
    opts.parent_nonblock = true;
    p.start(&sh("sleep 1; exec cat >/dev/null"), &opts).unwrap();

    let chunk = [b'x'; 8192];
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_would_block = false;
    while Instant::now() < deadline {
      match p.write_stdin(&chunk) {
        Ok(_) => {}
        Err(e) => {
          assert_eq!(e.kind(), ErrorKind::WouldBlock);
          saw_would_block = true;
          break;
        }
      }
    }
    assert!(saw_would_block, "the pipe never filled");

    // Once the child starts draining, writes go through again.
    let mut accepted_again = false;
    for _ in 0..100 {
      match p.write_stdin(b"y") {
        Ok(n) if n > 0 => {
          accepted_again = true;
          break;
        }
        Ok(_) => break, // broken pipe: the child exited early
        Err(_) => std::thread::sleep(Duration::from_millis(50)),
      }
    }
    assert!(accepted_again, "writes never resumed after the drain");

    p.close_stdin();
    assert_eq!(exit_code(p.wait().unwrap()), 0);
  }

  #[test]
  fn close_stdin_is_idempotent() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::piped();
    opts.stderr = StreamSpec::Inherit;
    p.start(&["cat"], &opts).unwrap();

    p.close_stdin();
    p.close_stdin();
    let err = p.write_stdin(b"late").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAvailable);
    assert_eq!(p.last_error().unwrap().kind(), ErrorKind::NotAvailable);

    assert!(drain_stdout(&mut p).is_empty());
    assert_eq!(exit_code(p.wait().unwrap()), 0);
  }

  #[test]
  fn env_kv_is_applied_in_the_child() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::default();
    opts.stdout = StreamSpec::Pipe;
    opts.env_kv = vec!["POPEN3_TEST_VAR=hello world".into()];
    p.start(&sh("echo \"$POPEN3_TEST_VAR\""), &opts).unwrap();
    assert_eq!(drain_stdout(&mut p), b"hello world\n");
    assert_eq!(exit_code(p.wait().unwrap()), 0);
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn clear_env_wipes_the_inherited_environment() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::default();
    opts.stdout = StreamSpec::Pipe;
    opts.clear_env = true;
    opts.env_kv = vec!["POPEN3_KEPT=42".into()];
    p.start(&sh("echo \"$POPEN3_KEPT:$HOME\""), &opts).unwrap();
    assert_eq!(drain_stdout(&mut p), b"42:\n");
    assert_eq!(exit_code(p.wait().unwrap()), 0);
  }

  #[test]
  fn chdir_changes_the_child_working_directory() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::default();
    opts.stdout = StreamSpec::Pipe;
    opts.chdir_to = Some("/".into());
    p.start(&sh("pwd"), &opts).unwrap();
    assert_eq!(drain_stdout(&mut p), b"/\n");
    assert_eq!(exit_code(p.wait().unwrap()), 0);
  }

  #[test]
  fn chdir_failure_surfaces_as_launch_error() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::default();
    opts.chdir_to = Some("/definitely/not/a/directory".into());
    let err = p.start(&["true"], &opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LaunchFailed);
    assert_eq!(err.code(), libc::ENOENT);
    assert!(p.pid().is_none());
  }

  #[test]
  fn setpgid_makes_the_child_a_group_leader() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::default();
    opts.setpgid = Some(0);
    p.start(&["sleep", "5"], &opts).unwrap();

    let pid = p.pid().unwrap() as i32;
    assert_eq!(unsafe { libc::getpgid(pid) }, pid);

    p.kill(libc::SIGKILL).unwrap();
    let status = p.wait().unwrap();
    assert!(libc::WIFSIGNALED(status));
  }

  #[test]
  fn kill_signal_is_reported_by_wait() {
    let mut p = Popen::new();
    p.start(&["sleep", "30"], &LaunchOptions::default()).unwrap();
    p.kill(libc::SIGTERM).unwrap();
    let status = p.wait().unwrap();
    assert!(libc::WIFSIGNALED(status));
    assert_eq!(libc::WTERMSIG(status), libc::SIGTERM);
  }

  #[test]
  fn liveness_and_try_wait_agree() {
    let mut p = Popen::new();
    p.start(&["sleep", "1"], &LaunchOptions::default()).unwrap();
    assert!(p.alive());
    assert_eq!(p.try_wait().unwrap(), None);

    let status = p.wait().unwrap();
    assert_eq!(exit_code(status), 0);
    assert!(!p.alive());
    let err = p.try_wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAvailable);
  }

  #[test]
  fn second_start_while_running_is_rejected() {
    let mut p = Popen::new();
    p.start(&["sleep", "5"], &LaunchOptions::default()).unwrap();
    let err = p.start(&["true"], &LaunchOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    p.kill(libc::SIGKILL).unwrap();
    p.wait().unwrap();
  }

  #[test]
  fn dropping_a_handle_never_blocks() {
    let mut p = Popen::new();
    p.start(&["sleep", "30"], &LaunchOptions::default()).unwrap();
    p.kill(libc::SIGKILL).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    drop(p);
    assert!(started.elapsed() < Duration::from_secs(1));
  }

  #[test]
  fn env_kv_splits_at_the_first_equals() {
    use crate::unix::parse_env_kv;

    assert_eq!(parse_env_kv("K=V"), Some(("K", "V")));
    assert_eq!(parse_env_kv("K="), Some(("K", "")));
    assert_eq!(parse_env_kv("K"), Some(("K", "")));
    assert_eq!(parse_env_kv("K=a=b"), Some(("K", "a=b")));
    assert_eq!(parse_env_kv("=orphan"), None);
    assert_eq!(parse_env_kv(""), None);
  }
}

#[cfg(windows)]
mod windows {
  use std::time::{Duration, Instant};

  use windows_sys::Win32::System::Threading::{WaitForMultipleObjects, WaitForSingleObject};

  use crate::{ErrorKind, LaunchOptions, Popen};

  fn cmd(line: &str) -> Vec<String> {
    vec!["cmd".into(), "/C".into(), line.into()]
  }

  fn overlapped_piped() -> LaunchOptions {
    let mut opts = LaunchOptions::piped();
    opts.overlapped_io = true;
    opts
  }

  /// Reads a stream to EOF, sleeping on the completion event through the
  /// would-block gaps.
  fn drain_stdout(p: &mut Popen) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
      let n = p.read_stdout(&mut buf).unwrap();
      if n == 0 {
        if p.last_error().is_none() {
          break;
        }
        match p.stdout_event() {
          Some(event) => unsafe {
            WaitForSingleObject(event, 5_000);
          },
          None => std::thread::sleep(Duration::from_millis(20)),
        }
        continue;
      }
      out.extend_from_slice(&buf[..n]);
    }
    out
  }

  #[test]
  fn empty_argv_is_rejected() {
    let mut p = Popen::new();
    let argv: [&str; 0] = [];
    let err = p.start(&argv, &LaunchOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
  }

  #[test]
  fn missing_binary_reports_file_not_found() {
    use windows_sys::Win32::Foundation::ERROR_FILE_NOT_FOUND;

    let mut p = Popen::new();
    let err = p
      .start(&["definitely-not-a-binary-popen3.exe"], &LaunchOptions::piped())
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LaunchFailed);
    assert_eq!(err.code(), ERROR_FILE_NOT_FOUND as i32);
    assert!(!p.alive());
    assert!(p.pid().is_none());
  }

  #[test]
  fn overlapped_round_trip_preserves_bytes() {
    let mut p = Popen::new();
    p.start(&cmd("findstr .*"), &overlapped_piped()).unwrap();

    assert_eq!(p.write_stdin(b"hello\r\n").unwrap(), 7);
    p.close_stdin();

    let out = drain_stdout(&mut p);
    assert!(
      out.windows(5).any(|w| w == b"hello"),
      "stdout did not echo the payload: {out:?}"
    );
    p.wait().unwrap();
  }

  #[test]
  fn second_async_write_is_rejected_while_pending() {
    // The child never reads stdin, so a large submission stays in flight.
    let mut p = Popen::new();
    let mut opts = overlapped_piped();
    opts.stdout = crate::StreamSpec::Inherit;
    opts.stderr = crate::StreamSpec::Inherit;
    p.start(&cmd("ping -n 3 127.0.0.1 > NUL"), &opts).unwrap();

    let payload = vec![b'x'; 1 << 20];
    p.write_stdin_async(&payload).unwrap();
    if p.stdin_write_pending() {
      let err = p.write_stdin_async(b"more").unwrap_err();
      assert_eq!(err.kind(), ErrorKind::WouldBlock);
      assert_eq!(p.try_finalize_stdin_write().unwrap(), None);
    }

    p.terminate().unwrap();
    p.wait().unwrap();
  }

  #[test]
  fn peek_based_nonblocking_read_reports_would_block() {
    let mut p = Popen::new();
    let mut opts = LaunchOptions::piped();
    opts.parent_nonblock = true;
    p.start(&cmd("ping -n 2 127.0.0.1 > NUL & echo done"), &opts)
      .unwrap();
    p.close_stdin();

    let mut buf = [0u8; 64];
    let n = p.read_stdout(&mut buf).unwrap();
    if n == 0 {
      assert_eq!(p.last_error().unwrap().kind(), ErrorKind::WouldBlock);
    }

    let out = drain_stdout(&mut p);
    assert!(out.windows(4).any(|w| w == b"done"));
    p.wait().unwrap();
  }

  #[test]
  fn two_children_compose_under_one_wait() {
    let mut first = Popen::new();
    let mut second = Popen::new();
    first.start(&cmd("echo one"), &overlapped_piped()).unwrap();
    second.start(&cmd("echo two"), &overlapped_piped()).unwrap();
    first.close_stdin();
    second.close_stdin();

    // One wait over both children's wait sets wakes for whichever has
    // progress; the per-stream state machines keep the outputs separate.
    let handles: Vec<_> = first
      .collect_wait_handles(false)
      .into_iter()
      .chain(second.collect_wait_handles(false))
      .collect();
    assert_eq!(handles.len(), 6);
    let woke = unsafe {
      WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), 0, 5_000)
    };
    assert_ne!(woke, windows_sys::Win32::Foundation::WAIT_TIMEOUT);

    assert_eq!(drain_stdout(&mut first), b"one\r\n");
    assert_eq!(drain_stdout(&mut second), b"two\r\n");
    assert_eq!(first.wait().unwrap(), 0);
    assert_eq!(second.wait().unwrap(), 0);
  }

  #[test]
  fn terminate_twice_is_tolerated() {
    let mut p = Popen::new();
    p.start(&cmd("ping -n 10 127.0.0.1 > NUL"), &LaunchOptions::default())
      .unwrap();
    assert!(p.alive());
    p.terminate().unwrap();
    p.wait().unwrap();
    p.terminate().unwrap();
  }

  #[test]
  fn dropping_a_handle_never_blocks() {
    let mut p = Popen::new();
    p.start(&cmd("ping -n 10 127.0.0.1 > NUL"), &overlapped_piped())
      .unwrap();

    let started = Instant::now();
    drop(p);
    assert!(started.elapsed() < Duration::from_secs(1));
  }
}
