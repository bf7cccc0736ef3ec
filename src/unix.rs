//! The POSIX engine: fork/exec launch with a close-on-exec status pipe,
//! descriptor-level stream I/O, and child lifecycle.

use std::{
  ffi::{CStr, CString},
  io,
  mem::size_of,
  os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use tracing::{debug, trace};

use crate::{Error, ErrorKind, LaunchOptions, Result, StreamSpec};

/// The parent-retained end of one of the child's standard streams.
#[derive(Debug)]
enum StreamEnd {
  /// The stream was inherited or redirected; the parent holds nothing.
  None,
  /// A pipe end in blocking mode.
  Blocking(OwnedFd),
  /// A pipe end with `O_NONBLOCK` set.
  Nonblocking(OwnedFd),
}

impl StreamEnd {
  fn raw(&self) -> Option<RawFd> {
    match self {
      Self::None => None,
      Self::Blocking(fd) | Self::Nonblocking(fd) => Some(fd.as_raw_fd()),
    }
  }
}

/// A handle to one spawned child process and the parent-retained ends of
/// its standard streams.
///
/// A `Popen` is single-threaded by design: drive it from one thread, or
/// serialize access yourself. Dropping it closes every retained descriptor
/// and makes one non-blocking reap attempt; it never blocks.
#[derive(Debug)]
pub struct Popen {
  pid: Option<libc::pid_t>,
  stdin: StreamEnd,
  stdout: StreamEnd,
  stderr: StreamEnd,
  /// Status word observed by a non-blocking check, held until the caller
  /// collects it through `wait`/`try_wait`.
  reaped: Option<i32>,
  last_error: Option<Error>,
}

impl Default for Popen {
  fn default() -> Self {
    Self::new()
  }
}

impl Popen {
  /// Creates an idle handle. Call [`start`](Self::start) to launch a child.
  pub fn new() -> Self {
    Self {
      pid: None,
      stdin: StreamEnd::None,
      stdout: StreamEnd::None,
      stderr: StreamEnd::None,
      reaped: None,
      last_error: None,
    }
  }

  /// Launches `argv[0]` (resolved on `PATH`) with the given stream wiring.
  ///
  /// On success the child is running and any `Pipe` streams are retained by
  /// this handle. On failure no child remains: a child that failed between
  /// `fork` and `exec` has already been reaped, every transient descriptor
  /// is closed, and the returned error carries the child-side `errno`.
  pub fn start<S: AsRef<str>>(&mut self, argv: &[S], opts: &LaunchOptions) -> Result<()> {
    self.last_error = None;
    if self.pid.is_some() || self.reaped.is_some() {
      return self.fail(Error::invalid("a child is already tracked by this handle"));
    }
    if argv.is_empty() {
      return self.fail(Error::invalid("argv is empty"));
    }
    for spec in [&opts.stdin, &opts.stdout, &opts.stderr] {
      if let StreamSpec::UseFd(fd) = spec {
        if *fd < 0 {
          return self.fail(Error::invalid("UseFd requires a valid descriptor"));
        }
      }
    }

    // Everything the child path touches is prepared before fork so the
    // child performs syscalls only.
    let cargv = match argv
      .iter()
      .map(|s| CString::new(s.as_ref()))
      .collect::<std::result::Result<Vec<_>, _>>()
    {
      Ok(v) => v,
      Err(_) => return self.fail(Error::invalid("argv contains an interior NUL byte")),
    };
    let mut argv_ptrs: Vec<*const libc::c_char> = cargv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let mut env: Vec<(CString, CString)> = Vec::with_capacity(opts.env_kv.len());
    for kv in &opts.env_kv {
      let (k, v) = match parse_env_kv(kv) {
        Some(pair) => pair,
        None => continue,
      };
      match (CString::new(k), CString::new(v)) {
        (Ok(k), Ok(v)) => env.push((k, v)),
        _ => return self.fail(Error::invalid("env_kv contains an interior NUL byte")),
      }
    }

    let chdir = match &opts.chdir_to {
      Some(dir) if !dir.as_os_str().is_empty() => {
        use std::os::unix::ffi::OsStrExt;
        match CString::new(dir.as_os_str().as_bytes()) {
          Ok(c) => Some(c),
          Err(_) => return self.fail(Error::invalid("chdir_to contains an interior NUL byte")),
        }
      }
      _ => None,
    };

    let stdin_pipe = match self.make_pipe(&opts.stdin, true, "pipe(stdin)") {
      Ok(p) => p,
      Err(e) => return self.fail(e),
    };
    let stdout_pipe = match self.make_pipe(&opts.stdout, false, "pipe(stdout)") {
      Ok(p) => p,
      Err(e) => return self.fail(e),
    };
    let stderr_pipe = match self.make_pipe(&opts.stderr, false, "pipe(stderr)") {
      Ok(p) => p,
      Err(e) => return self.fail(e),
    };

    // The launch handshake: both ends close-on-exec, so a successful exec
    // closes the write end and the parent reads EOF. A child that fails
    // before exec writes its errno instead.
    let (status_rd, status_wr) = match anon_pipe() {
      Ok(p) => p,
      Err(e) => {
        return self.fail(Error::from_os(
          ErrorKind::Io,
          e.raw_os_error().unwrap_or(0),
          "pipe(launch status)",
        ))
      }
    };

    let setup = ChildSetup {
      status_rd: status_rd.as_raw_fd(),
      status_wr: status_wr.as_raw_fd(),
      stdio: [
        child_stdio(&opts.stdin, stdin_pipe.as_ref()),
        child_stdio(&opts.stdout, stdout_pipe.as_ref()),
        child_stdio(&opts.stderr, stderr_pipe.as_ref()),
      ],
      clear_env: opts.clear_env,
      env: &env,
      chdir: chdir.as_deref(),
      setpgid: opts.setpgid,
      argv_ptrs: &argv_ptrs,
    };

    let pid = unsafe { libc::fork() };
    if pid < 0 {
      return self.fail(Error::last_os(ErrorKind::Io, "fork"));
    }
    if pid == 0 {
      // Child: only syscalls from here to exec or _exit.
      unsafe { child_after_fork(&setup) };
    }

    // Parent.
    self.pid = Some(pid);
    drop(status_wr);
    self.stdin = retain_parent_end(stdin_pipe, opts.parent_nonblock);
    self.stdout = retain_parent_end(stdout_pipe, opts.parent_nonblock);
    self.stderr = retain_parent_end(stderr_pipe, opts.parent_nonblock);

    match self.read_launch_status(status_rd.as_raw_fd()) {
      LaunchStatus::ExecSucceeded => {
        trace!(pid, "child started");
        Ok(())
      }
      LaunchStatus::ChildError(errno) => {
        debug!(pid, errno, "child failed before exec");
        self.reap_failed_launch();
        self.fail(Error::from_os(
          ErrorKind::LaunchFailed,
          errno,
          "exec failed in child",
        ))
      }
      LaunchStatus::ShortReport => {
        self.reap_failed_launch();
        self.fail(Error::new(
          ErrorKind::Unknown,
          0,
          "short read on the launch status pipe",
        ))
      }
      LaunchStatus::ReadError(code) => {
        self.reap_failed_launch();
        self.fail(Error::from_os(ErrorKind::Io, code, "read(launch status)"))
      }
    }
  }

  /// Writes to the child's stdin pipe, retrying `EINTR` and continuing
  /// through partial writes.
  ///
  /// Returns the number of bytes accepted. A non-blocking pipe with no room
  /// returns [`ErrorKind::WouldBlock`] if nothing was accepted, or the
  /// partial count if some bytes went through. `Ok(0)` means the child
  /// closed its read end; no error is recorded for that, so write loops can
  /// terminate on it cleanly.
  pub fn write_stdin(&mut self, data: &[u8]) -> Result<usize> {
    self.last_error = None;
    let fd = match self.stdin.raw() {
      Some(fd) => fd,
      None => return self.fail(Error::not_available("stdin")),
    };
    let mut written = 0;
    while written < data.len() {
      let n = unsafe {
        libc::write(
          fd,
          data[written..].as_ptr().cast(),
          data.len() - written,
        )
      };
      if n < 0 {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if code == libc::EINTR {
          continue;
        }
        if code == libc::EAGAIN || code == libc::EWOULDBLOCK {
          if written > 0 {
            return Ok(written);
          }
          return self.fail(Error::would_block("write to stdin"));
        }
        if code == libc::EPIPE {
          return Ok(written);
        }
        return self.fail(Error::from_os(ErrorKind::Io, code, "write(stdin)"));
      }
      written += n as usize;
    }
    Ok(written)
  }

  /// Reads from the child's stdout pipe.
  ///
  /// `Ok(0)` means EOF on a blocking stream. On a non-blocking stream it
  /// can also mean "no data right now", in which case the last-error record
  /// is set to [`ErrorKind::WouldBlock`]; EOF leaves the record empty.
  pub fn read_stdout(&mut self, buf: &mut [u8]) -> Result<usize> {
    self.last_error = None;
    let fd = match self.stdout.raw() {
      Some(fd) => fd,
      None => return self.fail(Error::not_available("stdout")),
    };
    self.read_fd(fd, buf, "read from stdout")
  }

  /// Reads from the child's stderr pipe. Same contract as
  /// [`read_stdout`](Self::read_stdout).
  pub fn read_stderr(&mut self, buf: &mut [u8]) -> Result<usize> {
    self.last_error = None;
    let fd = match self.stderr.raw() {
      Some(fd) => fd,
      None => return self.fail(Error::not_available("stderr")),
    };
    self.read_fd(fd, buf, "read from stderr")
  }

  fn read_fd(&mut self, fd: RawFd, buf: &mut [u8], what: &str) -> Result<usize> {
    loop {
      let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
      if n >= 0 {
        return Ok(n as usize);
      }
      let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
      if code == libc::EINTR {
        continue;
      }
      if code == libc::EAGAIN || code == libc::EWOULDBLOCK {
        self.last_error = Some(Error::would_block(what));
        return Ok(0);
      }
      return self.fail(Error::from_os(ErrorKind::Io, code, what));
    }
  }

  /// Closes the parent's write end of stdin, delivering EOF to a child that
  /// reads its input to completion. Idempotent.
  pub fn close_stdin(&mut self) {
    self.stdin = StreamEnd::None;
  }

  /// Closes the parent's read end of stdout. Idempotent.
  pub fn close_stdout(&mut self) {
    self.stdout = StreamEnd::None;
  }

  /// Closes the parent's read end of stderr. Idempotent.
  pub fn close_stderr(&mut self) {
    self.stderr = StreamEnd::None;
  }

  /// The parent's write end of the child's stdin, for registration with an
  /// external poll loop. `None` when the stream is not piped or was closed.
  pub fn stdin_fd(&self) -> Option<RawFd> {
    self.stdin.raw()
  }

  /// The parent's read end of the child's stdout.
  pub fn stdout_fd(&self) -> Option<RawFd> {
    self.stdout.raw()
  }

  /// The parent's read end of the child's stderr.
  pub fn stderr_fd(&self) -> Option<RawFd> {
    self.stderr.raw()
  }

  /// Non-blocking liveness check. A terminal status observed here is cached
  /// and later returned by [`wait`](Self::wait)/[`try_wait`](Self::try_wait).
  pub fn alive(&mut self) -> bool {
    if self.reaped.is_some() {
      return false;
    }
    let pid = match self.pid {
      Some(pid) => pid,
      None => return false,
    };
    let mut status = 0;
    loop {
      let r = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
      if r == 0 {
        return true;
      }
      if r == pid {
        self.reaped = Some(status);
        return false;
      }
      if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
        continue;
      }
      return false;
    }
  }

  /// Non-blocking reap. `Ok(None)` while the child is still running;
  /// `Ok(Some(status))` hands back the raw status word, closes the retained
  /// pipe ends, and clears the child id.
  pub fn try_wait(&mut self) -> Result<Option<i32>> {
    self.last_error = None;
    self.wait_inner(libc::WNOHANG)
  }

  /// Blocking reap, retrying `EINTR`. Returns the raw status word (inspect
  /// with `libc::WIFEXITED` and friends), closes the retained pipe ends,
  /// and clears the child id.
  pub fn wait(&mut self) -> Result<i32> {
    self.last_error = None;
    match self.wait_inner(0)? {
      Some(status) => Ok(status),
      // waitpid with flags 0 only returns without a status on error.
      None => self.fail(Error::new(ErrorKind::Unknown, 0, "waitpid returned early")),
    }
  }

  fn wait_inner(&mut self, flags: libc::c_int) -> Result<Option<i32>> {
    if let Some(status) = self.reaped {
      self.finish_reap(status);
      return Ok(Some(status));
    }
    let pid = match self.pid {
      Some(pid) => pid,
      None => {
        return self.fail(Error::new(ErrorKind::NotAvailable, libc::ECHILD, "no child"))
      }
    };
    let mut status = 0;
    loop {
      let r = unsafe { libc::waitpid(pid, &mut status, flags) };
      if r == 0 {
        return Ok(None);
      }
      if r == pid {
        self.finish_reap(status);
        return Ok(Some(status));
      }
      let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
      if code == libc::EINTR {
        continue;
      }
      return self.fail(Error::from_os(ErrorKind::Io, code, "waitpid"));
    }
  }

  fn finish_reap(&mut self, status: i32) {
    trace!(pid = self.pid, status, "child reaped");
    self.pid = None;
    self.reaped = None;
    self.stdin = StreamEnd::None;
    self.stdout = StreamEnd::None;
    self.stderr = StreamEnd::None;
  }

  /// Sends `signal` to the child. A no-op when no child is tracked or the
  /// child has already been observed dead (its pid may be recycled).
  pub fn kill(&mut self, signal: i32) -> Result<()> {
    self.last_error = None;
    if self.reaped.is_some() {
      return Ok(());
    }
    let pid = match self.pid {
      Some(pid) => pid,
      None => return Ok(()),
    };
    if unsafe { libc::kill(pid, signal) } != 0 {
      return self.fail(Error::last_os(ErrorKind::Io, "kill"));
    }
    Ok(())
  }

  /// The child's OS process id, if one is tracked.
  pub fn pid(&self) -> Option<u32> {
    self.pid.map(|pid| pid as u32)
  }

  /// The error recorded by the most recent failing operation, if any.
  /// Successful operations clear it; a would-block read sets it.
  pub fn last_error(&self) -> Option<&Error> {
    self.last_error.as_ref()
  }

  /// The OS numeric code of the last recorded error, or `0`.
  pub fn last_errno(&self) -> i32 {
    self.last_error.as_ref().map_or(0, Error::code)
  }

  fn fail<T>(&mut self, err: Error) -> Result<T> {
    self.last_error = Some(err.clone());
    Err(err)
  }

  fn make_pipe(
    &mut self,
    spec: &StreamSpec,
    parent_writes: bool,
    what: &str,
  ) -> std::result::Result<Option<PipePair>, Error> {
    match spec {
      StreamSpec::Pipe => match anon_pipe() {
        Ok((rd, wr)) => Ok(Some(if parent_writes {
          PipePair { parent: wr, child: rd }
        } else {
          PipePair { parent: rd, child: wr }
        })),
        Err(e) => Err(Error::from_os(
          ErrorKind::Io,
          e.raw_os_error().unwrap_or(0),
          what,
        )),
      },
      _ => Ok(None),
    }
  }

  fn read_launch_status(&mut self, fd: RawFd) -> LaunchStatus {
    let mut buf = [0u8; size_of::<libc::c_int>()];
    let mut got = 0;
    while got < buf.len() {
      let n = unsafe {
        libc::read(fd, buf[got..].as_mut_ptr().cast(), buf.len() - got)
      };
      if n == 0 {
        break;
      }
      if n < 0 {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if code == libc::EINTR {
          continue;
        }
        return LaunchStatus::ReadError(code);
      }
      got += n as usize;
    }
    match got {
      0 => LaunchStatus::ExecSucceeded,
      n if n == buf.len() => LaunchStatus::ChildError(libc::c_int::from_ne_bytes(buf)),
      _ => LaunchStatus::ShortReport,
    }
  }

  /// The child never reached exec: collect it with a blocking wait and
  /// release everything retained for it.
  fn reap_failed_launch(&mut self) {
    if let Some(pid) = self.pid {
      let mut status = 0;
      loop {
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r >= 0 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
          break;
        }
      }
    }
    self.pid = None;
    self.stdin = StreamEnd::None;
    self.stdout = StreamEnd::None;
    self.stderr = StreamEnd::None;
  }
}

impl Drop for Popen {
  fn drop(&mut self) {
    // Retained ends close via field drops. A still-running child is left
    // running, with one WNOHANG attempt so an already-exited child does not
    // linger as a zombie.
    if let (Some(pid), None) = (self.pid, self.reaped) {
      trace!(pid, "dropping handle with child still tracked");
      let mut status = 0;
      unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    }
  }
}

enum LaunchStatus {
  ExecSucceeded,
  ChildError(i32),
  ShortReport,
  ReadError(i32),
}

struct PipePair {
  parent: OwnedFd,
  child: OwnedFd,
}

fn retain_parent_end(pipe: Option<PipePair>, nonblock: bool) -> StreamEnd {
  match pipe {
    None => StreamEnd::None,
    Some(pair) => {
      // The child-facing end closes here; the child keeps its own copy.
      let parent = pair.parent;
      drop(pair.child);
      if nonblock {
        set_nonblock(parent.as_raw_fd());
        StreamEnd::Nonblocking(parent)
      } else {
        StreamEnd::Blocking(parent)
      }
    }
  }
}

fn set_nonblock(fd: RawFd) {
  unsafe {
    let flags = libc::fcntl(fd, libc::F_GETFL);
    if flags >= 0 {
      libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
  }
}

/// Creates a pipe with close-on-exec on both ends, atomically where the
/// platform can.
fn anon_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
  let mut fds = [0 as libc::c_int; 2];
  #[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
  ))]
  {
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
      return Err(io::Error::last_os_error());
    }
  }
  #[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
  )))]
  {
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
      return Err(io::Error::last_os_error());
    }
    for fd in fds {
      unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
          let err = io::Error::last_os_error();
          libc::close(fds[0]);
          libc::close(fds[1]);
          return Err(err);
        }
      }
    }
  }
  Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Splits a `KEY=VALUE` entry at its first `=`. Entries with no `=` get an
/// empty value; entries with an empty key are dropped.
pub(crate) fn parse_env_kv(s: &str) -> Option<(&str, &str)> {
  let (k, v) = match s.split_once('=') {
    Some(pair) => pair,
    None => (s, ""),
  };
  if k.is_empty() {
    None
  } else {
    Some((k, v))
  }
}

#[derive(Clone, Copy)]
enum ChildStdio {
  Inherit,
  Pipe { child: RawFd, parent: RawFd },
  UseFd(RawFd),
}

fn child_stdio(spec: &StreamSpec, pipe: Option<&PipePair>) -> ChildStdio {
  match spec {
    StreamSpec::Inherit => ChildStdio::Inherit,
    StreamSpec::Pipe => {
      let pair = pipe.expect("pipe created for Pipe spec");
      ChildStdio::Pipe {
        child: pair.child.as_raw_fd(),
        parent: pair.parent.as_raw_fd(),
      }
    }
    StreamSpec::UseFd(fd) => ChildStdio::UseFd(*fd),
  }
}

struct ChildSetup<'a> {
  status_rd: RawFd,
  status_wr: RawFd,
  stdio: [ChildStdio; 3],
  clear_env: bool,
  env: &'a [(CString, CString)],
  chdir: Option<&'a CStr>,
  setpgid: Option<i32>,
  argv_ptrs: &'a [*const libc::c_char],
}

/// Runs in the forked child. Nothing here allocates; every failure funnels
/// into [`child_fail`], which reports errno to the parent and exits 127.
unsafe fn child_after_fork(setup: &ChildSetup<'_>) -> ! {
  libc::close(setup.status_rd);

  for (target, stdio) in setup.stdio.iter().enumerate() {
    apply_child_stdio(target as RawFd, *stdio, setup.status_wr);
  }

  if setup.clear_env {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if libc::clearenv() != 0 {
      child_fail(setup.status_wr);
    }
    // Other platforms lack clearenv; the option degrades to a no-op there.
  }
  for (k, v) in setup.env {
    if libc::setenv(k.as_ptr(), v.as_ptr(), 1) != 0 {
      child_fail(setup.status_wr);
    }
  }

  if let Some(dir) = setup.chdir {
    if libc::chdir(dir.as_ptr()) != 0 {
      child_fail(setup.status_wr);
    }
  }

  if let Some(pgid) = setup.setpgid {
    if libc::setpgid(0, pgid as libc::pid_t) != 0 {
      child_fail(setup.status_wr);
    }
  }

  libc::execvp(setup.argv_ptrs[0], setup.argv_ptrs.as_ptr());
  child_fail(setup.status_wr);
}

unsafe fn apply_child_stdio(target: RawFd, stdio: ChildStdio, status_wr: RawFd) {
  match stdio {
    ChildStdio::Inherit => {}
    ChildStdio::Pipe { child, parent } => {
      libc::close(parent);
      dup2_retry(child, target, status_wr);
      if child != target {
        libc::close(child);
      }
    }
    ChildStdio::UseFd(fd) => {
      if fd != target {
        dup2_retry(fd, target, status_wr);
      }
      if fd > 2 {
        libc::close(fd);
      }
    }
  }
}

unsafe fn dup2_retry(src: RawFd, dst: RawFd, status_wr: RawFd) {
  loop {
    if libc::dup2(src, dst) != -1 {
      return;
    }
    if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
      child_fail(status_wr);
    }
  }
}

/// Reports the current errno to the parent over the status pipe (EINTR
/// retried, short writes not) and exits with the conventional 127.
unsafe fn child_fail(status_wr: RawFd) -> ! {
  let code = io::Error::last_os_error()
    .raw_os_error()
    .unwrap_or(libc::EINVAL) as libc::c_int;
  let bytes = code.to_ne_bytes();
  loop {
    let n = libc::write(status_wr, bytes.as_ptr().cast(), bytes.len());
    if n >= 0 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
      break;
    }
  }
  libc::_exit(127);
}
