//! The Windows engine: CreateProcess launch over inheritable handles, with
//! synchronous anonymous pipes or overlapped named pipes per stream.

mod cmdline;
mod overlapped;
mod pipe;

use std::{
  mem::size_of,
  os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle},
  ptr,
  time::Duration,
};

use tracing::{debug, trace};
use windows_sys::Win32::{
  Foundation::{
    GetLastError, ERROR_ACCESS_DENIED, ERROR_BROKEN_PIPE, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT,
  },
  Storage::FileSystem::{ReadFile, WriteFile},
  System::{
    Console::{GetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE},
    Pipes::PeekNamedPipe,
    Threading::{
      CreateProcessW, GetExitCodeProcess, TerminateProcess, WaitForSingleObject, INFINITE,
      PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOW,
    },
  },
};

use crate::{Error, ErrorKind, LaunchOptions, Result, StreamSpec};
use overlapped::{Finalized, OverlappedReader, OverlappedWriter, ReadStep, Submitted};

const DEFAULT_IO_BUFFER: usize = 64 * 1024;

/// The parent-retained end of one of the child's standard streams.
enum StreamEnd {
  /// The stream was inherited or redirected; the parent holds nothing.
  None,
  /// An anonymous-pipe end driven by synchronous ReadFile/WriteFile.
  Sync(OwnedHandle),
  /// A named-pipe read end with its overlapped reader.
  Reader(OverlappedReader),
  /// The named-pipe write end of stdin with its overlapped writer.
  Writer(OverlappedWriter),
}

enum WriteOutcome {
  Wrote(usize),
  Broken,
  WouldBlock,
  Fail(Error),
}

enum ReadOutcome {
  Data(usize),
  NoData,
  Eof,
  Fail(Error),
}

/// A handle to one spawned child process and the parent-retained ends of
/// its standard streams.
///
/// A `Popen` is single-threaded by design: drive it from one thread, or
/// serialize access yourself. With `overlapped_io` the exposed completion
/// events and the process handle compose with `WaitForMultipleObjects` in a
/// caller-owned loop. Dropping the handle cancels pending I/O and closes
/// everything; it never blocks on the child.
pub struct Popen {
  process: Option<OwnedHandle>,
  thread: Option<OwnedHandle>,
  pid: Option<u32>,
  stdin: StreamEnd,
  stdout: StreamEnd,
  stderr: StreamEnd,
  parent_nonblock: bool,
  exit_code: Option<u32>,
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
      process: None,
      thread: None,
      pid: None,
      stdin: StreamEnd::None,
      stdout: StreamEnd::None,
      stderr: StreamEnd::None,
      parent_nonblock: false,
      exit_code: None,
      last_error: None,
    }
  }

  /// Launches the command line built from `argv` with the given stream
  /// wiring.
  ///
  /// Every preparatory failure unwinds all handles created so far and
  /// returns without a child; once `CreateProcessW` succeeds the child's
  /// copies of the stream handles are closed immediately and, for
  /// overlapped streams, the first read is posted on each readable end.
  pub fn start<S: AsRef<str>>(&mut self, argv: &[S], opts: &LaunchOptions) -> Result<()> {
    self.last_error = None;
    if self.process.is_some() {
      return self.fail(Error::invalid("a child is already tracked by this handle"));
    }
    if argv.is_empty() {
      return self.fail(Error::invalid("argv is empty"));
    }
    let io_buffer = if opts.io_buffer_size == 0 {
      DEFAULT_IO_BUFFER
    } else {
      opts.io_buffer_size
    };
    self.parent_nonblock = opts.parent_nonblock;

    let mut cmdline = match cmdline::build_command_line(argv) {
      Ok(c) => c,
      Err(e) => return self.fail(e),
    };

    let (child_in, parent_in) =
      match prepare_stream(&opts.stdin, false, opts.overlapped_io, io_buffer, STD_INPUT_HANDLE) {
        Ok(pair) => pair,
        Err(e) => return self.fail(e),
      };
    let (child_out, parent_out) = match prepare_stream(
      &opts.stdout,
      true,
      opts.overlapped_io,
      io_buffer,
      STD_OUTPUT_HANDLE,
    ) {
      Ok(pair) => pair,
      Err(e) => return self.fail(e),
    };
    let (child_err, parent_err) = match prepare_stream(
      &opts.stderr,
      true,
      opts.overlapped_io,
      io_buffer,
      STD_ERROR_HANDLE,
    ) {
      Ok(pair) => pair,
      Err(e) => return self.fail(e),
    };

    let mut si: STARTUPINFOW = unsafe { std::mem::zeroed() };
    si.cb = size_of::<STARTUPINFOW>() as u32;
    si.dwFlags = STARTF_USESTDHANDLES;
    si.hStdInput = raw_or_null(&child_in);
    si.hStdOutput = raw_or_null(&child_out);
    si.hStdError = raw_or_null(&child_err);
    let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    let ok = unsafe {
      CreateProcessW(
        ptr::null(),
        cmdline.as_mut_ptr(),
        ptr::null(),
        ptr::null(),
        1,
        0,
        ptr::null(),
        ptr::null(),
        &si,
        &mut pi,
      )
    };
    let launch_err = if ok == 0 {
      Some(Error::last_os(ErrorKind::LaunchFailed, "CreateProcessW"))
    } else {
      None
    };

    // The child owns its copies now (or never will); ours close either way.
    drop(child_in);
    drop(child_out);
    drop(child_err);
    if let Some(err) = launch_err {
      debug!(code = err.code(), "CreateProcessW failed");
      // parent_in/out/err unwind on drop.
      return self.fail(err);
    }

    self.process = Some(unsafe { OwnedHandle::from_raw_handle(pi.hProcess) });
    self.thread = Some(unsafe { OwnedHandle::from_raw_handle(pi.hThread) });
    self.pid = Some(pi.dwProcessId);

    let wired = self.wire_parent_ends(parent_in, parent_out, parent_err, opts, io_buffer);
    if let Err(err) = wired {
      // The child is already running; take it down so a failed start never
      // leaves one behind.
      self.abandon_started_child();
      return self.fail(err);
    }

    trace!(pid = pi.dwProcessId, "child started");
    Ok(())
  }

  fn wire_parent_ends(
    &mut self,
    parent_in: Option<OwnedHandle>,
    parent_out: Option<OwnedHandle>,
    parent_err: Option<OwnedHandle>,
    opts: &LaunchOptions,
    io_buffer: usize,
  ) -> std::result::Result<(), Error> {
    self.stdin = match parent_in {
      None => StreamEnd::None,
      Some(h) if opts.overlapped_io => StreamEnd::Writer(OverlappedWriter::new(h)?),
      Some(h) => StreamEnd::Sync(h),
    };
    self.stdout = wire_reader(parent_out, opts.overlapped_io, io_buffer)?;
    self.stderr = wire_reader(parent_err, opts.overlapped_io, io_buffer)?;
    Ok(())
  }

  fn abandon_started_child(&mut self) {
    if let Some(process) = &self.process {
      unsafe {
        TerminateProcess(process.as_raw_handle(), 1);
        WaitForSingleObject(process.as_raw_handle(), INFINITE);
      }
    }
    self.process = None;
    self.thread = None;
    self.pid = None;
    self.stdin = StreamEnd::None;
    self.stdout = StreamEnd::None;
    self.stderr = StreamEnd::None;
  }

  /// Writes to the child's stdin.
  ///
  /// On the synchronous path this is a blocking `WriteFile`. On the
  /// overlapped path the payload is copied and submitted without blocking:
  /// `Ok(n)` means the bytes are owned by the engine and will reach the
  /// pipe, [`ErrorKind::WouldBlock`] means the previous submission has not
  /// completed yet. `Ok(0)` on either path means the child closed its read
  /// end; no error is recorded for that.
  pub fn write_stdin(&mut self, data: &[u8]) -> Result<usize> {
    self.last_error = None;
    let outcome = match &mut self.stdin {
      StreamEnd::None => WriteOutcome::Fail(Error::not_available("stdin")),
      StreamEnd::Sync(h) => sync_write(h.as_raw_handle(), data),
      StreamEnd::Writer(w) => {
        if w.pending() {
          match w.try_finalize() {
            Finalized::Pending => WriteOutcome::WouldBlock,
            Finalized::Done(_) => submit_new(w, data),
            Finalized::Failed(e) => WriteOutcome::Fail(e),
          }
        } else {
          submit_new(w, data)
        }
      }
      StreamEnd::Reader(_) => WriteOutcome::Fail(Error::not_available("stdin")),
    };
    match outcome {
      WriteOutcome::Wrote(n) => Ok(n),
      WriteOutcome::Broken => Ok(0),
      WriteOutcome::WouldBlock => self.fail(Error::would_block("write to stdin")),
      WriteOutcome::Fail(e) => self.fail(e),
    }
  }

  /// Submits one overlapped write of `data` to the child's stdin.
  ///
  /// At most one write may be outstanding: a second submission before
  /// [`try_finalize_stdin_write`](Self::try_finalize_stdin_write) reports
  /// completion fails with [`ErrorKind::WouldBlock`] and issues nothing.
  /// Completion is signalled on [`stdin_event`](Self::stdin_event).
  pub fn write_stdin_async(&mut self, data: &[u8]) -> Result<()> {
    self.last_error = None;
    let outcome = match &mut self.stdin {
      StreamEnd::Writer(w) => w.submit(data).map(|_| ()),
      _ => Err(Error::not_available("overlapped stdin")),
    };
    match outcome {
      Ok(()) => Ok(()),
      Err(e) => self.fail(e),
    }
  }

  /// Whether an overlapped stdin write is still in flight.
  pub fn stdin_write_pending(&self) -> bool {
    matches!(&self.stdin, StreamEnd::Writer(w) if w.pending())
  }

  /// Collects the result of an overlapped stdin write.
  ///
  /// `Ok(None)` while the write is still in flight. `Ok(Some(n))` once a
  /// result is available; a broken pipe reports `Some(0)`. Any other
  /// completion failure also reports `Some(0)` with the error recorded in
  /// [`last_error`](Self::last_error), so a caller looping on this can
  /// always make progress.
  pub fn try_finalize_stdin_write(&mut self) -> Result<Option<usize>> {
    self.last_error = None;
    let outcome = match &mut self.stdin {
      StreamEnd::Writer(w) => Ok(w.try_finalize()),
      _ => Err(Error::not_available("overlapped stdin")),
    };
    match outcome {
      Ok(Finalized::Pending) => Ok(None),
      Ok(Finalized::Done(n)) => Ok(Some(n)),
      Ok(Finalized::Failed(e)) => {
        self.last_error = Some(e);
        Ok(Some(0))
      }
      Err(e) => self.fail(e),
    }
  }

  /// Reads from the child's stdout.
  ///
  /// `Ok(0)` means EOF on a blocking stream. With `parent_nonblock` or
  /// `overlapped_io` it can also mean "no data right now", in which case
  /// the last-error record is set to [`ErrorKind::WouldBlock`]; EOF leaves
  /// the record empty.
  pub fn read_stdout(&mut self, buf: &mut [u8]) -> Result<usize> {
    self.last_error = None;
    let nonblock = self.parent_nonblock;
    let outcome = read_end(&mut self.stdout, buf, nonblock, "stdout");
    self.finish_read(outcome, "read from stdout")
  }

  /// Reads from the child's stderr. Same contract as
  /// [`read_stdout`](Self::read_stdout).
  pub fn read_stderr(&mut self, buf: &mut [u8]) -> Result<usize> {
    self.last_error = None;
    let nonblock = self.parent_nonblock;
    let outcome = read_end(&mut self.stderr, buf, nonblock, "stderr");
    self.finish_read(outcome, "read from stderr")
  }

  fn finish_read(&mut self, outcome: ReadOutcome, what: &str) -> Result<usize> {
    match outcome {
      ReadOutcome::Data(n) => Ok(n),
      ReadOutcome::Eof => Ok(0),
      ReadOutcome::NoData => {
        self.last_error = Some(Error::would_block(what));
        Ok(0)
      }
      ReadOutcome::Fail(e) => self.fail(e),
    }
  }

  /// Closes the parent's stdin end, cancelling any in-flight write first.
  /// Idempotent.
  pub fn close_stdin(&mut self) {
    self.stdin = StreamEnd::None;
  }

  /// Closes the parent's stdout end, cancelling any in-flight read first.
  /// Idempotent.
  pub fn close_stdout(&mut self) {
    self.stdout = StreamEnd::None;
  }

  /// Closes the parent's stderr end, cancelling any in-flight read first.
  /// Idempotent.
  pub fn close_stderr(&mut self) {
    self.stderr = StreamEnd::None;
  }

  /// The manual-reset completion event for overlapped stdin writes.
  pub fn stdin_event(&self) -> Option<RawHandle> {
    match &self.stdin {
      StreamEnd::Writer(w) => Some(w.event()),
      _ => None,
    }
  }

  /// The manual-reset completion event for overlapped stdout reads. It
  /// stays signalled while data is buffered, so one wait wakes the caller.
  pub fn stdout_event(&self) -> Option<RawHandle> {
    match &self.stdout {
      StreamEnd::Reader(r) => Some(r.event()),
      _ => None,
    }
  }

  /// The manual-reset completion event for overlapped stderr reads.
  pub fn stderr_event(&self) -> Option<RawHandle> {
    match &self.stderr {
      StreamEnd::Reader(r) => Some(r.event()),
      _ => None,
    }
  }

  /// The child's process handle, for wait composition.
  pub fn process_handle(&self) -> Option<RawHandle> {
    self.process.as_ref().map(|h| h.as_raw_handle())
  }

  /// The child's initial-thread handle, owned until the `Popen` drops.
  pub fn thread_handle(&self) -> Option<RawHandle> {
    self.thread.as_ref().map(|h| h.as_raw_handle())
  }

  /// Gathers the process handle and stream events into one list for
  /// `WaitForMultipleObjects`. Stdin's write-completion event is included
  /// only on request.
  pub fn collect_wait_handles(&self, include_stdin_event: bool) -> Vec<RawHandle> {
    let mut handles = Vec::with_capacity(4);
    if let Some(h) = self.process_handle() {
      handles.push(h);
    }
    if let Some(h) = self.stdout_event() {
      handles.push(h);
    }
    if let Some(h) = self.stderr_event() {
      handles.push(h);
    }
    if include_stdin_event {
      if let Some(h) = self.stdin_event() {
        handles.push(h);
      }
    }
    handles
  }

  /// Non-blocking liveness check.
  pub fn alive(&self) -> bool {
    match &self.process {
      Some(h) if self.exit_code.is_none() => {
        unsafe { WaitForSingleObject(h.as_raw_handle(), 0) == WAIT_TIMEOUT }
      }
      _ => false,
    }
  }

  /// Non-blocking reap. `Ok(None)` while the child is still running.
  pub fn try_wait(&mut self) -> Result<Option<u32>> {
    self.last_error = None;
    self.wait_for(0)
  }

  /// Blocks until the child exits and returns its exit code.
  pub fn wait(&mut self) -> Result<u32> {
    self.last_error = None;
    match self.wait_for(INFINITE)? {
      Some(code) => Ok(code),
      None => self.fail(Error::new(ErrorKind::Unknown, 0, "wait returned early")),
    }
  }

  /// Waits up to `timeout` for the child to exit. `Ok(None)` on timeout.
  pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<u32>> {
    self.last_error = None;
    let ms = timeout.as_millis().min(u128::from(INFINITE - 1)) as u32;
    self.wait_for(ms)
  }

  fn wait_for(&mut self, timeout_ms: u32) -> Result<Option<u32>> {
    if let Some(code) = self.exit_code {
      return Ok(Some(code));
    }
    let process = match &self.process {
      Some(h) => h.as_raw_handle(),
      None => {
        return self.fail(Error::new(
          ErrorKind::NotAvailable,
          ERROR_INVALID_HANDLE_CODE,
          "no child",
        ))
      }
    };
    match unsafe { WaitForSingleObject(process, timeout_ms) } {
      WAIT_TIMEOUT => Ok(None),
      WAIT_OBJECT_0 => {
        let mut code = 0u32;
        if unsafe { GetExitCodeProcess(process, &mut code) } == 0 {
          return self.fail(Error::last_os(ErrorKind::Io, "GetExitCodeProcess"));
        }
        trace!(pid = self.pid, code, "child exited");
        self.exit_code = Some(code);
        Ok(Some(code))
      }
      _ => self.fail(Error::last_os(ErrorKind::Io, "WaitForSingleObject(process)")),
    }
  }

  /// Best-effort hard terminate. A no-op when no child is tracked; a child
  /// that already exited is not an error.
  pub fn terminate(&mut self) -> Result<()> {
    self.last_error = None;
    let process = match &self.process {
      Some(h) => h.as_raw_handle(),
      None => return Ok(()),
    };
    if unsafe { TerminateProcess(process, 1) } == 0 {
      let code = unsafe { GetLastError() };
      let exited = unsafe { WaitForSingleObject(process, 0) } == WAIT_OBJECT_0;
      if code == ERROR_ACCESS_DENIED && exited {
        return Ok(());
      }
      return self.fail(Error::from_os(ErrorKind::Io, code as i32, "TerminateProcess"));
    }
    Ok(())
  }

  /// The child's OS process id, if one is tracked.
  pub fn pid(&self) -> Option<u32> {
    self.pid
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
}

const ERROR_INVALID_HANDLE_CODE: i32 =
  windows_sys::Win32::Foundation::ERROR_INVALID_HANDLE as i32;

fn raw_or_null(handle: &Option<OwnedHandle>) -> HANDLE {
  handle
    .as_ref()
    .map_or(ptr::null_mut(), |h| h.as_raw_handle())
}

fn submit_new(w: &mut OverlappedWriter, data: &[u8]) -> WriteOutcome {
  match w.submit(data) {
    Ok(Submitted::Done(n)) => WriteOutcome::Wrote(n),
    // The payload is copied and owned; it will reach the pipe.
    Ok(Submitted::Pending) => WriteOutcome::Wrote(data.len()),
    Ok(Submitted::Broken) => WriteOutcome::Broken,
    Err(e) => WriteOutcome::Fail(e),
  }
}

/// Produces the inheritable child handle and the parent-retained end for
/// one stream spec.
fn prepare_stream(
  spec: &StreamSpec,
  parent_reads: bool,
  overlapped: bool,
  io_buffer: usize,
  std_id: u32,
) -> std::result::Result<(Option<OwnedHandle>, Option<OwnedHandle>), Error> {
  match spec {
    StreamSpec::Inherit => {
      let current = unsafe { GetStdHandle(std_id) };
      Ok((pipe::dup_inheritable(current)?, None))
    }
    StreamSpec::UseHandle(h) => Ok((pipe::dup_inheritable(*h)?, None)),
    StreamSpec::Pipe => {
      let (parent, child) = if overlapped {
        pipe::named_pair(parent_reads, io_buffer as u32)?
      } else {
        pipe::anon_pair(parent_reads)?
      };
      Ok((Some(child), Some(parent)))
    }
  }
}

fn wire_reader(
  parent: Option<OwnedHandle>,
  overlapped: bool,
  io_buffer: usize,
) -> std::result::Result<StreamEnd, Error> {
  Ok(match parent {
    None => StreamEnd::None,
    Some(h) if overlapped => {
      let mut reader = OverlappedReader::new(h, io_buffer)?;
      reader.post_read()?;
      StreamEnd::Reader(reader)
    }
    Some(h) => StreamEnd::Sync(h),
  })
}

fn read_end(end: &mut StreamEnd, buf: &mut [u8], nonblock: bool, what: &str) -> ReadOutcome {
  match end {
    StreamEnd::None => ReadOutcome::Fail(Error::not_available(what)),
    StreamEnd::Sync(h) => sync_read(h.as_raw_handle(), buf, nonblock, what),
    StreamEnd::Reader(r) => match r.read(buf) {
      Ok(ReadStep::Data(n)) => ReadOutcome::Data(n),
      Ok(ReadStep::NoData) => ReadOutcome::NoData,
      Ok(ReadStep::Eof) => ReadOutcome::Eof,
      Err(e) => ReadOutcome::Fail(e),
    },
    StreamEnd::Writer(_) => ReadOutcome::Fail(Error::not_available(what)),
  }
}

fn sync_write(handle: RawHandle, data: &[u8]) -> WriteOutcome {
  let mut n = 0u32;
  let ok = unsafe {
    WriteFile(
      handle,
      data.as_ptr().cast(),
      data.len() as u32,
      &mut n,
      ptr::null_mut(),
    )
  };
  if ok != 0 {
    return WriteOutcome::Wrote(n as usize);
  }
  match unsafe { GetLastError() } {
    ERROR_BROKEN_PIPE => WriteOutcome::Broken,
    code => WriteOutcome::Fail(Error::from_os(ErrorKind::Io, code as i32, "WriteFile(stdin)")),
  }
}

/// Synchronous read; with `nonblock` it peeks first and reports an empty
/// pipe as "no data" instead of blocking.
fn sync_read(handle: RawHandle, buf: &mut [u8], nonblock: bool, what: &str) -> ReadOutcome {
  let mut to_read = buf.len() as u32;
  if nonblock {
    let mut avail = 0u32;
    let ok = unsafe {
      PeekNamedPipe(
        handle,
        ptr::null_mut(),
        0,
        ptr::null_mut(),
        &mut avail,
        ptr::null_mut(),
      )
    };
    if ok == 0 {
      return match unsafe { GetLastError() } {
        ERROR_BROKEN_PIPE => ReadOutcome::Eof,
        code => ReadOutcome::Fail(Error::from_os(ErrorKind::Io, code as i32, "PeekNamedPipe")),
      };
    }
    if avail == 0 {
      return ReadOutcome::NoData;
    }
    to_read = to_read.min(avail);
  }
  let mut n = 0u32;
  let ok = unsafe {
    ReadFile(
      handle,
      buf.as_mut_ptr().cast(),
      to_read,
      &mut n,
      ptr::null_mut(),
    )
  };
  if ok == 0 {
    return match unsafe { GetLastError() } {
      ERROR_BROKEN_PIPE => ReadOutcome::Eof,
      code => ReadOutcome::Fail(Error::from_os(ErrorKind::Io, code as i32, what)),
    };
  }
  if n == 0 {
    ReadOutcome::Eof
  } else {
    ReadOutcome::Data(n as usize)
  }
}

impl Drop for Popen {
  fn drop(&mut self) {
    // Stream ends cancel their pending I/O as they drop; the process and
    // thread handles just close. The child, if still running, runs on.
    if self.process.is_some() && self.exit_code.is_none() {
      trace!(pid = self.pid, "dropping handle with child still tracked");
    }
  }
}
