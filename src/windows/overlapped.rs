//! Overlapped read/write state machines for named-pipe stream ends.
//!
//! Each readable stream owns one reader: a fixed buffer, a manual-reset
//! completion event, and at most one outstanding `ReadFile`. The writer is
//! the mirror image with an owned payload copy and at most one outstanding
//! `WriteFile`. The state lives behind a `Box` so the kernel-visible
//! `OVERLAPPED` and buffer keep their addresses while the handle moves.

use std::os::windows::io::{AsRawHandle, OwnedHandle, RawHandle};

use windows_sys::Win32::{
  Foundation::{ERROR_BROKEN_PIPE, ERROR_IO_INCOMPLETE, ERROR_IO_PENDING, GetLastError},
  Storage::FileSystem::{ReadFile, WriteFile},
  System::{
    Threading::{ResetEvent, SetEvent},
    IO::{CancelIo, GetOverlappedResult, OVERLAPPED},
  },
};

use super::pipe::manual_reset_event;
use crate::{Error, ErrorKind};

/// What one call to [`OverlappedReader::read`] produced.
pub(crate) enum ReadStep {
  /// Bytes copied out of the stream, in child-write order.
  Data(usize),
  /// Nothing available yet; the completion event will signal.
  NoData,
  /// The stream has delivered everything it ever will.
  Eof,
}

struct ReadState {
  ov: OVERLAPPED,
  buf: Vec<u8>,
  /// Valid bytes in `buf`.
  have: usize,
  /// Bytes of `buf` already handed to the caller; `pos <= have`.
  pos: usize,
  /// A `ReadFile` is outstanding on the OS.
  pending: bool,
  /// A zero-byte completion or `ERROR_BROKEN_PIPE` was observed.
  eof: bool,
}

pub(crate) struct OverlappedReader {
  handle: OwnedHandle,
  event: OwnedHandle,
  state: Box<ReadState>,
}

impl OverlappedReader {
  pub(crate) fn new(handle: OwnedHandle, buffer_size: usize) -> Result<Self, Error> {
    let event = manual_reset_event()?;
    let mut state = Box::new(ReadState {
      ov: unsafe { std::mem::zeroed() },
      buf: vec![0; buffer_size],
      have: 0,
      pos: 0,
      pending: false,
      eof: false,
    });
    state.ov.hEvent = event.as_raw_handle();
    Ok(Self {
      handle,
      event,
      state,
    })
  }

  /// The completion event, for `WaitForMultipleObjects` composition.
  pub(crate) fn event(&self) -> RawHandle {
    self.event.as_raw_handle()
  }

  /// Arms the next `ReadFile`. Immediate completions land in the buffer (or
  /// flip to eof) with the event signalled; `IO_PENDING` leaves the event
  /// to the kernel.
  pub(crate) fn post_read(&mut self) -> Result<(), Error> {
    let state = &mut *self.state;
    if state.eof {
      return Ok(());
    }
    unsafe { ResetEvent(self.event.as_raw_handle()) };
    state.ov = unsafe { std::mem::zeroed() };
    state.ov.hEvent = self.event.as_raw_handle();
    let mut n = 0u32;
    let ok = unsafe {
      ReadFile(
        self.handle.as_raw_handle(),
        state.buf.as_mut_ptr().cast(),
        state.buf.len() as u32,
        &mut n,
        &mut state.ov,
      )
    };
    if ok != 0 {
      state.have = n as usize;
      state.pos = 0;
      state.pending = false;
      if n == 0 {
        state.eof = true;
      }
      unsafe { SetEvent(self.event.as_raw_handle()) };
      return Ok(());
    }
    match unsafe { GetLastError() } {
      ERROR_IO_PENDING => {
        state.pending = true;
        Ok(())
      }
      ERROR_BROKEN_PIPE => {
        state.have = 0;
        state.pos = 0;
        state.pending = false;
        state.eof = true;
        unsafe { SetEvent(self.event.as_raw_handle()) };
        Ok(())
      }
      code => Err(Error::from_os(
        ErrorKind::Io,
        code as i32,
        "ReadFile(overlapped)",
      )),
    }
  }

  /// Copies buffered bytes out, probing a pending completion first when the
  /// buffer is empty. Re-arms the next read once the buffer drains.
  pub(crate) fn read(&mut self, dst: &mut [u8]) -> Result<ReadStep, Error> {
    if self.state.have > self.state.pos {
      return Ok(ReadStep::Data(self.copy_out(dst)?));
    }
    if self.state.eof {
      return Ok(ReadStep::Eof);
    }
    if self.state.pending {
      let mut n = 0u32;
      let ok = unsafe {
        GetOverlappedResult(self.handle.as_raw_handle(), &self.state.ov, &mut n, 0)
      };
      if ok == 0 {
        match unsafe { GetLastError() } {
          ERROR_IO_INCOMPLETE => return Ok(ReadStep::NoData),
          ERROR_BROKEN_PIPE => {
            self.state.pending = false;
            self.state.eof = true;
            unsafe { ResetEvent(self.event.as_raw_handle()) };
            return Ok(ReadStep::Eof);
          }
          code => {
            // The request is dead either way; report it once and terminate
            // the stream so callers are not wedged.
            self.state.pending = false;
            self.state.eof = true;
            unsafe { ResetEvent(self.event.as_raw_handle()) };
            return Err(Error::from_os(
              ErrorKind::Io,
              code as i32,
              "GetOverlappedResult(read)",
            ));
          }
        }
      }
      self.state.pending = false;
      self.state.have = n as usize;
      self.state.pos = 0;
      if n == 0 {
        self.state.eof = true;
        unsafe { ResetEvent(self.event.as_raw_handle()) };
        return Ok(ReadStep::Eof);
      }
      return Ok(ReadStep::Data(self.copy_out(dst)?));
    }
    // Transient idle: arm a read and report nothing available yet.
    self.post_read()?;
    if self.state.have > self.state.pos {
      return Ok(ReadStep::Data(self.copy_out(dst)?));
    }
    if self.state.eof {
      return Ok(ReadStep::Eof);
    }
    Ok(ReadStep::NoData)
  }

  fn copy_out(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
    let (n, drained, at_eof) = {
      let state = &mut *self.state;
      let avail = state.have - state.pos;
      let n = avail.min(dst.len());
      dst[..n].copy_from_slice(&state.buf[state.pos..state.pos + n]);
      state.pos += n;
      let drained = state.pos == state.have;
      if drained {
        state.have = 0;
        state.pos = 0;
      }
      (n, drained, state.eof)
    };
    if drained {
      if at_eof {
        // Terminal: leave the event dark so waiters stop waking.
        unsafe { ResetEvent(self.event.as_raw_handle()) };
      } else {
        self.post_read()?;
      }
    }
    Ok(n)
  }
}

impl Drop for OverlappedReader {
  fn drop(&mut self) {
    if self.state.pending {
      // The kernel owns `ov` and the buffer until the cancel completes.
      unsafe {
        CancelIo(self.handle.as_raw_handle());
        let mut n = 0u32;
        GetOverlappedResult(self.handle.as_raw_handle(), &self.state.ov, &mut n, 1);
      }
      self.state.pending = false;
    }
  }
}

/// What a write submission produced.
pub(crate) enum Submitted {
  /// The write completed inline with this many bytes.
  Done(usize),
  /// The write is in flight; finalize it later.
  Pending,
  /// The child closed its read end.
  Broken,
}

/// What finalizing an in-flight write produced.
pub(crate) enum Finalized {
  /// Still in flight.
  Pending,
  /// Completed with this many bytes (zero when the pipe broke).
  Done(usize),
  /// The request failed; pending is cleared so the stream stays usable.
  Failed(Error),
}

struct WriteState {
  ov: OVERLAPPED,
  buf: Vec<u8>,
  pending: bool,
  last_n: u32,
}

pub(crate) struct OverlappedWriter {
  handle: OwnedHandle,
  event: OwnedHandle,
  state: Box<WriteState>,
}

impl OverlappedWriter {
  pub(crate) fn new(handle: OwnedHandle) -> Result<Self, Error> {
    let event = manual_reset_event()?;
    let mut state = Box::new(WriteState {
      ov: unsafe { std::mem::zeroed() },
      buf: Vec::new(),
      pending: false,
      last_n: 0,
    });
    state.ov.hEvent = event.as_raw_handle();
    Ok(Self {
      handle,
      event,
      state,
    })
  }

  pub(crate) fn event(&self) -> RawHandle {
    self.event.as_raw_handle()
  }

  pub(crate) fn pending(&self) -> bool {
    self.state.pending
  }

  /// Copies `data` into the owned payload and issues the `WriteFile`. At
  /// most one write may be outstanding; a second submission is rejected
  /// without touching the OS.
  pub(crate) fn submit(&mut self, data: &[u8]) -> Result<Submitted, Error> {
    if self.state.pending {
      return Err(Error::new(
        ErrorKind::WouldBlock,
        ERROR_IO_PENDING as i32,
        "a stdin write is already pending",
      ));
    }
    if data.is_empty() {
      return Ok(Submitted::Done(0));
    }
    let state = &mut *self.state;
    state.buf.clear();
    state.buf.extend_from_slice(data);
    unsafe { ResetEvent(self.event.as_raw_handle()) };
    state.ov = unsafe { std::mem::zeroed() };
    state.ov.hEvent = self.event.as_raw_handle();
    let mut n = 0u32;
    let ok = unsafe {
      WriteFile(
        self.handle.as_raw_handle(),
        state.buf.as_ptr().cast(),
        state.buf.len() as u32,
        &mut n,
        &mut state.ov,
      )
    };
    if ok != 0 {
      state.pending = false;
      state.last_n = n;
      unsafe { SetEvent(self.event.as_raw_handle()) };
      return Ok(Submitted::Done(n as usize));
    }
    match unsafe { GetLastError() } {
      ERROR_IO_PENDING => {
        state.pending = true;
        Ok(Submitted::Pending)
      }
      ERROR_BROKEN_PIPE => {
        state.pending = false;
        state.last_n = 0;
        unsafe { SetEvent(self.event.as_raw_handle()) };
        Ok(Submitted::Broken)
      }
      code => Err(Error::from_os(
        ErrorKind::Io,
        code as i32,
        "WriteFile(stdin overlapped)",
      )),
    }
  }

  /// Probes the in-flight write without blocking.
  pub(crate) fn try_finalize(&mut self) -> Finalized {
    if !self.state.pending {
      return Finalized::Done(self.state.last_n as usize);
    }
    let mut n = 0u32;
    let ok = unsafe {
      GetOverlappedResult(self.handle.as_raw_handle(), &self.state.ov, &mut n, 0)
    };
    if ok != 0 {
      self.state.pending = false;
      self.state.last_n = n;
      return Finalized::Done(n as usize);
    }
    match unsafe { GetLastError() } {
      ERROR_IO_INCOMPLETE => Finalized::Pending,
      ERROR_BROKEN_PIPE => {
        self.state.pending = false;
        self.state.last_n = 0;
        unsafe { SetEvent(self.event.as_raw_handle()) };
        Finalized::Done(0)
      }
      code => {
        self.state.pending = false;
        self.state.last_n = 0;
        Finalized::Failed(Error::from_os(
          ErrorKind::Io,
          code as i32,
          "GetOverlappedResult(stdin)",
        ))
      }
    }
  }
}

impl Drop for OverlappedWriter {
  fn drop(&mut self) {
    if self.state.pending {
      unsafe {
        CancelIo(self.handle.as_raw_handle());
        let mut n = 0u32;
        GetOverlappedResult(self.handle.as_raw_handle(), &self.state.ov, &mut n, 1);
      }
      self.state.pending = false;
    }
  }
}
