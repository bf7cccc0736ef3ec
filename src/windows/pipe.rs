//! Pipe construction for the Windows launcher: anonymous pairs for the
//! synchronous path, uniquely named server/client pairs for overlapped I/O,
//! and the inheritable-duplicate helper the INHERIT/USE_HANDLE specs need.

use std::{
  mem::size_of,
  os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle},
  ptr,
  sync::atomic::{AtomicU32, Ordering},
};

use windows_sys::Win32::{
  Foundation::{
    DuplicateHandle, GetLastError, SetHandleInformation, DUPLICATE_SAME_ACCESS, ERROR_IO_PENDING,
    ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE, HANDLE, HANDLE_FLAG_INHERIT,
    INVALID_HANDLE_VALUE,
  },
  Security::SECURITY_ATTRIBUTES,
  Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED,
    OPEN_EXISTING,
  },
  System::{
    Pipes::{
      ConnectNamedPipe, CreateNamedPipeW, CreatePipe, PIPE_ACCESS_INBOUND, PIPE_ACCESS_OUTBOUND,
      PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
    },
    SystemInformation::GetTickCount,
    Threading::{CreateEventW, GetCurrentProcess, GetCurrentProcessId, GetCurrentThreadId, SetEvent},
    IO::{CancelIo, GetOverlappedResult, OVERLAPPED},
  },
};

use crate::{Error, ErrorKind};

/// Process-wide counter folded into pipe names so concurrent launches never
/// collide.
static PIPE_SERIAL: AtomicU32 = AtomicU32::new(0);

fn inheritable_sa() -> SECURITY_ATTRIBUTES {
  SECURITY_ATTRIBUTES {
    nLength: size_of::<SECURITY_ATTRIBUTES>() as u32,
    lpSecurityDescriptor: ptr::null_mut(),
    bInheritHandle: 1,
  }
}

/// A manual-reset event, initially unsignalled.
pub(crate) fn manual_reset_event() -> Result<OwnedHandle, Error> {
  let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
  if event.is_null() {
    return Err(Error::last_os(ErrorKind::Io, "CreateEventW"));
  }
  Ok(unsafe { OwnedHandle::from_raw_handle(event) })
}

/// An anonymous pipe for the synchronous path. The child end is inheritable
/// (both ends are born that way under an inheritable security descriptor);
/// the parent end is explicitly stripped of the inherit flag.
pub(crate) fn anon_pair(parent_reads: bool) -> Result<(OwnedHandle, OwnedHandle), Error> {
  let sa = inheritable_sa();
  let mut read: HANDLE = ptr::null_mut();
  let mut write: HANDLE = ptr::null_mut();
  if unsafe { CreatePipe(&mut read, &mut write, &sa, 0) } == 0 {
    return Err(Error::last_os(ErrorKind::Io, "CreatePipe"));
  }
  let (read, write) = unsafe {
    (
      OwnedHandle::from_raw_handle(read),
      OwnedHandle::from_raw_handle(write),
    )
  };
  let (parent, child) = if parent_reads { (read, write) } else { (write, read) };
  if unsafe { SetHandleInformation(parent.as_raw_handle(), HANDLE_FLAG_INHERIT, 0) } == 0 {
    return Err(Error::last_os(ErrorKind::Io, "SetHandleInformation"));
  }
  Ok((parent, child))
}

/// A named-pipe server/client pair for overlapped I/O, connected within this
/// process: the parent keeps the overlapped server end, the child inherits
/// the client end.
pub(crate) fn named_pair(
  parent_reads: bool,
  buffer_size: u32,
) -> Result<(OwnedHandle, OwnedHandle), Error> {
  let name = unique_pipe_name();
  let direction = if parent_reads {
    PIPE_ACCESS_INBOUND
  } else {
    PIPE_ACCESS_OUTBOUND
  };
  let server = unsafe {
    CreateNamedPipeW(
      name.as_ptr(),
      direction | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
      PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
      1,
      buffer_size,
      buffer_size,
      0,
      ptr::null(),
    )
  };
  if server == INVALID_HANDLE_VALUE {
    return Err(Error::last_os(ErrorKind::Io, "CreateNamedPipeW"));
  }
  let server = unsafe { OwnedHandle::from_raw_handle(server) };

  // Connect overlapped so we can open the client end from this same thread.
  let connect_event = manual_reset_event()?;
  let mut ov: OVERLAPPED = unsafe { std::mem::zeroed() };
  ov.hEvent = connect_event.as_raw_handle();
  if unsafe { ConnectNamedPipe(server.as_raw_handle(), &mut ov) } == 0 {
    match unsafe { GetLastError() } {
      ERROR_PIPE_CONNECTED => {
        unsafe { SetEvent(connect_event.as_raw_handle()) };
      }
      ERROR_IO_PENDING => {}
      code => {
        return Err(Error::from_os(ErrorKind::Io, code as i32, "ConnectNamedPipe"));
      }
    }
  }

  let desired = if parent_reads { GENERIC_WRITE } else { GENERIC_READ };
  let sa = inheritable_sa();
  let client = unsafe {
    CreateFileW(
      name.as_ptr(),
      desired,
      0,
      &sa,
      OPEN_EXISTING,
      FILE_ATTRIBUTE_NORMAL,
      ptr::null_mut(),
    )
  };
  if client == INVALID_HANDLE_VALUE {
    let err = Error::last_os(ErrorKind::Io, "CreateFileW(pipe client)");
    // Drain the pending connect before `ov` leaves scope; the server
    // handle and connect event then unwind on drop.
    unsafe {
      CancelIo(server.as_raw_handle());
      let mut transferred = 0u32;
      GetOverlappedResult(server.as_raw_handle(), &ov, &mut transferred, 1);
    }
    return Err(err);
  }
  let client = unsafe { OwnedHandle::from_raw_handle(client) };

  // The connect should have completed the moment the client opened; wait
  // out the corner where it has not been delivered yet.
  let mut transferred = 0u32;
  if unsafe { GetOverlappedResult(server.as_raw_handle(), &ov, &mut transferred, 1) } == 0 {
    let code = unsafe { GetLastError() };
    if code != ERROR_PIPE_CONNECTED {
      return Err(Error::from_os(
        ErrorKind::Io,
        code as i32,
        "GetOverlappedResult(connect)",
      ));
    }
  }

  if unsafe { SetHandleInformation(server.as_raw_handle(), HANDLE_FLAG_INHERIT, 0) } == 0 {
    return Err(Error::last_os(ErrorKind::Io, "SetHandleInformation"));
  }
  Ok((server, client))
}

/// Duplicates `src` as an inheritable handle with the same access. A null
/// or invalid source (a parent with no console, say) propagates as `None`
/// so the child sees the same nothing.
pub(crate) fn dup_inheritable(src: RawHandle) -> Result<Option<OwnedHandle>, Error> {
  if src.is_null() || src == INVALID_HANDLE_VALUE {
    return Ok(None);
  }
  let process = unsafe { GetCurrentProcess() };
  let mut dup: HANDLE = ptr::null_mut();
  let ok = unsafe {
    DuplicateHandle(process, src, process, &mut dup, 0, 1, DUPLICATE_SAME_ACCESS)
  };
  if ok == 0 {
    return Err(Error::last_os(ErrorKind::Io, "DuplicateHandle"));
  }
  Ok(Some(unsafe { OwnedHandle::from_raw_handle(dup) }))
}

/// `\\.\pipe\popen3_<pid>_<tid>_<tick>_<serial>`, NUL-terminated UTF-16.
fn unique_pipe_name() -> Vec<u16> {
  let name = format!(
    r"\\.\pipe\popen3_{}_{}_{}_{}",
    unsafe { GetCurrentProcessId() },
    unsafe { GetCurrentThreadId() },
    unsafe { GetTickCount() },
    PIPE_SERIAL.fetch_add(1, Ordering::Relaxed),
  );
  name.encode_utf16().chain(Some(0)).collect()
}
