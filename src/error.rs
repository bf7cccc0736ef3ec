use std::fmt;

/// Classifies the failures reported by [`Popen`](crate::Popen) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
  /// The caller handed over something unusable (empty argv, interior NUL,
  /// a second `start` while a child is already tracked).
  InvalidArgument,
  /// The child could not reach `exec` / `CreateProcess` failed. The OS code
  /// is the child-side `errno` on POSIX and `GetLastError` on Windows.
  LaunchFailed,
  /// The operation targets a stream that is closed or was never piped.
  NotAvailable,
  /// A non-blocking stream has no data or no room right now.
  WouldBlock,
  /// The peer closed its end of the pipe.
  BrokenPipe,
  /// Any other OS-level failure, carrying the native code.
  Io,
  /// The launch handshake produced a truncated status report.
  Unknown,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::InvalidArgument => "invalid argument",
      Self::LaunchFailed => "launch failed",
      Self::NotAvailable => "stream not available",
      Self::WouldBlock => "operation would block",
      Self::BrokenPipe => "broken pipe",
      Self::Io => "I/O error",
      Self::Unknown => "unknown error",
    };
    f.write_str(s)
  }
}

/// The error record kept by a [`Popen`](crate::Popen) and returned from its
/// fallible operations: a [`ErrorKind`], the OS-native numeric code, and a
/// formatted message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Error {
  kind: ErrorKind,
  code: i32,
  message: String,
}

impl Error {
  pub(crate) fn new(kind: ErrorKind, code: i32, message: impl Into<String>) -> Self {
    Self {
      kind,
      code,
      message: message.into(),
    }
  }

  /// Captures the calling thread's current OS error (`errno` /
  /// `GetLastError`) under the given kind.
  pub(crate) fn last_os(kind: ErrorKind, what: &str) -> Self {
    let err = std::io::Error::last_os_error();
    let code = err.raw_os_error().unwrap_or(0);
    Self::from_os(kind, code, what)
  }

  /// Builds a record from a known OS code, formatting the system message
  /// for it.
  pub(crate) fn from_os(kind: ErrorKind, code: i32, what: &str) -> Self {
    #[cfg(windows)]
    {
      Self::new(
        kind,
        code,
        format!(
          "{what} failed: {} (GetLastError={code})",
          format_win32_message(code as u32)
        ),
      )
    }
    #[cfg(not(windows))]
    {
      Self::new(
        kind,
        code,
        format!("{what}: {}", std::io::Error::from_raw_os_error(code)),
      )
    }
  }

  pub(crate) fn would_block(what: &str) -> Self {
    #[cfg(unix)]
    let code = libc::EAGAIN;
    #[cfg(windows)]
    let code = windows_sys::Win32::Foundation::ERROR_IO_PENDING as i32;
    Self::new(ErrorKind::WouldBlock, code, format!("{what} would block"))
  }

  pub(crate) fn not_available(what: &str) -> Self {
    #[cfg(unix)]
    let code = libc::EBADF;
    #[cfg(windows)]
    let code = windows_sys::Win32::Foundation::ERROR_INVALID_HANDLE as i32;
    Self::new(
      ErrorKind::NotAvailable,
      code,
      format!("{what} is not available"),
    )
  }

  pub(crate) fn invalid(message: impl Into<String>) -> Self {
    #[cfg(unix)]
    let code = libc::EINVAL;
    #[cfg(windows)]
    let code = windows_sys::Win32::Foundation::ERROR_INVALID_PARAMETER as i32;
    Self::new(ErrorKind::InvalidArgument, code, message)
  }

  /// The classification of this error.
  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  /// The OS-native numeric code (`errno` on POSIX, `GetLastError` on
  /// Windows), or the closest equivalent for synthesized errors.
  pub fn code(&self) -> i32 {
    self.code
  }

  /// The formatted human-readable message.
  pub fn message(&self) -> &str {
    &self.message
  }
}

/// Renders the system text for a `GetLastError` code without allocating
/// through `LocalAlloc`.
#[cfg(windows)]
pub(crate) fn format_win32_message(code: u32) -> String {
  use windows_sys::Win32::System::Diagnostics::Debug::{
    FormatMessageW, FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS,
  };

  let mut buf = [0u16; 512];
  let len = unsafe {
    FormatMessageW(
      FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
      std::ptr::null(),
      code,
      0,
      buf.as_mut_ptr(),
      buf.len() as u32,
      std::ptr::null(),
    )
  };
  if len == 0 {
    return format!("os error {code}");
  }
  String::from_utf16_lossy(&buf[..len as usize])
    .trim_end()
    .to_string()
}
