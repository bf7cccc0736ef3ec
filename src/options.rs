/// How one of the child's standard streams is wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamSpec {
  /// The child shares the parent's stream; the parent retains no end.
  #[default]
  Inherit,
  /// A fresh pipe; the parent keeps the far end and can read or write it.
  Pipe,
  /// The child's stream is redirected onto a descriptor the caller already
  /// owns. The caller keeps ownership; the engine never closes it in the
  /// parent.
  #[cfg(unix)]
  #[cfg_attr(docsrs, doc(cfg(unix)))]
  UseFd(std::os::unix::io::RawFd),
  /// The child's stream is redirected onto a handle the caller already
  /// owns. The engine duplicates it as inheritable and closes only the
  /// duplicate.
  #[cfg(windows)]
  #[cfg_attr(docsrs, doc(cfg(windows)))]
  UseHandle(std::os::windows::io::RawHandle),
}

/// Options consumed by [`Popen::start`](crate::Popen::start).
///
/// The [`Default`] value inherits all three streams and turns every switch
/// off; [`LaunchOptions::piped`] is the common all-pipes starting point.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct LaunchOptions {
  /// Wiring for the child's stdin.
  pub stdin: StreamSpec,
  /// Wiring for the child's stdout.
  pub stdout: StreamSpec,
  /// Wiring for the child's stderr.
  pub stderr: StreamSpec,
  /// Make the parent-retained pipe ends non-blocking. On POSIX this sets
  /// `O_NONBLOCK`; on the Windows synchronous path reads peek before they
  /// read and report "no data" as `Ok(0)`.
  pub parent_nonblock: bool,
  /// Working directory for the child, applied between `fork` and `exec`.
  /// `None` inherits the parent's.
  #[cfg(unix)]
  #[cfg_attr(docsrs, doc(cfg(unix)))]
  pub chdir_to: Option<std::path::PathBuf>,
  /// Wipe the child's environment before applying [`env_kv`](Self::env_kv).
  /// Silently skipped on platforms without `clearenv(3)`.
  #[cfg(unix)]
  #[cfg_attr(docsrs, doc(cfg(unix)))]
  pub clear_env: bool,
  /// Ordered `KEY=VALUE` pairs applied in the child after the optional
  /// clear. Each entry splits at its first `=`; entries with an empty key
  /// are ignored.
  #[cfg(unix)]
  #[cfg_attr(docsrs, doc(cfg(unix)))]
  pub env_kv: Vec<String>,
  /// Call `setpgid` in the child. `Some(0)` makes the child its own group
  /// leader; `Some(pgid)` joins an existing group.
  #[cfg(unix)]
  #[cfg_attr(docsrs, doc(cfg(unix)))]
  pub setpgid: Option<i32>,
  /// Implement `Pipe` streams as named pipes driven by overlapped I/O
  /// instead of synchronous anonymous pipes.
  #[cfg(windows)]
  #[cfg_attr(docsrs, doc(cfg(windows)))]
  pub overlapped_io: bool,
  /// Per-stream chunk size for overlapped reads. Zero is rewritten to the
  /// 64 KiB default at start time.
  #[cfg(windows)]
  #[cfg_attr(docsrs, doc(cfg(windows)))]
  pub io_buffer_size: usize,
}

impl LaunchOptions {
  /// Options with all three standard streams piped and everything else at
  /// its default.
  pub fn piped() -> Self {
    Self {
      stdin: StreamSpec::Pipe,
      stdout: StreamSpec::Pipe,
      stderr: StreamSpec::Pipe,
      ..Self::default()
    }
  }
}
