#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

#[allow(unused_macros)]
macro_rules! cfg_unix {
  ($($item:item)*) => {
    $(
      #[cfg(unix)]
      #[cfg_attr(docsrs, doc(cfg(unix)))]
      $item
    )*
  }
}

#[allow(unused_macros)]
macro_rules! cfg_windows {
  ($($item:item)*) => {
    $(
      #[cfg(windows)]
      #[cfg_attr(docsrs, doc(cfg(windows)))]
      $item
    )*
  };
}

mod error;
mod options;

pub use error::{Error, ErrorKind};
pub use options::{LaunchOptions, StreamSpec};

/// The result type returned by this crate's fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

cfg_unix!(
  mod unix;

  pub use unix::Popen;
);

cfg_windows!(
  mod windows;

  pub use windows::Popen;
);

#[cfg(test)]
mod tests;
