//! Shared error types for deskvm.
//!
//! Every deskvm crate reports failures through [`Error`]. Each variant maps
//! onto one [`ErrorKind`], and the retry combinator in `deskvm-retry` decides
//! whether to wait out a failure purely from that kind:
//!
//! | Kind | Meaning |
//! |------|---------|
//! | [`ErrorKind::Retriable`] | transient, expected to resolve with time |
//! | [`ErrorKind::Search`] | a tree search found nothing (retried on request) |
//! | [`ErrorKind::Timeout`] | a bounded retry loop ran out of time |
//! | [`ErrorKind::Fatal`] | everything else, never retried |
//!
//! # Usage
//!
//! ```rust
//! use deskvm_error::{Error, ErrorKind};
//!
//! let err = Error::retriable("the bus is not available yet");
//! assert_eq!(err.kind(), ErrorKind::Retriable);
//! ```

mod bus;
mod common;

pub use bus::{BusError, BusErrorKind};
pub use common::{Error, ErrorKind, ExecFailure};

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
