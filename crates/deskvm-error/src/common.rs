//! Error taxonomy shared across deskvm crates.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::bus::{BusError, BusErrorKind};

/// How an error should be treated by a bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient: bus not ready, widget not rendered yet, unit still
    /// shutting down.
    Retriable,
    /// A tree traversal found no matching node.
    Search,
    /// A bounded retry loop exhausted its budget.
    Timeout,
    /// Any other failure.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retriable => "retriable",
            Self::Search => "search",
            Self::Timeout => "timeout",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// A subprocess that exited unsuccessfully.
#[derive(Debug, Clone)]
pub struct ExecFailure {
    /// The command line, space separated.
    pub command: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard error.
    pub stderr: String,
}

impl fmt::Display for ExecFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "`{}` exited with code {code}", self.command)?,
            None => write!(f, "`{}` was terminated by a signal", self.command)?,
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {stderr}")?;
        }
        Ok(())
    }
}

/// Errors produced by deskvm.
#[derive(Debug, Error)]
pub enum Error {
    /// A transient condition worth waiting out.
    #[error("{0}")]
    Retriable(String),

    /// A tree search found no matching node.
    #[error("search failed: {0}")]
    Search(String),

    /// A bounded retry loop gave up.
    #[error("{message} (timeout: {} seconds){}", .timeout.as_secs_f64(), last_error_suffix(.last_error))]
    Timeout {
        /// Message configured at the call site.
        message: String,
        /// Configured time budget.
        timeout: Duration,
        /// The last retriable error that was caught, if any.
        last_error: Option<String>,
    },

    /// A subprocess exited with a non-zero status.
    #[error("command failed: {0}")]
    Exec(ExecFailure),

    /// A call on the accessibility bus failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// An accessible node was used through a capability it does not have.
    #[error("{node} does not implement {capability}")]
    MissingCapability {
        /// Capability that was requested.
        capability: &'static str,
        /// Description of the node.
        node: String,
    },

    /// The remote side reported that an operation did not take effect.
    #[error("remote operation failed: {0}")]
    Remote(String),

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Every vsock port in the scanned range is taken.
    #[error("no free vsock port in range {min}..={max}")]
    NoFreePort {
        /// First port scanned.
        min: u32,
        /// Last port scanned.
        max: u32,
    },

    /// Malformed hypervisor XML.
    #[error("XML error: {0}")]
    Xml(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(": last error: {e}"))
        .unwrap_or_default()
}

impl Error {
    /// Creates a retriable error.
    #[must_use]
    pub fn retriable(msg: impl Into<String>) -> Self {
        Self::Retriable(msg.into())
    }

    /// Creates a search error.
    #[must_use]
    pub fn search(msg: impl Into<String>) -> Self {
        Self::Search(msg.into())
    }

    /// Creates an invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Creates a remote failure error.
    #[must_use]
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an XML error.
    #[must_use]
    pub fn xml(msg: impl ToString) -> Self {
        Self::Xml(msg.to_string())
    }

    /// Returns the retry classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Retriable(_) => ErrorKind::Retriable,
            Self::Search(_) => ErrorKind::Search,
            Self::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::Fatal,
        }
    }

    /// Returns the exit code if this is a subprocess failure.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exec(failure) => failure.code,
            _ => None,
        }
    }

    /// Returns the bus error kind if this is a bus failure.
    #[must_use]
    pub const fn bus_kind(&self) -> Option<BusErrorKind> {
        match self {
            Self::Bus(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Returns true if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
