//! # deskvm-retry
//!
//! Bounded-time polling for operations whose result depends on slow-moving
//! external state (a booting VM, a bus socket that appears lazily, a widget
//! that is rendered after some asynchronous GUI work).
//!
//! One primitive, [`RetryPolicy::run`], and two thin surfaces over it:
//!
//! - [`retry`]: call a closure right away, retrying [`ErrorKind::Retriable`]
//!   failures.
//! - [`retryable`]: build a policy for arbitrary error kinds and wrap a
//!   closure with [`RetryPolicy::wrap`] to call it later.
//!
//! The loop only bounds elapsed wall-clock time. It sleeps exactly
//! `interval` between attempts, never backs off and never counts attempts.
//!
//! ```rust
//! use std::time::Duration;
//! use deskvm_error::Error;
//!
//! let mut attempts = 0;
//! let value = deskvm_retry::retry(
//!     || {
//!         attempts += 1;
//!         if attempts < 3 {
//!             return Err(Error::retriable("not yet"));
//!         }
//!         Ok(attempts)
//!     },
//!     Duration::from_secs(5),
//!     Duration::from_millis(1),
//! )
//! .unwrap();
//! assert_eq!(value, 3);
//! ```

use std::time::{Duration, Instant};

use deskvm_error::{Error, ErrorKind, Result};
use tracing::debug;

/// Error kinds retried by [`retry`].
pub const RETRIABLE: &[ErrorKind] = &[ErrorKind::Retriable];

/// Error kinds retried by tree searches that opted into retrying.
pub const SEARCH: &[ErrorKind] = &[ErrorKind::Search];

/// Parameters of one bounded polling loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total time budget measured from the first attempt.
    pub timeout: Duration,
    /// Sleep between attempts.
    pub interval: Duration,
    /// Error kinds that trigger another attempt.
    pub retriable: &'static [ErrorKind],
    /// Prefix of the [`Error::Timeout`] message.
    pub error_message: String,
}

impl RetryPolicy {
    /// Creates a policy retrying [`ErrorKind::Retriable`] errors.
    #[must_use]
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            retriable: RETRIABLE,
            error_message: String::new(),
        }
    }

    /// Sets the error kinds that trigger another attempt.
    #[must_use]
    pub fn retry_on(mut self, kinds: &'static [ErrorKind]) -> Self {
        self.retriable = kinds;
        self
    }

    /// Sets the message embedded in the timeout error.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Returns true if `err` should be retried under this policy.
    #[must_use]
    pub fn is_retriable(&self, err: &Error) -> bool {
        self.retriable.contains(&err.kind())
    }

    /// Invokes `op` until it succeeds, fails with a non-retriable error, or
    /// the time budget is spent.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let start = Instant::now();
        let mut last_error = None;

        while start.elapsed() < self.timeout {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if self.is_retriable(&e) => {
                    debug!(error = %e, "Retrying");
                    last_error = Some(e.to_string());
                    std::thread::sleep(self.interval);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Timeout {
            message: self.error_message.clone(),
            timeout: self.timeout,
            last_error,
        })
    }

    /// Wraps `op` so that every call of the returned closure runs under
    /// this policy.
    pub fn wrap<T, F>(self, mut op: F) -> impl FnMut() -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        move || self.run(&mut op)
    }
}

/// Retries `op` on [`ErrorKind::Retriable`] errors for at most `timeout`.
pub fn retry<T, F>(op: F, timeout: Duration, interval: Duration) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    RetryPolicy::new(timeout, interval).run(op)
}

/// Like [`retry`], with a message for the timeout error.
pub fn retry_with_message<T, F>(
    op: F,
    timeout: Duration,
    interval: Duration,
    message: impl Into<String>,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    RetryPolicy::new(timeout, interval)
        .with_message(message)
        .run(op)
}

/// Builds a policy retrying the given error kinds.
#[must_use]
pub fn retryable(
    timeout: Duration,
    interval: Duration,
    kinds: &'static [ErrorKind],
) -> RetryPolicy {
    RetryPolicy::new(timeout, interval).retry_on(kinds)
}
