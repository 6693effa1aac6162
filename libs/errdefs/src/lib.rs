//! Tagged error kinds for the virtual kubelet.
//!
//! Every error the agent produces or observes carries an [`ErrorKind`], and
//! the kind alone decides what happens next: retry with backoff, record on
//! the workload and stop, or shut the process down.
//!
//! # Invariants
//!
//! - Classification is by tag, never by message text.
//! - Wrapping preserves the kind of the innermost tagged error: [`kind_of`]
//!   walks the `source()` chain and reports the deepest [`Error`] it finds.
//! - Errors with no tag anywhere in their chain classify as
//!   [`ErrorKind::Transient`].

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error used as a cause.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias used across the agent.
pub type Result<T, E = Error> = std::result::Result<T, E>;

// =============================================================================
// Kinds
// =============================================================================

/// The closed set of error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The referenced object does not exist.
    NotFound,

    /// A create collided with an existing object.
    AlreadyExists,

    /// A write lost an optimistic-concurrency race.
    Conflict,

    /// The request was malformed or semantically invalid.
    InvalidInput,

    /// The provider cannot perform this operation in principle.
    Unsupported,

    /// Authentication against the control plane failed.
    Unauthorized,

    /// Authorization against the control plane failed.
    Forbidden,

    /// Network or rate-limit style failure.
    Transient,

    /// A deadline elapsed before the operation completed.
    Timeout,

    /// The operation was cancelled by its supervisor.
    Cancelled,

    /// The process cannot continue correctly.
    Fatal,
}

impl ErrorKind {
    /// Machine-readable tag, used as the `Reason` on workload conditions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::Conflict => "Conflict",
            Self::InvalidInput => "InvalidInput",
            Self::Unsupported => "Unsupported",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::Transient => "Transient",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Fatal => "Fatal",
        }
    }

    /// Whether work failing with this kind should be retried with backoff.
    ///
    /// Credentials may be rotated out of band, so auth failures retry too.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists
                | Self::Conflict
                | Self::Unauthorized
                | Self::Forbidden
                | Self::Transient
                | Self::Timeout
        )
    }

    /// Whether failures of this kind are recorded on the workload and dropped.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidInput | Self::Unsupported)
    }

    /// Process exit code used when an error of this kind ends the agent.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled => 0,
            Self::Fatal => 1,
            Self::InvalidInput => 2,
            Self::Unauthorized | Self::Forbidden => 3,
            Self::Unsupported => 4,
            Self::NotFound => 5,
            Self::Transient | Self::Timeout | Self::Conflict | Self::AlreadyExists => 6,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Error
// =============================================================================

/// A tagged error with an optional cause.
///
/// `Display` prints this layer only; the cause is exposed through `source()`.
/// Use [`Error::report`] for the whole chain on one line.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    retry_after: Option<Duration>,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            source: None,
        }
    }

    /// Wrap `source` with context, inheriting its kind.
    pub fn wrap(source: impl Into<BoxError>, message: impl Into<String>) -> Self {
        let source = source.into();
        let kind = kind_of(source.as_ref());
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            source: Some(source),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorKind::Timeout, format!("deadline of {after:?} exceeded"))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Attach a cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attach a server-suggested client delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// The kind of the innermost tagged error in this chain.
    pub fn kind(&self) -> ErrorKind {
        match &self.source {
            Some(source) => deepest_kind(source.as_ref()).unwrap_or(self.kind),
            None => self.kind,
        }
    }

    /// Shorthand for `self.kind() == kind`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// The message of this layer, without causes.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// This error and every cause, joined with `": "`.
    pub fn report(&self) -> Report<'_> {
        Report(self)
    }

    /// The first server-suggested delay found walking outer to inner.
    pub fn retry_after(&self) -> Option<Duration> {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(err) = current {
            if let Some(delay) = tagged(err).and_then(|e| e.retry_after) {
                return Some(delay);
            }
            current = err.source();
        }
        None
    }
}

/// Single-line rendering of an error chain, for logs and status messages.
pub struct Report<'a>(&'a Error);

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut current = self.0.source();
        while let Some(cause) = current {
            write!(f, ": {cause}")?;
            current = cause.source();
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                ErrorKind::InvalidInput
            }
            std::io::ErrorKind::PermissionDenied => ErrorKind::Forbidden,
            std::io::ErrorKind::Unsupported => ErrorKind::Unsupported,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::Transient,
        };
        Self::new(kind, "i/o error").with_source(err)
    }
}

// =============================================================================
// Classification
// =============================================================================

fn tagged<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a Error> {
    err.downcast_ref::<Error>()
        .or_else(|| err.downcast_ref::<Arc<Error>>().map(|arc| arc.as_ref()))
}

fn deepest_kind(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    let mut found = None;
    let mut current = Some(err);
    while let Some(err) = current {
        current = match tagged(err) {
            // An `Arc<Error>` forwards `source()` past the tagged layer.
            Some(e) => {
                found = Some(e.kind);
                e.source.as_deref().map(|s| s as &(dyn StdError + 'static))
            }
            None => err.source(),
        };
    }
    found
}

/// Classify any error by the innermost tag in its chain.
pub fn kind_of(err: &(dyn StdError + 'static)) -> ErrorKind {
    deepest_kind(err).unwrap_or(ErrorKind::Transient)
}
