//! Error types for repository lock operations.
//!
//! Errors are explicit and typed:
//!
//! - **Cancellation**: a queued request was withdrawn before it was granted
//! - **Busy**: a non-waiting acquisition found the key held or contended
//! - **Configuration**: a [`MutexConfig`](crate::config::MutexConfig) failed validation
//!
//! A release the bookkeeping cannot account for is a [`ContractViolation`],
//! handled by policy rather than returned to a caller.
//!
//! The lock never retries or logs acquisition failures on the caller's behalf;
//! [`Error::recoverability`] lets callers decide whether to try again.

use core::fmt;
use std::sync::Arc;

use crate::types::{LockMode, RequestId, ResourceKey};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request was cancelled while queued, or its token was already
    /// cancelled when the request was made.
    Cancelled,
    /// A non-waiting acquisition found the key busy.
    WouldBlock,
    /// Configuration failed validation.
    InvalidConfig,
}

impl ErrorKind {
    /// Returns the recoverability classification of this kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::WouldBlock => Recoverability::Transient,
            Self::Cancelled | Self::InvalidConfig => Recoverability::Permanent,
        }
    }

    /// Returns a short lowercase name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::WouldBlock => "would block",
            Self::InvalidConfig => "invalid config",
        }
    }
}

/// Classification of error recoverability for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// The same request will not succeed if repeated.
    Permanent,
}

impl Recoverability {
    /// Returns true if a fresh attempt may succeed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Diagnostic context for an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// The resource key involved.
    pub key: Option<ResourceKey>,
    /// The diagnostic label of the request.
    pub label: Option<String>,
    /// The request, if one had been registered.
    pub request_id: Option<RequestId>,
    /// The requested mode.
    pub mode: Option<LockMode>,
}

/// The main error type for repository lock operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    context: ErrorContext,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            context: ErrorContext {
                key: None,
                label: None,
                request_id: None,
                mode: None,
            },
        }
    }

    /// Creates a cancellation error for a request on `key`.
    #[must_use]
    pub fn cancelled(key: &ResourceKey, label: &str, mode: LockMode) -> Self {
        Self::new(ErrorKind::Cancelled)
            .with_message(format!("{mode} lock on {key} cancelled"))
            .with_context(ErrorContext {
                key: Some(key.clone()),
                label: Some(label.to_owned()),
                request_id: None,
                mode: Some(mode),
            })
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds structured context to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        self.context = ctx;
        self
    }

    /// Records the request id in the context.
    #[must_use]
    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.context.request_id = Some(id);
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the recoverability classification.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the error context.
    #[must_use]
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.name())?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(e: crate::config::ConfigError) -> Self {
        Self::new(ErrorKind::InvalidConfig)
            .with_message(e.to_string())
            .with_source(e)
    }
}

/// Error returned by the non-waiting acquire operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquireError {
    /// The key is held in a conflicting mode or has queued requests.
    WouldBlock,
}

impl fmt::Display for TryAcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "repository lock is busy"),
        }
    }
}

impl std::error::Error for TryAcquireError {}

impl From<TryAcquireError> for Error {
    fn from(e: TryAcquireError) -> Self {
        match e {
            TryAcquireError::WouldBlock => Self::new(ErrorKind::WouldBlock),
        }
    }
}

/// A release that the holder bookkeeping cannot account for.
///
/// Never surfaced as an [`Error`]; the configured
/// [`ViolationPolicy`](crate::config::ViolationPolicy) decides whether it
/// panics or is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractViolation {
    /// Mode the caller tried to release.
    pub released: LockMode,
    /// Holder count before the release.
    pub shared_count: usize,
    /// True if the key had an exclusive holder.
    pub exclusive_held: bool,
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "released {} lock not held (shared holders: {}, exclusive held: {})",
            self.released, self.shared_count, self.exclusive_held
        )
    }
}

impl std::error::Error for ContractViolation {}

/// A specialized Result type for repository lock operations.
pub type Result<T> = core::result::Result<T, Error>;
