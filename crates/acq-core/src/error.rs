//! Error types for the acquisition core.
//!
//! `AcqError` is the one error type every driver, the session and the
//! decoder return. Its variants follow the acquisition error taxonomy rather
//! than the error sources, so a caller can decide what to do from the kind
//! alone:
//!
//! - **`Arg`**: invalid or missing parameter, unknown channel index, device
//!   already owned by another session.
//! - **`NotApplicable`**: the driver does not support this key or operation.
//!   Generic code that walks capabilities must treat this as "skip", never as
//!   a failure. Use [`AcqError::is_not_applicable`] to test for it.
//! - **`DeviceClosed`**: the operation needs an active device instance.
//! - **`Io`**: transport read/write failure. During acquisition this stops the
//!   affected device only.
//! - **`Malloc`**: allocation failure reported by a transport or buffer.
//! - **`Bug`**: an internal invariant was violated (for example a packet sent
//!   for a device that belongs to no session). Unrecoverable for that call.
//! - **`Decode`**: checksum or sync failure on one frame; the streaming
//!   decoder recovers from these locally.

use thiserror::Error;

/// Convenience alias for results using the acquisition error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Copyable classification of an [`AcqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Generic,
    Arg,
    NotApplicable,
    DeviceClosed,
    Io,
    Malloc,
    Bug,
    Decode,
    Timeout,
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Generic => "generic",
            ErrorKind::Arg => "argument",
            ErrorKind::NotApplicable => "not_applicable",
            ErrorKind::DeviceClosed => "device_closed",
            ErrorKind::Io => "io",
            ErrorKind::Malloc => "malloc",
            ErrorKind::Bug => "bug",
            ErrorKind::Decode => "decode",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type of the acquisition core.
#[derive(Error, Debug)]
pub enum AcqError {
    /// Unspecified failure.
    #[error("{0}")]
    Generic(String),

    /// Invalid or missing argument.
    ///
    /// **Recovery Strategy**: fix the call; retrying with the same input
    /// fails the same way.
    #[error("Invalid argument: {0}")]
    Arg(String),

    /// Operation or configuration key not supported by this driver.
    ///
    /// This is a probe answer, not a failure. Code iterating over keys or
    /// drivers should skip the entry and continue.
    #[error("Not applicable")]
    NotApplicable,

    /// The device instance is not active (not opened, or already closed).
    #[error("Device is closed")]
    DeviceClosed,

    /// Transport I/O failed.
    ///
    /// **Source**: wraps `std::io::Error` from descriptors, sockets and serial
    /// ports.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An allocation could not be satisfied.
    #[error("Allocation failed: {0}")]
    Malloc(String),

    /// Internal invariant violated.
    ///
    /// Distinct from user-triggerable errors: seeing one means the core or a
    /// driver broke its own contract.
    #[error("Internal error: {0}")]
    Bug(String),

    /// One frame failed sync or checksum validation.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Settings or config-file validation failed.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AcqError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcqError::Generic(_) => ErrorKind::Generic,
            AcqError::Arg(_) => ErrorKind::Arg,
            AcqError::NotApplicable => ErrorKind::NotApplicable,
            AcqError::DeviceClosed => ErrorKind::DeviceClosed,
            AcqError::Io(_) => ErrorKind::Io,
            AcqError::Malloc(_) => ErrorKind::Malloc,
            AcqError::Bug(_) => ErrorKind::Bug,
            AcqError::Decode(_) => ErrorKind::Decode,
            AcqError::Timeout(_) => ErrorKind::Timeout,
            AcqError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// True for the "unsupported here" probe answer.
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, AcqError::NotApplicable)
    }

    pub fn arg(message: impl Into<String>) -> Self {
        AcqError::Arg(message.into())
    }

    pub fn bug(message: impl Into<String>) -> Self {
        AcqError::Bug(message.into())
    }
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Configuration(err.to_string())
    }
}
