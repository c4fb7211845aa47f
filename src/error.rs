//! Error types for the fetchpool library.

use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur while scheduling, transferring, or caching work.
///
/// The type is `Clone` so a single failure can be delivered to every caller
/// waiting on the same in-flight request.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The transport answered with a status the request did not expect.
    #[error("Transport error: unexpected status {status}")]
    Transport {
        /// Status code returned by the transport.
        status: u16,
    },

    /// A stop was observed before the work completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The deadline elapsed before the operation settled.
    #[error("Operation timed out")]
    Timeout,

    /// Cache or store miss with no fetch fallback available.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Data could not be decoded into the expected shape.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// More data arrived than the transfer declared.
    #[error("Protocol violation: expected {expected} bytes, received {received}")]
    ProtocolViolation {
        /// Declared size of the transfer.
        expected: u64,
        /// Bytes received including the offending chunk.
        received: u64,
    },

    /// The body ended before the declared size was reached.
    #[error("Transfer truncated: expected {expected} bytes, received {received}")]
    Truncated {
        /// Declared size of the transfer.
        expected: u64,
        /// Bytes received before the body ended.
        received: u64,
    },

    /// I/O error from the blob store or configuration files.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Configuration could not be parsed or written.
    #[error("Config error: {0}")]
    Config(String),

    /// Work item failed for a reason not covered above.
    #[error("Download failed: {0}")]
    Download(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        err.status().map_or_else(
            || Self::Http(err.to_string()),
            |status| Self::Transport {
                status: status.as_u16(),
            },
        )
    }
}

impl Error {
    /// Returns true if this error represents a cooperative cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A specialized `Result` type for fetchpool operations.
pub type Result<T> = std::result::Result<T, Error>;
