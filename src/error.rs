//! Error types for blocktable.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// The result type used throughout blocktable.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for table building and reading.
///
/// `Error` is `Clone` so a [`TableBuilder`](crate::sstable::TableBuilder) can
/// latch the first failure and hand it back from every later call.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Data corruption was detected.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The requested key or block was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A feature is disabled or not supported by this build.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// An allocation on the read path could not be satisfied.
    #[error("Memory limit: {0}")]
    MemoryLimit(String),

    /// The object is in a state that does not allow the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A block checksum did not match its trailer.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The checksum stored in the block trailer.
        expected: u32,
        /// The checksum computed over the block bytes.
        actual: u32,
    },
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new not supported error.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Creates a new memory limit error.
    pub fn memory_limit(msg: impl Into<String>) -> Self {
        Error::MemoryLimit(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Returns true for any kind of detected data corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::ChecksumMismatch { .. })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}
