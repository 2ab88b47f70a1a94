use std::path::PathBuf;
use std::time::Duration;

use recordqueue_types::Priority;
use thiserror::Error;

/// Errors that can occur in the record storage.
#[derive(Debug, Error)]
pub enum Error {
    /// A resource budget could not grant a reservation.
    ///
    /// Nothing has been written, the caller may retry later.
    #[error("{0} budget exhausted")]
    ResourceExhausted(&'static str),

    /// No queue is configured for the requested priority.
    #[error("no queue configured for priority {0}")]
    NotFound(Priority),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A segment file contains invalid framing.
    #[error("corrupted segment {path:?} at offset {offset}: {reason}")]
    Corruption {
        /// The affected segment file.
        path: PathBuf,
        /// Offset of the first invalid byte.
        offset: u64,
        /// What failed to validate.
        reason: &'static str,
    },

    /// The uploader failed, the upload will be retried.
    #[error("upload failed: {0}")]
    UploadFailed(String),

    /// The uploader rejected the upload and asked not to retry.
    #[error("upload rejected: {0}")]
    UploadRejected(String),

    /// The upload did not complete within the configured timeout.
    #[error("upload timed out after {0:?}")]
    Timeout(Duration),

    /// The storage or queue options are inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O errors related to segment and metadata files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors related to de/serialization of record metadata.
    #[error("serde error: {context}")]
    Serde {
        /// What was being de/serialized.
        context: String,
        /// The underlying error.
        #[source]
        cause: serde_json::Error,
    },

    /// The storage has been shut down.
    #[error("storage has been shut down")]
    ShutDown,
}

impl Error {
    /// Returns `true` if an upload that failed with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::UploadRejected(_)
                | Error::InvalidArgument(_)
                | Error::Configuration(_)
                | Error::NotFound(_)
                | Error::ShutDown
        )
    }
}

/// Result type for storage operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::UploadFailed("connection reset".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::ResourceExhausted("memory").is_retryable());
        assert!(!Error::UploadRejected("bad request".into()).is_retryable());
        assert!(!Error::ShutDown.is_retryable());
    }
}
