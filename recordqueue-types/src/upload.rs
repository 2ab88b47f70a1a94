//! Upload triggers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The reason an upload attempt was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadReason {
    /// Requested by an operator or the producer side.
    Manual,
    /// An encryption key has been delivered.
    KeyDelivery,
    /// The periodic timer of the queue fired.
    Periodic,
    /// A flush was requested, or the queue uploads after every write.
    ImmediateFlush,
    /// Retry after a failed upload.
    FailureRetry,
    /// Continuation of an upload that stopped before the queue was drained.
    IncompleteRetry,
    /// Backlog found while recovering the queue at startup.
    InitResume,
}

impl UploadReason {
    /// Returns the canonical upper-case name of this reason.
    pub fn as_str(self) -> &'static str {
        match self {
            UploadReason::Manual => "MANUAL",
            UploadReason::KeyDelivery => "KEY_DELIVERY",
            UploadReason::Periodic => "PERIODIC",
            UploadReason::ImmediateFlush => "IMMEDIATE_FLUSH",
            UploadReason::FailureRetry => "FAILURE_RETRY",
            UploadReason::IncompleteRetry => "INCOMPLETE_RETRY",
            UploadReason::InitResume => "INIT_RESUME",
        }
    }
}

impl fmt::Display for UploadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
