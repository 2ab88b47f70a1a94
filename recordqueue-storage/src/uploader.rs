//! The contract between a queue and the component delivering its records.
//!
//! For every upload attempt the queue asks the [`UploaderFactory`] for a fresh [`Uploader`] and
//! drives it through a fixed sequence of calls: any number of [`process_record`] and
//! [`process_gap`] calls in strictly increasing sequence order, followed by exactly one call to
//! [`completed`]. Since `completed` consumes the uploader, no further calls can follow it.
//!
//! [`process_record`]: Uploader::process_record
//! [`process_gap`]: Uploader::process_gap
//! [`completed`]: Uploader::completed

use std::fmt::Debug;
use std::sync::Arc;

use recordqueue_types::{EncryptedRecord, SequenceInformation, UploadReason};

use crate::error::Result;
use crate::resources::ScopedReservation;

/// Receives the records of a single upload attempt.
#[async_trait::async_trait]
pub trait Uploader: Send + 'static {
    /// Handles the next record.
    ///
    /// `reservation` accounts for the memory occupied by the record and should be kept for as
    /// long as the record is held. Return `false` to stop the attempt after this record.
    async fn process_record(
        &mut self,
        record: EncryptedRecord,
        reservation: ScopedReservation,
    ) -> bool;

    /// Handles `count` sequence numbers starting at `start` that the queue cannot produce.
    ///
    /// Return `false` to stop the attempt after this gap.
    async fn process_gap(&mut self, start: SequenceInformation, count: u64) -> bool;

    /// Ends the attempt.
    ///
    /// `status` describes how supplying records ended on the queue side. The returned result is
    /// the outcome of the attempt: on `Ok`, everything that was accepted by `process_record` and
    /// `process_gap` is considered delivered.
    async fn completed(self: Box<Self>, status: Result<()>) -> Result<()>;
}

/// Type-erased [`Uploader`].
pub type BoxedUploader = Box<dyn Uploader>;

/// Creates an [`Uploader`] for every upload attempt.
#[async_trait::async_trait]
pub trait UploaderFactory: Debug + Send + Sync + 'static {
    /// Starts a new upload attempt for the given reason.
    async fn start_uploader(&self, reason: UploadReason) -> Result<BoxedUploader>;
}

/// Shared [`UploaderFactory`] used by all queues of a storage.
pub type SharedUploaderFactory = Arc<dyn UploaderFactory>;
