//! Shared data model of the record queue.
//!
//! These types are used by the storage engine, by uploaders that consume records from it, and by
//! the daemon that exposes it to producers:
//!
//!  - [`Priority`](priority::Priority) selects the queue a record lands in
//!  - [`SequenceInformation`](record::SequenceInformation) identifies a stored record
//!  - [`EncryptedRecord`](record::EncryptedRecord) is what uploaders receive
//!  - [`UploadReason`](upload::UploadReason) explains why an upload was started
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod priority;
pub mod record;
pub mod upload;

pub use priority::Priority;
pub use record::{
    CompressionAlgorithm, CompressionInformation, EncryptedRecord, EncryptionInformation,
    RecordMetadata, SequenceInformation,
};
pub use upload::UploadReason;
