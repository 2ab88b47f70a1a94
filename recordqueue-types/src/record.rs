//! Stored records and their identifiers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::priority::Priority;

/// Identifies a record within the queue of its priority.
///
/// `sequence_number` grows strictly within one `generation_id`. A new generation is minted
/// whenever the on-disk state of a queue is recreated from scratch, so a sequence number is only
/// meaningful together with the generation it was issued in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceInformation {
    /// The priority of the queue that issued the sequence number.
    pub priority: Priority,
    /// Random tag of the sequence number space.
    pub generation_id: u64,
    /// Position of the record in its queue.
    pub sequence_number: u64,
}

impl fmt::Display for SequenceInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:016x}/{}",
            self.priority, self.generation_id, self.sequence_number
        )
    }
}

/// Compression algorithms applied to record payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// The payload is stored as-is.
    #[default]
    None,
    /// The payload is zstd-compressed.
    Zstd,
}

/// Describes how a payload has been compressed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionInformation {
    /// The algorithm that was applied.
    pub algorithm: CompressionAlgorithm,
    /// Size of the payload before compression.
    pub uncompressed_size: u64,
}

/// Describes how a payload has been encrypted.
///
/// The contents are produced by the encryption collaborator and are not interpreted by the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInformation {
    /// Identifier of the public key the record key was wrapped with.
    pub public_key_id: u64,
    /// The wrapped record key.
    pub encrypted_key: Bytes,
}

/// Per-record metadata stored next to the payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Time the record was produced, in microseconds since the Unix epoch.
    pub timestamp_us: i64,
    /// Present if the payload is compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionInformation>,
    /// Present if the payload is encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionInformation>,
}

impl RecordMetadata {
    /// Creates metadata stamped with the current wall clock time.
    pub fn now() -> Self {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as i64)
            .unwrap_or_default();

        Self {
            timestamp_us,
            ..Default::default()
        }
    }
}

/// A record as handed to an uploader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedRecord {
    /// Where the record is stored.
    pub sequence_information: SequenceInformation,
    /// Compression and encryption descriptors of `payload`.
    pub metadata: RecordMetadata,
    /// The opaque payload bytes.
    pub payload: Bytes,
}
