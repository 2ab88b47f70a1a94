//! Uploader writing batches into a spool directory.
//!
//! Every upload attempt that accepts at least one record or gap produces one JSON file in the
//! outbox, named `<priority>-<generation>-<first>-<last>.json`. A downstream shipper picks up
//! finished files. Files are written atomically, so partially written batches are never visible.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use recordqueue_storage::file::write_file_atomic;
use recordqueue_storage::{
    BoxedUploader, Error, Result, ScopedReservation, Uploader, UploaderFactory,
};
use recordqueue_types::{
    EncryptedRecord, Priority, RecordMetadata, SequenceInformation, UploadReason,
};
use serde::{Deserialize, Serialize};

use crate::config;

/// Record payload as written into a batch file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpoolPayload {
    /// UTF-8 payloads are written as strings.
    Text(String),
    /// Everything else is written as an array of bytes.
    Binary(Bytes),
}

impl From<Bytes> for SpoolPayload {
    fn from(payload: Bytes) -> Self {
        match std::str::from_utf8(&payload) {
            Ok(text) => SpoolPayload::Text(text.to_owned()),
            Err(_) => SpoolPayload::Binary(payload),
        }
    }
}

/// One entry of a batch file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SpoolItem {
    /// A stored record.
    Record {
        /// Sequence number of the record.
        sequence_number: u64,
        /// Metadata stored alongside the payload.
        metadata: RecordMetadata,
        /// The stored payload.
        payload: SpoolPayload,
    },
    /// A range of records that were lost.
    Gap {
        /// First lost sequence number.
        start: u64,
        /// Number of lost records.
        count: u64,
    },
}

/// Contents of a batch file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolBatch {
    /// Why the upload was started.
    pub reason: UploadReason,
    /// Priority of the queue the batch was read from.
    pub priority: Priority,
    /// Generation of the queue.
    pub generation_id: u64,
    /// Records and gaps in sequence order.
    pub items: Vec<SpoolItem>,
}

/// Returns the file name of a batch covering `first..=last`.
pub fn batch_file_name(priority: Priority, generation_id: u64, first: u64, last: u64) -> String {
    format!(
        "{}-{generation_id:016x}-{first}-{last}.json",
        priority.as_str().to_ascii_lowercase()
    )
}

/// Starts [`SpoolUploader`]s writing into one outbox directory.
#[derive(Debug, Clone)]
pub struct SpoolFactory {
    outbox: PathBuf,
    failure_rate: f64,
    max_batch_records: Option<usize>,
}

impl SpoolFactory {
    /// Creates a factory writing into `outbox`.
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
            failure_rate: 0.0,
            max_batch_records: None,
        }
    }

    /// Makes the given fraction of uploads fail with a retryable error.
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    /// Limits the number of records accepted into a single batch.
    pub fn with_max_batch_records(mut self, max_batch_records: Option<usize>) -> Self {
        self.max_batch_records = max_batch_records;
        self
    }

    /// Returns the outbox directory.
    pub fn outbox(&self) -> &Path {
        &self.outbox
    }
}

impl From<&config::Spool> for SpoolFactory {
    fn from(config: &config::Spool) -> Self {
        SpoolFactory::new(&config.outbox)
            .with_failure_rate(config.failure_rate)
            .with_max_batch_records(config.max_batch_records)
    }
}

#[async_trait::async_trait]
impl UploaderFactory for SpoolFactory {
    async fn start_uploader(&self, reason: UploadReason) -> Result<BoxedUploader> {
        tokio::fs::create_dir_all(&self.outbox).await?;

        Ok(Box::new(SpoolUploader {
            outbox: self.outbox.clone(),
            reason,
            fail: self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate,
            remaining: self.max_batch_records,
            batch: None,
            range: None,
            reservations: Vec::new(),
        }))
    }
}

/// Collects the records of one upload attempt and writes them as one batch file.
///
/// Payloads stay accounted in the memory budget until the batch is written.
#[derive(Debug)]
pub struct SpoolUploader {
    outbox: PathBuf,
    reason: UploadReason,
    fail: bool,
    remaining: Option<usize>,
    batch: Option<SpoolBatch>,
    range: Option<(u64, u64)>,
    reservations: Vec<ScopedReservation>,
}

impl SpoolUploader {
    fn push(&mut self, info: SequenceInformation, last: u64, item: SpoolItem) {
        let batch = self.batch.get_or_insert_with(|| SpoolBatch {
            reason: self.reason,
            priority: info.priority,
            generation_id: info.generation_id,
            items: Vec::new(),
        });
        batch.items.push(item);

        let first = self.range.map_or(info.sequence_number, |(first, _)| first);
        self.range = Some((first, last));
    }
}

#[async_trait::async_trait]
impl Uploader for SpoolUploader {
    async fn process_record(
        &mut self,
        record: EncryptedRecord,
        reservation: ScopedReservation,
    ) -> bool {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return false;
            }
            *remaining -= 1;
        }

        let info = record.sequence_information;
        let item = SpoolItem::Record {
            sequence_number: info.sequence_number,
            metadata: record.metadata,
            payload: record.payload.into(),
        };
        self.push(info, info.sequence_number, item);
        self.reservations.push(reservation);
        true
    }

    async fn process_gap(&mut self, start: SequenceInformation, count: u64) -> bool {
        tracing::warn!(
            priority = %start.priority,
            start = start.sequence_number,
            count,
            "Spooling gap of lost records"
        );

        let item = SpoolItem::Gap {
            start: start.sequence_number,
            count,
        };
        let last = start.sequence_number + count.saturating_sub(1);
        self.push(start, last, item);
        true
    }

    async fn completed(self: Box<Self>, status: Result<()>) -> Result<()> {
        if let Err(ref err) = status {
            tracing::debug!(
                error = err as &dyn std::error::Error,
                "Upload ended early, spooling accepted records"
            );
        }

        if self.fail {
            return Err(Error::UploadFailed("simulated spool failure".into()));
        }

        let (Some(batch), Some((first, last))) = (self.batch, self.range) else {
            return Ok(());
        };

        let name = batch_file_name(batch.priority, batch.generation_id, first, last);
        let path = self.outbox.join(name);
        let contents = serde_json::to_vec_pretty(&batch).map_err(|cause| Error::Serde {
            context: "spool batch".into(),
            cause,
        })?;
        write_file_atomic(&path, &contents).await?;

        tracing::info!(
            path = %path.display(),
            priority = %batch.priority,
            items = batch.items.len(),
            "Spooled batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(sequence_number: u64) -> SequenceInformation {
        SequenceInformation {
            priority: Priority::FastBatch,
            generation_id: 0xabc,
            sequence_number,
        }
    }

    fn record(sequence_number: u64, payload: &'static [u8]) -> EncryptedRecord {
        EncryptedRecord {
            sequence_information: info(sequence_number),
            metadata: RecordMetadata::default(),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn names_batches_by_range() {
        assert_eq!(
            batch_file_name(Priority::SlowBatch, 0xabc, 3, 9),
            "slow_batch-0000000000000abc-3-9.json"
        );
    }

    #[test]
    fn binary_payloads_stay_bytes() {
        assert_eq!(
            SpoolPayload::from(Bytes::from_static(b"text")),
            SpoolPayload::Text("text".into())
        );
        assert!(matches!(
            SpoolPayload::from(Bytes::from_static(b"\xff\xfe")),
            SpoolPayload::Binary(_)
        ));
    }

    #[tokio::test]
    async fn writes_records_and_gaps() {
        let tempdir = tempfile::tempdir().unwrap();
        let factory = SpoolFactory::new(tempdir.path().join("outbox"));

        let mut uploader = factory.start_uploader(UploadReason::Manual).await.unwrap();
        assert!(uploader.process_gap(info(4), 2).await);
        assert!(
            uploader
                .process_record(record(6, b"hello"), ScopedReservation::empty())
                .await
        );
        uploader.completed(Ok(())).await.unwrap();

        let path = factory
            .outbox()
            .join(batch_file_name(Priority::FastBatch, 0xabc, 4, 6));
        let batch: SpoolBatch =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();

        assert_eq!(batch.reason, UploadReason::Manual);
        assert_eq!(
            batch.items,
            vec![
                SpoolItem::Gap { start: 4, count: 2 },
                SpoolItem::Record {
                    sequence_number: 6,
                    metadata: RecordMetadata::default(),
                    payload: SpoolPayload::Text("hello".into()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn empty_attempt_writes_nothing() {
        let tempdir = tempfile::tempdir().unwrap();
        let factory = SpoolFactory::new(tempdir.path());

        let uploader = factory.start_uploader(UploadReason::Periodic).await.unwrap();
        uploader.completed(Ok(())).await.unwrap();

        let mut entries = tokio::fs::read_dir(tempdir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stops_at_batch_limit() {
        let tempdir = tempfile::tempdir().unwrap();
        let factory = SpoolFactory::new(tempdir.path()).with_max_batch_records(Some(1));

        let mut uploader = factory.start_uploader(UploadReason::Manual).await.unwrap();
        assert!(
            uploader
                .process_record(record(0, b"a"), ScopedReservation::empty())
                .await
        );
        assert!(
            !uploader
                .process_record(record(1, b"b"), ScopedReservation::empty())
                .await
        );
    }

    #[tokio::test]
    async fn simulated_failure_is_retryable() {
        let tempdir = tempfile::tempdir().unwrap();
        let factory = SpoolFactory::new(tempdir.path()).with_failure_rate(1.0);

        let mut uploader = factory.start_uploader(UploadReason::Manual).await.unwrap();
        uploader
            .process_record(record(0, b"a"), ScopedReservation::empty())
            .await;
        let err = uploader.completed(Ok(())).await.unwrap_err();

        assert!(matches!(err, Error::UploadFailed(_)));
        assert!(err.is_retryable());
        let path = tempdir
            .path()
            .join(batch_file_name(Priority::FastBatch, 0xabc, 0, 0));
        assert!(!path.exists());
    }
}
