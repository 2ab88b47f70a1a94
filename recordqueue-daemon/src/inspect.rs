//! Read-only inspection of queue directories.

use std::fmt;
use std::ops::Range;

use anyhow::Result;
use recordqueue_storage::segment::{self, ScanReport, Tail};
use recordqueue_storage::{QueueMeta, StorageOptions, read_meta};
use recordqueue_types::Priority;

/// What is stored on disk for one queue.
#[derive(Debug)]
pub struct QueueReport {
    /// The priority served by the queue.
    pub priority: Priority,
    /// Contents of the metadata file, if it exists and is valid.
    pub meta: Option<QueueMeta>,
    /// Segment files of the queue.
    pub scan: ScanReport,
}

impl QueueReport {
    /// Returns the total size of all segment files.
    pub fn disk_bytes(&self) -> u64 {
        self.scan.segments.iter().map(|segment| segment.size).sum()
    }

    /// Returns the sequence numbers held on disk that are not confirmed yet.
    pub fn unconfirmed(&self) -> Range<u64> {
        let end = self.scan.next_sequence_number.unwrap_or(0);
        let start = self.meta.map_or(0, |meta| meta.first_unconfirmed);
        start.min(end)..end
    }
}

impl fmt::Display for QueueReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.meta {
            Some(meta) => writeln!(
                f,
                "{}: generation {:016x}, first unconfirmed {}",
                self.priority, meta.generation_id, meta.first_unconfirmed
            )?,
            None => writeln!(f, "{}: no metadata", self.priority)?,
        }

        let unconfirmed = self.unconfirmed();
        writeln!(
            f,
            "  {} segment(s), {} bytes, unconfirmed {}..{}",
            self.scan.segments.len(),
            self.disk_bytes(),
            unconfirmed.start,
            unconfirmed.end
        )?;

        for info in &self.scan.segments {
            let range = info.first_sequence_number..info.first_sequence_number + info.record_count;
            write!(
                f,
                "  {} [{}..{}) {} bytes",
                info.path.display(),
                range.start,
                range.end,
                info.size
            )?;
            if info.overlapping {
                write!(f, ", overlapping")?;
            }
            match info.tail {
                Tail::Clean => {}
                Tail::Partial { dropped } => write!(f, ", partial tail of {dropped} bytes")?,
                Tail::Corrupted { dropped, reason } => {
                    write!(f, ", corrupted tail of {dropped} bytes ({reason})")?
                }
            }
            writeln!(f)?;
        }

        for gap in &self.scan.gaps {
            writeln!(f, "  gap [{}..{})", gap.start, gap.end)?;
        }
        Ok(())
    }
}

/// Scans the directories of all configured queues without modifying them.
///
/// Queues whose directory does not exist yet are skipped.
pub async fn inspect(options: &StorageOptions) -> Result<Vec<QueueReport>> {
    let mut reports = Vec::new();

    for (priority, queue_options) in options.produce_queues_options() {
        let directory = queue_options.directory();
        if !tokio::fs::try_exists(&directory).await? {
            tracing::debug!(%priority, directory = %directory.display(), "Queue directory missing");
            continue;
        }

        let prefix = queue_options.file_prefix();
        let meta = read_meta(&directory, prefix).await?;
        let scan = segment::scan_directory(&directory, prefix).await?;
        reports.push(QueueReport {
            priority,
            meta,
            scan,
        });
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use recordqueue_storage::StorageQueue;
    use recordqueue_types::RecordMetadata;

    use super::*;
    use crate::spool::SpoolFactory;

    #[tokio::test]
    async fn reports_stored_queues() {
        let tempdir = tempfile::tempdir().unwrap();
        let options = StorageOptions::new(tempdir.path());

        let (priority, queue_options) = options
            .produce_queues_options()
            .into_iter()
            .find(|(priority, _)| *priority == Priority::ManualBatch)
            .unwrap();
        let queue = StorageQueue::create(
            priority,
            queue_options,
            Arc::new(SpoolFactory::new(tempdir.path().join("outbox"))),
        )
        .await
        .unwrap();
        for payload in ["a", "b", "c"] {
            queue
                .write(payload.into(), RecordMetadata::default())
                .await
                .unwrap();
        }
        let info = queue
            .write("d".into(), RecordMetadata::default())
            .await
            .unwrap();
        queue
            .confirm(recordqueue_types::SequenceInformation {
                sequence_number: 0,
                ..info
            })
            .await
            .unwrap();
        queue.shutdown().await;

        let reports = inspect(&options).await.unwrap();
        assert_eq!(reports.len(), 1);

        let report = &reports[0];
        assert_eq!(report.priority, Priority::ManualBatch);
        assert_eq!(report.meta.unwrap().generation_id, info.generation_id);
        assert_eq!(report.unconfirmed(), 1..4);
        assert!(report.scan.gaps.is_empty());

        let printed = report.to_string();
        assert!(printed.contains("MANUAL_BATCH"));
        assert!(printed.contains("unconfirmed 1..4"));
    }

    #[tokio::test]
    async fn skips_missing_directories() {
        let tempdir = tempfile::tempdir().unwrap();
        let options = StorageOptions::new(tempdir.path().join("nothing"));

        let reports = inspect(&options).await.unwrap();
        assert!(reports.is_empty());
    }

    #[test]
    fn unconfirmed_without_meta_starts_at_zero() {
        let report = QueueReport {
            priority: Priority::Security,
            meta: None,
            scan: ScanReport {
                next_sequence_number: Some(5),
                ..Default::default()
            },
        };
        assert_eq!(report.unconfirmed(), 0..5);
    }
}
