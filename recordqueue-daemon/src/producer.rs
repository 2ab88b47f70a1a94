//! Feeds records read as JSON lines into the storage.
//!
//! Every line holds one record:
//!
//! ```json
//! {"priority": "fast_batch", "data": "payload", "flush": false}
//! ```
//!
//! `flush` is optional and uploads the queue right after the write. Malformed lines and rejected
//! writes are logged and skipped.

use anyhow::Result;
use recordqueue_storage::{Error, Storage};
use recordqueue_types::{Priority, RecordMetadata};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Deserialize)]
struct Line {
    priority: String,
    data: String,
    #[serde(default)]
    flush: bool,
}

/// Counts of what happened to the lines read by [`produce`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProduceSummary {
    /// Records stored.
    pub written: usize,
    /// Lines that could not be parsed.
    pub malformed: usize,
    /// Records the storage refused.
    pub rejected: usize,
}

/// Writes every line of `reader` into `storage` until the input ends.
///
/// Only fails if reading the input fails or the storage has shut down.
pub async fn produce<R>(storage: &Storage, reader: R) -> Result<ProduceSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = ProduceSummary::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str::<Line>(line)
            .map_err(anyhow::Error::from)
            .and_then(|line| {
                let priority: Priority = line.priority.parse()?;
                Ok((priority, line))
            });
        let (priority, line) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed line");
                summary.malformed += 1;
                continue;
            }
        };

        match storage
            .write(priority, line.data.into(), RecordMetadata::now())
            .await
        {
            Ok(info) => {
                tracing::debug!(%info, "Record written");
                summary.written += 1;
            }
            Err(Error::ShutDown) => return Err(Error::ShutDown.into()),
            Err(err) => {
                tracing::warn!(
                    %priority,
                    error = &err as &dyn std::error::Error,
                    "Record rejected"
                );
                summary.rejected += 1;
                continue;
            }
        }

        if line.flush {
            storage.flush(priority)?;
        }
    }

    tracing::info!(
        written = summary.written,
        malformed = summary.malformed,
        rejected = summary.rejected,
        "Input exhausted"
    );
    Ok(summary)
}
