//! The durable queue of a single priority.
//!
//! A [`StorageQueue`] owns the segment files of one priority. Writes are appended to the active
//! segment and receive strictly increasing sequence numbers. Upload attempts read the queue from
//! the first unconfirmed record onwards and hand records and gaps to an [`Uploader`] in sequence
//! order. Once an attempt completes successfully, the accepted prefix is confirmed and segment
//! files holding only confirmed records are deleted.
//!
//! At most one upload attempt is in flight per queue. Attempts are triggered by the periodic
//! timer, by writes on queues that upload after every write, by retries after failures, and
//! explicitly through [`StorageQueue::initiate_upload`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use bytes::Bytes;
use recordqueue_types::{
    EncryptedRecord, Priority, RecordMetadata, SequenceInformation, UploadReason,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::file;
use crate::meta::{self, QueueMeta};
use crate::options::QueueOptions;
use crate::resources::{ResourceBudget, ScopedReservation};
use crate::segment::{self, SegmentFile};
use crate::uploader::{SharedUploaderFactory, Uploader};

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// The priority served by the queue.
    pub priority: Priority,
    /// Current generation of the sequence number space.
    pub generation_id: u64,
    /// Lowest sequence number that has not been confirmed.
    pub first_unconfirmed: u64,
    /// Sequence number preceding `first_unconfirmed`, if any.
    pub last_confirmed: Option<u64>,
    /// Sequence number the next write will receive.
    pub next_sequence_number: u64,
    /// Number of segment files.
    pub segment_count: usize,
    /// Bytes held in segment files.
    pub disk_bytes: u64,
    /// `true` while an upload attempt is in flight.
    pub uploading: bool,
}

struct QueueState {
    generation_id: u64,
    segments: VecDeque<SegmentFile>,
    next_sequence_number: u64,
    first_unconfirmed: u64,
}

#[derive(Debug, Default)]
struct UploadSlot {
    next_attempt: u64,
    in_flight: Option<u64>,
    consecutive_failures: u32,
    retry: Option<JoinHandle<()>>,
}

struct QueueInner {
    priority: Priority,
    options: QueueOptions,
    factory: SharedUploaderFactory,
    state: Mutex<QueueState>,
    upload: StdMutex<UploadSlot>,
    uploading: watch::Sender<bool>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// What an upload attempt reads next.
enum NextItem {
    End,
    Gap {
        count: u64,
    },
    Record {
        metadata: RecordMetadata,
        payload: Bytes,
        reservation: ScopedReservation,
    },
}

/// How far an upload attempt got.
#[derive(Debug, Default)]
struct Progress {
    next: u64,
    last_accepted: Option<u64>,
    stopped: bool,
}

/// Durable, sequenced storage of the records of one priority.
#[derive(Clone)]
pub struct StorageQueue(Arc<QueueInner>);

impl fmt::Debug for StorageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageQueue")
            .field("priority", &self.0.priority)
            .field("directory", &self.0.options.directory())
            .field("file_prefix", &self.0.options.file_prefix())
            .finish_non_exhaustive()
    }
}

impl StorageQueue {
    /// Opens the queue in its directory and recovers the state left by a previous run.
    ///
    /// Recovered segment bytes are reserved in the disk budget. If the budget cannot hold them,
    /// the oldest segments are dropped and will be reported as a gap. The periodic timer is not
    /// started until [`start`](Self::start) is called.
    pub async fn create(
        priority: Priority,
        options: QueueOptions,
        factory: SharedUploaderFactory,
    ) -> Result<Self> {
        let directory = options.directory();
        let prefix = options.file_prefix().to_owned();
        tokio::fs::create_dir_all(&directory).await?;

        let temp_suffix = format!(".{}", file::TEMP_SUFFIX);
        file::delete_files_warn_if_failed(&directory, |name| {
            name.starts_with(prefix.as_str()) && name.ends_with(temp_suffix.as_str())
        })
        .await;

        let stored = meta::read_meta(&directory, &prefix).await?;
        let recovered = segment::recover_segments(&directory, &prefix).await?;
        for gap in &recovered.gaps {
            tracing::warn!(
                %priority,
                start = gap.start,
                end = gap.end,
                "Records lost while recovering queue"
            );
        }

        let mut segments = VecDeque::from(recovered.segments);
        let recovered_next = recovered.next_sequence_number.unwrap_or(0);
        let (generation_id, first_unconfirmed) = match stored {
            Some(stored) => (stored.generation_id, stored.first_unconfirmed),
            None => {
                let generation_id = rand::random::<u64>();
                let first = segments
                    .front()
                    .map_or(recovered_next, SegmentFile::first_sequence_number);
                if !segments.is_empty() {
                    tracing::warn!(
                        %priority,
                        generation = format_args!("{generation_id:016x}"),
                        "Queue metadata missing, starting a new generation"
                    );
                }
                (generation_id, first)
            }
        };
        let next_sequence_number = recovered_next.max(first_unconfirmed);

        let disk = options.disk_budget();
        truncate_confirmed(&mut segments, first_unconfirmed, None).await;

        let mut recovered_bytes: u64 = segments.iter().map(SegmentFile::size).sum();
        while !disk.try_reserve(recovered_bytes) {
            let Some(oldest) = segments.pop_front() else {
                break;
            };
            let range = oldest.sequence_range();
            match oldest.delete().await {
                Ok(freed) => recovered_bytes -= freed,
                Err(_) => return Err(Error::ResourceExhausted("disk")),
            }
            tracing::warn!(
                %priority,
                start = range.start,
                end = range.end,
                "Disk budget exhausted during recovery, evicted oldest segment"
            );
        }

        let meta = QueueMeta {
            generation_id,
            first_unconfirmed,
        };
        meta::write_meta(&directory, &prefix, &meta).await?;

        tracing::info!(
            %priority,
            generation = format_args!("{generation_id:016x}"),
            first_unconfirmed,
            next_sequence_number,
            segments = segments.len(),
            "Queue recovered"
        );

        let (uploading, _) = watch::channel(false);
        Ok(Self(Arc::new(QueueInner {
            priority,
            options,
            factory,
            state: Mutex::new(QueueState {
                generation_id,
                segments,
                next_sequence_number,
                first_unconfirmed,
            }),
            upload: StdMutex::new(UploadSlot::default()),
            uploading,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })))
    }

    /// Returns the priority served by this queue.
    pub fn priority(&self) -> Priority {
        self.0.priority
    }

    /// Returns the options of this queue.
    pub fn options(&self) -> &QueueOptions {
        &self.0.options
    }

    /// Starts the periodic upload timer.
    ///
    /// Queues without an upload period, or with a zero period, have no timer.
    pub fn start(&self) {
        let Some(period) = self.0.options.upload_period().filter(|p| !p.is_zero()) else {
            return;
        };

        let queue = Arc::downgrade(&self.0);
        let shutdown = self.0.shutdown.clone();
        self.0.tasks.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(queue) = Weak::upgrade(&queue).map(StorageQueue) else {
                    break;
                };
                if let Err(err) = queue.initiate_upload(UploadReason::Periodic) {
                    tracing::debug!(error = &err as &dyn std::error::Error, "Periodic upload skipped");
                }
            }
        });
    }

    /// Durably stores a record and returns its sequence information.
    ///
    /// Fails with [`Error::ResourceExhausted`] if the record does not fit into the memory or disk
    /// budget. Before giving up on the disk budget, sealed segments are evicted from the front of
    /// this queue.
    pub async fn write(
        &self,
        payload: Bytes,
        metadata: RecordMetadata,
    ) -> Result<SequenceInformation> {
        if self.0.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }

        let max_record_size = self.0.options.max_record_size();
        if payload.len() as u64 > max_record_size {
            return Err(Error::InvalidArgument(format!(
                "record of {} bytes exceeds the limit of {max_record_size} bytes",
                payload.len()
            )));
        }

        let _staging = self
            .0
            .options
            .memory_budget()
            .try_reserve_scoped(payload.len() as u64)
            .ok_or(Error::ResourceExhausted("memory"))?;

        let mut state = self.0.state.lock().await;
        let sequence_number = state.next_sequence_number;
        let frame = segment::encode_record(sequence_number, &metadata, &payload)?;
        let frame_size = frame.len() as u64;

        self.reserve_disk(&mut state, frame_size).await?;

        if let Err(err) = self.append(&mut state, &frame).await {
            self.0.options.disk_budget().release(frame_size);
            return Err(err);
        }
        state.next_sequence_number += 1;
        let generation_id = state.generation_id;
        drop(state);

        tracing::trace!(
            priority = %self.0.priority,
            sequence = sequence_number,
            size = frame_size,
            "Record stored"
        );

        if self.0.options.uploads_after_write() {
            if let Err(err) = self.initiate_upload(UploadReason::ImmediateFlush) {
                tracing::debug!(error = &err as &dyn std::error::Error, "Immediate upload skipped");
            }
        }

        Ok(SequenceInformation {
            priority: self.0.priority,
            generation_id,
            sequence_number,
        })
    }

    async fn reserve_disk(&self, state: &mut QueueState, size: u64) -> Result<()> {
        let disk = self.0.options.disk_budget();
        if disk.try_reserve(size) {
            return Ok(());
        }

        // a write that fails anyway must not evict anything
        let evictable: u64 = state
            .segments
            .iter()
            .take_while(|segment| segment.is_sealed())
            .map(SegmentFile::size)
            .sum();
        if disk.available().saturating_add(evictable) < size {
            return Err(Error::ResourceExhausted("disk"));
        }

        while !disk.try_reserve(size) {
            let evictable = state.segments.front().is_some_and(SegmentFile::is_sealed);
            if !evictable {
                return Err(Error::ResourceExhausted("disk"));
            }

            let Some(oldest) = state.segments.pop_front() else {
                return Err(Error::ResourceExhausted("disk"));
            };
            let range = oldest.sequence_range();
            match oldest.delete().await {
                Ok(freed) => disk.release(freed),
                Err(oldest) => {
                    state.segments.push_front(oldest);
                    return Err(Error::ResourceExhausted("disk"));
                }
            }

            tracing::warn!(
                priority = %self.0.priority,
                start = range.start,
                end = range.end,
                "Disk budget exhausted, evicted oldest unconfirmed records"
            );
        }
        Ok(())
    }

    async fn append(&self, state: &mut QueueState, frame: &[u8]) -> Result<()> {
        let max_size = self.0.options.max_single_file_size();
        let len = frame.len() as u64;

        let rotate = state
            .segments
            .back()
            .is_none_or(|active| !active.can_accept(len, max_size));
        if rotate {
            if let Some(active) = state.segments.back_mut() {
                active.seal();
            }
            let segment = SegmentFile::create(
                &self.0.options.directory(),
                self.0.options.file_prefix(),
                state.next_sequence_number,
            )
            .await?;
            state.segments.push_back(segment);
        }

        let Some(active) = state.segments.back_mut() else {
            return Err(Error::InvalidArgument("queue has no active segment".into()));
        };
        active.append(frame).await?;
        Ok(())
    }

    /// Starts an upload attempt unless one is already in flight.
    ///
    /// Returns immediately. The attempt runs in the background and ends with exactly one call to
    /// [`Uploader::completed`].
    pub fn initiate_upload(&self, reason: UploadReason) -> Result<()> {
        if self.0.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }

        let attempt = {
            let mut slot = self.slot();
            if let Some(attempt) = slot.in_flight {
                tracing::trace!(
                    priority = %self.0.priority,
                    attempt,
                    %reason,
                    "Upload already in flight"
                );
                return Ok(());
            }
            slot.next_attempt += 1;
            slot.in_flight = Some(slot.next_attempt);
            slot.next_attempt
        };
        self.0.uploading.send_replace(true);

        let queue = self.clone();
        self.0
            .tasks
            .spawn(async move { queue.run_upload(attempt, reason).await });
        Ok(())
    }

    /// Uploads everything that has not been confirmed yet.
    pub fn flush(&self) -> Result<()> {
        self.initiate_upload(UploadReason::ImmediateFlush)
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(priority = %self.0.priority, attempt = attempt, reason = %reason)
    )]
    async fn run_upload(self, attempt: u64, reason: UploadReason) {
        let start = {
            let state = self.0.state.lock().await;
            (state.first_unconfirmed < state.next_sequence_number)
                .then_some((state.first_unconfirmed, state.generation_id))
        };
        let Some((start, generation_id)) = start else {
            tracing::trace!("Nothing to upload");
            self.end_attempt(attempt);
            return;
        };

        let upload_timeout = self.0.options.upload_timeout();
        let deadline = Instant::now() + upload_timeout;
        let mut progress = Progress {
            next: start,
            ..Default::default()
        };

        let started = tokio::time::timeout_at(deadline, self.0.factory.start_uploader(reason)).await;
        let mut uploader = match started {
            Ok(Ok(uploader)) => uploader,
            Ok(Err(err)) => {
                tracing::warn!(error = &err as &dyn std::error::Error, "Failed to start uploader");
                self.finish_upload(attempt, progress, None, Err(err)).await;
                return;
            }
            Err(_) => {
                tracing::warn!("Timed out starting uploader");
                let err = Error::Timeout(upload_timeout);
                self.finish_upload(attempt, progress, None, Err(err)).await;
                return;
            }
        };

        tracing::debug!(start, "Upload started");
        let supplied = tokio::time::timeout_at(
            deadline,
            self.supply(generation_id, &mut *uploader, &mut progress),
        )
        .await;
        let status = supplied.unwrap_or_else(|_| {
            tracing::warn!(next = progress.next, "Timed out supplying records");
            Err(Error::Timeout(upload_timeout))
        });
        let supply_error = status.as_ref().err().map(Error::is_retryable);

        // the uploader is consumed here, a timed out completion cannot report back later
        let outcome = tokio::time::timeout(upload_timeout, uploader.completed(status))
            .await
            .unwrap_or_else(|_| {
                tracing::warn!("Timed out completing upload");
                Err(Error::Timeout(upload_timeout))
            });

        self.finish_upload(attempt, progress, supply_error, outcome)
            .await;
    }

    async fn supply(
        &self,
        generation_id: u64,
        uploader: &mut dyn Uploader,
        progress: &mut Progress,
    ) -> Result<()> {
        let sequence_information = |sequence_number| SequenceInformation {
            priority: self.0.priority,
            generation_id,
            sequence_number,
        };

        loop {
            let sequence = progress.next;
            let item = {
                let state = self.0.state.lock().await;
                self.read_next(&state, sequence).await?
            };

            let (accepted, count) = match item {
                NextItem::End => return Ok(()),
                NextItem::Gap { count } => {
                    tracing::debug!(sequence, count, "Reporting gap");
                    let start = sequence_information(sequence);
                    (uploader.process_gap(start, count).await, count)
                }
                NextItem::Record {
                    metadata,
                    payload,
                    reservation,
                } => {
                    let record = EncryptedRecord {
                        sequence_information: sequence_information(sequence),
                        metadata,
                        payload,
                    };
                    (uploader.process_record(record, reservation).await, 1)
                }
            };

            if !accepted {
                progress.stopped = true;
                return Ok(());
            }
            progress.last_accepted = Some(sequence + count - 1);
            progress.next = sequence + count;
        }
    }

    async fn read_next(&self, state: &QueueState, sequence: u64) -> Result<NextItem> {
        if sequence >= state.next_sequence_number {
            return Ok(NextItem::End);
        }

        let holder = state
            .segments
            .iter()
            .find(|segment| segment.sequence_range().contains(&sequence));
        let Some(segment) = holder else {
            let until = state
                .segments
                .iter()
                .map(SegmentFile::first_sequence_number)
                .find(|&first| first > sequence)
                .unwrap_or(state.next_sequence_number)
                .min(state.next_sequence_number);
            return Ok(NextItem::Gap {
                count: until - sequence,
            });
        };

        let size = segment.record_size(sequence).unwrap_or_default();
        let reservation = self
            .0
            .options
            .memory_budget()
            .try_reserve_scoped(size)
            .ok_or(Error::ResourceExhausted("memory"))?;

        match segment.read(sequence).await {
            Ok(Some((metadata, payload))) => Ok(NextItem::Record {
                metadata,
                payload,
                reservation,
            }),
            Ok(None) => Ok(NextItem::Gap { count: 1 }),
            Err(err @ Error::Corruption { .. }) => {
                tracing::warn!(
                    sequence,
                    error = &err as &dyn std::error::Error,
                    "Unreadable record, reporting as gap"
                );
                Ok(NextItem::Gap { count: 1 })
            }
            Err(err) => Err(err),
        }
    }

    async fn finish_upload(
        &self,
        attempt: u64,
        progress: Progress,
        supply_error: Option<bool>,
        outcome: Result<()>,
    ) {
        let mut succeeded = false;
        let retry = match outcome {
            Ok(()) => {
                if let Some(last) = progress.last_accepted {
                    if let Err(err) = self.confirm_through(last).await {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Failed to confirm uploaded records"
                        );
                    }
                }
                self.slot().consecutive_failures = 0;
                succeeded = true;

                match supply_error {
                    Some(true) => Some(UploadReason::FailureRetry),
                    Some(false) => None,
                    None if progress.stopped => Some(UploadReason::IncompleteRetry),
                    None => None,
                }
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Upload failed, records retained for retry"
                );
                Some(UploadReason::FailureRetry)
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Upload rejected, records retained until the next upload"
                );
                None
            }
        };

        tracing::debug!(
            last_accepted = progress.last_accepted,
            succeeded,
            "Upload finished"
        );

        self.end_attempt(attempt);

        if let Some(reason) = retry {
            self.schedule_retry(reason, succeeded);
        } else if succeeded && self.0.options.uploads_after_write() && self.has_unconfirmed().await
        {
            // records written while the attempt was running
            if let Err(err) = self.initiate_upload(UploadReason::ImmediateFlush) {
                tracing::debug!(error = &err as &dyn std::error::Error, "Immediate upload skipped");
            }
        }
    }

    fn end_attempt(&self, attempt: u64) {
        {
            let mut slot = self.slot();
            if slot.in_flight == Some(attempt) {
                slot.in_flight = None;
            }
        }
        self.0.uploading.send_replace(false);
    }

    fn schedule_retry(&self, reason: UploadReason, succeeded: bool) {
        let base = self.0.options.upload_retry_delay();
        if base.is_zero() {
            return;
        }

        let mut slot = self.slot();
        let delay = if succeeded {
            base
        } else {
            slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
            self.0
                .options
                .retry_backoff()
                .delay(base, slot.consecutive_failures)
        };

        tracing::debug!(%reason, ?delay, "Scheduling upload retry");

        let queue = Arc::downgrade(&self.0);
        let shutdown = self.0.shutdown.clone();
        let handle = self.0.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(queue) = Weak::upgrade(&queue).map(StorageQueue) {
                if let Err(err) = queue.initiate_upload(reason) {
                    tracing::debug!(error = &err as &dyn std::error::Error, "Retry skipped");
                }
            }
        });

        if let Some(previous) = slot.retry.replace(handle) {
            previous.abort();
        }
    }

    /// Confirms all records up to and including `sequence_number` and deletes fully confirmed files.
    ///
    /// The confirmed position never moves backwards. Positions beyond the last written record
    /// are clamped.
    async fn confirm_through(&self, sequence_number: u64) -> Result<()> {
        let mut state = self.0.state.lock().await;
        let target = sequence_number
            .saturating_add(1)
            .min(state.next_sequence_number);
        if target <= state.first_unconfirmed {
            return Ok(());
        }

        state.first_unconfirmed = target;
        let meta = QueueMeta {
            generation_id: state.generation_id,
            first_unconfirmed: target,
        };
        meta::write_meta(
            &self.0.options.directory(),
            self.0.options.file_prefix(),
            &meta,
        )
        .await?;

        let disk = self.0.options.disk_budget();
        truncate_confirmed(&mut state.segments, target, Some(disk)).await;

        tracing::debug!(
            priority = %self.0.priority,
            first_unconfirmed = target,
            "Records confirmed"
        );
        Ok(())
    }

    /// Confirms the records up to `sequence_information` on behalf of the server.
    pub async fn confirm(&self, sequence_information: SequenceInformation) -> Result<()> {
        {
            let state = self.0.state.lock().await;
            if sequence_information.generation_id != state.generation_id {
                return Err(Error::InvalidArgument(format!(
                    "generation {:016x} does not match queue generation {:016x}",
                    sequence_information.generation_id, state.generation_id
                )));
            }
            if sequence_information.sequence_number >= state.next_sequence_number {
                return Err(Error::InvalidArgument(format!(
                    "sequence number {} has not been written yet",
                    sequence_information.sequence_number
                )));
            }
        }

        self.confirm_through(sequence_information.sequence_number)
            .await
    }

    /// Returns `true` if the queue holds records that have not been confirmed.
    pub async fn has_unconfirmed(&self) -> bool {
        let state = self.0.state.lock().await;
        state.first_unconfirmed < state.next_sequence_number
    }

    /// Returns a point-in-time view of the queue.
    pub async fn stats(&self) -> QueueStats {
        let uploading = *self.0.uploading.borrow();
        let state = self.0.state.lock().await;
        QueueStats {
            priority: self.0.priority,
            generation_id: state.generation_id,
            first_unconfirmed: state.first_unconfirmed,
            last_confirmed: state.first_unconfirmed.checked_sub(1),
            next_sequence_number: state.next_sequence_number,
            segment_count: state.segments.len(),
            disk_bytes: state.segments.iter().map(SegmentFile::size).sum(),
            uploading,
        }
    }

    /// Waits until no upload attempt is in flight.
    pub async fn wait_idle(&self) {
        let mut uploading = self.0.uploading.subscribe();
        // the sender lives in `self`, so the channel cannot close while waiting
        let _ = uploading.wait_for(|uploading| !*uploading).await;
    }

    /// Stops timers and pending retries, then waits for the in-flight upload to end.
    ///
    /// Subsequent writes and upload requests fail with [`Error::ShutDown`].
    pub async fn shutdown(&self) {
        self.0.shutdown.cancel();
        if let Some(retry) = self.slot().retry.take() {
            retry.abort();
        }
        self.0.tasks.close();
        self.0.tasks.wait().await;
        tracing::debug!(priority = %self.0.priority, "Queue shut down");
    }

    fn slot(&self) -> MutexGuard<'_, UploadSlot> {
        self.0
            .upload
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drops records below `first_unconfirmed` from the front of `segments`.
async fn truncate_confirmed(
    segments: &mut VecDeque<SegmentFile>,
    first_unconfirmed: u64,
    disk: Option<&ResourceBudget>,
) {
    while let Some(front) = segments.front_mut() {
        if front.first_sequence_number() >= first_unconfirmed {
            break;
        }

        let freed = front.truncate_prefix(first_unconfirmed - 1).await;
        if let Some(disk) = disk {
            disk.release(freed);
        }

        if front.is_empty() && front.is_sealed() {
            segments.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::options::StorageOptions;
    use crate::uploader::{BoxedUploader, UploaderFactory};

    #[derive(Debug)]
    enum Event {
        Record(u64, Bytes),
        Gap(u64, u64),
        Completed(bool),
    }

    struct ChannelUploader {
        events: mpsc::UnboundedSender<Event>,
        accept: usize,
        outcome: fn() -> Result<()>,
    }

    #[async_trait::async_trait]
    impl Uploader for ChannelUploader {
        async fn process_record(
            &mut self,
            record: EncryptedRecord,
            _reservation: ScopedReservation,
        ) -> bool {
            if self.accept == 0 {
                return false;
            }
            self.accept -= 1;
            let sequence = record.sequence_information.sequence_number;
            self.events.send(Event::Record(sequence, record.payload)).ok();
            true
        }

        async fn process_gap(&mut self, start: SequenceInformation, count: u64) -> bool {
            self.events
                .send(Event::Gap(start.sequence_number, count))
                .ok();
            true
        }

        async fn completed(self: Box<Self>, status: Result<()>) -> Result<()> {
            self.events.send(Event::Completed(status.is_ok())).ok();
            (self.outcome)()
        }
    }

    #[derive(Debug)]
    struct ChannelFactory {
        events: mpsc::UnboundedSender<Event>,
        calls: AtomicUsize,
        accept: usize,
        outcome: fn() -> Result<()>,
    }

    #[async_trait::async_trait]
    impl UploaderFactory for ChannelFactory {
        async fn start_uploader(&self, _reason: UploadReason) -> Result<BoxedUploader> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ChannelUploader {
                events: self.events.clone(),
                accept: self.accept,
                outcome: self.outcome,
            }))
        }
    }

    fn factory(
        accept: usize,
        outcome: fn() -> Result<()>,
    ) -> (Arc<ChannelFactory>, mpsc::UnboundedReceiver<Event>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let factory = Arc::new(ChannelFactory {
            events,
            calls: AtomicUsize::new(0),
            accept,
            outcome,
        });
        (factory, receiver)
    }

    fn manual_options(dir: &std::path::Path) -> QueueOptions {
        QueueOptions::new(&StorageOptions::new(dir))
            .set_subdirectory("manual")
            .set_file_prefix("P_Manual")
            .set_upload_period(None)
    }

    async fn write(queue: &StorageQueue, payload: &'static [u8]) -> u64 {
        queue
            .write(Bytes::from_static(payload), RecordMetadata::default())
            .await
            .unwrap()
            .sequence_number
    }

    #[tokio::test]
    async fn upload_confirms_accepted_prefix() {
        let tempdir = tempfile::tempdir().unwrap();
        let (factory, mut events) = factory(2, || Ok(()));
        let queue = StorageQueue::create(
            Priority::ManualBatch,
            manual_options(tempdir.path()).set_upload_retry_delay(Duration::ZERO),
            factory.clone(),
        )
        .await
        .unwrap();

        for payload in [&b"a"[..], b"b", b"c"] {
            write(&queue, payload).await;
        }

        queue.flush().unwrap();
        queue.wait_idle().await;

        assert!(matches!(events.recv().await, Some(Event::Record(0, _))));
        assert!(matches!(events.recv().await, Some(Event::Record(1, _))));
        assert!(matches!(events.recv().await, Some(Event::Completed(true))));

        let stats = queue.stats().await;
        assert_eq!(stats.first_unconfirmed, 2);
        assert_eq!(stats.last_confirmed, Some(1));
        assert_eq!(stats.next_sequence_number, 3);
        assert!(!stats.uploading);
    }

    #[tokio::test]
    async fn confirm_rejects_foreign_generation() {
        let tempdir = tempfile::tempdir().unwrap();
        let (factory, _events) = factory(0, || Ok(()));
        let queue = StorageQueue::create(
            Priority::ManualBatch,
            manual_options(tempdir.path()),
            factory,
        )
        .await
        .unwrap();

        let info = queue
            .write(Bytes::from_static(b"x"), RecordMetadata::default())
            .await
            .unwrap();

        let foreign = SequenceInformation {
            generation_id: info.generation_id.wrapping_add(1),
            ..info
        };
        assert!(matches!(
            queue.confirm(foreign).await,
            Err(Error::InvalidArgument(_))
        ));

        queue.confirm(info).await.unwrap();
        assert_eq!(queue.stats().await.first_unconfirmed, 1);
        assert!(!queue.has_unconfirmed().await);

        // confirming an older position is a no-op
        let older = SequenceInformation {
            sequence_number: 0,
            ..info
        };
        queue.confirm(older).await.unwrap();
        assert_eq!(queue.stats().await.first_unconfirmed, 1);
    }

    #[tokio::test]
    async fn confirmed_position_survives_restart() {
        let tempdir = tempfile::tempdir().unwrap();
        let (factory, _events) = factory(0, || Ok(()));

        let generation_id = {
            let queue = StorageQueue::create(
                Priority::ManualBatch,
                manual_options(tempdir.path()),
                factory.clone(),
            )
            .await
            .unwrap();
            for payload in [&b"a"[..], b"b", b"c"] {
                write(&queue, payload).await;
            }
            let info = SequenceInformation {
                priority: Priority::ManualBatch,
                generation_id: queue.stats().await.generation_id,
                sequence_number: 1,
            };
            queue.confirm(info).await.unwrap();
            queue.shutdown().await;
            info.generation_id
        };

        let queue = StorageQueue::create(
            Priority::ManualBatch,
            manual_options(tempdir.path()),
            factory,
        )
        .await
        .unwrap();
        let stats = queue.stats().await;
        assert_eq!(stats.generation_id, generation_id);
        assert_eq!(stats.first_unconfirmed, 2);
        assert_eq!(stats.next_sequence_number, 3);
        assert_eq!(write(&queue, b"d").await, 3);
    }

    #[tokio::test]
    async fn rejects_oversized_record() {
        let tempdir = tempfile::tempdir().unwrap();
        let (factory, _events) = factory(0, || Ok(()));
        let storage = StorageOptions::new(tempdir.path()).set_max_record_size(4);
        let options = QueueOptions::new(&storage).set_upload_period(None);
        let queue = StorageQueue::create(Priority::ManualBatch, options, factory)
            .await
            .unwrap();

        let result = queue
            .write(Bytes::from_static(b"12345"), RecordMetadata::default())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(storage.disk_budget().used(), 0);
        assert_eq!(storage.memory_budget().used(), 0);
    }

    #[tokio::test]
    async fn write_after_shutdown_fails() {
        let tempdir = tempfile::tempdir().unwrap();
        let (factory, _events) = factory(0, || Ok(()));
        let queue = StorageQueue::create(
            Priority::ManualBatch,
            manual_options(tempdir.path()),
            factory,
        )
        .await
        .unwrap();

        queue.shutdown().await;
        let result = queue
            .write(Bytes::from_static(b"x"), RecordMetadata::default())
            .await;
        assert!(matches!(result, Err(Error::ShutDown)));
        assert!(matches!(queue.flush(), Err(Error::ShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_upload_continues_after_retry_delay() {
        let tempdir = tempfile::tempdir().unwrap();
        let (factory, mut events) = factory(1, || Ok(()));
        let queue = StorageQueue::create(
            Priority::ManualBatch,
            manual_options(tempdir.path()).set_upload_retry_delay(Duration::from_secs(5)),
            factory.clone(),
        )
        .await
        .unwrap();

        write(&queue, b"a").await;
        write(&queue, b"b").await;
        queue.flush().unwrap();

        assert!(matches!(events.recv().await, Some(Event::Record(0, _))));
        assert!(matches!(events.recv().await, Some(Event::Completed(true))));
        assert!(matches!(events.recv().await, Some(Event::Record(1, _))));
        assert!(matches!(events.recv().await, Some(Event::Completed(true))));

        queue.wait_idle().await;
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
        assert!(!queue.has_unconfirmed().await);
    }
}
