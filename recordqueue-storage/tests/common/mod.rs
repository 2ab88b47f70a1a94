#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use recordqueue_storage::{
    BoxedUploader, Error, Result, ScopedReservation, Uploader, UploaderFactory,
};
use recordqueue_types::{EncryptedRecord, RecordMetadata, SequenceInformation, UploadReason};
use tokio::sync::watch;

/// Length of `RecordMetadata::default()` encoded as JSON.
pub const DEFAULT_METADATA_LEN: usize = br#"{"timestamp_us":0}"#.len();

/// Size of the frame holding a payload of `payload_len` bytes with default metadata.
pub fn frame_size(payload_len: usize) -> u64 {
    (recordqueue_storage::segment::HEADER_SIZE + DEFAULT_METADATA_LEN + payload_len) as u64
}

/// Returns a payload whose frame is exactly `frame` bytes with default metadata.
pub fn payload_for_frame(frame: usize, fill: u8) -> Bytes {
    let overhead = recordqueue_storage::segment::HEADER_SIZE + DEFAULT_METADATA_LEN;
    Bytes::from(vec![fill; frame - overhead])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Record {
        sequence: u64,
        generation: u64,
        metadata: RecordMetadata,
        payload: Bytes,
    },
    Gap {
        start: u64,
        count: u64,
    },
    Completed {
        ok: bool,
    },
}

/// What an uploader returns from `completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
    Reject,
    Hang,
}

#[derive(Debug, Default)]
struct State {
    events: Vec<Event>,
    reasons: Vec<UploadReason>,
    outcomes: VecDeque<Outcome>,
    accept: Option<usize>,
    hold_reservations: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    completions: watch::Sender<usize>,
}

/// Uploader factory recording everything it is handed.
#[derive(Debug, Clone)]
pub struct RecordingFactory(Arc<Shared>);

impl Default for RecordingFactory {
    fn default() -> Self {
        let (completions, _) = watch::channel(0);
        Self(Arc::new(Shared {
            state: Mutex::new(State::default()),
            completions,
        }))
    }
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for the next attempts. Later attempts succeed.
    pub fn with_outcomes(self, outcomes: &[Outcome]) -> Self {
        self.state().outcomes.extend(outcomes);
        self
    }

    /// Makes every uploader stop after accepting `accept` items.
    pub fn with_accept_limit(self, accept: usize) -> Self {
        self.state().accept = Some(accept);
        self
    }

    /// Makes uploaders keep memory reservations until they complete.
    pub fn holding_reservations(self) -> Self {
        self.state().hold_reservations = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.0.state.lock().unwrap()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut self.state().events)
    }

    pub fn reasons(&self) -> Vec<UploadReason> {
        self.state().reasons.clone()
    }

    pub fn calls(&self) -> usize {
        self.state().reasons.len()
    }

    /// Returns the sequence numbers and payloads of all offered records.
    pub fn records(&self) -> Vec<(u64, Bytes)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Record {
                    sequence, payload, ..
                } => Some((sequence, payload)),
                _ => None,
            })
            .collect()
    }

    /// Waits until `count` attempts reached `completed`.
    pub async fn wait_for_completions(&self, count: usize) {
        let mut completions = self.0.completions.subscribe();
        completions
            .wait_for(|completed| *completed >= count)
            .await
            .unwrap();
    }
}

#[async_trait::async_trait]
impl UploaderFactory for RecordingFactory {
    async fn start_uploader(&self, reason: UploadReason) -> Result<BoxedUploader> {
        let (outcome, accept, hold_reservations) = {
            let mut state = self.state();
            state.reasons.push(reason);
            let outcome = state.outcomes.pop_front().unwrap_or(Outcome::Succeed);
            (outcome, state.accept, state.hold_reservations)
        };

        Ok(Box::new(RecordingUploader {
            factory: self.clone(),
            outcome,
            remaining: accept.unwrap_or(usize::MAX),
            hold_reservations,
            held: Vec::new(),
        }))
    }
}

struct RecordingUploader {
    factory: RecordingFactory,
    outcome: Outcome,
    remaining: usize,
    hold_reservations: bool,
    held: Vec<ScopedReservation>,
}

impl RecordingUploader {
    fn admit(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

#[async_trait::async_trait]
impl Uploader for RecordingUploader {
    async fn process_record(
        &mut self,
        record: EncryptedRecord,
        reservation: ScopedReservation,
    ) -> bool {
        if !self.admit() {
            return false;
        }
        if self.hold_reservations {
            self.held.push(reservation);
        }

        let SequenceInformation {
            generation_id,
            sequence_number,
            ..
        } = record.sequence_information;
        self.factory.state().events.push(Event::Record {
            sequence: sequence_number,
            generation: generation_id,
            metadata: record.metadata,
            payload: record.payload,
        });
        true
    }

    async fn process_gap(&mut self, start: SequenceInformation, count: u64) -> bool {
        if !self.admit() {
            return false;
        }
        self.factory.state().events.push(Event::Gap {
            start: start.sequence_number,
            count,
        });
        true
    }

    async fn completed(self: Box<Self>, status: Result<()>) -> Result<()> {
        self.factory.state().events.push(Event::Completed {
            ok: status.is_ok(),
        });
        self.factory
            .0
            .completions
            .send_modify(|completed| *completed += 1);

        match self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail => Err(Error::UploadFailed("connection reset".into())),
            Outcome::Reject => Err(Error::UploadRejected("bad request".into())),
            Outcome::Hang => std::future::pending().await,
        }
    }
}
