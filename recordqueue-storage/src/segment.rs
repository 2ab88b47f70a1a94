//! Record framing and segment files.
//!
//! A segment file holds a contiguous run of records of one queue. Its name is
//! `<file_prefix>.<first_sequence_number>`. Every record is stored as a frame:
//!
//! ```text
//! | magic "\xf5R" | version | body_size | sequence | metadata_size | crc32 | header_crc32 | metadata | payload |
//!   2               2         4           8          4               4       4              ...        ...
//! ```
//!
//! All integers are little endian. The body consists of the JSON-encoded [`RecordMetadata`]
//! followed by the payload. `crc32` covers the body and `header_crc32` covers the header fields
//! before it, so a damaged `body_size` is detected before it is trusted. A frame is only accepted
//! if it carries the expected sequence number, so a file can be validated front to back without
//! any index.
//!
//! A crash in the middle of an append leaves an incomplete frame at the end of the file. Such a
//! tail is cut off when the file is recovered. A frame that fails validation is treated as the
//! end of the file, and the sequence numbers that may have followed it are reported as a gap.
//!
//! Confirmed records at the front of a file are only dropped from the in-memory index. Their
//! bytes stay on disk until every record of the file is confirmed and the file is deleted.

use std::collections::VecDeque;
use std::io::{ErrorKind, SeekFrom};
use std::mem;
use std::ops::Range;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use pack1::{U16LE, U32LE, U64LE};
use recordqueue_types::RecordMetadata;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use watto::Pod;

use crate::error::{Error, Result};
use crate::file;

/// Magic bytes at the start of every record frame.
pub const RECORD_MAGIC: [u8; 2] = *b"\xf5R";
/// Current version of the record frame.
pub const RECORD_VERSION: u16 = 1;
/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = mem::size_of::<RecordHeader>();

/// Fixed header of a record frame.
#[derive(Debug)]
#[repr(C)]
pub struct RecordHeader {
    /// Always [`RECORD_MAGIC`].
    pub magic: [u8; 2],
    /// Always [`RECORD_VERSION`].
    pub version: U16LE,
    /// Size of metadata and payload.
    pub body_size: U32LE,
    /// Sequence number of the record.
    pub sequence_number: U64LE,
    /// Size of the JSON-encoded metadata at the start of the body.
    pub metadata_size: U32LE,
    /// CRC32 of the body.
    pub crc32: U32LE,
    /// CRC32 of all preceding header fields.
    pub header_crc32: U32LE,
}
unsafe impl Pod for RecordHeader {}

/// Header bytes covered by [`RecordHeader::header_crc32`].
const CHECKED_HEADER_SIZE: usize = mem::offset_of!(RecordHeader, header_crc32);

const _: () = const {
    assert!(std::mem::align_of::<RecordHeader>() == 1);
    assert!(std::mem::size_of::<RecordHeader>() == 28);
    assert!(CHECKED_HEADER_SIZE + 4 == HEADER_SIZE);
};

/// Serializes a record into a frame ready to be appended.
pub fn encode_record(
    sequence_number: u64,
    metadata: &RecordMetadata,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let metadata = serde_json::to_vec(metadata).map_err(|cause| Error::Serde {
        context: "failed to encode record metadata".into(),
        cause,
    })?;

    let body_size = metadata.len() + payload.len();
    let body_size = u32::try_from(body_size)
        .map_err(|_| Error::InvalidArgument(format!("record of {body_size} bytes is too large")))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&metadata);
    hasher.update(payload);

    let mut header = RecordHeader {
        magic: RECORD_MAGIC,
        version: RECORD_VERSION.into(),
        body_size: body_size.into(),
        sequence_number: sequence_number.into(),
        metadata_size: (metadata.len() as u32).into(),
        crc32: hasher.finalize().into(),
        header_crc32: 0u32.into(),
    };
    header.header_crc32 = crc32fast::hash(&header.as_bytes()[..CHECKED_HEADER_SIZE]).into();

    let mut buffer = Vec::with_capacity(HEADER_SIZE + body_size as usize);
    buffer.extend_from_slice(header.as_bytes());
    buffer.extend_from_slice(&metadata);
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ends before the frame does.
    Incomplete,
    /// The frame is complete but does not validate.
    Invalid(&'static str),
}

/// Validates the frame at the start of `buf` and returns its total length.
pub fn check_frame(buf: &[u8], expected_sequence: u64) -> Result<usize, FrameError> {
    let header_bytes = buf.get(..HEADER_SIZE).ok_or(FrameError::Incomplete)?;
    let header =
        RecordHeader::ref_from_bytes(header_bytes).ok_or(FrameError::Invalid("bad header"))?;

    if header.magic != RECORD_MAGIC {
        return Err(FrameError::Invalid("bad magic"));
    }
    if crc32fast::hash(&header_bytes[..CHECKED_HEADER_SIZE]) != header.header_crc32.get() {
        return Err(FrameError::Invalid("header checksum mismatch"));
    }
    if header.version.get() != RECORD_VERSION {
        return Err(FrameError::Invalid("unsupported version"));
    }
    if header.sequence_number.get() != expected_sequence {
        return Err(FrameError::Invalid("unexpected sequence number"));
    }

    let body_size = header.body_size.get() as usize;
    if header.metadata_size.get() as usize > body_size {
        return Err(FrameError::Invalid("metadata exceeds body"));
    }

    let body = buf
        .get(HEADER_SIZE..HEADER_SIZE + body_size)
        .ok_or(FrameError::Incomplete)?;
    if crc32fast::hash(body) != header.crc32.get() {
        return Err(FrameError::Invalid("checksum mismatch"));
    }

    Ok(HEADER_SIZE + body_size)
}

/// Splits a validated frame into metadata and payload.
pub fn decode_frame(frame: Bytes) -> Result<(RecordMetadata, Bytes), FrameError> {
    let header = frame
        .get(..HEADER_SIZE)
        .and_then(RecordHeader::ref_from_bytes)
        .ok_or(FrameError::Incomplete)?;
    let metadata_end = HEADER_SIZE + header.metadata_size.get() as usize;

    let metadata = frame
        .get(HEADER_SIZE..metadata_end)
        .ok_or(FrameError::Incomplete)?;
    let metadata =
        serde_json::from_slice(metadata).map_err(|_| FrameError::Invalid("bad metadata"))?;

    Ok((metadata, frame.slice(metadata_end..)))
}

/// How the content of a segment file ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    /// Every byte belongs to a valid frame.
    Clean,
    /// The file ends with an incomplete frame of `dropped` bytes.
    Partial {
        /// Bytes after the last valid frame.
        dropped: u64,
    },
    /// A complete frame failed validation, `dropped` bytes follow the last valid frame.
    Corrupted {
        /// Bytes after the last valid frame.
        dropped: u64,
        /// What failed to validate.
        reason: &'static str,
    },
}

impl Tail {
    /// Returns the number of bytes after the last valid frame.
    pub fn dropped(&self) -> u64 {
        match *self {
            Tail::Clean => 0,
            Tail::Partial { dropped } | Tail::Corrupted { dropped, .. } => dropped,
        }
    }

    /// Upper bound of the records that may have been lost in a corrupted tail.
    ///
    /// Every frame is at least [`HEADER_SIZE`] bytes, so the dropped bytes cannot hold more.
    fn lost_records(&self) -> u64 {
        match *self {
            Tail::Corrupted { dropped, .. } => dropped.div_ceil(HEADER_SIZE as u64),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    offset: u64,
    size: u64,
}

struct FrameScan {
    entries: VecDeque<Entry>,
    valid_len: u64,
    tail: Tail,
}

fn scan_frames(buf: &[u8], first_sequence_number: u64) -> FrameScan {
    let mut entries = VecDeque::new();
    let mut offset = 0;

    let tail = loop {
        let remaining = &buf[offset..];
        if remaining.is_empty() {
            break Tail::Clean;
        }

        let sequence = first_sequence_number + entries.len() as u64;
        match check_frame(remaining, sequence) {
            Ok(size) => {
                entries.push_back(Entry {
                    offset: offset as u64,
                    size: size as u64,
                });
                offset += size;
            }
            Err(FrameError::Incomplete) => {
                break Tail::Partial {
                    dropped: remaining.len() as u64,
                };
            }
            Err(FrameError::Invalid(reason)) => {
                break Tail::Corrupted {
                    dropped: remaining.len() as u64,
                    reason,
                };
            }
        }
    };

    FrameScan {
        entries,
        valid_len: offset as u64,
        tail,
    }
}

/// Returns the file name of the segment starting at `first_sequence_number`.
pub fn segment_file_name(file_prefix: &str, first_sequence_number: u64) -> String {
    format!("{file_prefix}.{first_sequence_number}")
}

/// Parses the first sequence number out of a segment file name.
pub fn parse_segment_name(file_prefix: &str, name: &str) -> Option<u64> {
    let digits = name.strip_prefix(file_prefix)?.strip_prefix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Lists the segment files of a queue, ordered by their first sequence number.
pub async fn list_segments(directory: &Path, file_prefix: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut segments = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(first) = name
            .to_str()
            .and_then(|name| parse_segment_name(file_prefix, name))
        {
            segments.push((first, entry.path()));
        }
    }

    segments.sort_unstable_by_key(|(first, _)| *first);
    Ok(segments)
}

/// One physical file holding a contiguous run of records.
#[derive(Debug)]
pub struct SegmentFile {
    path: PathBuf,
    first_sequence_number: u64,
    entries: VecDeque<Entry>,
    size: u64,
    writer: Option<File>,
}

impl SegmentFile {
    /// Creates a new, empty segment file that accepts appends.
    pub async fn create(
        directory: &Path,
        file_prefix: &str,
        first_sequence_number: u64,
    ) -> Result<Self> {
        let path = directory.join(segment_file_name(file_prefix, first_sequence_number));
        let writer = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .await?;
        file::sync_directory(&path).await;

        tracing::debug!(path = %path.display(), "created segment file");

        Ok(Self {
            path,
            first_sequence_number,
            entries: VecDeque::new(),
            size: 0,
            writer: Some(writer),
        })
    }

    /// Opens an existing segment file and validates its frames.
    ///
    /// Bytes after the last valid frame are cut off. The returned segment is sealed.
    pub async fn recover(path: PathBuf, first_sequence_number: u64) -> Result<(Self, Tail)> {
        let contents = tokio::fs::read(&path).await?;
        let scan = scan_frames(&contents, first_sequence_number);

        if scan.tail != Tail::Clean {
            let file = OpenOptions::new().write(true).open(&path).await?;
            file.set_len(scan.valid_len).await?;
            file.sync_all().await?;
        }

        let segment = Self {
            path,
            first_sequence_number,
            entries: scan.entries,
            size: scan.valid_len,
            writer: None,
        };
        Ok((segment, scan.tail))
    }

    /// Returns the path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the sequence number of the first record still held in this file.
    pub fn first_sequence_number(&self) -> u64 {
        self.first_sequence_number
    }

    /// Returns the sequence number the next appended record will get.
    pub fn next_sequence_number(&self) -> u64 {
        self.first_sequence_number + self.entries.len() as u64
    }

    /// Returns the range of sequence numbers stored in this file.
    pub fn sequence_range(&self) -> Range<u64> {
        self.first_sequence_number..self.next_sequence_number()
    }

    /// Returns the number of records in this file.
    pub fn record_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the file holds no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the size of the file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns `true` if the file no longer accepts appends.
    pub fn is_sealed(&self) -> bool {
        self.writer.is_none()
    }

    /// Closes the file for appends.
    pub fn seal(&mut self) {
        self.writer = None;
    }

    /// Returns the serialized size of the record with `sequence_number`, if stored here.
    pub fn record_size(&self, sequence_number: u64) -> Option<u64> {
        let index = sequence_number.checked_sub(self.first_sequence_number)?;
        self.entries.get(index as usize).map(|entry| entry.size)
    }

    /// Returns `true` if a frame of `len` bytes may be appended.
    ///
    /// A file without records accepts a frame of any size.
    pub fn can_accept(&self, len: u64, max_size: u64) -> bool {
        !self.is_sealed() && (self.entries.is_empty() || self.size + len <= max_size)
    }

    /// Durably appends a frame and returns its sequence number.
    ///
    /// On failure the file is cut back to its previous length.
    pub async fn append(&mut self, frame: &[u8]) -> Result<u64> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(Error::InvalidArgument(format!(
                "segment {} is sealed",
                self.path.display()
            )));
        };

        let result = async {
            writer.write_all(frame).await?;
            writer.flush().await?;
            writer.sync_data().await
        }
        .await;

        if let Err(err) = result {
            tracing::error!(path = %self.path.display(), error = %err, "failed to append record");
            if let Err(err) = writer.set_len(self.size).await {
                tracing::error!(path = %self.path.display(), error = %err, "failed to roll back append");
                self.seal();
            }
            return Err(err.into());
        }

        let sequence_number = self.next_sequence_number();
        self.entries.push_back(Entry {
            offset: self.size,
            size: frame.len() as u64,
        });
        self.size += frame.len() as u64;

        Ok(sequence_number)
    }

    /// Reads the record with `sequence_number`.
    ///
    /// Returns `Ok(None)` if the record is not stored in this file.
    pub async fn read(&self, sequence_number: u64) -> Result<Option<(RecordMetadata, Bytes)>> {
        let Some(index) = sequence_number.checked_sub(self.first_sequence_number) else {
            return Ok(None);
        };
        let Some(entry) = self.entries.get(index as usize).copied() else {
            return Ok(None);
        };

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(entry.offset)).await?;
        let mut buf = vec![0; entry.size as usize];
        file.read_exact(&mut buf).await?;

        let corruption = |reason| Error::Corruption {
            path: self.path.clone(),
            offset: entry.offset,
            reason,
        };

        match check_frame(&buf, sequence_number) {
            Ok(size) if size == buf.len() => {}
            Ok(_) => return Err(corruption("frame size changed")),
            Err(FrameError::Incomplete) => return Err(corruption("truncated frame")),
            Err(FrameError::Invalid(reason)) => return Err(corruption(reason)),
        }

        match decode_frame(Bytes::from(buf)) {
            Ok(record) => Ok(Some(record)),
            Err(FrameError::Incomplete) => Err(corruption("truncated frame")),
            Err(FrameError::Invalid(reason)) => Err(corruption(reason)),
        }
    }

    /// Removes all records up to and including `through_sequence` and returns the freed bytes.
    ///
    /// Records are only dropped from the index while others remain in the file, which frees
    /// nothing. Once no records remain, the file is sealed and deleted.
    pub async fn truncate_prefix(&mut self, through_sequence: u64) -> u64 {
        if through_sequence < self.first_sequence_number || self.entries.is_empty() {
            return 0;
        }

        let count = ((through_sequence - self.first_sequence_number + 1) as usize)
            .min(self.entries.len());
        self.entries.drain(..count);
        self.first_sequence_number += count as u64;

        if !self.entries.is_empty() {
            tracing::trace!(
                path = %self.path.display(),
                dropped = count,
                first = self.first_sequence_number,
                "dropped confirmed records from segment index"
            );
            return 0;
        }

        self.writer = None;
        file::delete_file_warn_if_failed(&self.path).await;
        mem::take(&mut self.size)
    }

    /// Deletes the file and returns its size.
    ///
    /// If the file cannot be deleted, the segment is handed back.
    pub async fn delete(mut self) -> Result<u64, Self> {
        self.writer = None;
        if file::delete_file_warn_if_failed(&self.path).await {
            Ok(self.size)
        } else {
            Err(self)
        }
    }
}

/// Segments recovered from a queue directory.
#[derive(Debug)]
pub struct RecoveredSegments {
    /// Valid segments ordered by first sequence number, all of them sealed.
    pub segments: Vec<SegmentFile>,
    /// Sequence ranges that are known to be lost.
    pub gaps: Vec<Range<u64>>,
    /// First sequence number not covered by any file, `None` if there are no files.
    pub next_sequence_number: Option<u64>,
}

/// Opens and validates all segment files of a queue.
///
/// Files with invalid tails are cut back, files without valid records and files overlapping
/// their predecessor are deleted.
pub async fn recover_segments(directory: &Path, file_prefix: &str) -> Result<RecoveredSegments> {
    let listed = list_segments(directory, file_prefix).await?;
    let file_count = listed.len();

    let mut segments: Vec<SegmentFile> = Vec::new();
    let mut gaps = Vec::new();
    let mut coverage_end: Option<u64> = None;

    for (index, (first, path)) in listed.into_iter().enumerate() {
        if let Some(end) = coverage_end {
            if first < end {
                tracing::warn!(path = %path.display(), "deleting overlapping segment file");
                file::delete_file_warn_if_failed(&path).await;
                continue;
            }
            if first > end {
                gaps.push(end..first);
            }
        }

        let (segment, tail) = SegmentFile::recover(path, first).await?;
        let is_last = index + 1 == file_count;

        match tail {
            Tail::Clean => {}
            Tail::Partial { dropped } => {
                tracing::info!(
                    path = %segment.path().display(),
                    dropped,
                    "discarded incomplete record at end of segment"
                );
            }
            Tail::Corrupted { dropped, reason } => {
                tracing::warn!(
                    path = %segment.path().display(),
                    offset = segment.size(),
                    dropped,
                    reason,
                    "segment corrupted, truncating at last valid record"
                );
            }
        }

        let mut end = segment.next_sequence_number();
        if is_last && tail.lost_records() > 0 {
            // the lost frames may have used these numbers already
            let skipped = tail.lost_records();
            gaps.push(end..end + skipped);
            end += skipped;
        }
        coverage_end = Some(end);

        if segment.is_empty() {
            // a failed deletion is logged and retried on the next recovery
            let _ = segment.delete().await;
        } else {
            segments.push(segment);
        }
    }

    Ok(RecoveredSegments {
        segments,
        gaps,
        next_sequence_number: coverage_end,
    })
}

/// Read-only description of one segment file.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Path of the file.
    pub path: PathBuf,
    /// First sequence number from the file name.
    pub first_sequence_number: u64,
    /// Number of valid records.
    pub record_count: u64,
    /// Size of the file in bytes.
    pub size: u64,
    /// How the valid content of the file ended.
    pub tail: Tail,
    /// The file overlaps its predecessor and would be deleted on recovery.
    pub overlapping: bool,
}

/// Read-only report over the segment files of a queue.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// All segment files ordered by first sequence number.
    pub segments: Vec<SegmentInfo>,
    /// Sequence ranges recovery would report as lost.
    pub gaps: Vec<Range<u64>>,
    /// The sequence number the queue would continue with.
    pub next_sequence_number: Option<u64>,
}

/// Inspects the segment files of a queue without modifying them.
pub async fn scan_directory(directory: &Path, file_prefix: &str) -> Result<ScanReport> {
    let listed = list_segments(directory, file_prefix).await?;
    let file_count = listed.len();
    let mut report = ScanReport::default();

    for (index, (first, path)) in listed.into_iter().enumerate() {
        let contents = tokio::fs::read(&path).await?;
        let size = contents.len() as u64;

        let overlapping = report.next_sequence_number.is_some_and(|end| first < end);
        if overlapping {
            report.segments.push(SegmentInfo {
                path,
                first_sequence_number: first,
                record_count: 0,
                size,
                tail: Tail::Clean,
                overlapping,
            });
            continue;
        }
        if let Some(end) = report.next_sequence_number.filter(|&end| first > end) {
            report.gaps.push(end..first);
        }

        let scan = scan_frames(&contents, first);
        let mut end = first + scan.entries.len() as u64;
        if index + 1 == file_count && scan.tail.lost_records() > 0 {
            let skipped = scan.tail.lost_records();
            report.gaps.push(end..end + skipped);
            end += skipped;
        }
        report.next_sequence_number = Some(end);

        report.segments.push(SegmentInfo {
            path,
            first_sequence_number: first,
            record_count: scan.entries.len() as u64,
            size,
            tail: scan.tail,
            overlapping,
        });
    }

    Ok(report)
}
