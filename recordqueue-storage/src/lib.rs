//! Durable, priority-ordered record storage.
//!
//! Records are appended to one [`StorageQueue`] per [`Priority`](recordqueue_types::Priority).
//! Each queue persists its records in size-bounded segment files, assigns strictly increasing
//! sequence numbers, and drives an external [`Uploader`] through upload attempts that are retried
//! until the records are confirmed. Disk and memory usage of all queues is bounded by two shared
//! [`ResourceBudget`]s.
//!
//! The [`Storage`] type ties the queues together:
//!
//! ```no_run
//! # async fn example(factory: impl recordqueue_storage::UploaderFactory) -> recordqueue_storage::Result<()> {
//! use bytes::Bytes;
//! use recordqueue_storage::{Storage, StorageOptions};
//! use recordqueue_types::{Priority, RecordMetadata};
//!
//! let storage = Storage::create(StorageOptions::new("/var/cache/records"), factory).await?;
//! let stored = storage
//!     .write(Priority::FastBatch, Bytes::from("event"), RecordMetadata::now())
//!     .await?;
//! println!("stored as {stored}");
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod compression;
pub mod encryption;
mod error;
pub mod file;
mod meta;
pub mod options;
pub mod queue;
pub mod resources;
pub mod segment;
mod storage;
pub mod uploader;

pub use compression::{Compressor, NoCompression, ZstdCompression};
pub use encryption::{Encryptor, PassthroughEncryption, SignedEncryptionKey};
pub use error::{Error, Result};
pub use meta::{QueueMeta, meta_path, read_meta};
pub use options::{QueueOptions, QueueSettings, RetryBackoff, StorageOptions};
pub use queue::{QueueStats, StorageQueue};
pub use resources::{ResourceBudget, ScopedReservation};
pub use storage::Storage;
pub use uploader::{BoxedUploader, SharedUploaderFactory, Uploader, UploaderFactory};
