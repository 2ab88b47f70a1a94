//! The multi-priority storage front.

use std::sync::Arc;

use bytes::Bytes;
use recordqueue_types::{Priority, RecordMetadata, SequenceInformation, UploadReason};

use crate::compression::{Compressor, NoCompression};
use crate::encryption::{Encryptor, PassthroughEncryption, SignedEncryptionKey};
use crate::error::{Error, Result};
use crate::options::StorageOptions;
use crate::queue::{QueueStats, StorageQueue};
use crate::resources::ResourceBudget;
use crate::uploader::{SharedUploaderFactory, UploaderFactory};

#[derive(Debug)]
struct StorageInner {
    options: StorageOptions,
    queues: Vec<(Priority, StorageQueue)>,
    compressor: Box<dyn Compressor>,
    encryptor: Box<dyn Encryptor>,
}

/// Routes records to one [`StorageQueue`] per priority.
///
/// This type is cheaply cloneable and shares the queues between clones.
#[derive(Clone, Debug)]
pub struct Storage(Arc<StorageInner>);

impl Storage {
    /// Opens all configured queues without compression and with passthrough encryption.
    pub async fn create(options: StorageOptions, factory: impl UploaderFactory) -> Result<Self> {
        let encryptor = PassthroughEncryption::new(
            options
                .signature_verification_public_key()
                .map(str::to_owned),
        );
        Self::create_with_modules(options, Arc::new(factory), NoCompression, encryptor).await
    }

    /// Opens all configured queues with custom payload collaborators.
    ///
    /// Every queue is recovered from disk before any of them starts its timer. Queues holding
    /// unconfirmed records start an upload right away.
    pub async fn create_with_modules(
        options: StorageOptions,
        factory: SharedUploaderFactory,
        compressor: impl Compressor,
        encryptor: impl Encryptor,
    ) -> Result<Self> {
        options.validate()?;
        tokio::fs::create_dir_all(options.directory()).await?;

        let mut queues = Vec::new();
        for (priority, queue_options) in options.produce_queues_options() {
            let queue = StorageQueue::create(priority, queue_options, factory.clone()).await?;
            queues.push((priority, queue));
        }

        for (priority, queue) in &queues {
            queue.start();
            if queue.has_unconfirmed().await {
                tracing::info!(%priority, "Resuming upload of recovered records");
                queue.initiate_upload(UploadReason::InitResume)?;
            }
        }

        tracing::info!(
            directory = %options.directory().display(),
            queues = queues.len(),
            "Storage ready"
        );

        Ok(Self(Arc::new(StorageInner {
            options,
            queues,
            compressor: Box::new(compressor),
            encryptor: Box::new(encryptor),
        })))
    }

    /// Returns the queue for `priority`.
    pub fn queue(&self, priority: Priority) -> Result<&StorageQueue> {
        self.0
            .queues
            .iter()
            .find(|(p, _)| *p == priority)
            .map(|(_, queue)| queue)
            .ok_or(Error::NotFound(priority))
    }

    /// Returns all queues, ordered from the least to the most urgent priority.
    pub fn queues(&self) -> impl Iterator<Item = &StorageQueue> {
        self.0.queues.iter().map(|(_, queue)| queue)
    }

    /// Compresses, encrypts and stores a record in the queue for `priority`.
    pub async fn write(
        &self,
        priority: Priority,
        payload: Bytes,
        mut metadata: RecordMetadata,
    ) -> Result<SequenceInformation> {
        let queue = self.queue(priority)?;

        let (payload, compression) = self.0.compressor.compress(payload)?;
        let (payload, encryption) = self.0.encryptor.encrypt(payload)?;
        metadata.compression = compression;
        metadata.encryption = encryption;

        queue.write(payload, metadata).await
    }

    /// Uploads everything unconfirmed in the queue for `priority`.
    pub fn flush(&self, priority: Priority) -> Result<()> {
        self.queue(priority)?.flush()
    }

    /// Uploads everything unconfirmed in all queues.
    ///
    /// All queues are triggered even if some of them fail, the first error is returned.
    pub fn flush_all(&self) -> Result<()> {
        self.initiate_all(UploadReason::ImmediateFlush)
    }

    /// Starts an upload on all queues after an encryption key became available.
    pub fn on_key_delivered(&self) -> Result<()> {
        self.initiate_all(UploadReason::KeyDelivery)
    }

    /// Installs a newly delivered encryption key and uploads withheld records.
    pub fn update_encryption_key(&self, key: SignedEncryptionKey) -> Result<()> {
        self.0.encryptor.update_encryption_key(key)?;
        self.on_key_delivered()
    }

    /// Starts a manually requested upload on the queue for `priority`.
    pub fn upload(&self, priority: Priority) -> Result<()> {
        self.queue(priority)?.initiate_upload(UploadReason::Manual)
    }

    fn initiate_all(&self, reason: UploadReason) -> Result<()> {
        let mut result = Ok(());
        for queue in self.queues() {
            if let Err(err) = queue.initiate_upload(reason) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Confirms records up to and including `sequence_information` on behalf of the server.
    pub async fn confirm(&self, sequence_information: SequenceInformation) -> Result<()> {
        self.queue(sequence_information.priority)?
            .confirm(sequence_information)
            .await
    }

    /// Returns the statistics of all queues.
    pub async fn stats(&self) -> Vec<QueueStats> {
        let mut stats = Vec::with_capacity(self.0.queues.len());
        for queue in self.queues() {
            stats.push(queue.stats().await);
        }
        stats
    }

    /// Returns the options the storage was created with.
    pub fn options(&self) -> &StorageOptions {
        &self.0.options
    }

    /// Returns the shared disk budget.
    pub fn disk_budget(&self) -> &ResourceBudget {
        self.0.options.disk_budget()
    }

    /// Returns the shared memory budget.
    pub fn memory_budget(&self) -> &ResourceBudget {
        self.0.options.memory_budget()
    }

    /// Shuts down all queues, waiting for in-flight uploads.
    pub async fn shutdown(&self) {
        for queue in self.queues() {
            queue.shutdown().await;
        }
        tracing::info!("Storage shut down");
    }
}
