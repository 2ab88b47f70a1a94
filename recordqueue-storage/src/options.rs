//! Storage and queue options.
//!
//! [`StorageOptions`] carries the global settings and the per-priority queue table. At storage
//! creation the table is expanded into one [`QueueOptions`] per configured priority by
//! [`StorageOptions::produce_queues_options`].
//!
//! ```
//! use std::time::Duration;
//!
//! use recordqueue_storage::StorageOptions;
//! use recordqueue_types::Priority;
//!
//! let mut options = StorageOptions::new("/var/cache/records")
//!     .set_max_record_size(4 * 1024)
//!     .set_max_total_files_size(64 * 1024 * 1024)
//!     .set_max_total_memory_size(256 * 1024);
//!
//! if let Some(queue) = options.queue_mut(Priority::SlowBatch) {
//!     queue.upload_period = Some(Duration::from_secs(60));
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use recordqueue_types::Priority;

use crate::error::{Error, Result};
use crate::resources::ResourceBudget;

/// Default maximum size of a single record payload.
pub const DEFAULT_MAX_RECORD_SIZE: u64 = 1024 * 1024;
/// Default capacity of the disk budget.
pub const DEFAULT_MAX_TOTAL_FILES_SIZE: u64 = 64 * 1024 * 1024;
/// Default capacity of the memory budget.
pub const DEFAULT_MAX_TOTAL_MEMORY_SIZE: u64 = 4 * 1024 * 1024;
/// Default size after which a segment file is sealed.
pub const DEFAULT_MAX_SINGLE_FILE_SIZE: u64 = 2 * 1024 * 1024;
/// Default delay before a failed upload is retried.
pub const DEFAULT_UPLOAD_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Default time an upload attempt may take before it is abandoned.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How the delay between consecutive failed uploads evolves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryBackoff {
    /// Always wait `upload_retry_delay`.
    #[default]
    Fixed,
    /// Double the delay for every consecutive failure, up to `max`.
    Exponential {
        /// Upper bound of the delay.
        max: Duration,
    },
}

impl RetryBackoff {
    /// Returns the delay before the next retry after `consecutive_failures` failed uploads.
    ///
    /// `consecutive_failures` counts the failure that is being retried, so the first retry
    /// passes `1` and waits exactly `base`.
    pub fn delay(&self, base: Duration, consecutive_failures: u32) -> Duration {
        match *self {
            RetryBackoff::Fixed => base,
            RetryBackoff::Exponential { max } => {
                let exponent = consecutive_failures.saturating_sub(1).min(31);
                base.checked_mul(1 << exponent).unwrap_or(max).min(max)
            }
        }
    }
}

/// Per-priority queue settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    /// Directory of the queue, relative to the storage directory.
    pub subdirectory: PathBuf,
    /// Prefix of the segment and metadata file names.
    pub file_prefix: String,
    /// Interval of periodic uploads.
    ///
    /// `None` disables the timer, uploads only happen on explicit flush. A zero period uploads
    /// right after every write.
    pub upload_period: Option<Duration>,
    /// Delay before a failed upload is retried. Zero disables retries.
    pub upload_retry_delay: Duration,
    /// Growth of the retry delay across consecutive failures.
    pub retry_backoff: RetryBackoff,
    /// Size after which the active segment file is sealed.
    pub max_single_file_size: u64,
    /// Time an upload attempt may take before it is treated as failed.
    pub upload_timeout: Duration,
}

impl QueueSettings {
    /// Returns the default settings for the queue of `priority`.
    pub fn for_priority(priority: Priority) -> Self {
        let (name, upload_period) = match priority {
            Priority::Security => ("Security", Some(Duration::ZERO)),
            Priority::Immediate => ("Immediate", Some(Duration::ZERO)),
            Priority::FastBatch => ("FastBatch", Some(Duration::from_secs(1))),
            Priority::SlowBatch => ("SlowBatch", Some(Duration::from_secs(20))),
            Priority::BackgroundBatch => ("BackgroundBatch", Some(Duration::from_secs(60))),
            Priority::ManualBatch => ("ManualBatch", None),
        };

        let max_single_file_size = match priority {
            Priority::Security => 64 * 1024,
            _ => DEFAULT_MAX_SINGLE_FILE_SIZE,
        };

        Self {
            subdirectory: PathBuf::from(name),
            file_prefix: format!("P_{name}"),
            upload_period,
            upload_retry_delay: DEFAULT_UPLOAD_RETRY_DELAY,
            retry_backoff: RetryBackoff::Fixed,
            max_single_file_size,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

/// Global options of a [`Storage`](crate::Storage).
#[derive(Clone, Debug)]
pub struct StorageOptions {
    directory: PathBuf,
    signature_verification_public_key: Option<String>,
    max_record_size: u64,
    disk: ResourceBudget,
    memory: ResourceBudget,
    queues: BTreeMap<Priority, QueueSettings>,
}

impl StorageOptions {
    /// Creates options rooted at `directory` with one default queue per priority.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let queues = Priority::ALL
            .into_iter()
            .map(|priority| (priority, QueueSettings::for_priority(priority)))
            .collect();

        Self {
            directory: directory.into(),
            signature_verification_public_key: None,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            disk: ResourceBudget::new("disk", DEFAULT_MAX_TOTAL_FILES_SIZE),
            memory: ResourceBudget::new("memory", DEFAULT_MAX_TOTAL_MEMORY_SIZE),
            queues,
        }
    }

    /// Sets the root directory of all queues.
    pub fn set_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Sets the key passed to the encryption collaborator to verify delivered keys.
    pub fn set_signature_verification_public_key(mut self, key: impl Into<String>) -> Self {
        self.signature_verification_public_key = Some(key.into());
        self
    }

    /// Sets the maximum size of a single record payload.
    pub fn set_max_record_size(mut self, max_record_size: u64) -> Self {
        self.max_record_size = max_record_size;
        self
    }

    /// Replaces the disk budget with a fresh one of the given capacity.
    pub fn set_max_total_files_size(mut self, max_total_files_size: u64) -> Self {
        self.disk = ResourceBudget::new("disk", max_total_files_size);
        self
    }

    /// Replaces the memory budget with a fresh one of the given capacity.
    pub fn set_max_total_memory_size(mut self, max_total_memory_size: u64) -> Self {
        self.memory = ResourceBudget::new("memory", max_total_memory_size);
        self
    }

    /// Configures the queue for `priority`, replacing any previous settings.
    pub fn set_queue(mut self, priority: Priority, settings: QueueSettings) -> Self {
        self.queues.insert(priority, settings);
        self
    }

    /// Removes the queue for `priority`. Writes with that priority fail with `NotFound`.
    pub fn remove_queue(mut self, priority: Priority) -> Self {
        self.queues.remove(&priority);
        self
    }

    /// Returns mutable access to the settings of the queue for `priority`.
    pub fn queue_mut(&mut self, priority: Priority) -> Option<&mut QueueSettings> {
        self.queues.get_mut(&priority)
    }

    /// Returns the settings of the queue for `priority`, if it is configured.
    pub fn queue_settings(&self, priority: Priority) -> Option<&QueueSettings> {
        self.queues.get(&priority)
    }

    /// Returns the root directory of all queues.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the signature verification key, if configured.
    pub fn signature_verification_public_key(&self) -> Option<&str> {
        self.signature_verification_public_key.as_deref()
    }

    /// Returns the maximum size of a single record payload.
    pub fn max_record_size(&self) -> u64 {
        self.max_record_size
    }

    /// Returns the capacity of the disk budget.
    pub fn max_total_files_size(&self) -> u64 {
        self.disk.total()
    }

    /// Returns the capacity of the memory budget.
    pub fn max_total_memory_size(&self) -> u64 {
        self.memory.total()
    }

    /// Returns the shared disk budget.
    pub fn disk_budget(&self) -> &ResourceBudget {
        &self.disk
    }

    /// Returns the shared memory budget.
    pub fn memory_budget(&self) -> &ResourceBudget {
        &self.memory
    }

    /// Expands the queue table into the options of every configured queue.
    ///
    /// The list is ordered from the least to the most urgent priority.
    pub fn produce_queues_options(&self) -> Vec<(Priority, QueueOptions)> {
        self.queues
            .iter()
            .rev()
            .map(|(&priority, settings)| {
                let options = QueueOptions {
                    settings: settings.clone(),
                    ..QueueOptions::new(self)
                };
                (priority, options)
            })
            .collect()
    }

    /// Checks that the queue table describes distinct, usable queues.
    pub fn validate(&self) -> Result<()> {
        if self.max_record_size == 0 {
            return Err(Error::Configuration(
                "max_record_size must be positive".into(),
            ));
        }

        let mut locations = HashSet::new();
        for (priority, queue) in &self.queues {
            if queue.max_single_file_size == 0 {
                return Err(Error::Configuration(format!(
                    "queue {priority}: max_single_file_size must be positive"
                )));
            }
            if queue.file_prefix.is_empty() || queue.file_prefix.contains(['/', '\\']) {
                return Err(Error::Configuration(format!(
                    "queue {priority}: invalid file prefix {:?}",
                    queue.file_prefix
                )));
            }
            if queue.upload_timeout.is_zero() {
                return Err(Error::Configuration(format!(
                    "queue {priority}: upload_timeout must be positive"
                )));
            }

            let location = (self.directory.join(&queue.subdirectory), &queue.file_prefix);
            if !locations.insert(location) {
                return Err(Error::Configuration(format!(
                    "queue {priority} shares its directory and file prefix with another queue"
                )));
            }
        }

        Ok(())
    }
}

/// Fully resolved options of a single [`StorageQueue`](crate::StorageQueue).
#[derive(Clone, Debug)]
pub struct QueueOptions {
    storage_directory: PathBuf,
    max_record_size: u64,
    disk: ResourceBudget,
    memory: ResourceBudget,
    settings: QueueSettings,
}

impl QueueOptions {
    /// Creates queue options inheriting the global settings and budgets of `storage`.
    ///
    /// The queue settings start out as those of [`Priority::ManualBatch`].
    pub fn new(storage: &StorageOptions) -> Self {
        Self {
            storage_directory: storage.directory.clone(),
            max_record_size: storage.max_record_size,
            disk: storage.disk.clone(),
            memory: storage.memory.clone(),
            settings: QueueSettings::for_priority(Priority::ManualBatch),
        }
    }

    /// Sets the directory of the queue, relative to the storage directory.
    pub fn set_subdirectory(mut self, subdirectory: impl Into<PathBuf>) -> Self {
        self.settings.subdirectory = subdirectory.into();
        self
    }

    /// Sets the prefix of segment and metadata file names.
    pub fn set_file_prefix(mut self, file_prefix: impl Into<String>) -> Self {
        self.settings.file_prefix = file_prefix.into();
        self
    }

    /// Sets the periodic upload interval, `None` for flush-only queues.
    pub fn set_upload_period(mut self, upload_period: Option<Duration>) -> Self {
        self.settings.upload_period = upload_period;
        self
    }

    /// Sets the delay before a failed upload is retried.
    pub fn set_upload_retry_delay(mut self, upload_retry_delay: Duration) -> Self {
        self.settings.upload_retry_delay = upload_retry_delay;
        self
    }

    /// Sets how the retry delay grows across consecutive failures.
    pub fn set_retry_backoff(mut self, retry_backoff: RetryBackoff) -> Self {
        self.settings.retry_backoff = retry_backoff;
        self
    }

    /// Sets the size after which the active segment file is sealed.
    pub fn set_max_single_file_size(mut self, max_single_file_size: u64) -> Self {
        self.settings.max_single_file_size = max_single_file_size;
        self
    }

    /// Sets the time an upload attempt may take.
    pub fn set_upload_timeout(mut self, upload_timeout: Duration) -> Self {
        self.settings.upload_timeout = upload_timeout;
        self
    }

    /// Returns the directory holding the files of this queue.
    pub fn directory(&self) -> PathBuf {
        self.storage_directory.join(&self.settings.subdirectory)
    }

    /// Returns the prefix of segment and metadata file names.
    pub fn file_prefix(&self) -> &str {
        &self.settings.file_prefix
    }

    /// Returns the periodic upload interval.
    pub fn upload_period(&self) -> Option<Duration> {
        self.settings.upload_period
    }

    /// Returns `true` if every write triggers an upload.
    pub fn uploads_after_write(&self) -> bool {
        self.settings.upload_period == Some(Duration::ZERO)
    }

    /// Returns the delay before a failed upload is retried.
    pub fn upload_retry_delay(&self) -> Duration {
        self.settings.upload_retry_delay
    }

    /// Returns the retry backoff policy.
    pub fn retry_backoff(&self) -> RetryBackoff {
        self.settings.retry_backoff
    }

    /// Returns the size after which the active segment file is sealed.
    pub fn max_single_file_size(&self) -> u64 {
        self.settings.max_single_file_size
    }

    /// Returns the time an upload attempt may take.
    pub fn upload_timeout(&self) -> Duration {
        self.settings.upload_timeout
    }

    /// Returns the maximum size of a single record payload.
    pub fn max_record_size(&self) -> u64 {
        self.max_record_size
    }

    /// Returns the shared disk budget.
    pub fn disk_budget(&self) -> &ResourceBudget {
        &self.disk
    }

    /// Returns the shared memory budget.
    pub fn memory_budget(&self) -> &ResourceBudget {
        &self.memory
    }
}
