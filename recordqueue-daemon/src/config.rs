//! Configuration for the record queue daemon.
//!
//! Configuration is loaded from the following sources, with later sources overriding earlier ones:
//!
//! 1. Defaults
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Environment variables (prefixed with `RQ__`)
//!
//! # Environment Variables
//!
//! Environment variables use `RQ__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `RQ__STORAGE__DIRECTORY=/var/lib/recordqueue` sets the queue directory
//! - `RQ__STORAGE__MAX_TOTAL_FILES_SIZE=134217728` sets the disk budget
//! - `RQ__QUEUES__SLOW_BATCH__UPLOAD_PERIOD=30s` overrides the period of one queue
//!
//! # YAML Configuration File
//!
//! ```yaml
//! storage:
//!   directory: /var/lib/recordqueue
//!   max_total_files_size: 134217728
//!
//! queues:
//!   slow_batch:
//!     upload_period: 30s
//!   manual_batch:
//!     disabled: true
//!
//! spool:
//!   outbox: /var/spool/recordqueue
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use recordqueue_storage::{RetryBackoff, StorageOptions, options};
use recordqueue_types::Priority;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "RQ__";

/// A configuration string that is redacted from debug output.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret value.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[redacted]")
    }
}

/// Location and budgets of the durable queues.
///
/// Used in: [`Config::storage`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Storage {
    /// Root directory holding one subdirectory per queue.
    ///
    /// # Default
    ///
    /// `"data/queues"` (relative to the working directory)
    ///
    /// # Environment Variable
    ///
    /// `RQ__STORAGE__DIRECTORY`
    pub directory: PathBuf,

    /// Largest accepted payload in bytes.
    ///
    /// # Environment Variable
    ///
    /// `RQ__STORAGE__MAX_RECORD_SIZE`
    pub max_record_size: u64,

    /// Bytes all queues together may keep on disk.
    ///
    /// # Environment Variable
    ///
    /// `RQ__STORAGE__MAX_TOTAL_FILES_SIZE`
    pub max_total_files_size: u64,

    /// Bytes all queues together may hold in memory while writing and uploading.
    ///
    /// # Environment Variable
    ///
    /// `RQ__STORAGE__MAX_TOTAL_MEMORY_SIZE`
    pub max_total_memory_size: u64,

    /// Key used to verify delivered encryption keys.
    ///
    /// # Environment Variable
    ///
    /// `RQ__STORAGE__SIGNATURE_VERIFICATION_PUBLIC_KEY`
    pub signature_verification_public_key: Option<String>,

    /// Payloads of at least this many bytes are compressed with zstd.
    ///
    /// Set to `None` to store all payloads uncompressed.
    ///
    /// # Default
    ///
    /// `512`
    ///
    /// # Environment Variable
    ///
    /// `RQ__STORAGE__COMPRESSION_THRESHOLD`
    pub compression_threshold: Option<usize>,

    /// Interval for logging the usage of the disk and memory budgets.
    ///
    /// # Default
    ///
    /// `60s`
    ///
    /// # Environment Variable
    ///
    /// `RQ__STORAGE__REPORT_INTERVAL`
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/queues"),
            max_record_size: options::DEFAULT_MAX_RECORD_SIZE,
            max_total_files_size: options::DEFAULT_MAX_TOTAL_FILES_SIZE,
            max_total_memory_size: options::DEFAULT_MAX_TOTAL_MEMORY_SIZE,
            signature_verification_public_key: None,
            compression_threshold: Some(512),
            report_interval: Duration::from_secs(60),
        }
    }
}

/// Overrides for the queue of one priority.
///
/// Fields that are not set keep the defaults of the priority.
///
/// Used in: [`Config::queues`]
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueOverride {
    /// Removes the queue. Writes to its priority are rejected.
    pub disabled: bool,

    /// Disables the periodic timer. The queue only uploads when flushed.
    pub flush_only: bool,

    /// Interval of the periodic upload. `0s` uploads after every write.
    #[serde(with = "humantime_serde")]
    pub upload_period: Option<Duration>,

    /// Delay before a failed or incomplete upload is retried. `0s` disables retries.
    #[serde(with = "humantime_serde")]
    pub upload_retry_delay: Option<Duration>,

    /// Upper bound of the retry delay. When set, the delay doubles after every failure.
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Option<Duration>,

    /// Time an upload attempt may take before it is treated as failed.
    #[serde(with = "humantime_serde")]
    pub upload_timeout: Option<Duration>,

    /// Size after which a segment file is sealed.
    pub max_single_file_size: Option<u64>,
}

/// Settings of the spool uploader.
///
/// The spool uploader writes every upload attempt into one JSON file in the outbox directory.
///
/// Used in: [`Config::spool`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Spool {
    /// Directory receiving the batch files.
    ///
    /// # Default
    ///
    /// `"data/outbox"`
    ///
    /// # Environment Variable
    ///
    /// `RQ__SPOOL__OUTBOX`
    pub outbox: PathBuf,

    /// Fraction of upload attempts that fail on purpose, between `0.0` and `1.0`.
    ///
    /// # Environment Variable
    ///
    /// `RQ__SPOOL__FAILURE_RATE`
    pub failure_rate: f64,

    /// Maximum number of records accepted into one batch.
    ///
    /// The remaining records are uploaded by a follow-up attempt.
    ///
    /// # Environment Variable
    ///
    /// `RQ__SPOOL__MAX_BATCH_RECORDS`
    pub max_batch_records: Option<usize>,
}

impl Default for Spool {
    fn default() -> Self {
        Self {
            outbox: PathBuf::from("data/outbox"),
            failure_rate: 0.0,
            max_batch_records: None,
        }
    }
}

/// [Sentry](https://sentry.io/) error reporting configuration.
///
/// Sentry is disabled unless a DSN is provided.
///
/// Used in: [`Config::sentry`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Sentry DSN.
    ///
    /// # Environment Variable
    ///
    /// `RQ__SENTRY__DSN`
    pub dsn: Option<ConfigSecret>,

    /// Environment name for this deployment.
    ///
    /// # Environment Variable
    ///
    /// `RQ__SENTRY__ENVIRONMENT`
    pub environment: Option<Cow<'static, str>>,

    /// Name of the host running the daemon.
    ///
    /// # Environment Variable
    ///
    /// `RQ__SENTRY__SERVER_NAME`
    pub server_name: Option<Cow<'static, str>>,

    /// Fraction of error events sent to Sentry.
    ///
    /// # Default
    ///
    /// `1.0`
    pub sample_rate: f32,

    /// Fraction of traces sent to Sentry.
    ///
    /// # Default
    ///
    /// `0.01`
    pub traces_sample_rate: f32,

    /// Enables debug output of the Sentry SDK.
    pub debug: bool,

    /// Tags attached to all events.
    ///
    /// # Environment Variables
    ///
    /// - `RQ__SENTRY__TAGS__FOO=foo`
    pub tags: BTreeMap<String, String>,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            server_name: None,
            sample_rate: 1.0,
            traces_sample_rate: 0.01,
            debug: false,
            tags: BTreeMap::new(),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// [`LogFormat::Pretty`] on a terminal, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Plain single-line output.
    Simplified,

    /// JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::error::Error for FormatParseError {}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// `RUST_LOG` takes precedence if it is set.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `RQ__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Environment Variable
    ///
    /// `RQ__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration of the daemon.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Location and budgets of the queues.
    pub storage: Storage,

    /// Per-priority overrides, keyed by priority name such as `slow_batch`.
    pub queues: BTreeMap<String, QueueOverride>,

    /// Settings of the spool uploader.
    pub spool: Spool,

    /// Logging configuration.
    pub logging: Logging,

    /// Sentry error reporting configuration.
    pub sentry: Sentry,
}

impl Config {
    /// Loads configuration from defaults, an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Builds the storage options, applying the per-priority overrides.
    pub fn storage_options(&self) -> Result<StorageOptions> {
        let storage = &self.storage;
        let mut options = StorageOptions::new(&storage.directory)
            .set_max_record_size(storage.max_record_size)
            .set_max_total_files_size(storage.max_total_files_size)
            .set_max_total_memory_size(storage.max_total_memory_size);
        if let Some(key) = &storage.signature_verification_public_key {
            options = options.set_signature_verification_public_key(key.as_str());
        }

        for (name, overrides) in &self.queues {
            let priority: Priority = name
                .parse()
                .with_context(|| format!("invalid queue override `{name}`"))?;

            if overrides.disabled {
                options = options.remove_queue(priority);
                continue;
            }

            let Some(settings) = options.queue_mut(priority) else {
                continue;
            };
            if overrides.flush_only {
                settings.upload_period = None;
            } else if let Some(period) = overrides.upload_period {
                settings.upload_period = Some(period);
            }
            if let Some(delay) = overrides.upload_retry_delay {
                settings.upload_retry_delay = delay;
            }
            if let Some(max) = overrides.max_retry_delay {
                settings.retry_backoff = RetryBackoff::Exponential { max };
            }
            if let Some(timeout) = overrides.upload_timeout {
                settings.upload_timeout = timeout;
            }
            if let Some(size) = overrides.max_single_file_size {
                settings.max_single_file_size = size;
            }
        }

        options.validate()?;
        Ok(options)
    }
}
