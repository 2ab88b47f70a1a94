//! Lifecycle of the running daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use recordqueue_storage::{
    NoCompression, PassthroughEncryption, ResourceBudget, Storage, StorageOptions,
    ZstdCompression,
};
use tokio::io::BufReader;
use tokio::signal::unix::SignalKind;

use crate::config::Config;
use crate::producer;
use crate::spool::SpoolFactory;

/// Opens the storage and runs until termination is requested.
///
/// With `read_stdin`, records are read from standard input as JSON lines while the daemon runs.
/// Reaching the end of the input does not stop the daemon.
pub async fn run(config: Config, read_stdin: bool) -> Result<()> {
    tracing::info!("Starting record queue");

    let storage = open_storage(&config).await?;

    let interval = config.storage.report_interval;
    if !interval.is_zero() {
        for budget in [storage.disk_budget().clone(), storage.memory_budget().clone()] {
            tokio::spawn(report_usage(budget, interval));
        }
    }

    if read_stdin {
        let storage = storage.clone();
        tokio::spawn(async move {
            let guard = elegant_departure::get_shutdown_guard();
            let input = BufReader::new(tokio::io::stdin());
            tokio::select! {
                result = producer::produce(&storage, input) => {
                    if let Err(err) = result {
                        tracing::error!(error = %err, "Reading records from stdin failed");
                    }
                }
                _ = guard.wait() => {}
            }
        });
    }

    tokio::spawn(async move {
        elegant_departure::get_shutdown_guard().wait().await;
        tracing::info!("Shutting down ...");
    });

    elegant_departure::tokio::depart()
        .on_termination()
        .on_sigint()
        .on_signal(SignalKind::hangup())
        .on_signal(SignalKind::quit())
        .await;

    storage.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Creates the storage described by `config` with the spool uploader.
pub async fn open_storage(config: &Config) -> Result<Storage> {
    let options: StorageOptions = config.storage_options()?;
    let factory = Arc::new(SpoolFactory::from(&config.spool));
    let encryption =
        PassthroughEncryption::new(config.storage.signature_verification_public_key.clone());

    let storage = match config.storage.compression_threshold {
        Some(threshold) => {
            let compression = ZstdCompression::new(threshold);
            Storage::create_with_modules(options, factory, compression, encryption).await
        }
        None => Storage::create_with_modules(options, factory, NoCompression, encryption).await,
    };

    storage.with_context(|| {
        format!(
            "failed to open queues in {}",
            config.storage.directory.display()
        )
    })
}

async fn report_usage(budget: ResourceBudget, interval: std::time::Duration) {
    let name = budget.name();
    budget
        .run_emitter(interval, |used, total| async move {
            tracing::info!(budget = name, used, total, "Budget usage");
        })
        .await;
}
