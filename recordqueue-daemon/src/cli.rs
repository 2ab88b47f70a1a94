//! Command line interface of the `recordqueue` binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;

use crate::config::Config;
use crate::{daemon, inspect, observability};

/// Durable local record queue.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Inspect(InspectCommand),
    Version(VersionCommand),
}

/// run the queue daemon
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// read records as JSON lines from standard input
    #[argh(switch)]
    stdin: bool,
}

/// print the segments, sequence ranges and gaps of every queue without modifying them
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "inspect")]
struct InspectCommand {}

/// print the record queue version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    let result = runtime.block_on(async move {
        match args.command {
            Command::Run(RunCommand { stdin }) => daemon::run(config, stdin).await,
            Command::Inspect(InspectCommand {}) => {
                let options = config.storage_options()?;
                for report in inspect::inspect(&options).await? {
                    print!("{report}");
                }
                Ok(())
            }
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    });

    drop(_runtime_guard);
    // A blocked read on stdin must not hold up the exit.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}
