use tracing_subscriber::EnvFilter;

const CRATE_NAMES: &[&str] = &[
    "recordqueue",
    "recordqueue_daemon",
    "recordqueue_storage",
    "recordqueue_types",
];

/// Initialize the logger for testing.
///
/// Output goes to the writer captured by the Rust test runner. Unless `RUST_LOG` is set, the
/// record queue crates log at `TRACE` and everything else at `ERROR`. Calling this more than once
/// is fine.
///
/// # Example
///
/// ```
/// recordqueue_test::tracing::init();
/// ```
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}

fn default_filter() -> EnvFilter {
    CRATE_NAMES
        .iter()
        .filter_map(|name| format!("{name}=TRACE").parse().ok())
        .fold(EnvFilter::new("ERROR"), EnvFilter::add_directive)
}
