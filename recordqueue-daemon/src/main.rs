fn main() -> anyhow::Result<()> {
    recordqueue_daemon::cli::execute()
}
