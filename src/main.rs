//! daq-emulator: a file-backed acquisition control endpoint
//!
//! Answers the `GetConfig` gRPC call with the raw bytes of a configuration
//! file, so client software can be tested without the physical unit.
//!
//! Features:
//! - File re-read on every call, served byte for byte
//! - Failed reads reported to the caller as gRPC status codes
//! - Configuration via CLI arguments or TOML file

use daq_emulator::config::Config;
use daq_emulator::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        endpoint = %config.endpoint,
        file = %config.path_to_file.display(),
        request_timeout = ?config.request_timeout,
        concurrency_limit = ?config.concurrency_limit,
        workers = ?config.workers,
        "Starting daq-emulator"
    );

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers.filter(|&w| w > 0) {
        runtime.worker_threads(workers);
    }
    let runtime = runtime.enable_all().build()?;

    runtime.block_on(Server::new(config).run())?;
    Ok(())
}
