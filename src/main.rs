//! backup-server: a per-user file backup service
//!
//! Supported operations:
//! - Backup a file under a user's namespace
//! - Restore a previously backed-up file
//! - Delete a file (idempotent)
//! - List every file a user has backed up
//!
//! Features:
//! - One task per connection, requests handled in order per connection
//! - Payloads streamed to and from disk in bounded chunks
//! - Staged writes renamed into place
//! - Configuration via CLI arguments or TOML file

use backup_server::config::Config;
use backup_server::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
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
        host = %config.host,
        port = config.port,
        base_dir = %config.base_dir.display(),
        workers = ?config.workers,
        "Starting backup server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let server = Server::new(config)?;
    runtime.block_on(server.run())
}
