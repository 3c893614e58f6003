//! packet-link: a packet-framed echo server
//!
//! Every inbound `[code][varlen][payload]` packet is sent back with the same
//! code. Code 0 is a ping and is answered with an empty packet.
//!
//! Features:
//! - TCP, Unix domain socket and named pipe endpoints
//! - Growable per-connection read buffers
//! - Idle connection sweeping
//! - Configuration via CLI arguments or TOML file

mod config;
mod server;

use config::Config;
use server::Server;
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

    let workers = config.workers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    info!(
        listen = %config.listen,
        workers,
        max_connections = config.max_connections,
        read_buffer = config.connection.read_buffer_size,
        threshold = config.connection.threshold,
        idle_timeout = config.idle_timeout,
        "Starting packet-link server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::new(config);
        server.run().await
    })
}
