use clap::Parser;
use log::{error, info};
use server::config::{ServerArgs, ServerConfig};
use server::network::Server;
use server::services::{InMemoryCredentials, InMemoryPersistence};
use std::sync::Arc;

/// Main-method of the application.
/// Parses command-line arguments, sets up logging and runs the server until Ctrl+C.
fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = ServerArgs::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = ServerConfig::from(&args);
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(
        "Starting server on {} ({} workers, {} sessions, {} rooms)",
        config.bind_addr(),
        config.workers,
        config.max_sessions,
        config.max_rooms
    );

    let server = Server::bind(
        config,
        Arc::new(InMemoryCredentials::new()),
        Arc::new(InMemoryPersistence::new()),
    )
    .await?;

    // Handle shutdown gracefully
    server
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
}
