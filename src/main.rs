use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use http2amqp::cli::Cli;
use http2amqp::logging;
use http2amqp::rabbitmq::{connection::redact_uri, LapinDriver};
use http2amqp::relay::{routes, Relay, RelaySettings};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let _log_guard = logging::init(&config.log_file_path)?;
    info!(
        uri = %redact_uri(&config.uri),
        http_port = config.http_port,
        log_file = %config.log_file_path.display(),
        "Starting http2amqp"
    );

    let driver = LapinDriver::new(config.connect_timeout(), config.publisher_confirms);
    let relay = Relay::spawn(driver, &config.uri, RelaySettings::from(&config));
    let app = routes::create_router(relay.front_end());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    relay.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
