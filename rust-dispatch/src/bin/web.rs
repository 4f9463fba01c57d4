//! Forecast Web Server - payment webhook receiver.
//!
//! This binary provides the provider-facing HTTP server that:
//! - Validates and normalizes payment notifications
//! - Drops duplicate deliveries of the same payment
//! - Routes each purchased product to its work queues
//! - Answers 200 only after the broker confirmed every job

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dispatch::queue::JobSink;
use dispatch::{shutdown_signal, web, AppState, Config, IdempotencyStore, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    let topology = config.topology().context("Invalid queue catalog")?;
    let router = config
        .router(&topology)
        .context("Invalid product routing table")?;

    info!(
        port = config.port,
        broker = %config.broker_endpoint(),
        queues = topology.len(),
        products = router.len(),
        publish_max_attempts = config.publish_max_attempts,
        publish_deadline_ms = config.publish_deadline_ms,
        "config_loaded"
    );

    // Create RabbitMQ publisher
    let publisher = Publisher::new(
        config.rabbitmq_url.clone(),
        topology,
        config.publish_retry(),
        config.confirm_timeout(),
    );
    info!("rabbitmq_publisher_created");

    // Create application state
    let sink: Arc<dyn JobSink> = Arc::new(publisher.clone());
    let state = AppState::new(sink, router, IdempotencyStore::new(config.idempotency_ttl()))
        .with_publish_deadline(config.publish_deadline());

    let app = web::router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("web_server_shutting_down");
        })
        .await
        .context("Server error")?;

    // Close publisher connection
    publisher.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}
