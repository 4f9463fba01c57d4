//! Forecast Worker - async RabbitMQ consumer for paid forecast jobs.
//!
//! This worker consumes jobs from the configured work queues and hands each
//! one to the forecast generation service. Transient failures are retried
//! through the broker; permanent ones land on the dead-letter queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dispatch::worker::{self, HttpForecastHandler};
use dispatch::{shutdown_signal, Config, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        broker = %config.broker_endpoint(),
        queues = ?config.worker_queues,
        prefetch = config.worker_prefetch,
        max_attempts = config.worker_max_attempts,
        forecast_api_url = %config.forecast_api_url,
        "config_loaded"
    );

    let topology = config.topology().context("Invalid queue catalog")?;

    // Dead letters go out through a confirm-mode publisher
    let publisher = Publisher::new(
        config.rabbitmq_url.clone(),
        topology,
        config.publish_retry(),
        config.confirm_timeout(),
    );

    let handler = HttpForecastHandler::new(
        config.forecast_api_url.clone(),
        Duration::from_millis(config.request_timeout_ms),
    )?;

    let result = worker::run(&config, Arc::new(handler), publisher.clone(), shutdown_signal()).await;

    publisher.close().await;

    result
}
