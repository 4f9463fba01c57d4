//! Forecast Monitor - prints how many jobs wait in each work queue.
//!
//! Read-only: queues are checked passively and never created or purged.
//! Exits non-zero when the broker cannot be reached at all.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dispatch::monitor::{inspect_all, AmqpInspector};
use dispatch::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true).with_writer(std::io::stderr))
        .init();

    let config = Config::from_env();
    let topology = config.topology().context("Invalid queue catalog")?;

    println!("Connecting to RabbitMQ at {}", config.broker_endpoint());

    let inspector = AmqpInspector::connect(&config.rabbitmq_url)
        .await
        .context("Check that RabbitMQ is running and RABBITMQ_URL and its credentials are correct")?;

    let report = inspect_all(&inspector, &topology).await;
    inspector.close().await;

    print!("{}", report.render());

    info!(
        total = report.total(),
        failed = report.failed(),
        idle = report.is_idle(),
        "monitor_report_complete"
    );

    Ok(())
}
