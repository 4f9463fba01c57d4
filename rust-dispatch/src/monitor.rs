//! Read-only queue depth reporting.
//!
//! The monitor never creates, alters, or purges a queue. Each queue is
//! checked with a passive declare on its own short-lived channel: a missing
//! queue makes the broker close that channel, which is reported as an error
//! for that queue while the connection stays usable for the rest.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::{
    options::QueueDeclareOptions,
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    Connection, ConnectionProperties,
};
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::queue::QueueTopology;

/// Something that can report how many messages sit in a queue.
#[async_trait]
pub trait QueueInspector: Send + Sync {
    async fn inspect(&self, queue: &str) -> Result<u32, MonitorError>;
}

/// Inspector backed by a live AMQP connection.
pub struct AmqpInspector {
    connection: Connection,
}

impl AmqpInspector {
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;
        Ok(Self { connection })
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "Monitor done").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }
    }
}

#[async_trait]
impl QueueInspector for AmqpInspector {
    async fn inspect(&self, queue: &str) -> Result<u32, MonitorError> {
        let broker = |e: lapin::Error| MonitorError::Broker {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let channel = self.connection.create_channel().await.map_err(broker)?;

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match declared {
            Ok(state) => {
                let count = state.message_count();
                if let Err(e) = channel.close(200, "Inspection done").await {
                    debug!(queue = %queue, error = %e, "rabbitmq_channel_close_error");
                }
                Ok(count)
            }
            // The broker already closed the channel.
            Err(e) if is_not_found(&e) => Err(MonitorError::QueueNotFound(queue.to_string())),
            Err(e) => Err(broker(e)),
        }
    }
}

/// Whether the broker answered 404 NOT_FOUND.
fn is_not_found(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::ProtocolError(e)
            if matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

/// One row of the report.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub queue: String,
    pub outcome: Result<u32, MonitorError>,
}

/// Per-queue results plus their sum.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorReport {
    pub entries: Vec<QueueStatus>,
    total: u64,
}

impl MonitorReport {
    /// Build a report; the total counts only successfully inspected queues.
    pub fn from_entries(entries: Vec<QueueStatus>) -> Self {
        let total = entries
            .iter()
            .filter_map(|entry| entry.outcome.as_ref().ok())
            .fold(0u64, |sum, &count| sum + u64::from(count));

        Self { entries, total }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome.is_err()).count()
    }

    pub fn is_idle(&self) -> bool {
        self.total == 0
    }

    /// Likely causes when nothing is pending anywhere.
    pub fn diagnosis(&self) -> Option<&'static [&'static str]> {
        const NO_PENDING_WORK: &[&str] = &[
            "the webhook never published jobs (production stalled upstream)",
            "workers drained the queues faster than expected",
            "the broker is unreachable or the credentials are wrong",
        ];

        self.is_idle().then_some(NO_PENDING_WORK)
    }

    /// Plain-text table for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::from("Queue status:\n\n");

        for entry in &self.entries {
            let _ = match &entry.outcome {
                Ok(count) => writeln!(out, "  {:30} {:>5} messages", entry.queue, count),
                Err(e) => writeln!(out, "  {:30} error: {}", entry.queue, e),
            };
        }

        let _ = writeln!(out, "\n{}", "=".repeat(60));
        let _ = writeln!(out, "Total messages in queues: {}", self.total);

        match self.diagnosis() {
            Some(causes) => {
                out.push_str("\nNo pending work in any queue. Possible causes:\n");
                for (i, cause) in causes.iter().enumerate() {
                    let _ = writeln!(out, "  {}. {}", i + 1, cause);
                }
            }
            None => {
                let _ = writeln!(
                    out,
                    "\n{} jobs waiting; workers should pick them up.",
                    self.total
                );
            }
        }

        out
    }
}

/// Inspect every catalog queue in order.
pub async fn inspect_all(inspector: &dyn QueueInspector, topology: &QueueTopology) -> MonitorReport {
    let mut entries = Vec::with_capacity(topology.len());

    for queue in topology.names() {
        let outcome = inspector.inspect(queue).await;
        if let Err(e) = &outcome {
            warn!(queue = %queue, error = %e, "monitor_inspect_failed");
        }
        entries.push(QueueStatus {
            queue: queue.to_string(),
            outcome,
        });
    }

    MonitorReport::from_entries(entries)
}
