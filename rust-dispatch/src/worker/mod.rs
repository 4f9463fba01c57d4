//! Worker side of the job queues.
//!
//! Each delivery moves through:
//!
//! ```text
//! delivered-unacked → processing → acked
//!                               ↘ nacked + requeued   (transient, attempts left)
//!                               ↘ dead-lettered + acked (permanent / exhausted)
//! ```
//!
//! Delivery is at-least-once, so processing is keyed by `job_id` and a
//! redelivered job that already completed is acked without running again.

pub mod consumer;
pub mod disposition;
pub mod forecast_api;

use async_trait::async_trait;

use crate::error::{ProcessingError, PublishError};
use crate::queue::{DeadLetter, Job};

pub use consumer::run;
pub use disposition::{decide, DeliveryLedger, Disposition};
pub use forecast_api::HttpForecastHandler;

/// Does the actual work for one job.
///
/// Implementations must tolerate seeing the same `job_id` more than once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), ProcessingError>;
}

/// Settles deliveries with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> anyhow::Result<()>;

    /// Hand the delivery back to its queue for another attempt.
    async fn nack_requeue(&self, delivery_tag: u64) -> anyhow::Result<()>;
}

/// Where jobs go when processing gives up on them.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Returns only once the letter is durably stored.
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), PublishError>;
}
