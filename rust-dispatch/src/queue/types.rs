//! Queue message types.
//!
//! This module defines the message formats for:
//! - work queues (`*_predictions`, `recommendations`, ...): [`Job`]
//! - `dead_letters`: [`DeadLetter`]
//! - `unrouted_events`: [`UnroutedEvent`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::event::PaymentEvent;

/// Length of a job id in hex characters (128 bits of the digest).
const JOB_ID_LEN: usize = 32;

/// Derive the job id for one purchased product of one payment.
///
/// The id is a pure function of its inputs, so republishing the same event
/// yields the same id and consumers can deduplicate on it.
pub fn derive_job_id(event_id: &str, product: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_id.as_bytes());
    hasher.update(b":");
    hasher.update(product.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(JOB_ID_LEN);
    id
}

// =============================================================================
// Work Queue Types
// =============================================================================

/// One unit of forecast-generation work.
///
/// Redelivery counts are tracked by the consumer from broker state, never
/// written into the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub event_id: String,
    pub user_id: String,
    pub product: String,
    pub queue_name: String,
    /// Opaque generation parameters.
    #[serde(default)]
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Build the job a payment owes on `queue_name` for `product`.
    pub fn for_event(event: &PaymentEvent, product: &str, queue_name: &str) -> Self {
        let payload = json!({
            "amount": event.amount.as_ref().map(|m| m.value.to_string()),
            "currency": event.amount.as_ref().map(|m| m.currency.clone()),
            "paid_at": event.created_at,
        });

        Self {
            job_id: derive_job_id(&event.event_id, product),
            event_id: event.event_id.clone(),
            user_id: event.user_id.clone(),
            product: product.to_string(),
            queue_name: queue_name.to_string(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

// =============================================================================
// Dead Letter Types (dead_letters queue)
// =============================================================================

/// Machine-readable reason a job was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterCode {
    PermanentFailure,
    MaxAttemptsExceeded,
    Unparseable,
}

impl DeadLetterCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterCode::PermanentFailure => "PERMANENT_FAILURE",
            DeadLetterCode::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            DeadLetterCode::Unparseable => "UNPARSEABLE",
        }
    }
}

/// A job held for manual inspection after processing gave up on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Missing when the delivery body could not be parsed as a job.
    pub job: Option<Job>,
    /// Lossy copy of an unparseable body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
    pub origin_queue: String,
    pub code: DeadLetterCode,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn for_job(job: Job, code: DeadLetterCode, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            origin_queue: job.queue_name.clone(),
            job: Some(job),
            raw_body: None,
            code,
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    pub fn unparseable(origin_queue: &str, body: &[u8], reason: impl Into<String>) -> Self {
        Self {
            job: None,
            raw_body: Some(String::from_utf8_lossy(body).into_owned()),
            origin_queue: origin_queue.to_string(),
            code: DeadLetterCode::Unparseable,
            reason: reason.into(),
            attempts: 1,
            failed_at: Utc::now(),
        }
    }

    /// Broker message id: the job id when known.
    pub fn message_id(&self) -> String {
        match &self.job {
            Some(job) => format!("dead-{}", job.job_id),
            None => format!("dead-{}-{}", self.origin_queue, self.failed_at.timestamp_millis()),
        }
    }
}

// =============================================================================
// Unrouted Event Types (unrouted_events queue)
// =============================================================================

/// A succeeded payment the router could not map to any queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnroutedEvent {
    pub event_id: String,
    pub product: Option<String>,
    pub reason: String,
    /// The webhook body exactly as received.
    pub raw: Value,
    pub received_at: DateTime<Utc>,
}

impl UnroutedEvent {
    pub fn new(event: &PaymentEvent, reason: impl Into<String>, raw: Value) -> Self {
        Self {
            event_id: event.event_id.clone(),
            product: event.product.clone(),
            reason: reason.into(),
            raw,
            received_at: Utc::now(),
        }
    }
}
