//! Canonical payment events.
//!
//! ## Processing Flow
//!
//! ```text
//! raw JSON envelope → normalize() → PaymentEvent → Router → Job(s)
//! ```

pub mod normalizer;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use normalizer::normalize;

/// Envelope kind (`type` field of the callback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Notification,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    Canceled,
    Pending,
    Unknown,
}

impl PaymentStatus {
    /// Parse the provider's `object.status` value.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" => PaymentStatus::Succeeded,
            "canceled" | "cancelled" => PaymentStatus::Canceled,
            "pending" | "waiting_for_capture" => PaymentStatus::Pending,
            _ => PaymentStatus::Unknown,
        }
    }

    /// Derive a status from the envelope's `event` name, e.g.
    /// `payment.succeeded`.
    pub fn from_event_name(event: &str) -> Self {
        match event.rsplit_once('.') {
            Some(("payment", state)) => Self::parse(state),
            _ => PaymentStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Unknown => "unknown",
        }
    }
}

/// Payment amount as sent by the provider (`{"value": "10.00", "currency": "RUB"}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub value: Decimal,
    pub currency: String,
}

/// A validated payment callback. Built once per request and never shared
/// outside that request's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub status: PaymentStatus,
    pub amount: Option<Money>,
    pub user_id: String,
    /// Lowercased product key; `None` when the metadata names none.
    pub product: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl PaymentEvent {
    /// Only succeeded payments are owed a forecast.
    pub fn is_fulfillable(&self) -> bool {
        self.status == PaymentStatus::Succeeded
    }
}
