//! Maps a raw provider callback into a [`PaymentEvent`].
//!
//! Only the idempotency key (`object.id`) and the purchaser
//! (`object.metadata.user_id`) are mandatory. Amount and timestamp are
//! informational; malformed values are logged and dropped rather than
//! blocking fulfillment of a paid order.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use super::{EventKind, Money, PaymentEvent, PaymentStatus};
use crate::error::ValidationError;

/// Validate and normalize a parsed webhook body.
pub fn normalize(raw: &Value) -> Result<PaymentEvent, ValidationError> {
    let root = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    let kind = match root.get("type").and_then(Value::as_str) {
        Some("notification") => EventKind::Notification,
        _ => EventKind::Other,
    };

    let object = root
        .get("object")
        .and_then(Value::as_object)
        .ok_or(ValidationError::MissingField("object"))?;

    let event_id = non_empty_str(object.get("id")).ok_or(ValidationError::MissingField("object.id"))?;

    let status = match object.get("status").and_then(Value::as_str) {
        Some(raw_status) => PaymentStatus::parse(raw_status),
        None => root
            .get("event")
            .and_then(Value::as_str)
            .map(PaymentStatus::from_event_name)
            .unwrap_or(PaymentStatus::Unknown),
    };

    let metadata = object.get("metadata").and_then(Value::as_object);

    let user_id = metadata
        .and_then(|m| identifier(m.get("user_id")))
        .ok_or(ValidationError::MissingField("object.metadata.user_id"))?;

    // Older payments carry the product under `planet`.
    let product = metadata
        .and_then(|m| non_empty_str(m.get("product")).or_else(|| non_empty_str(m.get("planet"))))
        .map(|p| p.to_ascii_lowercase());

    let amount = object.get("amount").and_then(|value| {
        match serde_json::from_value::<Money>(value.clone()) {
            Ok(money) => Some(money),
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "payment_amount_invalid");
                None
            }
        }
    });

    let created_at = object
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|ts| match DateTime::parse_from_rfc3339(ts) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(e) => {
                warn!(event_id = %event_id, created_at = %ts, error = %e, "payment_created_at_invalid");
                None
            }
        });

    Ok(PaymentEvent {
        event_id,
        kind,
        status,
        amount,
        user_id,
        product,
        created_at,
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accept identifiers sent either as strings or as JSON numbers.
fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Number(n) => Some(n.to_string()),
        other => non_empty_str(Some(other)),
    }
}
