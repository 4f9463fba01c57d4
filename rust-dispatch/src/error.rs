//! Error taxonomy for the dispatch pipeline.
//!
//! Each stage owns a typed error; `WebhookError` is what the HTTP boundary
//! turns into a response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// A callback that parsed as JSON but cannot describe a payment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("envelope must be a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

/// A succeeded payment whose product has no queue mapping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("payment metadata carries no product")]
    MissingProduct,
    #[error("unknown product `{0}`")]
    UnknownProduct(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker unavailable after {attempts} attempts: {last_error}")]
    BrokerUnavailable { attempts: u32, last_error: String },
    #[error("jobs not confirmed within {0:?}")]
    DeadlineExceeded(std::time::Duration),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("queue `{0}` does not exist")]
    QueueNotFound(String),
    #[error("broker error while inspecting `{queue}`: {reason}")]
    Broker { queue: String, reason: String },
}

/// Outcome of a failed job handler run, as seen by the consumer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Worth another delivery.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Repeating the job cannot succeed.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("route `{product}` targets queue `{queue}` which is not in the catalog")]
    UnknownQueue { product: String, queue: String },
    #[error("route `{0}` has no target queues")]
    EmptyRoute(String),
    #[error("queue catalog is empty")]
    EmptyCatalog,
}

/// Failures the webhook endpoint reports back to the payment provider.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid payment event: {0}")]
    InvalidEvent(#[from] ValidationError),
    #[error("could not publish job: {0}")]
    PublishFailed(#[from] PublishError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, label) = match &self {
            WebhookError::InvalidJson(_) => (StatusCode::BAD_REQUEST, "invalid_json"),
            WebhookError::InvalidEvent(_) => (StatusCode::BAD_REQUEST, "invalid_event"),
            WebhookError::PublishFailed(e) => {
                error!(error = %e, "webhook_publish_failed");
                (StatusCode::SERVICE_UNAVAILABLE, "publish_failed")
            }
        };

        let body = Json(json!({
            "status": label,
            "detail": self.to_string(),
        }));

        (status, body).into_response()
    }
}
