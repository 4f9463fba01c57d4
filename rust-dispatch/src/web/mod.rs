//! Web server module for the payment provider's callbacks.
//!
//! This module provides the HTTP boundary that:
//! - Validates and normalizes payment envelopes
//! - Suppresses duplicate deliveries
//! - Routes succeeded payments to their work queues
//! - Answers only once the broker confirmed every job

pub mod handlers;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use handlers::{
    health, payment_webhook, webhook_probe, webhook_success, AppState, HealthResponse,
    ProbeResponse, WebhookResponse,
};

/// Build the HTTP router for the webhook receiver.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_probe).post(payment_webhook))
        .route("/webhook/success", get(webhook_success))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
