//! Webhook endpoint handlers.
//!
//! The payment webhook only answers 200 once every job the payment owes is
//! confirmed by the broker, or when there is nothing (more) to publish.
//! Anything else is either the provider's fault (400) or worth a provider
//! retry (503).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{PublishError, RoutingError, WebhookError};
use crate::event::{normalize, PaymentEvent};
use crate::idempotency::IdempotencyStore;
use crate::queue::{Job, JobSink, UnroutedEvent};
use crate::routing::ProductRouter;

/// Publishing an event's jobs gives up after this long, so the provider
/// gets an answer before its own timeout.
pub const DEFAULT_PUBLISH_DEADLINE: Duration = Duration::from_secs(15);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<dyn JobSink>,
    pub router: Arc<ProductRouter>,
    pub idempotency: Arc<IdempotencyStore>,
    pub publish_deadline: Duration,
}

impl AppState {
    pub fn new(sink: Arc<dyn JobSink>, router: ProductRouter, idempotency: IdempotencyStore) -> Self {
        Self {
            sink,
            router: Arc::new(router),
            idempotency: Arc::new(idempotency),
            publish_deadline: DEFAULT_PUBLISH_DEADLINE,
        }
    }

    pub fn with_publish_deadline(mut self, deadline: Duration) -> Self {
        self.publish_deadline = deadline;
        self
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Process liveness; never touches the broker.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Provider Probes
// =============================================================================

#[derive(Serialize)]
pub struct ProbeResponse {
    pub status: &'static str,
    pub message: &'static str,
}

/// GET on the webhook path, used by the provider to verify the endpoint.
pub async fn webhook_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "ok",
        message: "Webhook endpoint is working",
    })
}

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html lang="ru">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Оплата прошла успешно</title>
</head>
<body>
  <h1>Спасибо! Оплата прошла успешно.</h1>
  <p>Ваш разбор уже готовится и придёт в бот в течение нескольких минут.</p>
  <p>Эту страницу можно закрыть и вернуться в Telegram.</p>
</body>
</html>
"#;

/// Page the payer lands on after the provider redirects back.
pub async fn webhook_success() -> Html<&'static str> {
    Html(SUCCESS_PAGE)
}

// =============================================================================
// Payment Webhook
// =============================================================================

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queues: Option<Vec<String>>,
}

impl WebhookResponse {
    fn for_event(status: &'static str, event: &PaymentEvent) -> Self {
        Self {
            status,
            event_id: Some(event.event_id.clone()),
            job_id: None,
            queues: None,
        }
    }
}

/// Payment provider callback.
///
/// Pipeline: parse → normalize → status gate → claim → route → publish.
pub async fn payment_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, WebhookError> {
    let raw: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(
            error = %e,
            body_length = body.len(),
            "webhook_invalid_json"
        );
        WebhookError::InvalidJson(e.to_string())
    })?;

    let event = normalize(&raw).map_err(|e| {
        warn!(error = %e, "webhook_invalid_event");
        WebhookError::InvalidEvent(e)
    })?;

    info!(
        event_id = %event.event_id,
        status = event.status.as_str(),
        product = ?event.product,
        user_id = %event.user_id,
        "webhook_received"
    );

    if !event.is_fulfillable() {
        info!(
            event_id = %event.event_id,
            status = event.status.as_str(),
            "webhook_status_ignored"
        );
        return Ok((StatusCode::OK, Json(WebhookResponse::for_event("ignored", &event))));
    }

    // Released on every path that does not complete it, including the
    // request future being dropped mid-publish.
    let claim = match IdempotencyStore::claim(&state.idempotency, &event.event_id) {
        Ok(claim) => claim,
        Err(existing) => {
            info!(
                event_id = %event.event_id,
                claim = ?existing,
                "webhook_duplicate"
            );
            return Ok((StatusCode::OK, Json(WebhookResponse::for_event("duplicate", &event))));
        }
    };

    let (product, queues) = match resolve_route(&state.router, &event) {
        Ok(route) => route,
        Err(e) => {
            retain_unrouted(&state, &event, &e, raw).await;
            claim.complete();
            return Ok((StatusCode::OK, Json(WebhookResponse::for_event("unrouted", &event))));
        }
    };

    let jobs: Vec<Job> = queues
        .iter()
        .map(|queue| Job::for_event(&event, &product, queue))
        .collect();

    let deadline = state.publish_deadline;
    let published = tokio::time::timeout(deadline, publish_all(state.sink.as_ref(), &jobs))
        .await
        .unwrap_or(Err(PublishError::DeadlineExceeded(deadline)));

    if let Err(e) = published {
        // Dropping the claim lets the provider's retry redo the whole event.
        drop(claim);
        error!(
            event_id = %event.event_id,
            product = %product,
            error = %e,
            "webhook_job_not_enqueued"
        );
        return Err(WebhookError::PublishFailed(e));
    }

    claim.complete();

    let job_id = jobs.first().map(|job| job.job_id.clone());
    info!(
        event_id = %event.event_id,
        job_id = ?job_id,
        queues = ?queues,
        "webhook_enqueued"
    );

    Ok((
        StatusCode::OK,
        Json(WebhookResponse {
            status: "enqueued",
            event_id: Some(event.event_id),
            job_id,
            queues: Some(queues),
        }),
    ))
}

/// Publish every job in order, stopping at the first failure.
async fn publish_all(sink: &dyn JobSink, jobs: &[Job]) -> Result<(), PublishError> {
    for job in jobs {
        sink.publish(job).await.map_err(|e| {
            warn!(
                job_id = %job.job_id,
                queue = %job.queue_name,
                error = %e,
                "webhook_job_publish_failed"
            );
            e
        })?;
    }
    Ok(())
}

fn resolve_route(
    router: &ProductRouter,
    event: &PaymentEvent,
) -> Result<(String, Vec<String>), RoutingError> {
    let product = event.product.as_deref().ok_or(RoutingError::MissingProduct)?;
    let queues = router.route(product)?;
    Ok((product.to_string(), queues.to_vec()))
}

/// Park a paid-but-unroutable event and raise an operator alert.
///
/// The provider still gets 200: the payment itself is valid, and retrying
/// the webhook cannot fix a missing route.
async fn retain_unrouted(state: &AppState, event: &PaymentEvent, reason: &RoutingError, raw: Value) {
    let unrouted = UnroutedEvent::new(event, reason.to_string(), raw);

    match state.sink.retain_unrouted(&unrouted).await {
        Ok(()) => {
            error!(
                alert = true,
                event_id = %event.event_id,
                user_id = %event.user_id,
                product = ?event.product,
                error = %reason,
                "webhook_routing_failed"
            );
        }
        Err(e) => {
            // The log line is the only remaining copy of the payment.
            error!(
                alert = true,
                event_id = %event.event_id,
                user_id = %event.user_id,
                product = ?event.product,
                error = %reason,
                retain_error = %e,
                raw = %unrouted.raw,
                "webhook_routing_failed_unretained"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{derive_job_id, QueueTopology};
    use crate::routing::default_routes;
    use crate::web::router;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    /// In-memory stand-in for the broker.
    #[derive(Default)]
    struct RecordingSink {
        jobs: Mutex<Vec<Job>>,
        unrouted: Mutex<Vec<UnroutedEvent>>,
        fail_publishes: Mutex<u32>,
        stall_publishes: Mutex<bool>,
    }

    impl RecordingSink {
        fn failing(times: u32) -> Self {
            Self {
                fail_publishes: Mutex::new(times),
                ..Default::default()
            }
        }

        fn stalling() -> Self {
            Self {
                stall_publishes: Mutex::new(true),
                ..Default::default()
            }
        }

        fn stop_stalling(&self) {
            *self.stall_publishes.lock().unwrap() = false;
        }

        fn jobs(&self) -> Vec<Job> {
            self.jobs.lock().unwrap().clone()
        }

        fn unrouted_count(&self) -> usize {
            self.unrouted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobSink for RecordingSink {
        async fn publish(&self, job: &Job) -> Result<(), PublishError> {
            {
                let mut remaining = self.fail_publishes.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(PublishError::BrokerUnavailable {
                        attempts: 5,
                        last_error: "connection refused".to_string(),
                    });
                }
            }
            if *self.stall_publishes.lock().unwrap() {
                // A broker that never confirms.
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            // Give concurrent requests a chance to interleave.
            tokio::task::yield_now().await;
            self.jobs.lock().unwrap().push(job.clone());
            Ok(())
        }

        async fn retain_unrouted(&self, event: &UnroutedEvent) -> Result<(), PublishError> {
            self.unrouted.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn state(sink: Arc<RecordingSink>) -> AppState {
        let topology = QueueTopology::default_catalog();
        let product_router = ProductRouter::new(default_routes(), &topology).unwrap();
        AppState::new(
            sink,
            product_router,
            IdempotencyStore::new(Duration::from_secs(60)),
        )
    }

    fn app(sink: Arc<RecordingSink>) -> axum::Router {
        router(state(sink))
    }

    fn succeeded(event_id: &str, product: &str) -> Value {
        json!({
            "type": "notification",
            "event": "payment.succeeded",
            "object": {
                "id": event_id,
                "status": "succeeded",
                "amount": { "value": "10.00", "currency": "RUB" },
                "metadata": { "user_id": "12345", "product": product }
            }
        })
    }

    async fn post(app: &axum::Router, body: String) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/webhook")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn get(app: &axum::Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_succeeded_payment_enqueues_one_job() {
        let sink = Arc::new(RecordingSink::default());
        let app = app(sink.clone());

        let (status, body) = post(&app, succeeded("evt-1", "sun").to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "enqueued");
        let jobs = sink.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue_name, "sun_predictions");
        assert_eq!(jobs[0].user_id, "12345");
        assert_eq!(jobs[0].job_id, derive_job_id("evt-1", "sun"));
        assert_eq!(body["job_id"], jobs[0].job_id.as_str());
    }

    #[tokio::test]
    async fn test_repeated_delivery_is_not_republished() {
        let sink = Arc::new(RecordingSink::default());
        let app = app(sink.clone());
        let body = succeeded("evt-1", "sun").to_string();

        post(&app, body.clone()).await;
        let (status, response) = post(&app, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["status"], "duplicate");
        assert_eq!(sink.jobs().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_publish_once() {
        let sink = Arc::new(RecordingSink::default());
        let app = app(sink.clone());
        let body = succeeded("evt-race", "sun").to_string();

        let requests: Vec<_> = (0..16)
            .map(|_| {
                let app = app.clone();
                let body = body.clone();
                tokio::spawn(async move { post(&app, body).await.0 })
            })
            .collect();

        for request in requests {
            assert_eq!(request.await.unwrap(), StatusCode::OK);
        }
        assert_eq!(sink.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_bundle_enqueues_one_job_per_queue() {
        let sink = Arc::new(RecordingSink::default());
        let app = app(sink.clone());

        let (status, body) = post(&app, succeeded("evt-b", "sun_bundle").to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queues"], json!(["sun_predictions", "recommendations"]));
        let queues: Vec<String> = sink.jobs().into_iter().map(|j| j.queue_name).collect();
        assert_eq!(queues, vec!["sun_predictions", "recommendations"]);
    }

    #[tokio::test]
    async fn test_non_succeeded_statuses_never_enqueue() {
        let sink = Arc::new(RecordingSink::default());
        let app = app(sink.clone());

        for (event, status) in [
            ("payment.waiting_for_capture", "pending"),
            ("payment.canceled", "canceled"),
        ] {
            let mut body = succeeded(&format!("evt-{status}"), "sun");
            body["event"] = json!(event);
            body["object"]["status"] = json!(status);

            let (code, response) = post(&app, body.to_string()).await;
            assert_eq!(code, StatusCode::OK);
            assert_eq!(response["status"], "ignored");
        }
        assert!(sink.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_product_is_retained_not_enqueued() {
        let sink = Arc::new(RecordingSink::default());
        let app = app(sink.clone());
        let body = succeeded("evt-u", "unknown_planet").to_string();

        let (status, response) = post(&app, body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["status"], "unrouted");
        assert!(sink.jobs().is_empty());
        assert_eq!(sink.unrouted_count(), 1);

        // A provider retry does not raise a second alert.
        let (_, response) = post(&app, body).await;
        assert_eq!(response["status"], "duplicate");
        assert_eq!(sink.unrouted_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let app = app(sink.clone());

        let (status, response) = post(&app, "{not json".to_string()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["status"], "invalid_json");
        assert!(sink.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_missing_identifiers_are_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let app = app(sink.clone());

        let no_id = json!({
            "event": "payment.succeeded",
            "object": { "metadata": { "user_id": "12345", "product": "sun" } }
        });
        let (status, response) = post(&app, no_id.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["status"], "invalid_event");

        let mut no_user = succeeded("evt-2", "sun");
        no_user["object"]["metadata"] = json!({ "product": "sun" });
        let (status, _) = post(&app, no_user.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(sink.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_returns_5xx_and_allows_retry() {
        let sink = Arc::new(RecordingSink::failing(1));
        let app = app(sink.clone());
        let body = succeeded("evt-f", "sun").to_string();

        let (status, response) = post(&app, body.clone()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response["status"], "publish_failed");
        assert!(sink.jobs().is_empty());

        let (status, response) = post(&app, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["status"], "enqueued");
        assert_eq!(sink.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_request_does_not_block_provider_retry() {
        let sink = Arc::new(RecordingSink::stalling());
        let app = app(sink.clone());
        let body = succeeded("evt-x", "sun").to_string();

        // The provider gives up and the connection is torn down mid-publish.
        let dropped = tokio::time::timeout(Duration::from_millis(50), post(&app, body.clone())).await;
        assert!(dropped.is_err());
        assert!(sink.jobs().is_empty());

        sink.stop_stalling();
        let (status, response) = post(&app, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["status"], "enqueued");
        assert_eq!(sink.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_deadline_answers_5xx_and_allows_retry() {
        let sink = Arc::new(RecordingSink::stalling());
        let app = router(state(sink.clone()).with_publish_deadline(Duration::from_millis(20)));
        let body = succeeded("evt-slow", "sun").to_string();

        let (status, response) = post(&app, body.clone()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response["status"], "publish_failed");

        sink.stop_stalling();
        let (status, response) = post(&app, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["status"], "enqueued");
        assert_eq!(sink.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_probes() {
        let app = app(Arc::new(RecordingSink::default()));

        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("ok"));

        let (status, body) = get(&app, "/webhook").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Webhook endpoint is working"));

        let (status, body) = get(&app, "/webhook/success").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<html"));
    }
}
