//! RabbitMQ consumer module using lapin.
//!
//! This module handles connecting to RabbitMQ, consuming jobs from every
//! configured work queue, and spawning async tasks to process each delivery
//! concurrently. In-flight work is bounded by the channel prefetch.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{select_all, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    Channel, Connection, ConnectionProperties,
};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::disposition::{attempt_number, decide, DeliveryLedger, Disposition};
use super::{DeadLetterSink, DeliveryAcker, JobHandler};
use crate::config::Config;
use crate::error::PublishError;
use crate::queue::{DeadLetter, Job, Publisher, RetryPolicy};

/// Completed jobs remembered per worker for duplicate suppression.
const LEDGER_CAPACITY: usize = 10_000;

#[async_trait]
impl DeliveryAcker for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .context("Failed to ack delivery")
    }

    async fn nack_requeue(&self, delivery_tag: u64) -> Result<()> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                requeue: true,
                ..Default::default()
            },
        )
        .await
        .context("Failed to nack delivery")
    }
}

#[async_trait]
impl DeadLetterSink for Publisher {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), PublishError> {
        Publisher::dead_letter(self, letter).await
    }
}

/// The parts of a delivery the worker looks at.
#[derive(Debug, Clone)]
struct InboundJob {
    queue: String,
    delivery_tag: u64,
    data: Vec<u8>,
    /// Previous deliveries as reported by the broker, if it reports them.
    delivery_count: Option<u32>,
    redelivered: bool,
}

impl InboundJob {
    fn from_delivery(delivery: Delivery) -> Self {
        Self {
            queue: delivery.routing_key.as_str().to_string(),
            delivery_tag: delivery.delivery_tag,
            delivery_count: delivery_count(&delivery),
            redelivered: delivery.redelivered,
            data: delivery.data,
        }
    }
}

/// Everything a delivery task needs.
struct WorkerContext {
    acker: Arc<dyn DeliveryAcker>,
    handler: Arc<dyn JobHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    ledger: DeliveryLedger,
    retry: RetryPolicy,
}

/// Run the RabbitMQ consumer until `shutdown` resolves.
///
/// This function:
/// 1. Connects to RabbitMQ using the configured URL
/// 2. Sets QoS so at most `worker_prefetch` deliveries per queue are unacked
/// 3. Declares the worker's queues (idempotent operation)
/// 4. Consumes every queue, spawning a task per delivery
/// 5. On shutdown, abandons unfinished deliveries unacked so they are
///    redelivered
///
/// Returns an error if the broker closes the consumers on its own.
pub async fn run(
    config: &Config,
    handler: Arc<dyn JobHandler>,
    publisher: Publisher,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    info!(broker = %config.broker_endpoint(), "rabbitmq_connecting");

    let conn = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    let channel = conn.create_channel().await.context("Failed to create channel")?;

    info!("rabbitmq_channel_created");

    // Prefetch is per consumer, so each queue holds at most this many jobs.
    let prefetch = config.prefetch();
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = prefetch, "rabbitmq_qos_set");

    let mut consumers = Vec::with_capacity(config.worker_queues.len());
    let mut consumer_tags = Vec::with_capacity(config.worker_queues.len());

    for queue in &config.worker_queues {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare queue {queue}"))?;

        let tag = format!("forecast-worker-{queue}");
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to start consumer on {queue}"))?;

        info!(queue = %queue, consumer_tag = %tag, "rabbitmq_consumer_started");
        consumers.push(consumer);
        consumer_tags.push(tag);
    }

    let ctx = Arc::new(WorkerContext {
        acker: Arc::new(channel.clone()),
        handler,
        dead_letters: Arc::new(publisher),
        ledger: DeliveryLedger::new(LEDGER_CAPACITY),
        retry: config.worker_retry(),
    });

    let mut deliveries = select_all(consumers);
    let mut tasks = JoinSet::new();
    let mut closed_by_broker = false;

    info!(queues = ?config.worker_queues, "worker_ready");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("worker_stopping");
                break;
            }
            Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(error = %e, "worker_task_panicked");
                    }
                }
            }
            delivery = deliveries.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let ctx = Arc::clone(&ctx);
                        let inbound = InboundJob::from_delivery(delivery);
                        tasks.spawn(async move {
                            handle_delivery(&ctx, inbound).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        error!("rabbitmq_consumer_closed");
                        closed_by_broker = true;
                        break;
                    }
                }
            }
        }
    }

    if !closed_by_broker {
        for tag in &consumer_tags {
            if let Err(e) = channel.basic_cancel(tag, BasicCancelOptions::default()).await {
                warn!(consumer_tag = %tag, error = %e, "rabbitmq_cancel_failed");
            }
        }
    }

    // Unfinished jobs are dropped unacked; closing the channel hands them
    // back to the broker for redelivery.
    let abandoned = tasks.len();
    tasks.shutdown().await;

    if let Err(e) = channel.close(200, "Worker shutdown").await {
        warn!(error = %e, "rabbitmq_channel_close_error");
    }
    if let Err(e) = conn.close(200, "Worker shutdown").await {
        warn!(error = %e, "rabbitmq_connection_close_error");
    }

    info!(abandoned_jobs = abandoned, "worker_shutdown_complete");

    exit_status(closed_by_broker)
}

/// A worker only exits cleanly when asked to; losing its consumers must
/// surface as a failure to whatever supervises the process.
fn exit_status(closed_by_broker: bool) -> Result<()> {
    if closed_by_broker {
        return Err(anyhow!("RabbitMQ closed the consumers"));
    }
    Ok(())
}

async fn handle_delivery(ctx: &WorkerContext, inbound: InboundJob) {
    let delivery_tag = inbound.delivery_tag;
    let queue = inbound.queue.as_str();

    let job: Job = match serde_json::from_slice(&inbound.data) {
        Ok(job) => job,
        Err(e) => {
            error!(
                queue = %queue,
                delivery_tag = delivery_tag,
                error = %e,
                body_preview = %String::from_utf8_lossy(
                    &inbound.data[..inbound.data.len().min(500)]
                ),
                "rabbitmq_job_parse_failed"
            );
            let letter = DeadLetter::unparseable(queue, &inbound.data, e.to_string());
            dead_letter(ctx, delivery_tag, &letter, None).await;
            return;
        }
    };

    let key = DeliveryLedger::key(queue, &job.job_id);

    if ctx.ledger.is_completed(&key) {
        info!(queue = %queue, job_id = %job.job_id, "worker_job_duplicate_skipped");
        ack(ctx, delivery_tag).await;
        return;
    }

    let attempt = attempt_number(inbound.delivery_count, ctx.ledger.record_attempt(&key));

    info!(
        queue = %queue,
        job_id = %job.job_id,
        event_id = %job.event_id,
        attempt = attempt,
        redelivered = inbound.redelivered,
        "rabbitmq_job_received"
    );

    let outcome = ctx.handler.handle(&job).await;

    match decide(&outcome, attempt, ctx.retry.max_attempts) {
        Disposition::Ack => {
            ctx.ledger.mark_completed(&key);
            if ack(ctx, delivery_tag).await {
                info!(queue = %queue, job_id = %job.job_id, "rabbitmq_job_completed");
            }
        }
        Disposition::Requeue => {
            let delay = ctx.retry.jittered_backoff(attempt);
            warn!(
                queue = %queue,
                job_id = %job.job_id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = ?outcome.err(),
                "worker_job_requeued"
            );
            sleep(delay).await;
            nack_requeue(ctx, delivery_tag).await;
        }
        Disposition::DeadLetter(code) => {
            let reason = outcome
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default();
            let letter = DeadLetter::for_job(job, code, reason, attempt);
            dead_letter(ctx, delivery_tag, &letter, Some(&key)).await;
        }
    }
}

/// Park a delivery on the dead-letter queue, then ack it. If the dead
/// letter cannot be confirmed the delivery goes back to its queue instead.
async fn dead_letter(ctx: &WorkerContext, delivery_tag: u64, letter: &DeadLetter, key: Option<&str>) {
    match ctx.dead_letters.dead_letter(letter).await {
        Ok(()) => {
            if let Some(key) = key {
                ctx.ledger.forget(key);
            }
            error!(
                alert = true,
                queue = %letter.origin_queue,
                job_id = ?letter.job.as_ref().map(|j| j.job_id.as_str()),
                code = letter.code.as_str(),
                attempts = letter.attempts,
                reason = %letter.reason,
                "worker_job_dead_lettered"
            );
            ack(ctx, delivery_tag).await;
        }
        Err(e) => {
            error!(
                queue = %letter.origin_queue,
                error = %e,
                "worker_dead_letter_failed"
            );
            nack_requeue(ctx, delivery_tag).await;
        }
    }
}

async fn ack(ctx: &WorkerContext, delivery_tag: u64) -> bool {
    match ctx.acker.ack(delivery_tag).await {
        Ok(()) => true,
        Err(e) => {
            error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed");
            false
        }
    }
}

async fn nack_requeue(ctx: &WorkerContext, delivery_tag: u64) {
    if let Err(e) = ctx.acker.nack_requeue(delivery_tag).await {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_nack_failed");
    }
}

/// Previous deliveries as reported by the broker, if it reports them.
fn delivery_count(delivery: &Delivery) -> Option<u32> {
    let headers = delivery.properties.headers().as_ref()?;
    headers
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == "x-delivery-count")
        .and_then(|(_, value)| amqp_u32(value))
}

fn amqp_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessingError;
    use crate::queue::DeadLetterCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Settled {
        Ack(u64),
        Requeue(u64),
    }

    #[derive(Default)]
    struct RecordingAcker {
        settled: Mutex<Vec<Settled>>,
    }

    impl RecordingAcker {
        fn settled(&self) -> Vec<Settled> {
            self.settled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryAcker for RecordingAcker {
        async fn ack(&self, delivery_tag: u64) -> Result<()> {
            self.settled.lock().unwrap().push(Settled::Ack(delivery_tag));
            Ok(())
        }

        async fn nack_requeue(&self, delivery_tag: u64) -> Result<()> {
            self.settled.lock().unwrap().push(Settled::Requeue(delivery_tag));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDeadLetters {
        letters: Mutex<Vec<DeadLetter>>,
        unavailable: bool,
    }

    impl RecordingDeadLetters {
        fn letters(&self) -> Vec<DeadLetter> {
            self.letters.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeadLetterSink for RecordingDeadLetters {
        async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), PublishError> {
            if self.unavailable {
                return Err(PublishError::BrokerUnavailable {
                    attempts: 5,
                    last_error: "connection refused".to_string(),
                });
            }
            self.letters.lock().unwrap().push(letter.clone());
            Ok(())
        }
    }

    /// Answers every job with the same outcome and counts the calls.
    struct FixedHandler {
        outcome: Result<(), ProcessingError>,
        calls: AtomicU32,
    }

    impl FixedHandler {
        fn new(outcome: Result<(), ProcessingError>) -> Self {
            Self {
                outcome,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobHandler for FixedHandler {
        async fn handle(&self, _job: &Job) -> Result<(), ProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    struct Harness {
        ctx: WorkerContext,
        acker: Arc<RecordingAcker>,
        dead_letters: Arc<RecordingDeadLetters>,
        handler: Arc<FixedHandler>,
    }

    impl Harness {
        fn new(outcome: Result<(), ProcessingError>) -> Self {
            Self::with_dead_letters(outcome, RecordingDeadLetters::default())
        }

        fn with_dead_letters(
            outcome: Result<(), ProcessingError>,
            dead_letters: RecordingDeadLetters,
        ) -> Self {
            let acker = Arc::new(RecordingAcker::default());
            let dead_letters = Arc::new(dead_letters);
            let handler = Arc::new(FixedHandler::new(outcome));
            let ctx = WorkerContext {
                acker: acker.clone(),
                handler: handler.clone(),
                dead_letters: dead_letters.clone(),
                ledger: DeliveryLedger::new(100),
                retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            };
            Self {
                ctx,
                acker,
                dead_letters,
                handler,
            }
        }
    }

    fn inbound(delivery_tag: u64, delivery_count: Option<u32>) -> InboundJob {
        let job = serde_json::json!({
            "job_id": "job-1",
            "event_id": "evt-1",
            "user_id": "12345",
            "product": "sun",
            "queue_name": "sun_predictions",
            "enqueued_at": "2026-01-01T00:00:00Z"
        });
        InboundJob {
            queue: "sun_predictions".to_string(),
            delivery_tag,
            data: serde_json::to_vec(&job).unwrap(),
            delivery_count,
            redelivered: delivery_count.is_some(),
        }
    }

    fn transient() -> Result<(), ProcessingError> {
        Err(ProcessingError::Transient("503".to_string()))
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let h = Harness::new(Ok(()));

        handle_delivery(&h.ctx, inbound(1, None)).await;

        assert_eq!(h.acker.settled(), vec![Settled::Ack(1)]);
        assert_eq!(h.handler.calls(), 1);
        assert!(h.ctx.ledger.is_completed("sun_predictions:job-1"));
        assert!(h.dead_letters.letters().is_empty());
    }

    #[tokio::test]
    async fn test_completed_job_is_acked_without_running_again() {
        let h = Harness::new(Ok(()));

        handle_delivery(&h.ctx, inbound(1, None)).await;
        handle_delivery(&h.ctx, inbound(2, Some(1))).await;

        assert_eq!(h.acker.settled(), vec![Settled::Ack(1), Settled::Ack(2)]);
        assert_eq!(h.handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_requeued() {
        let h = Harness::new(transient());

        handle_delivery(&h.ctx, inbound(1, None)).await;

        assert_eq!(h.acker.settled(), vec![Settled::Requeue(1)]);
        assert!(h.dead_letters.letters().is_empty());
        assert!(!h.ctx.ledger.is_completed("sun_predictions:job-1"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dead_lettered_then_acked() {
        let h = Harness::new(transient());

        // Third delivery of a job allowed three attempts.
        handle_delivery(&h.ctx, inbound(7, Some(2))).await;

        let letters = h.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].code, DeadLetterCode::MaxAttemptsExceeded);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(h.acker.settled(), vec![Settled::Ack(7)]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dead_lettered_and_forgotten() {
        let h = Harness::new(Err(ProcessingError::Permanent("400".to_string())));

        handle_delivery(&h.ctx, inbound(1, None)).await;

        let letters = h.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].code, DeadLetterCode::PermanentFailure);
        assert_eq!(letters[0].origin_queue, "sun_predictions");
        assert_eq!(
            letters[0].job.as_ref().map(|j| j.job_id.as_str()),
            Some("job-1")
        );
        assert_eq!(h.acker.settled(), vec![Settled::Ack(1)]);

        // The attempt count left with the job.
        assert_eq!(h.ctx.ledger.record_attempt("sun_predictions:job-1"), 1);
    }

    #[tokio::test]
    async fn test_failed_dead_letter_puts_job_back() {
        let h = Harness::with_dead_letters(
            Err(ProcessingError::Permanent("400".to_string())),
            RecordingDeadLetters {
                unavailable: true,
                ..Default::default()
            },
        );

        handle_delivery(&h.ctx, inbound(1, None)).await;

        assert_eq!(h.acker.settled(), vec![Settled::Requeue(1)]);
        assert!(!h.acker.settled().contains(&Settled::Ack(1)));
    }

    #[tokio::test]
    async fn test_unparseable_body_is_dead_lettered() {
        let h = Harness::new(Ok(()));
        let garbage = InboundJob {
            data: b"{not a job".to_vec(),
            ..inbound(9, None)
        };

        handle_delivery(&h.ctx, garbage).await;

        let letters = h.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].code, DeadLetterCode::Unparseable);
        assert!(letters[0].job.is_none());
        assert_eq!(letters[0].raw_body.as_deref(), Some("{not a job"));
        assert_eq!(h.acker.settled(), vec![Settled::Ack(9)]);
        assert_eq!(h.handler.calls(), 0);
    }

    #[test]
    fn test_broker_closing_consumers_is_a_failure() {
        assert!(exit_status(false).is_ok());
        assert!(exit_status(true).is_err());
    }

    #[test]
    fn test_amqp_u32() {
        assert_eq!(amqp_u32(&AMQPValue::LongLongInt(3)), Some(3));
        assert_eq!(amqp_u32(&AMQPValue::LongInt(2)), Some(2));
        assert_eq!(amqp_u32(&AMQPValue::ShortShortUInt(1)), Some(1));
        assert_eq!(amqp_u32(&AMQPValue::LongLongInt(-1)), None);
        assert_eq!(amqp_u32(&AMQPValue::Boolean(true)), None);
    }
}
