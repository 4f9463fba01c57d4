//! Hands jobs to the forecast generation service over HTTP.
//!
//! The service is expected to upsert by the `Idempotency-Key` header, so a
//! redelivered job never produces a second forecast.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{info, warn};

use super::JobHandler;
use crate::error::ProcessingError;
use crate::queue::Job;

pub struct HttpForecastHandler {
    client: Client,
    endpoint: String,
}

impl HttpForecastHandler {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, endpoint })
    }
}

/// Map the generation service's answer onto retry semantics.
///
/// 409 means the job id was already processed.
pub fn classify_status(status: StatusCode) -> Result<(), ProcessingError> {
    if status.is_success() || status == StatusCode::CONFLICT {
        return Ok(());
    }

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return Err(ProcessingError::Transient(format!(
            "forecast service answered {status}"
        )));
    }

    Err(ProcessingError::Permanent(format!(
        "forecast service rejected job with {status}"
    )))
}

#[async_trait]
impl JobHandler for HttpForecastHandler {
    async fn handle(&self, job: &Job) -> Result<(), ProcessingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", &job.job_id)
            .json(job)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    job_id = %job.job_id,
                    timeout = e.is_timeout(),
                    connect = e.is_connect(),
                    error = %e,
                    "forecast_request_failed"
                );
                ProcessingError::Transient(e.to_string())
            })?;

        let status = response.status();
        classify_status(status)?;

        info!(
            job_id = %job.job_id,
            product = %job.product,
            status = status.as_u16(),
            "forecast_request_accepted"
        );

        Ok(())
    }
}
