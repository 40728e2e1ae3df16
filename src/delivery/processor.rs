use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::{BusyRetryPolicy, StoreError};
use crate::delivery::retry::RetryStrategy;
use crate::delivery::store::{finalize_failed, record_failure, record_success};
use crate::types::{DeliveryEvent, DeliveryKind, DeliveryStatus};

/// Response bytes kept in an error message; the stored error is capped anyway.
const ERROR_BODY_PREVIEW: usize = 200;

/// One destination kind driven by the dispatcher.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attempts every due event once. Only a failure to load the batch is
    /// returned; per-event failures are logged and the batch carries on.
    async fn process_batch(&self) -> Result<BatchReport, StoreError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    pub errored: usize,
}

impl BatchReport {
    pub fn record(&mut self, result: &Result<DeliveryEvent, StoreError>) {
        match result {
            Ok(event) => match event.status {
                DeliveryStatus::Delivered => self.delivered += 1,
                DeliveryStatus::Failed => self.failed += 1,
                _ => self.retrying += 1,
            },
            Err(_) => self.errored += 1,
        }
    }
}

/// Why a single delivery attempt failed. Every variant is retryable.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Sends a prepared request and maps anything but a 2xx to a [`DeliveryError`].
pub(crate) async fn send_request(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<u16, DeliveryError> {
    let response = request.timeout(timeout).send().await.map_err(|err| {
        if err.is_timeout() {
            DeliveryError::Timeout(timeout)
        } else {
            DeliveryError::Transport(err.to_string())
        }
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(status.as_u16());
    }

    let body = response.text().await.unwrap_or_default();
    Err(DeliveryError::Status {
        status: status.as_u16(),
        body: body.trim().chars().take(ERROR_BODY_PREVIEW).collect(),
    })
}

/// Shared persistence and logging for the outcome of one attempt.
pub(crate) struct OutcomeWriter<'a> {
    pub pool: &'a SqlitePool,
    pub busy_retry: &'a BusyRetryPolicy,
    pub strategy: &'a RetryStrategy,
    pub kind: DeliveryKind,
}

impl OutcomeWriter<'_> {
    pub async fn attempted(
        &self,
        event: &DeliveryEvent,
        outcome: Result<u16, DeliveryError>,
    ) -> Result<DeliveryEvent, StoreError> {
        let now = Utc::now();
        match outcome {
            Ok(status) => {
                let stored =
                    record_success(self.pool, self.busy_retry, self.kind, event.id, now).await?;
                info!(
                    kind = self.kind.as_str(),
                    event_id = %stored.id,
                    http_status = status,
                    attempt_count = stored.attempt_count,
                    "delivery succeeded"
                );
                Ok(stored)
            }
            Err(err) => {
                let message = err.to_string();
                let stored = record_failure(
                    self.pool,
                    self.busy_retry,
                    self.strategy,
                    self.kind,
                    event.id,
                    &message,
                    now,
                )
                .await?;
                warn!(
                    kind = self.kind.as_str(),
                    event_id = %stored.id,
                    attempt_count = stored.attempt_count,
                    status = stored.status.as_str(),
                    next_attempt_at = stored.next_attempt_at.as_deref().unwrap_or(""),
                    error = %message,
                    "delivery attempt failed"
                );
                Ok(stored)
            }
        }
    }

    /// Fails the event without an attempt; retrying cannot fix configuration.
    pub async fn misconfigured(
        &self,
        event: &DeliveryEvent,
        reason: &str,
    ) -> Result<DeliveryEvent, StoreError> {
        let stored =
            finalize_failed(self.pool, self.busy_retry, self.kind, event.id, reason, Utc::now())
                .await?;
        warn!(
            kind = self.kind.as_str(),
            event_id = %stored.id,
            reason,
            "delivery failed permanently"
        );
        Ok(stored)
    }
}
