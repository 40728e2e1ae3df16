use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde_json::json;
use sha2::Sha256;
use sqlx::SqlitePool;
use tracing::{error, warn};

use crate::db::{BusyRetryPolicy, StoreError};
use crate::delivery::config::{self, DeliveryConfig, WEBHOOK_TIMEOUT};
use crate::delivery::processor::{BatchReport, OutcomeWriter, Processor, send_request};
use crate::delivery::retry::RetryStrategy;
use crate::delivery::store::{
    BATCH_SIZE, SubmissionContext, WebhookConfig, fetch_due_events, load_webhook_target,
};
use crate::types::{DeliveryEvent, DeliveryKind};

type HmacSha256 = Hmac<Sha256>;

pub struct WebhookProcessor {
    pool: SqlitePool,
    client: Client,
    strategy: RetryStrategy,
    busy_retry: BusyRetryPolicy,
    signature_header: String,
}

impl WebhookProcessor {
    pub fn new(pool: SqlitePool, config: &DeliveryConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().build()?;

        Ok(Self {
            pool,
            client,
            strategy: RetryStrategy::new(config.backoff_schedule.clone()),
            busy_retry: config.busy_retry,
            signature_header: config.signature_header.clone(),
        })
    }

    fn writer(&self) -> OutcomeWriter<'_> {
        OutcomeWriter {
            pool: &self.pool,
            busy_retry: &self.busy_retry,
            strategy: &self.strategy,
            kind: DeliveryKind::Webhook,
        }
    }

    async fn process_event(&self, event: &DeliveryEvent) -> Result<DeliveryEvent, StoreError> {
        let writer = self.writer();

        let target = match load_webhook_target(&self.pool, event.submission_id).await {
            Ok(Some(target)) => target,
            Ok(None) => return writer.misconfigured(event, "submission not found").await,
            Err(StoreError::Parse(message)) => {
                let reason = format!("invalid webhook configuration: {message}");
                return writer.misconfigured(event, &reason).await;
            }
            Err(err) => return Err(err),
        };

        let config = match target.config {
            Some(config) if config.enabled => config,
            Some(_) => return writer.misconfigured(event, "webhook delivery is disabled").await,
            None => {
                return writer
                    .misconfigured(event, "webhook delivery is not configured")
                    .await;
            }
        };
        let url = match reqwest::Url::parse(config.url.trim()) {
            Ok(url) => url,
            Err(err) => {
                let reason = format!("invalid webhook url {:?}: {err}", config.url);
                return writer.misconfigured(event, &reason).await;
            }
        };

        let body = build_payload(&target.context, event);
        let body = match serde_json::to_vec(&body) {
            Ok(body) => body,
            Err(err) => {
                let reason = format!("failed to encode webhook payload: {err}");
                return writer.misconfigured(event, &reason).await;
            }
        };
        let headers = match self.build_headers(&config, &body) {
            Ok(headers) => headers,
            Err(reason) => return writer.misconfigured(event, &reason).await,
        };

        let request = self.client.post(url).headers(headers).body(body);
        let outcome = send_request(request, WEBHOOK_TIMEOUT).await;

        writer.attempted(event, outcome).await
    }

    fn build_headers(&self, config: &WebhookConfig, body: &[u8]) -> Result<HeaderMap, String> {
        let mut headers = HeaderMap::new();

        for (name, value) in &config.headers {
            let parsed = HeaderName::from_bytes(name.trim().as_bytes())
                .ok()
                .zip(HeaderValue::from_str(value.trim()).ok());
            match parsed {
                Some((name, value)) => {
                    headers.insert(name, value);
                }
                None => warn!(header = %name, "skipping invalid custom webhook header"),
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(config::USER_AGENT));

        if let Some(secret) = config.secret.as_deref() {
            let header_name = config
                .signature_header
                .as_deref()
                .unwrap_or(&self.signature_header);
            let name = HeaderName::from_bytes(header_name.as_bytes())
                .map_err(|_| format!("invalid signature header name: {header_name}"))?;
            let signature = sign_payload(secret.as_bytes(), body)?;
            let value = HeaderValue::from_str(&signature)
                .map_err(|err| format!("invalid signature header value: {err}"))?;
            headers.insert(name, value);
        }

        Ok(headers)
    }
}

#[async_trait]
impl Processor for WebhookProcessor {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn process_batch(&self) -> Result<BatchReport, StoreError> {
        let events =
            fetch_due_events(&self.pool, DeliveryKind::Webhook, Utc::now(), BATCH_SIZE).await?;
        let mut report = BatchReport {
            fetched: events.len(),
            ..BatchReport::default()
        };

        for event in &events {
            let result = self.process_event(event).await;
            if let Err(err) = &result {
                error!(event_id = %event.id, error = %err, "failed to process webhook event");
            }
            report.record(&result);
        }

        Ok(report)
    }
}

/// JSON body posted to webhook destinations.
pub fn build_payload(context: &SubmissionContext, event: &DeliveryEvent) -> serde_json::Value {
    json!({
        "event": "submission.created",
        "form": {
            "id": context.form_id,
            "slug": context.form_slug,
            "name": context.form_name,
        },
        "submission": {
            "id": context.submission_id,
            "created_at": context.submitted_at,
            "data": context.data,
        },
        "delivery": {
            "event_id": event.id,
            "attempt": event.attempt_count + 1,
        },
    })
}

/// `sha256=<hex>` HMAC of the exact body bytes.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| format!("invalid webhook secret: {err}"))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
