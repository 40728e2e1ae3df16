use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use sqlx::SqlitePool;
use tracing::error;

use crate::db::{BusyRetryPolicy, StoreError};
use crate::delivery::config::{DeliveryConfig, EMAIL_TIMEOUT};
use crate::delivery::processor::{BatchReport, OutcomeWriter, Processor, send_request};
use crate::delivery::retry::RetryStrategy;
use crate::delivery::store::{
    BATCH_SIZE, EmailTarget, SubmissionContext, fetch_due_events, load_email_target,
};
use crate::types::{DeliveryEvent, DeliveryKind};

pub struct EmailProcessor {
    pool: SqlitePool,
    client: Client,
    strategy: RetryStrategy,
    busy_retry: BusyRetryPolicy,
    api_base: String,
}

/// Everything needed to send one message; built only when nothing is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub api_key: String,
    pub domain: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

impl EmailProcessor {
    pub fn new(pool: SqlitePool, config: &DeliveryConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().build()?;

        Ok(Self {
            pool,
            client,
            strategy: RetryStrategy::new(config.backoff_schedule.clone()),
            busy_retry: config.busy_retry,
            api_base: config.mailgun_api_base.trim_end_matches('/').to_string(),
        })
    }

    fn writer(&self) -> OutcomeWriter<'_> {
        OutcomeWriter {
            pool: &self.pool,
            busy_retry: &self.busy_retry,
            strategy: &self.strategy,
            kind: DeliveryKind::Email,
        }
    }

    async fn process_event(&self, event: &DeliveryEvent) -> Result<DeliveryEvent, StoreError> {
        let writer = self.writer();

        let target = match load_email_target(&self.pool, event.submission_id).await {
            Ok(Some(target)) => target,
            Ok(None) => return writer.misconfigured(event, "submission not found").await,
            Err(StoreError::Parse(message)) => {
                let reason = format!("invalid email configuration: {message}");
                return writer.misconfigured(event, &reason).await;
            }
            Err(err) => return Err(err),
        };

        let message = match compose_message(&target) {
            Ok(message) => message,
            Err(reason) => return writer.misconfigured(event, &reason).await,
        };

        let url = format!("{}/v3/{}/messages", self.api_base, message.domain);
        let request = self
            .client
            .post(url)
            .basic_auth("api", Some(&message.api_key))
            .form(&[
                ("from", message.from.as_str()),
                ("to", message.to.as_str()),
                ("subject", message.subject.as_str()),
                ("text", message.text.as_str()),
            ]);
        let outcome = send_request(request, EMAIL_TIMEOUT).await;

        writer.attempted(event, outcome).await
    }
}

#[async_trait]
impl Processor for EmailProcessor {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn process_batch(&self) -> Result<BatchReport, StoreError> {
        let events =
            fetch_due_events(&self.pool, DeliveryKind::Email, Utc::now(), BATCH_SIZE).await?;
        let mut report = BatchReport {
            fetched: events.len(),
            ..BatchReport::default()
        };

        for event in &events {
            let result = self.process_event(event).await;
            if let Err(err) = &result {
                error!(event_id = %event.id, error = %err, "failed to process email event");
            }
            report.record(&result);
        }

        Ok(report)
    }
}

/// Resolves recipient, credentials and content, or explains what is missing.
pub fn compose_message(target: &EmailTarget) -> Result<EmailMessage, String> {
    let config = match &target.config {
        Some(config) if config.enabled => config,
        Some(_) => return Err("email delivery is disabled".to_string()),
        None => return Err("email delivery is not configured".to_string()),
    };

    let to = config
        .overrides
        .to
        .as_deref()
        .map(str::trim)
        .filter(|to| !to.is_empty());
    let credentials = &target.credentials;

    let mut missing = Vec::new();
    if credentials.api_key.is_none() {
        missing.push("api key");
    }
    if credentials.domain.is_none() {
        missing.push("domain");
    }
    if credentials.from.is_none() {
        missing.push("from address");
    }
    if to.is_none() {
        missing.push("recipient");
    }

    match (&credentials.api_key, &credentials.domain, &credentials.from, to) {
        (Some(api_key), Some(domain), Some(from), Some(to)) => Ok(EmailMessage {
            api_key: api_key.clone(),
            domain: domain.clone(),
            from: from.clone(),
            to: to.to_string(),
            subject: render_subject(&target.context, config.overrides.subject.as_deref()),
            text: render_text(&target.context),
        }),
        _ => Err(format!(
            "email delivery misconfigured: missing {}",
            missing.join(", ")
        )),
    }
}

pub fn render_subject(context: &SubmissionContext, subject: Option<&str>) -> String {
    match subject.map(str::trim).filter(|subject| !subject.is_empty()) {
        Some(subject) => subject.to_string(),
        None => format!("New submission: {}", context.form_name),
    }
}

/// One `key: value` line per field, in key order.
pub fn render_text(context: &SubmissionContext) -> String {
    let mut text = format!("New submission for {}\n\n", context.form_name);

    match &context.data {
        serde_json::Value::Object(fields) => {
            let mut fields: Vec<_> = fields.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            for (key, value) in fields {
                let value = match value {
                    serde_json::Value::String(value) => value.clone(),
                    other => other.to_string(),
                };
                let _ = writeln!(text, "{key}: {value}");
            }
        }
        serde_json::Value::String(raw) => {
            let _ = writeln!(text, "{raw}");
        }
        other => {
            let _ = writeln!(text, "{other}");
        }
    }

    let _ = write!(
        text,
        "\nSubmission {} received at {}",
        context.submission_id, context.submitted_at
    );
    text
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::delivery::store::{EmailConfig, EmailOverrides, MailgunCredentials};

    fn target(config: Option<EmailConfig>, credentials: MailgunCredentials) -> EmailTarget {
        EmailTarget {
            context: SubmissionContext {
                submission_id: Uuid::new_v4(),
                submitted_at: "2026-03-04T05:06:07.000Z".to_string(),
                data: json!({ "name": "Ada", "age": 36, "message": "hello" }),
                form_id: Uuid::new_v4(),
                form_slug: "contact".to_string(),
                form_name: "Contact".to_string(),
            },
            config,
            credentials,
        }
    }

    fn credentials() -> MailgunCredentials {
        MailgunCredentials {
            api_key: Some("key-123".to_string()),
            domain: Some("mg.example.com".to_string()),
            from: Some("forms@example.com".to_string()),
        }
    }

    fn enabled(to: Option<&str>) -> Option<EmailConfig> {
        Some(EmailConfig {
            enabled: true,
            overrides: EmailOverrides {
                to: to.map(str::to_string),
                subject: None,
            },
        })
    }

    #[test]
    fn composes_complete_message() {
        let message = compose_message(&target(enabled(Some("owner@example.com")), credentials()));
        let message = message.as_ref();

        assert_eq!(message.map(|m| m.to.as_str()), Ok("owner@example.com"));
        assert_eq!(message.map(|m| m.domain.as_str()), Ok("mg.example.com"));
        assert_eq!(
            message.map(|m| m.subject.as_str()),
            Ok("New submission: Contact")
        );
        assert!(message.is_ok_and(|m| m.text.contains("age: 36\nmessage: hello\nname: Ada\n")));
    }

    #[test]
    fn disabled_config_is_rejected() {
        let mut config = enabled(Some("owner@example.com"));
        if let Some(config) = config.as_mut() {
            config.enabled = false;
        }

        let err = compose_message(&target(config, credentials()));

        assert_eq!(err, Err("email delivery is disabled".to_string()));
    }

    #[test]
    fn missing_fields_are_listed() {
        let mut creds = credentials();
        creds.api_key = None;

        let err = compose_message(&target(enabled(Some("  ")), creds));

        assert_eq!(
            err,
            Err("email delivery misconfigured: missing api key, recipient".to_string())
        );
    }

    #[test]
    fn subject_override_wins() {
        let context = target(None, credentials()).context;

        assert_eq!(render_subject(&context, Some(" Hi ")), "Hi");
        assert_eq!(render_subject(&context, Some("")), "New submission: Contact");
    }
}
