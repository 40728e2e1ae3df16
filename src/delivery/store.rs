use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{BusyRetryPolicy, StoreError, format_utc, with_retry};
use crate::delivery::retry::{RetryDecision, RetryStrategy, truncate_error};
use crate::types::{DeliveryEvent, DeliveryKind, DeliveryStatus};

/// Most events a processor handles per tick.
pub const BATCH_SIZE: i64 = 10;

const EVENT_COLUMNS: &str = "id, submission_id, status, attempt_count, last_attempt_at, \
    last_attempt_err, next_attempt_at, created_at, updated_at";

fn events_table(kind: DeliveryKind) -> &'static str {
    match kind {
        DeliveryKind::Webhook => "webhook_events",
        DeliveryKind::Email => "email_events",
    }
}

/// Due events of one kind, oldest first.
pub async fn fetch_due_events(
    pool: &SqlitePool,
    kind: DeliveryKind,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<DeliveryEvent>, StoreError> {
    let sql = format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM {table}
        WHERE status IN ('pending', 'retrying')
            AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
        ORDER BY created_at ASC, id ASC
        LIMIT ?
        "#,
        table = events_table(kind),
    );

    let rows: Vec<EventRow> = sqlx::query_as(&sql)
        .bind(format_utc(now))
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(EventRow::try_into).collect()
}

pub async fn get_event(
    pool: &SqlitePool,
    kind: DeliveryKind,
    event_id: Uuid,
) -> Result<Option<DeliveryEvent>, StoreError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM {table} WHERE id = ?",
        table = events_table(kind),
    );

    let row: Option<EventRow> = sqlx::query_as(&sql)
        .bind(event_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(EventRow::try_into).transpose()
}

/// Marks an event delivered and returns the stored row.
pub async fn record_success(
    pool: &SqlitePool,
    policy: &BusyRetryPolicy,
    kind: DeliveryKind,
    event_id: Uuid,
    now: DateTime<Utc>,
) -> Result<DeliveryEvent, StoreError> {
    let sql = format!(
        r#"
        UPDATE {table}
        SET status = 'delivered',
            attempt_count = attempt_count + 1,
            last_attempt_at = ?,
            last_attempt_err = '',
            next_attempt_at = NULL,
            updated_at = ?
        WHERE id = ?
            AND status IN ('pending', 'retrying')
        RETURNING {EVENT_COLUMNS}
        "#,
        table = events_table(kind),
    );
    let id = event_id.to_string();
    let now_str = format_utc(now);

    let row = with_retry(pool, policy, move |tx| {
        let sql = sql.clone();
        let id = id.clone();
        let now_str = now_str.clone();
        Box::pin(async move {
            sqlx::query_as::<_, EventRow>(&sql)
                .bind(&now_str)
                .bind(&now_str)
                .bind(&id)
                .fetch_optional(&mut **tx)
                .await
        })
    })
    .await?;

    finish(kind, event_id, row)
}

/// Records a failed attempt, scheduling a retry or failing the event once
/// the attempt ceiling is reached.
pub async fn record_failure(
    pool: &SqlitePool,
    policy: &BusyRetryPolicy,
    strategy: &RetryStrategy,
    kind: DeliveryKind,
    event_id: Uuid,
    message: &str,
    now: DateTime<Utc>,
) -> Result<DeliveryEvent, StoreError> {
    let table = events_table(kind);
    let select_sql = format!(
        "SELECT attempt_count FROM {table} WHERE id = ? AND status IN ('pending', 'retrying')"
    );
    let update_sql = format!(
        r#"
        UPDATE {table}
        SET status = ?,
            attempt_count = ?,
            last_attempt_at = ?,
            last_attempt_err = ?,
            next_attempt_at = ?,
            updated_at = ?
        WHERE id = ?
            AND status IN ('pending', 'retrying')
        RETURNING {EVENT_COLUMNS}
        "#
    );
    let id = event_id.to_string();
    let now_str = format_utc(now);
    let error = truncate_error(Some(message));
    let strategy = strategy.clone();

    let row = with_retry(pool, policy, move |tx| {
        let select_sql = select_sql.clone();
        let update_sql = update_sql.clone();
        let id = id.clone();
        let now_str = now_str.clone();
        let error = error.clone();
        let strategy = strategy.clone();
        Box::pin(async move {
            let current: Option<i64> = sqlx::query_scalar(&select_sql)
                .bind(&id)
                .fetch_optional(&mut **tx)
                .await?;
            let Some(current) = current else {
                return Ok(None);
            };

            let attempt_count = current + 1;
            let (status, next_attempt_at) = match strategy.decide(attempt_count, now) {
                RetryDecision::Retry { next_attempt_at } => {
                    (DeliveryStatus::Retrying, next_attempt_at.map(format_utc))
                }
                RetryDecision::GiveUp => (DeliveryStatus::Failed, None),
            };

            sqlx::query_as::<_, EventRow>(&update_sql)
                .bind(status.as_str())
                .bind(attempt_count)
                .bind(&now_str)
                .bind(&error)
                .bind(next_attempt_at)
                .bind(&now_str)
                .bind(&id)
                .fetch_optional(&mut **tx)
                .await
        })
    })
    .await?;

    finish(kind, event_id, row)
}

/// Fails an event without counting an attempt, for problems a retry cannot fix.
pub async fn finalize_failed(
    pool: &SqlitePool,
    policy: &BusyRetryPolicy,
    kind: DeliveryKind,
    event_id: Uuid,
    message: &str,
    now: DateTime<Utc>,
) -> Result<DeliveryEvent, StoreError> {
    let sql = format!(
        r#"
        UPDATE {table}
        SET status = 'failed',
            last_attempt_err = ?,
            next_attempt_at = NULL,
            updated_at = ?
        WHERE id = ?
            AND status IN ('pending', 'retrying')
        RETURNING {EVENT_COLUMNS}
        "#,
        table = events_table(kind),
    );
    let id = event_id.to_string();
    let now_str = format_utc(now);
    let error = truncate_error(Some(message));

    let row = with_retry(pool, policy, move |tx| {
        let sql = sql.clone();
        let id = id.clone();
        let now_str = now_str.clone();
        let error = error.clone();
        Box::pin(async move {
            sqlx::query_as::<_, EventRow>(&sql)
                .bind(&error)
                .bind(&now_str)
                .bind(&id)
                .fetch_optional(&mut **tx)
                .await
        })
    })
    .await?;

    finish(kind, event_id, row)
}

fn finish(
    kind: DeliveryKind,
    event_id: Uuid,
    row: Option<EventRow>,
) -> Result<DeliveryEvent, StoreError> {
    row.ok_or_else(|| {
        StoreError::NotFound(format!(
            "{} event {event_id} is not awaiting delivery",
            kind.as_str()
        ))
    })?
    .try_into()
}

/// Form and submission data every destination needs.
#[derive(Debug, Clone)]
pub struct SubmissionContext {
    pub submission_id: Uuid,
    pub submitted_at: String,
    pub data: serde_json::Value,
    pub form_id: Uuid,
    pub form_slug: String,
    pub form_name: String,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    pub secret: Option<String>,
    pub signature_header: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct WebhookTarget {
    pub context: SubmissionContext,
    pub config: Option<WebhookConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailOverrides {
    pub to: Option<String>,
    pub subject: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub enabled: bool,
    pub overrides: EmailOverrides,
}

/// Provider credentials from the profile linked to the form.
#[derive(Debug, Clone, Default)]
pub struct MailgunCredentials {
    pub api_key: Option<String>,
    pub domain: Option<String>,
    pub from: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmailTarget {
    pub context: SubmissionContext,
    pub config: Option<EmailConfig>,
    pub credentials: MailgunCredentials,
}

/// Latest webhook destination for a submission; `None` if the submission is gone.
pub async fn load_webhook_target(
    pool: &SqlitePool,
    submission_id: Uuid,
) -> Result<Option<WebhookTarget>, StoreError> {
    let row = sqlx::query_as::<_, WebhookTargetRow>(
        r#"
        SELECT
            s.id AS submission_id,
            s.created_at AS submitted_at,
            s.payload,
            f.id AS form_id,
            f.slug AS form_slug,
            f.name AS form_name,
            w.enabled AS webhook_enabled,
            w.url AS webhook_url,
            w.secret AS webhook_secret,
            w.signature_header AS webhook_signature_header,
            w.headers AS webhook_headers
        FROM submissions s
        JOIN forms f ON f.id = s.form_id
        LEFT JOIN form_webhook_configs w ON w.form_id = f.id
        WHERE s.id = ?
        "#,
    )
    .bind(submission_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(WebhookTargetRow::try_into).transpose()
}

/// Latest email destination and credentials for a submission.
pub async fn load_email_target(
    pool: &SqlitePool,
    submission_id: Uuid,
) -> Result<Option<EmailTarget>, StoreError> {
    let row = sqlx::query_as::<_, EmailTargetRow>(
        r#"
        SELECT
            s.id AS submission_id,
            s.created_at AS submitted_at,
            s.payload,
            f.id AS form_id,
            f.slug AS form_slug,
            f.name AS form_name,
            e.enabled AS email_enabled,
            e.overrides AS email_overrides,
            p.mailgun_api_key,
            p.mailgun_domain,
            p.mailgun_from
        FROM submissions s
        JOIN forms f ON f.id = s.form_id
        LEFT JOIN form_email_configs e ON e.form_id = f.id
        LEFT JOIN profiles p ON p.id = f.profile_id
        WHERE s.id = ?
        "#,
    )
    .bind(submission_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(EmailTargetRow::try_into).transpose()
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    submission_id: String,
    status: String,
    attempt_count: i64,
    last_attempt_at: Option<String>,
    last_attempt_err: Option<String>,
    next_attempt_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<EventRow> for DeliveryEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(DeliveryEvent {
            id: parse_uuid("event id", &row.id)?,
            submission_id: parse_uuid("submission id", &row.submission_id)?,
            status: parse_status(&row.status)?,
            attempt_count: row.attempt_count,
            last_attempt_at: row.last_attempt_at,
            last_attempt_err: row.last_attempt_err,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookTargetRow {
    submission_id: String,
    submitted_at: String,
    payload: String,
    form_id: String,
    form_slug: String,
    form_name: String,
    webhook_enabled: Option<bool>,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    webhook_signature_header: Option<String>,
    webhook_headers: Option<String>,
}

impl TryFrom<WebhookTargetRow> for WebhookTarget {
    type Error = StoreError;

    fn try_from(row: WebhookTargetRow) -> Result<Self, Self::Error> {
        let config = match (row.webhook_enabled, row.webhook_url) {
            (Some(enabled), Some(url)) => {
                let headers = match row.webhook_headers.as_deref().map(str::trim) {
                    None | Some("") => BTreeMap::new(),
                    Some(raw) => serde_json::from_str(raw).map_err(|err| {
                        StoreError::Parse(format!("invalid webhook headers JSON: {err}"))
                    })?,
                };
                Some(WebhookConfig {
                    enabled,
                    url,
                    secret: non_empty(row.webhook_secret),
                    signature_header: non_empty(row.webhook_signature_header),
                    headers,
                })
            }
            _ => None,
        };

        Ok(WebhookTarget {
            context: SubmissionContext::from_parts(
                &row.submission_id,
                row.submitted_at,
                &row.payload,
                &row.form_id,
                row.form_slug,
                row.form_name,
            )?,
            config,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EmailTargetRow {
    submission_id: String,
    submitted_at: String,
    payload: String,
    form_id: String,
    form_slug: String,
    form_name: String,
    email_enabled: Option<bool>,
    email_overrides: Option<String>,
    mailgun_api_key: Option<String>,
    mailgun_domain: Option<String>,
    mailgun_from: Option<String>,
}

impl TryFrom<EmailTargetRow> for EmailTarget {
    type Error = StoreError;

    fn try_from(row: EmailTargetRow) -> Result<Self, Self::Error> {
        let config = match row.email_enabled {
            Some(enabled) => {
                let overrides = match row.email_overrides.as_deref().map(str::trim) {
                    None | Some("") => EmailOverrides::default(),
                    Some(raw) => serde_json::from_str(raw).map_err(|err| {
                        StoreError::Parse(format!("invalid email overrides JSON: {err}"))
                    })?,
                };
                Some(EmailConfig { enabled, overrides })
            }
            None => None,
        };

        Ok(EmailTarget {
            context: SubmissionContext::from_parts(
                &row.submission_id,
                row.submitted_at,
                &row.payload,
                &row.form_id,
                row.form_slug,
                row.form_name,
            )?,
            config,
            credentials: MailgunCredentials {
                api_key: non_empty(row.mailgun_api_key),
                domain: non_empty(row.mailgun_domain),
                from: non_empty(row.mailgun_from),
            },
        })
    }
}

impl SubmissionContext {
    fn from_parts(
        submission_id: &str,
        submitted_at: String,
        payload: &str,
        form_id: &str,
        form_slug: String,
        form_name: String,
    ) -> Result<Self, StoreError> {
        // Payloads written by older clients may not be JSON; deliver them verbatim.
        let data = serde_json::from_str(payload)
            .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));

        Ok(Self {
            submission_id: parse_uuid("submission id", submission_id)?,
            submitted_at,
            data,
            form_id: parse_uuid("form id", form_id)?,
            form_slug,
            form_name,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|err| StoreError::Parse(format!("invalid {field}: {err}")))
}

fn parse_status(status: &str) -> Result<DeliveryStatus, StoreError> {
    match status {
        "pending" => Ok(DeliveryStatus::Pending),
        "delivering" => Ok(DeliveryStatus::Delivering),
        "delivered" => Ok(DeliveryStatus::Delivered),
        "retrying" => Ok(DeliveryStatus::Retrying),
        "failed" => Ok(DeliveryStatus::Failed),
        other => Err(StoreError::Parse(format!("unknown status: {other}"))),
    }
}
