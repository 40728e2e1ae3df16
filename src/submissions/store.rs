use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::db::{BusyRetryPolicy, StoreError, format_utc, with_retry};
use crate::types::SubmitResponse;

/// Stores a submission for the form with `slug` and queues a delivery event
/// for each enabled destination, all in one transaction.
pub async fn create_submission(
    pool: &SqlitePool,
    policy: &BusyRetryPolicy,
    slug: &str,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<SubmitResponse, StoreError> {
    let payload = serde_json::to_string(payload)
        .map_err(|err| StoreError::Parse(format!("invalid submission payload: {err}")))?;
    let form_slug = slug.to_string();
    let now_str = format_utc(now);
    let submission_id = Uuid::new_v4();
    let webhook_event_id = Uuid::new_v4();
    let email_event_id = Uuid::new_v4();

    let created = with_retry(pool, policy, move |tx| {
        let form_slug = form_slug.clone();
        let payload = payload.clone();
        let now_str = now_str.clone();
        Box::pin(async move {
            let form_id: Option<String> =
                sqlx::query_scalar("SELECT id FROM forms WHERE slug = ?")
                    .bind(&form_slug)
                    .fetch_optional(&mut **tx)
                    .await?;
            let Some(form_id) = form_id else {
                return Ok(None);
            };

            sqlx::query(
                r#"
                INSERT INTO submissions (id, form_id, payload, created_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(submission_id.to_string())
            .bind(&form_id)
            .bind(&payload)
            .bind(&now_str)
            .execute(&mut **tx)
            .await?;

            let webhook_enabled: Option<bool> =
                sqlx::query_scalar("SELECT enabled FROM form_webhook_configs WHERE form_id = ?")
                    .bind(&form_id)
                    .fetch_optional(&mut **tx)
                    .await?;
            let webhook_event = if webhook_enabled.unwrap_or(false) {
                insert_event(tx, "webhook_events", webhook_event_id, submission_id, &now_str)
                    .await?;
                Some(webhook_event_id)
            } else {
                None
            };

            let email_enabled: Option<bool> =
                sqlx::query_scalar("SELECT enabled FROM form_email_configs WHERE form_id = ?")
                    .bind(&form_id)
                    .fetch_optional(&mut **tx)
                    .await?;
            let email_event = if email_enabled.unwrap_or(false) {
                insert_event(tx, "email_events", email_event_id, submission_id, &now_str).await?;
                Some(email_event_id)
            } else {
                None
            };

            Ok(Some(SubmitResponse {
                submission_id,
                webhook_event_id: webhook_event,
                email_event_id: email_event,
            }))
        })
    })
    .await?;

    created.ok_or_else(|| StoreError::NotFound(format!("form {slug} not found")))
}

async fn insert_event(
    tx: &mut Transaction<'static, Sqlite>,
    table: &'static str,
    event_id: Uuid,
    submission_id: Uuid,
    now_str: &str,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO {table} (id, submission_id, status, attempt_count, created_at, updated_at)
        VALUES (?, ?, 'pending', 0, ?, ?)
        "#
    );

    sqlx::query(&sql)
        .bind(event_id.to_string())
        .bind(submission_id.to_string())
        .bind(now_str)
        .bind(now_str)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
