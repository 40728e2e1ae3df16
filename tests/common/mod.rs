#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::fs;
use std::net::SocketAddr;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU16, Ordering},
};
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
};
use chrono::{DateTime, Utc};
use formlander::db::{BusyRetryPolicy, format_utc};
use sqlx::{
    Connection, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tempfile::NamedTempFile;
use uuid::Uuid;

pub struct TestDb {
    pub pool: SqlitePool,
    pub options: SqliteConnectOptions,
    _db_file: NamedTempFile,
}

pub async fn setup_db() -> TestDb {
    setup_db_with(4, Duration::from_millis(500)).await
}

pub async fn setup_db_with(max_connections: u32, busy_timeout: Duration) -> TestDb {
    let db_file = NamedTempFile::new().expect("create temp sqlite file");
    let options = SqliteConnectOptions::new()
        .filename(db_file.path())
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(busy_timeout);

    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .expect("connect sqlite for migrations");
    run_migrations_on_conn(&mut conn)
        .await
        .expect("run migrations");
    conn.close().await.expect("close migration conn");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options.clone())
        .await
        .expect("connect sqlite file");

    TestDb {
        pool,
        options,
        _db_file: db_file,
    }
}

async fn run_migrations_on_conn(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    let mut entries: Vec<_> = fs::read_dir("migrations")
        .map_err(sqlx::Error::Io)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some("sql"))
        .collect();

    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let contents = fs::read_to_string(entry.path()).map_err(sqlx::Error::Io)?;
        for statement in contents.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&mut *conn).await?;
        }
    }

    Ok(())
}

/// Busy-retry policy with delays short enough for tests.
pub fn fast_retry() -> BusyRetryPolicy {
    BusyRetryPolicy {
        max_attempts: 10,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    }
}

pub async fn seed_profile(
    pool: &SqlitePool,
    api_key: Option<&str>,
    domain: Option<&str>,
    from: Option<&str>,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO profiles (id, name, mailgun_api_key, mailgun_domain, mailgun_from)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind("Acme")
    .bind(api_key)
    .bind(domain)
    .bind(from)
    .execute(pool)
    .await
    .expect("insert profile");

    id
}

pub async fn seed_form(pool: &SqlitePool, slug: &str, profile_id: Option<Uuid>) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO forms (id, slug, name, profile_id) VALUES (?, ?, ?, ?)")
        .bind(id.to_string())
        .bind(slug)
        .bind("Contact")
        .bind(profile_id.map(|id| id.to_string()))
        .execute(pool)
        .await
        .expect("insert form");

    id
}

pub async fn seed_webhook_config(
    pool: &SqlitePool,
    form_id: Uuid,
    url: &str,
    enabled: bool,
    secret: Option<&str>,
    signature_header: Option<&str>,
    headers: &str,
) {
    sqlx::query(
        r#"
        INSERT INTO form_webhook_configs (form_id, enabled, url, secret, signature_header, headers)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(form_id.to_string())
    .bind(enabled)
    .bind(url)
    .bind(secret)
    .bind(signature_header)
    .bind(headers)
    .execute(pool)
    .await
    .expect("insert webhook config");
}

pub async fn seed_email_config(pool: &SqlitePool, form_id: Uuid, enabled: bool, overrides: &str) {
    sqlx::query("INSERT INTO form_email_configs (form_id, enabled, overrides) VALUES (?, ?, ?)")
        .bind(form_id.to_string())
        .bind(enabled)
        .bind(overrides)
        .execute(pool)
        .await
        .expect("insert email config");
}

pub async fn seed_submission(pool: &SqlitePool, form_id: Uuid, payload: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO submissions (id, form_id, payload, created_at) VALUES (?, ?, ?, ?)")
        .bind(id.to_string())
        .bind(form_id.to_string())
        .bind(payload)
        .bind(format_utc(Utc::now()))
        .execute(pool)
        .await
        .expect("insert submission");

    id
}

pub async fn seed_event(
    pool: &SqlitePool,
    table: &str,
    submission_id: Uuid,
    created_at: DateTime<Utc>,
) -> Uuid {
    let id = Uuid::new_v4();
    let created_at = format_utc(created_at);
    let sql = format!(
        "INSERT INTO {table} (id, submission_id, status, attempt_count, created_at, updated_at) \
         VALUES (?, ?, 'pending', 0, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(id.to_string())
        .bind(submission_id.to_string())
        .bind(&created_at)
        .bind(&created_at)
        .execute(pool)
        .await
        .expect("insert event");

    id
}

/// Pulls an event's next attempt into the past so the next batch picks it up.
pub async fn make_due(pool: &SqlitePool, table: &str, event_id: Uuid) {
    let sql = format!("UPDATE {table} SET next_attempt_at = ? WHERE id = ?");
    sqlx::query(&sql)
        .bind(format_utc(Utc::now() - chrono::Duration::seconds(1)))
        .bind(event_id.to_string())
        .execute(pool)
        .await
        .expect("make event due");
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    sqlx::query_scalar(&sql)
        .fetch_one(pool)
        .await
        .expect("count rows")
}

pub fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .expect("rfc3339 timestamp")
        .with_timezone(&Utc)
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("json body")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    status: Arc<AtomicU16>,
}

/// Local HTTP destination that records every request it receives.
pub struct MockServer {
    pub url: String,
    state: MockState,
}

impl MockServer {
    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

pub async fn spawn_mock_server() -> MockServer {
    let state = MockState::default();
    state.status.store(200, Ordering::SeqCst);

    let app = Router::new().fallback(capture).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock server addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockServer {
        url: format!("http://{addr}"),
        state,
    }
}

async fn capture(
    State(state): State<MockState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.requests.lock().unwrap().push(CapturedRequest {
        path: uri.path().to_string(),
        headers,
        body,
    });
    StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK)
}
