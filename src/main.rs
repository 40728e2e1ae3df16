use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::post};
use formlander::{
    delivery::{DeliveryConfig, Dispatcher, EmailProcessor, WebhookProcessor},
    handlers::submissions::submit_handler,
    limits::LimitsConfig,
    state::AppState,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "formlander=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:formlander.db".to_string());
    let bind_addr = std::env::var("FORMLANDER_BIND_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let busy_timeout_ms = std::env::var("FORMLANDER_DB_BUSY_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(1_000);

    let options = SqliteConnectOptions::from_str(&database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(busy_timeout_ms));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let delivery = DeliveryConfig::from_env();
    let limits = LimitsConfig::from_env();
    tracing::info!(
        tick_secs = delivery.tick_interval.as_secs(),
        backoff = ?delivery.backoff_schedule,
        "delivery configured"
    );

    let dispatcher = Dispatcher::new(delivery.tick_interval)
        .with_processor(Arc::new(WebhookProcessor::new(pool.clone(), &delivery)?))
        .with_processor(Arc::new(EmailProcessor::new(pool.clone(), &delivery)?));
    dispatcher.start();

    let state = AppState::new(pool.clone(), limits, delivery.busy_retry);
    let app = Router::new()
        .route("/f/:slug", post(submit_handler))
        .with_state(state);

    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening for submissions");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    dispatcher.stop().await;
    pool.close().await;

    Ok(())
}
