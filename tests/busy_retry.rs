#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};
use std::time::Duration;

use formlander::db::{BusyRetryPolicy, TxError, with_retry};
use sqlx::{Connection, SqliteConnection};

use common::{count_rows, fast_retry, seed_form, setup_db};

fn locked() -> sqlx::Error {
    sqlx::Error::Protocol("database is locked".to_string())
}

#[tokio::test]
async fn non_busy_error_is_returned_without_retry() {
    let db = setup_db().await;
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let result: Result<(), TxError> = with_retry(&db.pool, &fast_retry(), move |_tx| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(sqlx::Error::RowNotFound)
        })
    })
    .await;

    assert!(matches!(result, Err(TxError::Db(sqlx::Error::RowNotFound))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn busy_errors_are_retried_until_success() {
    let db = setup_db().await;
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let result = with_retry(&db.pool, &fast_retry(), move |_tx| {
        let counter = counter.clone();
        Box::pin(async move {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 { Err(locked()) } else { Ok(call) }
        })
    })
    .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let db = setup_db().await;
    let calls = Arc::new(AtomicU32::new(0));
    let policy = BusyRetryPolicy {
        max_attempts: 10,
        base_delay: Duration::from_micros(100),
        max_delay: Duration::from_millis(1),
        jitter: 0.0,
    };

    let counter = calls.clone();
    let result: Result<(), TxError> = with_retry(&db.pool, &policy, move |_tx| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(locked())
        })
    })
    .await;

    let err = result.expect_err("should exhaust retries");
    assert!(matches!(err, TxError::Exhausted { attempts: 10, .. }));
    assert!(err.to_string().contains("10 attempts"));
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn failed_attempt_is_rolled_back_before_retry() {
    let db = setup_db().await;
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    with_retry(&db.pool, &fast_retry(), move |tx| {
        let counter = counter.clone();
        Box::pin(async move {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            sqlx::query("INSERT INTO profiles (id, name) VALUES (?, 'Acme')")
                .bind(format!("profile-{call}"))
                .execute(&mut **tx)
                .await?;
            if call == 1 {
                return Err(locked());
            }
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(count_rows(&db.pool, "profiles").await, 1);
    let kept: String = sqlx::query_scalar("SELECT id FROM profiles")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(kept, "profile-2");
}

#[tokio::test]
async fn waits_out_a_competing_writer() {
    let db = common::setup_db_with(2, Duration::ZERO).await;
    seed_form(&db.pool, "contact", None).await;

    let mut holder = SqliteConnection::connect_with(&db.options).await.unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut holder)
        .await
        .unwrap();
    sqlx::query("UPDATE forms SET name = 'Held' WHERE slug = 'contact'")
        .execute(&mut holder)
        .await
        .unwrap();

    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        sqlx::query("COMMIT").execute(&mut holder).await.unwrap();
        holder
    });

    let policy = BusyRetryPolicy {
        max_attempts: 10,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        jitter: 0.0,
    };
    let renamed = with_retry(&db.pool, &policy, |tx| {
        Box::pin(async move {
            sqlx::query("UPDATE forms SET name = 'Renamed' WHERE slug = 'contact'")
                .execute(&mut **tx)
                .await
                .map(|result| result.rows_affected())
        })
    })
    .await
    .expect("write should succeed once the lock is released");

    release.await.unwrap();
    assert_eq!(renamed, 1);
    let name: String = sqlx::query_scalar("SELECT name FROM forms WHERE slug = 'contact'")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(name, "Renamed");
}
