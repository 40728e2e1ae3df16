use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

/// Future returned by a unit of work passed to [`with_retry`].
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + Send + 'c>>;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Fallback for errors that carry no SQLite result code.
const BUSY_MESSAGES: &[&str] = &[
    "database is locked",
    "database table is locked",
    "database is busy",
    "sqlite_busy",
    "sqlite_locked",
    "statements in progress",
    "transaction in progress",
];

#[derive(Debug, Clone, Copy)]
pub struct BusyRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the backoff.
    pub jitter: f64,
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl BusyRetryPolicy {
    /// Backoff before the zero-based `attempt`; the first attempt never waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter.is_finite() || self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("database still busy after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Returns true when `err` means another writer holds the database.
pub fn is_busy_error(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err
        && let Some(code) = db_err.code()
        && let Ok(code) = code.parse::<i32>()
    {
        let primary = code & 0xff;
        return primary == SQLITE_BUSY || primary == SQLITE_LOCKED;
    }

    let message = err.to_string().to_ascii_lowercase();
    BUSY_MESSAGES.iter().any(|needle| message.contains(needle))
}

/// Runs `op` inside its own transaction, retrying the whole transaction
/// while SQLite reports write contention.
///
/// Any non-busy error (including a failed commit) is returned immediately.
/// `op` may run several times, so it must not have side effects outside the
/// transaction.
pub async fn with_retry<T, F>(
    pool: &SqlitePool,
    policy: &BusyRetryPolicy,
    mut op: F,
) -> Result<T, TxError>
where
    T: Send,
    F: for<'c> FnMut(&'c mut Transaction<'static, Sqlite>) -> TxFuture<'c, T> + Send,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if attempt > 0 {
            let delay = policy.jittered(policy.delay_for(attempt));
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "database busy, retrying transaction"
            );
            tokio::time::sleep(delay).await;
        }
        attempt += 1;

        match run_once(pool, &mut op).await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy_error(&err) => {
                if attempt >= max_attempts {
                    warn!(attempts = attempt, error = %err, "giving up on busy database");
                    return Err(TxError::Exhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
            Err(err) => return Err(TxError::Db(err)),
        }
    }
}

async fn run_once<T, F>(pool: &SqlitePool, op: &mut F) -> Result<T, sqlx::Error>
where
    F: for<'c> FnMut(&'c mut Transaction<'static, Sqlite>) -> TxFuture<'c, T>,
{
    let mut tx = pool.begin().await?;
    let value = op(&mut tx).await?;
    tx.commit().await?;
    Ok(value)
}
