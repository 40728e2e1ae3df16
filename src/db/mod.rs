mod tx;

use chrono::{DateTime, SecondsFormat, Utc};

pub use tx::{BusyRetryPolicy, TxError, TxFuture, is_busy_error, with_retry};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Tx(TxError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<TxError> for StoreError {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Db(db) => Self::Db(db),
            exhausted => Self::Tx(exhausted),
        }
    }
}

/// Formats a timestamp the way every row in the database stores it.
///
/// Fixed millisecond precision with a `Z` suffix keeps lexicographic and
/// chronological order identical, which the due-event query relies on.
pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}
