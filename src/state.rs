use std::sync::Arc;

use sqlx::SqlitePool;

use crate::db::BusyRetryPolicy;
use crate::limits::{ConcurrencyLimiter, LimitsConfig, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub rate_limiter: Arc<RateLimiter>,
    pub limits: LimitsConfig,
    pub busy_retry: BusyRetryPolicy,
}

impl AppState {
    pub fn new(pool: SqlitePool, limits: LimitsConfig, busy_retry: BusyRetryPolicy) -> Self {
        Self {
            pool,
            limiter: Arc::new(ConcurrencyLimiter::from_config(&limits)),
            rate_limiter: Arc::new(RateLimiter::new()),
            limits,
            busy_retry,
        }
    }
}
