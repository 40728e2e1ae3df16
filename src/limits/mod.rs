mod concurrency;
mod config;
mod rate;

pub use concurrency::{ConcurrencyLimiter, LimitError};
pub use config::LimitsConfig;
pub use rate::RateLimiter;
