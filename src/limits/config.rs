use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_writers: usize,
    pub max_readers: usize,
    /// How long a request may queue for a database slot.
    pub acquire_timeout: Duration,
    /// Queue time above which an acquisition is logged as a load signal.
    pub slow_queue_threshold: Duration,
    pub submit_rate_limit: u32,
    pub submit_rate_window: Duration,
}

impl LimitsConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("FORMLANDER_DB_MAX_WRITERS")
            && let Ok(parsed) = value.parse::<usize>()
        {
            config.max_writers = parsed.max(1);
        }
        if let Ok(value) = std::env::var("FORMLANDER_DB_MAX_READERS")
            && let Ok(parsed) = value.parse::<usize>()
        {
            config.max_readers = parsed.max(1);
        }
        if let Ok(value) = std::env::var("FORMLANDER_DB_ACQUIRE_TIMEOUT_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.acquire_timeout = Duration::from_millis(parsed);
        }
        if let Ok(value) = std::env::var("FORMLANDER_DB_SLOW_QUEUE_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.slow_queue_threshold = Duration::from_millis(parsed);
        }
        if let Ok(value) = std::env::var("FORMLANDER_SUBMIT_RATE_LIMIT")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.submit_rate_limit = parsed;
        }
        if let Ok(value) = std::env::var("FORMLANDER_SUBMIT_RATE_WINDOW_SECS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.submit_rate_window = Duration::from_secs(parsed);
        }

        config
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_writers: 1,
            max_readers: 16,
            acquire_timeout: Duration::from_secs(5),
            slow_queue_threshold: Duration::from_millis(250),
            submit_rate_limit: 10,
            submit_rate_window: Duration::from_secs(60),
        }
    }
}
