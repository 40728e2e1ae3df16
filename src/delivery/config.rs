use std::time::Duration;

use crate::db::BusyRetryPolicy;
use crate::delivery::retry::{DEFAULT_BACKOFF_SCHEDULE, parse_backoff_schedule};

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Formlander-Signature";
pub const DEFAULT_MAILGUN_API_BASE: &str = "https://api.mailgun.net";
pub const USER_AGENT: &str = concat!("Formlander-Webhook/", env!("CARGO_PKG_VERSION"));

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
pub const EMAIL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub tick_interval: Duration,
    pub backoff_schedule: Vec<u64>,
    pub signature_header: String,
    pub mailgun_api_base: String,
    pub busy_retry: BusyRetryPolicy,
}

impl DeliveryConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("FORMLANDER_DISPATCH_INTERVAL_SECS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.tick_interval = Duration::from_secs(parsed.max(1));
        }
        // A blank value keeps the default; a value with no valid entries
        // disables retry scheduling.
        if let Ok(value) = std::env::var("FORMLANDER_RETRY_BACKOFF")
            && !value.trim().is_empty()
        {
            config.backoff_schedule = parse_backoff_schedule(&value);
        }
        if let Ok(value) = std::env::var("FORMLANDER_SIGNATURE_HEADER")
            && !value.trim().is_empty()
        {
            config.signature_header = value.trim().to_string();
        }
        if let Ok(value) = std::env::var("FORMLANDER_MAILGUN_API_BASE")
            && !value.trim().is_empty()
        {
            config.mailgun_api_base = value.trim().trim_end_matches('/').to_string();
        }

        config
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(120),
            backoff_schedule: DEFAULT_BACKOFF_SCHEDULE.to_vec(),
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            mailgun_api_base: DEFAULT_MAILGUN_API_BASE.to_string(),
            busy_retry: BusyRetryPolicy::default(),
        }
    }
}
