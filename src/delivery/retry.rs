use chrono::{DateTime, Duration, Utc};

/// Total attempts, including the first, before an event is marked failed.
pub const MAX_ATTEMPTS: i64 = 3;
/// Longest error message stored on an event.
pub const MAX_ERROR_LEN: usize = 500;
pub const DEFAULT_BACKOFF_SCHEDULE: [u64; 4] = [1, 5, 15, 60];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again; `None` means the event is due immediately.
    Retry { next_attempt_at: Option<DateTime<Utc>> },
    GiveUp,
}

/// Decides whether a failed delivery is retried and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStrategy {
    schedule: Vec<u64>,
}

impl RetryStrategy {
    pub fn new(schedule: Vec<u64>) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &[u64] {
        &self.schedule
    }

    pub fn should_retry(&self, attempt_count: i64) -> bool {
        attempt_count < MAX_ATTEMPTS
    }

    pub fn next_retry(&self, attempt: i64) -> Option<DateTime<Utc>> {
        self.next_retry_from(Utc::now(), attempt)
    }

    /// The schedule is indexed by `attempt - 1` and clamps to its last entry.
    pub fn next_retry_from(&self, now: DateTime<Utc>, attempt: i64) -> Option<DateTime<Utc>> {
        let last = self.schedule.len().checked_sub(1)?;
        let index = usize::try_from(attempt.saturating_sub(1))
            .unwrap_or(0)
            .min(last);
        let secs = i64::try_from(*self.schedule.get(index)?).ok()?;
        now.checked_add_signed(Duration::try_seconds(secs)?)
    }

    /// `attempt_count` is the count after the failed attempt was recorded.
    pub fn decide(&self, attempt_count: i64, now: DateTime<Utc>) -> RetryDecision {
        if self.should_retry(attempt_count) {
            RetryDecision::Retry {
                next_attempt_at: self.next_retry_from(now, attempt_count),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_SCHEDULE.to_vec())
    }
}

/// Parses a comma-separated list of seconds, skipping entries that are not
/// positive integers so every scheduled retry lands strictly in the future.
pub fn parse_backoff_schedule(raw: &str) -> Vec<u64> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| match part.parse::<u64>() {
            Ok(secs) if secs > 0 => Some(secs),
            _ => {
                tracing::warn!(entry = part, "ignoring invalid backoff entry");
                None
            }
        })
        .collect()
}

/// Trims an error message and caps it at [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: Option<&str>) -> String {
    match message {
        Some(message) => message.trim().chars().take(MAX_ERROR_LEN).collect(),
        None => String::new(),
    }
}
