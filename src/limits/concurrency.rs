use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::warn;

use crate::limits::LimitsConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("{pool} capacity exceeded after waiting {}ms", .waited.as_millis())]
    CapacityExceeded {
        pool: &'static str,
        waited: Duration,
    },
    #[error("{pool} limiter is closed")]
    Closed { pool: &'static str },
}

/// Bounds concurrent foreground reads and writes against the database.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    read: Arc<Semaphore>,
    write: Arc<Semaphore>,
    read_capacity: u32,
    write_capacity: u32,
    slow_queue_threshold: Duration,
}

impl ConcurrencyLimiter {
    pub fn new(max_readers: usize, max_writers: usize, slow_queue_threshold: Duration) -> Self {
        let read_capacity = clamp_capacity(max_readers);
        let write_capacity = clamp_capacity(max_writers);

        Self {
            read: Arc::new(Semaphore::new(read_capacity as usize)),
            write: Arc::new(Semaphore::new(write_capacity as usize)),
            read_capacity,
            write_capacity,
            slow_queue_threshold,
        }
    }

    pub fn from_config(config: &LimitsConfig) -> Self {
        Self::new(
            config.max_readers,
            config.max_writers,
            config.slow_queue_threshold,
        )
    }

    pub async fn acquire_read(&self, timeout: Duration) -> Result<OwnedSemaphorePermit, LimitError> {
        self.acquire_read_weighted(1, timeout).await
    }

    pub async fn acquire_write(
        &self,
        timeout: Duration,
    ) -> Result<OwnedSemaphorePermit, LimitError> {
        self.acquire_write_weighted(1, timeout).await
    }

    pub async fn acquire_read_weighted(
        &self,
        weight: u32,
        timeout: Duration,
    ) -> Result<OwnedSemaphorePermit, LimitError> {
        let weight = weight.clamp(1, self.read_capacity);
        self.acquire(&self.read, "read", weight, timeout).await
    }

    pub async fn acquire_write_weighted(
        &self,
        weight: u32,
        timeout: Duration,
    ) -> Result<OwnedSemaphorePermit, LimitError> {
        let weight = weight.clamp(1, self.write_capacity);
        self.acquire(&self.write, "write", weight, timeout).await
    }

    pub fn available_reads(&self) -> usize {
        self.read.available_permits()
    }

    pub fn available_writes(&self) -> usize {
        self.write.available_permits()
    }

    async fn acquire(
        &self,
        semaphore: &Arc<Semaphore>,
        pool: &'static str,
        weight: u32,
        timeout: Duration,
    ) -> Result<OwnedSemaphorePermit, LimitError> {
        let started = Instant::now();
        let acquired =
            tokio::time::timeout(timeout, semaphore.clone().acquire_many_owned(weight)).await;
        let waited = started.elapsed();

        match acquired {
            Ok(Ok(permit)) => {
                if waited >= self.slow_queue_threshold {
                    warn!(
                        pool,
                        wait_ms = waited.as_millis() as u64,
                        "database admission queue is slow"
                    );
                }
                Ok(permit)
            }
            Ok(Err(_)) => Err(LimitError::Closed { pool }),
            Err(_) => {
                warn!(
                    pool,
                    wait_ms = waited.as_millis() as u64,
                    "database admission capacity exceeded"
                );
                Err(LimitError::CapacityExceeded { pool, waited })
            }
        }
    }
}

fn clamp_capacity(capacity: usize) -> u32 {
    u32::try_from(capacity.max(1)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_slots_are_bounded() {
        let limiter = ConcurrencyLimiter::new(4, 1, Duration::from_secs(1));

        let held = limiter.acquire_write(Duration::from_millis(50)).await;
        assert!(held.is_ok());
        assert_eq!(limiter.available_writes(), 0);

        let blocked = limiter.acquire_write(Duration::from_millis(20)).await;
        assert!(matches!(
            blocked,
            Err(LimitError::CapacityExceeded { pool: "write", .. })
        ));

        drop(held);
        assert!(limiter.acquire_write(Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn reads_do_not_consume_write_slots() {
        let limiter = ConcurrencyLimiter::new(2, 1, Duration::from_secs(1));

        let _a = limiter.acquire_read(Duration::from_millis(20)).await;
        let _b = limiter.acquire_read(Duration::from_millis(20)).await;

        assert_eq!(limiter.available_reads(), 0);
        assert_eq!(limiter.available_writes(), 1);
        assert!(limiter.acquire_read(Duration::from_millis(20)).await.is_err());
    }

    #[tokio::test]
    async fn waiter_proceeds_once_slot_is_released() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, 1, Duration::ZERO));
        let held = limiter.acquire_write(Duration::from_millis(50)).await;
        assert!(held.is_ok());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_write(Duration::from_secs(2)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);

        assert!(matches!(waiter.await, Ok(true)));
    }

    #[tokio::test]
    async fn oversized_weight_is_clamped_to_capacity() {
        let limiter = ConcurrencyLimiter::new(3, 2, Duration::from_secs(1));

        let permit = limiter
            .acquire_read_weighted(10, Duration::from_millis(20))
            .await;

        assert!(permit.is_ok());
        assert_eq!(limiter.available_reads(), 0);
    }
}
