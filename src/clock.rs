//! Time source used by the scheduler, queue and recovery manager.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock plus tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Clock anchored at a fixed instant that moves with tokio's timer.
///
/// Under `#[tokio::test(start_paused = true)]` time only passes when every
/// task is idle or `advance` is called, so backoff and stall thresholds can
/// be exercised without real waiting.
pub struct ManualClock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Jump the wall clock forward without touching tokio timers.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = self.offset.lock().map(|o| *o).unwrap_or_default();
        let elapsed = self.started.elapsed() + offset;
        self.base + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
