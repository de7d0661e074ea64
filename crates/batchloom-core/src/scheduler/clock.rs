//! Wall-clock time driven by the tokio clock.
//!
//! Retry deadlines and cron occurrences are stored as UTC timestamps but
//! waited on with tokio timers. Deriving "now" from a tokio instant keeps the
//! two consistent, including under a paused test runtime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    /// Anchor a clock at the current wall time.
    pub fn start() -> Self {
        Self {
            wall: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }

    /// Time left until `at`, zero if it has passed.
    pub fn until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_tokio_time() {
        let clock = Clock::start();
        let before = clock.now();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now() - before, chrono::Duration::seconds(90));
        assert_eq!(clock.until(before), Duration::ZERO);
        assert_eq!(
            clock.until(before + chrono::Duration::seconds(100)),
            Duration::from_secs(10)
        );
    }
}
