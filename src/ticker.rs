//! Periodic ticker shared by the heartbeat and recovery tasks.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// An interval that stops when its cancellation token fires.
///
/// The first tick completes immediately. Ticks missed while the owner was busy
/// are not replayed in a burst; the schedule is pushed back instead.
pub struct Ticker {
    interval: Interval,
    shutdown: CancellationToken,
}

impl Ticker {
    pub fn new(period: Duration, shutdown: CancellationToken) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, shutdown }
    }

    /// Wait for the next tick. Returns `false` once shutdown was requested.
    pub async fn tick(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = self.interval.tick() => true,
        }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_cancelled() {
        let token = CancellationToken::new();
        let mut ticker = Ticker::new(Duration::from_secs(10), token.clone());

        assert!(ticker.tick().await);
        assert!(ticker.tick().await);

        token.cancel();
        assert!(!ticker.tick().await);
    }
}
