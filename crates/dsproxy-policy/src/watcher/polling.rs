//! Fixed-interval reload trigger

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::WatchStrategy;
use crate::error::Result;

/// Default polling period for sources without change notification
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Signals once per period, regardless of whether anything changed
pub struct Polling {
    period: Duration,
    interval: Option<Interval>,
}

impl Polling {
    /// Poll every `period`; the first signal comes one period after the first wait
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    /// Polling period
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Default for Polling {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

#[async_trait]
impl WatchStrategy for Polling {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn changed(&mut self) -> Result<()> {
        let period = self.period;
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        interval.tick().await;
        Ok(())
    }
}
