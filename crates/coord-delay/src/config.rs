use std::time::Duration;

use coord_store::RetryPolicy;

/// Delayed task runner settings.
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Pause between two claim attempts of the polling loop.
    pub granularity: Duration,
    /// Records inserted further than this in the future of the store clock are
    /// treated as due (the clock went backwards since they were written).
    pub skew_tolerance: Duration,
    /// Retry bound for `insert` and `remove`.
    pub store_retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            granularity: Duration::from_secs(2),
            skew_tolerance: Duration::from_secs(30),
            store_retry: RetryPolicy::insert(),
        }
    }
}

impl RunnerConfig {
    pub fn with_granularity(mut self, granularity: Duration) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_store_retry(mut self, retry: RetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }

    pub(crate) fn skew_secs(&self) -> i64 {
        i64::try_from(self.skew_tolerance.as_secs()).unwrap_or(i64::MAX)
    }
}
