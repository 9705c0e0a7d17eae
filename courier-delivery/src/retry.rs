//! Retry scheduling.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Fixed backoff table: the delay before attempt `n + 1` is the entry at
/// `min(n - 1, len - 1)`, so the last interval repeats once the table runs
/// out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<u64>", into = "Vec<u64>")]
pub struct RetryPolicy {
    intervals_secs: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(defaults::intervals_secs())
    }
}

impl From<Vec<u64>> for RetryPolicy {
    fn from(intervals_secs: Vec<u64>) -> Self {
        Self::new(intervals_secs)
    }
}

impl From<RetryPolicy> for Vec<u64> {
    fn from(policy: RetryPolicy) -> Self {
        policy.intervals_secs
    }
}

impl RetryPolicy {
    /// An empty table falls back to the default one.
    #[must_use]
    pub fn new(intervals_secs: Vec<u64>) -> Self {
        if intervals_secs.is_empty() {
            return Self::default();
        }
        Self { intervals_secs }
    }

    #[must_use]
    pub fn intervals_secs(&self) -> &[u64] {
        &self.intervals_secs
    }

    /// Attempts allowed when the caller does not choose: one per interval.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.intervals_secs.len()).unwrap_or(u32::MAX)
    }

    /// Delay after the `attempt`th failure (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let secs = self
            .intervals_secs
            .get(index)
            .or_else(|| self.intervals_secs.last())
            .copied()
            .unwrap_or_default();
        Duration::from_secs(secs)
    }

    #[must_use]
    pub fn next_attempt_at(&self, attempt: u32, now: SystemTime) -> SystemTime {
        now + self.delay_for_attempt(attempt)
    }
}

pub(crate) mod defaults {
    pub fn intervals_secs() -> Vec<u64> {
        vec![300, 900, 3600, 14400, 86400]
    }
}
