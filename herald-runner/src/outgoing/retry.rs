use std::time::{Duration, SystemTime, UNIX_EPOCH};

use herald_common::Metadata;
use serde::Deserialize;

const fn default_retry_period_secs() -> u64 {
    5 * 24 * 60 * 60
}

/// Whether a message with temporary delivery failures is tried again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Requeue,
    GiveUp,
}

/// How long temporary failures are retried for
///
/// The window restarts every time the number of temporarily failing
/// recipients changes, so a message that is making progress is never given
/// up on. A message whose failures stay the same is dropped on the first
/// attempt after the window closes.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_period_secs")]
    pub retry_period_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_period_secs: default_retry_period_secs(),
        }
    }
}

/// Seconds since the Unix epoch
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(retry_period: Duration) -> Self {
        Self {
            retry_period_secs: retry_period.as_secs(),
        }
    }

    /// Decide what happens after an attempt that left `temporary` recipients
    /// failing, recording the attempt in `metadata`
    #[allow(clippy::cast_precision_loss)]
    pub fn decide(&self, metadata: &mut Metadata, temporary: usize, now: f64) -> Retry {
        let last = metadata.last_recip_count();
        let mut deliver_until = metadata.deliver_until().unwrap_or(now);

        if temporary == last {
            if now > deliver_until {
                return Retry::GiveUp;
            }
        } else {
            deliver_until = now + self.retry_period_secs as f64;
        }

        metadata.set_last_recip_count(temporary);
        metadata.set_deliver_until(deliver_until);

        Retry::Requeue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: f64 = 24.0 * 60.0 * 60.0;

    #[test]
    fn test_first_failure_opens_window() {
        let policy = RetryPolicy::default();
        let mut metadata = Metadata::new();

        assert_eq!(policy.decide(&mut metadata, 3, 1000.0), Retry::Requeue);
        assert_eq!(metadata.last_recip_count(), 3);
        assert_eq!(metadata.deliver_until(), Some(1000.0 + 5.0 * DAY));
    }

    #[test]
    fn test_no_progress_expires() {
        let policy = RetryPolicy::default();
        let mut metadata = Metadata::new();

        policy.decide(&mut metadata, 2, 0.0);
        assert_eq!(policy.decide(&mut metadata, 2, 4.0 * DAY), Retry::Requeue);
        assert_eq!(metadata.deliver_until(), Some(5.0 * DAY));
        assert_eq!(policy.decide(&mut metadata, 2, 6.0 * DAY), Retry::GiveUp);
    }

    #[test]
    fn test_progress_extends_window() {
        let policy = RetryPolicy::default();
        let mut metadata = Metadata::new();

        policy.decide(&mut metadata, 3, 0.0);
        assert_eq!(policy.decide(&mut metadata, 2, 6.0 * DAY), Retry::Requeue);
        assert_eq!(metadata.deliver_until(), Some(11.0 * DAY));
    }
}
