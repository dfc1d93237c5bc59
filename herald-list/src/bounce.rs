use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Bounce history for one member address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BounceInfo {
    /// Every bounce ever registered for this address
    pub count: u64,

    /// Bounces since the score was last reset
    pub score: f64,

    pub first_bounce: DateTime<Utc>,
    pub last_bounce: DateTime<Utc>,

    /// `Message-ID` of the most recent bounce, when it had one
    #[serde(default)]
    pub last_message_id: Option<String>,
}

/// What registering a bounce did to the member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceOutcome {
    Recorded,
    /// The score reached the list's threshold on this bounce
    ThresholdReached,
}

/// Bounce bookkeeping for a list, keyed by lower-cased address
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BounceRegistry {
    records: BTreeMap<String, BounceInfo>,
}

impl BounceRegistry {
    pub fn get(&self, address: &str) -> Option<&BounceInfo> {
        self.records.get(&address.trim().to_ascii_lowercase())
    }

    /// How many bounces were ever registered for `address`
    pub fn count(&self, address: &str) -> u64 {
        self.get(address).map_or(0, |info| info.count)
    }

    /// Record one bounce at `now`.
    ///
    /// A score whose last bounce is older than `stale_after` starts again
    /// from zero before this bounce is added.
    pub fn record(
        &mut self,
        address: &str,
        message_id: Option<&str>,
        now: DateTime<Utc>,
        stale_after: Duration,
        threshold: f64,
    ) -> BounceOutcome {
        let info = self
            .records
            .entry(address.trim().to_ascii_lowercase())
            .or_insert_with(|| BounceInfo {
                count: 0,
                score: 0.0,
                first_bounce: now,
                last_bounce: now,
                last_message_id: None,
            });

        if now - info.last_bounce > stale_after {
            info.score = 0.0;
            info.first_bounce = now;
        }

        let was_below = info.score < threshold;
        info.count += 1;
        info.score += 1.0;
        info.last_bounce = now;
        info.last_message_id = message_id.map(str::to_string);

        if was_below && info.score >= threshold {
            BounceOutcome::ThresholdReached
        } else {
            BounceOutcome::Recorded
        }
    }

    pub fn clear(&mut self, address: &str) -> Option<BounceInfo> {
        self.records.remove(&address.trim().to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
