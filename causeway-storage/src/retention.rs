//! Retention windows and prune reports.

use causeway_core::{Event, RetentionConfig, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How much history the hot store keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionWindow {
    pub max_age: Option<Duration>,
    pub max_count: Option<usize>,
}

impl RetentionWindow {
    pub const fn unbounded() -> Self {
        Self {
            max_age: None,
            max_count: None,
        }
    }

    pub fn from_config(config: &RetentionConfig) -> Self {
        Self {
            max_age: config.max_age(),
            max_count: config.max_count,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Events with a timestamp strictly below this are too old at `now`.
    pub fn age_cutoff(&self, now: Timestamp) -> Option<Timestamp> {
        self.max_age.map(|age| {
            let age = u64::try_from(age.as_nanos()).unwrap_or(u64::MAX);
            Timestamp(now.0.saturating_sub(age))
        })
    }
}

/// What a prune removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Removed events, oldest first.
    pub removed: Vec<Event>,
    pub expired_by_age: usize,
    pub evicted_by_count: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_cutoff() {
        let window = RetentionWindow::unbounded().with_max_age(Duration::from_nanos(100));
        assert_eq!(window.age_cutoff(Timestamp(250)), Some(Timestamp(150)));
        assert_eq!(window.age_cutoff(Timestamp(50)), Some(Timestamp(0)));
        assert_eq!(RetentionWindow::unbounded().age_cutoff(Timestamp(5)), None);
    }

    #[test]
    fn test_from_config() {
        let window = RetentionWindow::from_config(&RetentionConfig::default());
        assert_eq!(window.max_age, Some(Duration::from_secs(600)));
        assert_eq!(window.max_count, Some(1_000_000));
    }
}
