//! Monotonic capture clock.

use crate::Timestamp;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Monotonic clock anchored at engine start.
///
/// Timestamps are nanoseconds since the anchor. The wall-clock time of the
/// anchor is kept so timestamps can be displayed as dates.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
        }
    }

    #[inline]
    pub fn now(&self) -> Timestamp {
        Timestamp(u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX))
    }

    /// Wall-clock time at which the clock was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.wall_origin
    }

    /// Map a capture timestamp back to wall-clock time.
    pub fn to_wall(&self, ts: Timestamp) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(Duration::from_nanos(ts.0))
            .unwrap_or(chrono::Duration::MAX);
        self.wall_origin
            .checked_add_signed(offset)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Timestamp that lies `age` before now, saturating at zero.
    pub fn before_now(&self, age: Duration) -> Timestamp {
        let age = u64::try_from(age.as_nanos()).unwrap_or(u64::MAX);
        Timestamp(self.now().0.saturating_sub(age))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::start()
    }
}
