//! Time source for progression records.
//!
//! Stores never call `Utc::now()` directly; they ask a [`Clock`] so tests can pin
//! and step time to check timestamp invariants exactly.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

pub type Timestamp = DateTime<Utc>;

/// Anything that can tell the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock backed by `chrono::Utc::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: Timestamp) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = at;
        }
    }

    /// Move the clock forward and return the new time.
    pub fn advance(&self, by: Duration) -> Timestamp {
        match self.current.lock() {
            Ok(mut guard) => {
                *guard += by;
                *guard
            }
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        match self.current.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Shared handle used by every store in one engine.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances_by_requested_amount() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        let later = clock.advance(Duration::seconds(90));
        assert_eq!(later, start + Duration::seconds(90));
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn clones_share_the_same_time() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();
        clock.advance(Duration::minutes(5));
        assert_eq!(other.now(), start + Duration::minutes(5));
    }
}
