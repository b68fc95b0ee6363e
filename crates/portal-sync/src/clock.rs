//! Wall-clock sources for activity timestamps.
//!
//! Timers (backoff, ticks) run on tokio's time driver and are controlled in
//! tests with paused time. Timestamps written into portal state come from a
//! [`Clock`], so the idle detector can be exercised the same way.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of "now" for reconciliation and simulation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock anchored to tokio's clock.
///
/// Under `tokio::time::pause` the reported time only moves when the runtime
/// clock is advanced.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(anchor_wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall,
            anchor_instant: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor_instant.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor_wall + elapsed
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid time");
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));

        let rewound = start - chrono::Duration::hours(1);
        clock.set(rewound);
        assert_eq!(clock.now(), rewound);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_runtime_time() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid time");
        let clock = TokioClock::starting_at(start);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(clock.now(), start + chrono::Duration::seconds(300));
    }
}
