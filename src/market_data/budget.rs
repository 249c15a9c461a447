// =============================================================================
// Rate Budget — rolling hourly/daily call windows with adaptive pacing
// =============================================================================
//
// Two rolling windows gate outbound provider calls:
//
//   hourly: api_calls_this_hour < max_calls_per_hour, window resets when
//           now − hour_window_start ≥ 1 h
//   daily:  api_calls_today < max_calls_per_day, window resets when
//           now − day_window_start ≥ 24 h
//
// Both must allow a call. Counters are incremented before the provider call
// completes; a CircuitOpen rejection refunds the spend.
//
// The adaptive inter-call delay stretches as the hourly budget drains:
// 1.0 s below 25% used, 2.0 s to 50%, 2.5 s to 75%, 3.0 s above.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

struct Inner {
    calls_this_hour: u32,
    calls_today: u32,
    hour_window_start: DateTime<Utc>,
    day_window_start: DateTime<Utc>,
}

pub struct RateBudget {
    max_per_hour: u32,
    max_per_day: u32,
    inner: Mutex<Inner>,
}

impl RateBudget {
    pub fn new(max_per_hour: u32, max_per_day: u32, now: DateTime<Utc>) -> Self {
        Self {
            max_per_hour,
            max_per_day,
            inner: Mutex::new(Inner {
                calls_this_hour: 0,
                calls_today: 0,
                hour_window_start: now,
                day_window_start: now,
            }),
        }
    }

    /// Restore persisted counters (crash recovery).
    pub fn restore(
        &self,
        calls_this_hour: u32,
        calls_today: u32,
        hour_window_start: DateTime<Utc>,
        day_window_start: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock();
        inner.calls_this_hour = calls_this_hour;
        inner.calls_today = calls_today;
        inner.hour_window_start = hour_window_start;
        inner.day_window_start = day_window_start;
    }

    fn roll(inner: &mut Inner, now: DateTime<Utc>) {
        if now - inner.hour_window_start >= chrono::Duration::hours(1) {
            debug!("hourly rate window reset");
            inner.calls_this_hour = 0;
            inner.hour_window_start = now;
        }
        if now - inner.day_window_start >= chrono::Duration::hours(24) {
            debug!("daily rate window reset");
            inner.calls_today = 0;
            inner.day_window_start = now;
        }
    }

    /// True when both windows have room for one more call.
    pub fn can_call(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        Self::roll(&mut inner, now);
        inner.calls_this_hour < self.max_per_hour && inner.calls_today < self.max_per_day
    }

    /// Spend one call from both windows.
    pub fn record_call(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        Self::roll(&mut inner, now);
        inner.calls_this_hour += 1;
        inner.calls_today += 1;
    }

    /// Return one call to both windows (CircuitOpen rejections never reached
    /// the provider).
    pub fn refund(&self) {
        let mut inner = self.inner.lock();
        inner.calls_this_hour = inner.calls_this_hour.saturating_sub(1);
        inner.calls_today = inner.calls_today.saturating_sub(1);
    }

    /// Pacing delay between provider calls, stepped by hourly usage.
    pub fn adaptive_delay(&self, now: DateTime<Utc>) -> Duration {
        let mut inner = self.inner.lock();
        Self::roll(&mut inner, now);
        if self.max_per_hour == 0 {
            return Duration::from_millis(3000);
        }
        let used = inner.calls_this_hour as f64 / self.max_per_hour as f64;
        let millis = if used < 0.25 {
            1000
        } else if used < 0.50 {
            2000
        } else if used < 0.75 {
            2500
        } else {
            3000
        };
        Duration::from_millis(millis)
    }

    /// `(calls_this_hour, calls_today, hour_window_start, day_window_start)`.
    pub fn snapshot(&self) -> (u32, u32, DateTime<Utc>, DateTime<Utc>) {
        let inner = self.inner.lock();
        (
            inner.calls_this_hour,
            inner.calls_today,
            inner.hour_window_start,
            inner.day_window_start,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn allows_until_hourly_budget_exhausted() {
        let budget = RateBudget::new(3, 100, now());
        for _ in 0..3 {
            assert!(budget.can_call(now()));
            budget.record_call(now());
        }
        assert!(!budget.can_call(now()));
    }

    #[test]
    fn daily_budget_binds_independently() {
        let budget = RateBudget::new(100, 2, now());
        budget.record_call(now());
        budget.record_call(now());
        assert!(!budget.can_call(now()));
    }

    #[test]
    fn hourly_window_resets_after_an_hour() {
        let budget = RateBudget::new(1, 100, now());
        budget.record_call(now());
        assert!(!budget.can_call(now()));
        assert!(budget.can_call(now() + chrono::Duration::hours(1)));
    }

    #[test]
    fn daily_window_resets_after_24_hours() {
        let budget = RateBudget::new(100, 1, now());
        budget.record_call(now());
        assert!(!budget.can_call(now() + chrono::Duration::hours(23)));
        assert!(budget.can_call(now() + chrono::Duration::hours(24)));
    }

    #[test]
    fn refund_returns_spend() {
        let budget = RateBudget::new(1, 1, now());
        budget.record_call(now());
        assert!(!budget.can_call(now()));
        budget.refund();
        assert!(budget.can_call(now()));
        // Refund never underflows.
        budget.refund();
        budget.refund();
        assert!(budget.can_call(now()));
    }

    #[test]
    fn adaptive_delay_steps_with_usage() {
        let budget = RateBudget::new(100, 10_000, now());
        assert_eq!(budget.adaptive_delay(now()), Duration::from_millis(1000));
        for _ in 0..25 {
            budget.record_call(now());
        }
        assert_eq!(budget.adaptive_delay(now()), Duration::from_millis(2000));
        for _ in 0..25 {
            budget.record_call(now());
        }
        assert_eq!(budget.adaptive_delay(now()), Duration::from_millis(2500));
        for _ in 0..25 {
            budget.record_call(now());
        }
        assert_eq!(budget.adaptive_delay(now()), Duration::from_millis(3000));
    }

    #[test]
    fn restore_rehydrates_counters() {
        let budget = RateBudget::new(10, 20, now());
        budget.restore(9, 19, now(), now());
        assert!(budget.can_call(now()));
        budget.record_call(now());
        assert!(!budget.can_call(now()));
        let (h, d, _, _) = budget.snapshot();
        assert_eq!((h, d), (10, 20));
    }
}
