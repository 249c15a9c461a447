// =============================================================================
// Clock & Market Calendar — US equity session awareness
// =============================================================================
//
// Single source of truth for "now" and for session semantics. The regular
// session is 09:30–16:00 America/New_York; pre-market runs 04:00–09:30 ET and
// after-hours 16:00–20:00 ET. Weekends and the static holiday table are
// non-trading. Every function here is a pure function of its inputs.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};

/// Trading session classification for an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Session {
    PreMarket,
    Regular,
    AfterHours,
    Closed,
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreMarket => write!(f, "pre_market"),
            Self::Regular => write!(f, "regular"),
            Self::AfterHours => write!(f, "after_hours"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Observed US market holidays, 2024–2026.
const HOLIDAYS: &[(i32, u32, u32)] = &[
    // 2024
    (2024, 1, 1),
    (2024, 1, 15),
    (2024, 2, 19),
    (2024, 3, 29),
    (2024, 5, 27),
    (2024, 6, 19),
    (2024, 7, 4),
    (2024, 9, 2),
    (2024, 11, 28),
    (2024, 12, 25),
    // 2025
    (2025, 1, 1),
    (2025, 1, 20),
    (2025, 2, 17),
    (2025, 4, 18),
    (2025, 5, 26),
    (2025, 6, 19),
    (2025, 7, 4),
    (2025, 9, 1),
    (2025, 11, 27),
    (2025, 12, 25),
    // 2026 (July 4 falls on a Saturday; observed July 3)
    (2026, 1, 1),
    (2026, 1, 19),
    (2026, 2, 16),
    (2026, 4, 3),
    (2026, 5, 25),
    (2026, 6, 19),
    (2026, 7, 3),
    (2026, 9, 7),
    (2026, 11, 26),
    (2026, 12, 25),
];

fn regular_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).expect("valid constant time")
}

fn regular_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).expect("valid constant time")
}

fn pre_market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(4, 0, 0).expect("valid constant time")
}

fn after_hours_close() -> NaiveTime {
    NaiveTime::from_hms_opt(20, 0, 0).expect("valid constant time")
}

/// Current UTC instant with millisecond resolution.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// True when `date` (interpreted in New York) is a weekday and not a holiday.
pub fn is_trading_day(date: NaiveDate) -> bool {
    let weekday = date.weekday().num_days_from_monday();
    if weekday >= 5 {
        return false;
    }
    !HOLIDAYS
        .iter()
        .any(|&(y, m, d)| date.year() == y && date.month() == m && date.day() == d)
}

/// Convert an ET wall-clock `(date, time)` into a UTC instant.
///
/// Returns `None` only for wall-clock times skipped by a DST transition; the
/// session boundaries used here (04:00, 09:30, 16:00, 20:00) are never inside
/// the skipped hour.
fn et_instant(date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    New_York
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Session classification of a UTC instant.
pub fn session_of(instant: DateTime<Utc>) -> Session {
    let et = instant.with_timezone(&New_York);
    if !is_trading_day(et.date_naive()) {
        return Session::Closed;
    }
    let t = et.time();
    if t >= pre_market_open() && t < regular_open() {
        Session::PreMarket
    } else if t >= regular_open() && t < regular_close() {
        Session::Regular
    } else if t >= regular_close() && t < after_hours_close() {
        Session::AfterHours
    } else {
        Session::Closed
    }
}

/// Earliest regular-session open strictly after `instant`.
pub fn next_regular_open(instant: DateTime<Utc>) -> DateTime<Utc> {
    let start = instant.with_timezone(&New_York).date_naive();
    for offset in 0..400 {
        let date = start + Duration::days(offset);
        if !is_trading_day(date) {
            continue;
        }
        if let Some(open) = et_instant(date, regular_open()) {
            if open > instant {
                return open;
            }
        }
    }
    // Unreachable with a populated holiday table; fall back one week out.
    instant + Duration::days(7)
}

/// Earliest regular-session close strictly after `instant`.
pub fn next_regular_close(instant: DateTime<Utc>) -> DateTime<Utc> {
    let start = instant.with_timezone(&New_York).date_naive();
    for offset in 0..400 {
        let date = start + Duration::days(offset);
        if !is_trading_day(date) {
            continue;
        }
        if let Some(close) = et_instant(date, regular_close()) {
            if close > instant {
                return close;
            }
        }
    }
    instant + Duration::days(7)
}

/// Latest regular-session close at or before `instant`.
pub fn last_regular_close(instant: DateTime<Utc>) -> DateTime<Utc> {
    let start = instant.with_timezone(&New_York).date_naive();
    for offset in 0..400 {
        let date = start - Duration::days(offset);
        if !is_trading_day(date) {
            continue;
        }
        if let Some(close) = et_instant(date, regular_close()) {
            if close <= instant {
                return close;
            }
        }
    }
    instant - Duration::days(7)
}

/// Number of trading days `d` with `a < d <= b`. Zero when `b <= a`.
pub fn business_days_between(a: NaiveDate, b: NaiveDate) -> u32 {
    if b <= a {
        return 0;
    }
    let mut count = 0;
    let mut d = a + Duration::days(1);
    while d <= b {
        if is_trading_day(d) {
            count += 1;
        }
        d += Duration::days(1);
    }
    count
}

/// Parse "HH:MM" collection times; invalid entries are dropped.
pub fn parse_collection_times(times: &[String]) -> Vec<NaiveTime> {
    let mut parsed: Vec<NaiveTime> = times
        .iter()
        .filter_map(|s| NaiveTime::parse_from_str(s.trim(), "%H:%M").ok())
        .collect();
    parsed.sort();
    parsed.dedup();
    parsed
}

/// Earliest future instant strictly after `after` that matches any of the ET
/// wall-clock `times` on a trading day. Returns `None` when `times` is empty.
pub fn next_collection_at(after: DateTime<Utc>, times: &[NaiveTime]) -> Option<DateTime<Utc>> {
    if times.is_empty() {
        return None;
    }
    let start = after.with_timezone(&New_York).date_naive();
    for offset in 0..400 {
        let date = start + Duration::days(offset);
        if !is_trading_day(date) {
            continue;
        }
        for &t in times {
            if let Some(instant) = et_instant(date, t) {
                if instant > after {
                    return Some(instant);
                }
            }
        }
    }
    None
}
