//! US/Eastern market session and capture schedule

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const MARKET_TZ: Tz = chrono_tz::America::New_York;

/// Source of "now"; injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    now: std::sync::RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::RwLock::new(now),
        }
    }

    /// Clock set to a US/Eastern wall time; None if that time does not exist
    pub fn eastern(date: NaiveDate, hour: u32, minute: u32) -> Option<Self> {
        let local = date.and_hms_opt(hour, minute, 0)?;
        let at = MARKET_TZ.from_local_datetime(&local).single()?;
        Some(Self::new(at.with_timezone(&Utc)))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Session boundaries, all US/Eastern wall-clock times
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub regular_open: NaiveTime,
    pub regular_close: NaiveTime,
    /// Last capture mark (inclusive window end)
    pub capture_end: NaiveTime,
    /// Minute at which every open position is closed
    pub daily_close: NaiveTime,
    pub capture_period_minutes: u32,
    pub exit_check_interval: Duration,
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            regular_open: hm(9, 30),
            regular_close: hm(16, 0),
            capture_end: hm(16, 1),
            daily_close: hm(15, 59),
            capture_period_minutes: 5,
            exit_check_interval: Duration::from_secs(10),
        }
    }
}

/// Market-session queries over a `SessionConfig`
#[derive(Debug, Clone, Default)]
pub struct MarketSession {
    config: SessionConfig,
}

impl MarketSession {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn eastern(t: DateTime<Utc>) -> DateTime<Tz> {
        t.with_timezone(&MARKET_TZ)
    }

    fn local_time(t: DateTime<Utc>) -> NaiveTime {
        Self::eastern(t).time()
    }

    /// Trading day (US/Eastern calendar date) of `t`
    pub fn trading_day(t: DateTime<Utc>) -> NaiveDate {
        Self::eastern(t).date_naive()
    }

    /// open <= t < close
    pub fn is_regular_hours(&self, t: DateTime<Utc>) -> bool {
        let local = Self::local_time(t);
        local >= self.config.regular_open && local < self.config.regular_close
    }

    /// open <= t <= capture_end
    pub fn in_capture_window(&self, t: DateTime<Utc>) -> bool {
        let local = Self::local_time(t);
        local >= self.config.regular_open && local <= self.config.capture_end
    }

    /// True during the daily close-out minute
    pub fn is_daily_close(&self, t: DateTime<Utc>) -> bool {
        let local = Self::local_time(t);
        local.hour() == self.config.daily_close.hour() && local.minute() == self.config.daily_close.minute()
    }

    /// Next capture-period boundary at or after `t` (seconds truncated)
    pub fn next_capture_mark(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.config.capture_period_minutes.max(1) as i64;
        let local = Self::eastern(t);
        let exact = local.second() == 0 && local.nanosecond() == 0;
        let minute_of_day = (local.hour() * 60 + local.minute()) as i64;
        let rem = minute_of_day % period;
        let bump = if rem == 0 && exact { 0 } else { period - rem };
        let floored = t
            - ChronoDuration::seconds(local.second() as i64)
            - ChronoDuration::nanoseconds(local.nanosecond() as i64);
        floored + ChronoDuration::minutes(bump)
    }

    /// Next capture mark that falls inside the capture window
    pub fn next_capture_in_window(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let mut mark = self.next_capture_mark(t);
        // at most one day of marks
        for _ in 0..(24 * 60 / self.config.capture_period_minutes.max(1) + 1) {
            if self.in_capture_window(mark) {
                return mark;
            }
            mark += ChronoDuration::minutes(self.config.capture_period_minutes.max(1) as i64);
        }
        mark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn et(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        let date = NaiveDate::from_ymd_opt(2025, 3, 12).unwrap();
        MARKET_TZ
            .from_local_datetime(&date.and_hms_opt(h, m, s).unwrap())
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_regular_hours() {
        let s = MarketSession::default();
        assert!(!s.is_regular_hours(et(9, 29, 59)));
        assert!(s.is_regular_hours(et(9, 30, 0)));
        assert!(s.is_regular_hours(et(15, 59, 59)));
        assert!(!s.is_regular_hours(et(16, 0, 0)));
    }

    #[test]
    fn test_capture_window_and_close() {
        let s = MarketSession::default();
        assert!(s.in_capture_window(et(16, 1, 0)));
        assert!(!s.in_capture_window(et(16, 2, 0)));
        assert!(!s.in_capture_window(et(9, 25, 0)));
        assert!(s.is_daily_close(et(15, 59, 30)));
        assert!(!s.is_daily_close(et(15, 58, 59)));
    }

    #[test]
    fn test_next_capture_mark() {
        let s = MarketSession::default();
        assert_eq!(s.next_capture_mark(et(10, 2, 13)), et(10, 5, 0));
        assert_eq!(s.next_capture_mark(et(10, 5, 0)), et(10, 5, 0));
        assert_eq!(s.next_capture_mark(et(10, 5, 1)), et(10, 10, 0));
        assert_eq!(s.next_capture_mark(et(10, 57, 0)), et(11, 0, 0));
    }

    #[test]
    fn test_next_capture_in_window_skips_overnight() {
        let s = MarketSession::default();
        assert_eq!(s.next_capture_in_window(et(7, 12, 0)), et(9, 30, 0));
        assert_eq!(s.next_capture_in_window(et(12, 0, 0)), et(12, 0, 0));
    }

    #[test]
    fn test_fixed_clock() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 12).unwrap();
        let clock = FixedClock::eastern(date, 10, 0).unwrap();
        assert_eq!(clock.now(), et(10, 0, 0));
        clock.advance(ChronoDuration::minutes(15));
        assert_eq!(clock.now(), et(10, 15, 0));
        assert_eq!(MarketSession::trading_day(clock.now()), date);
    }
}
