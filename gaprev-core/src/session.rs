//! Trading-session calendar
//!
//! A pure function of wall-clock time and configuration: UTC now is mapped
//! into the configured reference timezone and tested against the weekly
//! open/close boundaries. Permitted exactly at the open instant, not
//! permitted exactly at the close instant.

use crate::config::{ConfigError, SessionConfig};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;

pub struct SessionScheduler {
    enabled: bool,
    tz: Tz,
    open_minute_of_week: u32,
    close_minute_of_week: u32,
}

fn minute_of_week(weekday: Weekday, hour: u32, minute: u32) -> u32 {
    weekday.num_days_from_monday() * 24 * 60 + hour * 60 + minute
}

impl SessionScheduler {
    pub fn new(config: &SessionConfig) -> Result<Self, ConfigError> {
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone: {}", config.timezone)))?;
        Ok(Self {
            enabled: config.enabled,
            tz,
            open_minute_of_week: minute_of_week(
                config.open_weekday()?,
                config.open_hour,
                config.open_minute,
            ),
            close_minute_of_week: minute_of_week(
                config.close_weekday()?,
                config.close_hour,
                config.close_minute,
            ),
        })
    }

    /// Whether new entries are permitted at this instant.
    pub fn is_trading_permitted(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }
        let local = now.with_timezone(&self.tz);
        let t = minute_of_week(local.weekday(), local.hour(), local.minute());
        let (open, close) = (self.open_minute_of_week, self.close_minute_of_week);
        if open <= close {
            t >= open && t < close
        } else {
            // Window wraps the week boundary (e.g. Sunday open, Friday close).
            t >= open || t < close
        }
    }

    /// Calendar date in the reference timezone, if it is a trading day.
    /// Saturday never counts, so the daily reset cannot fire over the
    /// weekend gap.
    pub fn trading_day(&self, now: DateTime<Utc>) -> Option<NaiveDate> {
        let local = now.with_timezone(&self.tz);
        if local.weekday() == Weekday::Sat {
            None
        } else {
            Some(local.date_naive())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scheduler() -> SessionScheduler {
        // Defaults: Africa/Lagos (UTC+1, no DST), Sunday 22:15 open,
        // Friday 21:45 close.
        SessionScheduler::new(&SessionConfig::default()).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn open_boundary_is_inclusive() {
        let s = scheduler();
        // Sunday 2024-06-02 22:15 Lagos == 21:15 UTC.
        assert!(!s.is_trading_permitted(utc(2024, 6, 2, 21, 14)));
        assert!(s.is_trading_permitted(utc(2024, 6, 2, 21, 15)));
        assert!(s.is_trading_permitted(utc(2024, 6, 2, 23, 0)));
    }

    #[test]
    fn close_boundary_is_exclusive() {
        let s = scheduler();
        // Friday 2024-06-07 21:45 Lagos == 20:45 UTC.
        assert!(s.is_trading_permitted(utc(2024, 6, 7, 20, 44)));
        assert!(!s.is_trading_permitted(utc(2024, 6, 7, 20, 45)));
        assert!(!s.is_trading_permitted(utc(2024, 6, 7, 22, 0)));
    }

    #[test]
    fn saturday_is_closed_midweek_is_open() {
        let s = scheduler();
        assert!(!s.is_trading_permitted(utc(2024, 6, 8, 12, 0))); // Saturday
        assert!(s.is_trading_permitted(utc(2024, 6, 5, 12, 0))); // Wednesday
        assert!(s.is_trading_permitted(utc(2024, 6, 3, 0, 0))); // Monday 01:00 Lagos
    }

    #[test]
    fn disabled_schedule_always_permits() {
        let config = SessionConfig {
            enabled: false,
            ..SessionConfig::default()
        };
        let s = SessionScheduler::new(&config).unwrap();
        assert!(s.is_trading_permitted(utc(2024, 6, 8, 12, 0))); // Saturday
    }

    #[test]
    fn trading_day_follows_reference_timezone() {
        let s = scheduler();
        // 23:30 UTC on Monday is already Tuesday in Lagos.
        assert_eq!(
            s.trading_day(utc(2024, 6, 3, 23, 30)),
            NaiveDate::from_ymd_opt(2024, 6, 4)
        );
        // Saturday never counts as a trading day.
        assert_eq!(s.trading_day(utc(2024, 6, 8, 12, 0)), None);
    }

    #[test]
    fn non_wrapping_window() {
        let config = SessionConfig {
            open_weekday: "monday".into(),
            open_hour: 9,
            open_minute: 0,
            close_weekday: "friday".into(),
            close_hour: 17,
            close_minute: 0,
            ..SessionConfig::default()
        };
        let s = SessionScheduler::new(&config).unwrap();
        assert!(!s.is_trading_permitted(utc(2024, 6, 3, 7, 0))); // Mon 08:00 Lagos
        assert!(s.is_trading_permitted(utc(2024, 6, 3, 8, 0))); // Mon 09:00 Lagos
        assert!(!s.is_trading_permitted(utc(2024, 6, 7, 16, 30))); // Fri 17:30 Lagos
    }
}
