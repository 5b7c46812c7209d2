//! Business Window Gate - Time-of-day and weekday sending window

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc, Weekday,
};
use mailout_common::config::SchedulerConfig;
use mailout_common::{Error, Result};

/// Allowed sending window, evaluated in the business time zone
#[derive(Debug, Clone)]
pub struct BusinessWindowGate {
    start: NaiveTime,
    end: NaiveTime,
    disallowed: Vec<Weekday>,
    offset: FixedOffset,
}

impl BusinessWindowGate {
    pub fn new(start: NaiveTime, end: NaiveTime, disallowed: Vec<Weekday>) -> Result<Self> {
        if start >= end {
            return Err(Error::Config(format!(
                "Business window start {} must be before end {}",
                start, end
            )));
        }
        if disallowed.len() >= 7 {
            return Err(Error::Config("Every weekday is disallowed".to_string()));
        }
        Ok(Self {
            start,
            end,
            disallowed,
            offset: Utc.fix(),
        })
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        let gate = Self::new(
            config.business_start.to_naive()?,
            config.business_end.to_naive()?,
            config.disallowed_weekdays.clone(),
        )?;
        gate.with_utc_offset_minutes(config.utc_offset_minutes)
    }

    /// Interpret wall-clock times at a fixed offset from UTC
    pub fn with_utc_offset_minutes(mut self, minutes: i32) -> Result<Self> {
        self.offset = FixedOffset::east_opt(minutes * 60)
            .ok_or_else(|| Error::Config(format!("Invalid UTC offset: {} minutes", minutes)))?;
        Ok(self)
    }

    fn is_disallowed(&self, day: Weekday) -> bool {
        self.disallowed.contains(&day)
    }

    /// First allowed date on or after `day`
    fn allowed_from(&self, mut day: NaiveDate) -> NaiveDate {
        for _ in 0..7 {
            if !self.is_disallowed(day.weekday()) {
                break;
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        day
    }

    /// Start of the next sending window at or after local time `now`
    pub fn next_open(&self, now: NaiveDateTime) -> NaiveDateTime {
        let day = self.allowed_from(now.date());
        let start = day.and_time(self.start);
        let end = day.and_time(self.end);

        if day == now.date() && now >= start && now <= end {
            return now;
        }
        if now < start {
            return start;
        }
        let following = day.succ_opt().unwrap_or(day);
        self.allowed_from(following).and_time(self.start)
    }

    /// Seconds to wait from local time `now` until sending is allowed; 0 when open
    pub fn seconds_until_open(&self, now: NaiveDateTime) -> f64 {
        let open = self.next_open(now);
        let millis = (open - now).num_milliseconds().max(0);
        millis as f64 / 1000.0
    }

    pub fn is_open(&self, now: NaiveDateTime) -> bool {
        self.next_open(now) == now
    }

    /// Local wall-clock time of an instant
    pub fn local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.with_timezone(&self.offset).naive_local()
    }

    /// Business date of an instant; daily counters roll over on this date
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        self.local(at).date()
    }

    pub fn seconds_until_open_at(&self, at: DateTime<Utc>) -> f64 {
        self.seconds_until_open(self.local(at))
    }

    pub fn is_open_at(&self, at: DateTime<Utc>) -> bool {
        self.is_open(self.local(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn gate() -> BusinessWindowGate {
        BusinessWindowGate::new(
            NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 30, 0).unwrap(),
            vec![Weekday::Sat, Weekday::Sun],
        )
        .unwrap()
    }

    // 2024-03-04 is a Monday.
    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_open_during_business_hours() {
        assert_eq!(gate().seconds_until_open(at(4, 12, 0)), 0.0);
        assert!(gate().is_open(at(4, 8, 30)));
        assert!(gate().is_open(at(4, 17, 30)));
    }

    #[test]
    fn test_before_start_waits_for_start() {
        assert_eq!(gate().seconds_until_open(at(4, 7, 30)), 3600.0);
    }

    #[test]
    fn test_after_end_waits_for_next_allowed_morning() {
        let expected = (at(5, 8, 30) - at(4, 19, 0)).num_seconds() as f64;
        assert_eq!(gate().seconds_until_open(at(4, 19, 0)), expected);

        // Friday evening skips the weekend.
        assert_eq!(gate().next_open(at(8, 19, 0)), at(11, 8, 30));
    }

    #[test]
    fn test_disallowed_day_lands_on_next_allowed_start() {
        let now = at(9, 10, 0);
        let wait = gate().seconds_until_open(now);
        let lands = now + Duration::milliseconds((wait * 1000.0) as i64);
        assert_eq!(lands, at(11, 8, 30));
        assert!(!gate().is_open(now));
    }

    #[test]
    fn test_rejects_inverted_window() {
        let start = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        assert!(BusinessWindowGate::new(start, end, vec![]).is_err());
    }

    #[test]
    fn test_utc_offset_shifts_local_time() {
        let gate = gate().with_utc_offset_minutes(120).unwrap();
        let instant = Utc.with_ymd_and_hms(2024, 3, 4, 6, 45, 0).unwrap();
        assert_eq!(gate.local(instant), at(4, 8, 45));
        assert!(gate.is_open_at(instant));
        assert_eq!(gate.local_date(instant), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
    }
}
