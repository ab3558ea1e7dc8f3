//! Weekly access windows for peers.
//!
//! A window opens at `start_hour` on each listed day and closes at
//! `end_hour`. When `end_hour` is not after `start_hour` the window runs past
//! midnight into the next day; `start_hour == end_hour` covers the whole day.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("unknown weekday: {0}")]
    InvalidDay(String),

    #[error("hour {0} out of range (0-23)")]
    InvalidHour(u8),

    #[error("schedule lists no days")]
    NoDays,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    days: Vec<Weekday>,
    pub start_hour: u8,
    pub end_hour: u8,
}

fn parse_day(s: &str) -> Result<Weekday, ScheduleError> {
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| ScheduleError::InvalidDay(s.trim().to_string()))
}

fn day_str(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl Schedule {
    pub fn new(days: &[Weekday], start_hour: u8, end_hour: u8) -> Result<Self, ScheduleError> {
        for hour in [start_hour, end_hour] {
            if hour > 23 {
                return Err(ScheduleError::InvalidHour(hour));
            }
        }
        let mut days = days.to_vec();
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        if days.is_empty() {
            return Err(ScheduleError::NoDays);
        }
        Ok(Self {
            days,
            start_hour,
            end_hour,
        })
    }

    /// Build from the stored comma-separated day list (`mon,wed,fri`).
    pub fn from_parts(days: &str, start_hour: u8, end_hour: u8) -> Result<Self, ScheduleError> {
        let days = days
            .split(',')
            .filter(|d| !d.trim().is_empty())
            .map(parse_day)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(&days, start_hour, end_hour)
    }

    pub fn days(&self) -> &[Weekday] {
        &self.days
    }

    pub fn days_string(&self) -> String {
        self.days
            .iter()
            .map(|d| day_str(*d))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn lists(&self, day: Weekday) -> bool {
        self.days.contains(&day)
    }

    /// Whether the peer may be connected at the given local time.
    pub fn allows(&self, at: NaiveDateTime) -> bool {
        let day = at.weekday();
        let hour = at.hour() as u8;
        let (start, end) = (self.start_hour, self.end_hour);

        if start == end {
            return self.lists(day);
        }
        if start < end {
            return self.lists(day) && (start..end).contains(&hour);
        }
        // Wraps midnight: the early hours belong to the previous day's window.
        (hour >= start && self.lists(day)) || (hour < end && self.lists(day.pred()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use test_case::test_case;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        // 2025-06-02 is a Monday.
        NaiveDate::from_ymd_opt(2025, 6, 1 + day)
            .unwrap()
            .and_hms_opt(hour, 30, 0)
            .unwrap()
    }

    #[test_case(1, 8, true ; "monday at start")]
    #[test_case(1, 17, true ; "monday before end")]
    #[test_case(1, 18, false ; "monday at end")]
    #[test_case(1, 7, false ; "monday before start")]
    #[test_case(6, 12, false ; "saturday not listed")]
    fn daytime_window(day: u32, hour: u32, expected: bool) {
        let schedule = Schedule::from_parts("mon,tue,wed,thu,fri", 8, 18).unwrap();
        assert_eq!(schedule.allows(at(day, hour)), expected);
    }

    #[test_case(5, 23, true ; "friday night")]
    #[test_case(6, 2, true ; "early saturday belongs to friday")]
    #[test_case(6, 6, false ; "saturday after end")]
    #[test_case(5, 2, false ; "early friday belongs to thursday")]
    fn overnight_window(day: u32, hour: u32, expected: bool) {
        let schedule = Schedule::from_parts("fri", 22, 6).unwrap();
        assert_eq!(schedule.allows(at(day, hour)), expected);
    }

    #[test]
    fn equal_hours_cover_the_whole_day() {
        let schedule = Schedule::from_parts("sun", 0, 0).unwrap();
        assert!(schedule.allows(at(7, 3)));
        assert!(!schedule.allows(at(1, 3)));
    }

    #[test]
    fn days_normalize() {
        let schedule = Schedule::from_parts("fri, mon,fri", 1, 2).unwrap();
        assert_eq!(schedule.days_string(), "mon,fri");
    }

    #[test_case("", 1, 2, ScheduleError::NoDays ; "no days")]
    #[test_case("funday", 1, 2, ScheduleError::InvalidDay("funday".into()) ; "bad day")]
    #[test_case("mon", 24, 2, ScheduleError::InvalidHour(24) ; "bad hour")]
    fn rejects(days: &str, start: u8, end: u8, expected: ScheduleError) {
        assert_eq!(Schedule::from_parts(days, start, end).unwrap_err(), expected);
    }
}
