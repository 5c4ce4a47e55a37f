use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// A calendar range [from, to], inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { from: day, to: day }
    }

    /// The Monday–Sunday week containing `day`.
    pub fn week_of(day: NaiveDate) -> Self {
        let from = week_start(day);
        Self {
            from,
            to: from + Duration::days(6),
        }
    }

    /// Number of days in the range (0 if inverted).
    pub fn days(&self) -> i64 {
        ((self.to - self.from).num_days() + 1).max(0)
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.from <= day && day <= self.to
    }

    pub fn covers(&self, other: &DateRange) -> bool {
        self.from <= other.from && other.to <= self.to
    }

    /// True when the range is exactly one Monday–Sunday week.
    pub fn is_calendar_week(&self) -> bool {
        *self == DateRange::week_of(self.from)
    }

    /// Iterate every day in the range.
    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> {
        let from = self.from;
        (0..self.days()).map(move |offset| from + Duration::days(offset))
    }

    /// Split into consecutive sub-ranges of at most `chunk_days` days.
    pub fn chunks(&self, chunk_days: u32) -> Vec<DateRange> {
        let step = i64::from(chunk_days.max(1));
        let mut out = Vec::new();
        let mut cursor = self.from;
        while cursor <= self.to {
            let end = (cursor + Duration::days(step - 1)).min(self.to);
            out.push(DateRange::new(cursor, end));
            cursor = end + Duration::days(1);
        }
        out
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// Monday of the week containing `day`.
pub fn week_start(day: NaiveDate) -> NaiveDate {
    day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
}

/// Sunday of the week containing `day`.
pub fn week_end(day: NaiveDate) -> NaiveDate {
    week_start(day) + Duration::days(6)
}

/// Latest date whose upstream data is considered final: yesterday.
pub fn watermark(today: NaiveDate) -> NaiveDate {
    today - Duration::days(1)
}

/// A week is closed once it has fully elapsed: today is not the week's own
/// Sunday and today is on or after the following Monday.
pub fn is_week_closed(week_start_day: NaiveDate, today: NaiveDate) -> bool {
    let monday = week_start(week_start_day);
    let sunday = monday + Duration::days(6);
    today != sunday && today >= monday + Duration::days(7)
}

/// The most recently closed Monday–Sunday week relative to `today`.
pub fn last_closed_week(today: NaiveDate) -> DateRange {
    DateRange::week_of(week_start(today) - Duration::days(7))
}

/// Decompose `range` into calendar-aligned sub-ranges, newest first: whole
/// Monday–Sunday weeks become weekly windows and any partial week at either
/// edge becomes a daily window.
pub fn split_into_weeks(range: DateRange) -> Vec<(DateRange, bool)> {
    let mut windows = Vec::new();
    if range.from > range.to {
        return windows;
    }
    let mut end = range.to;
    while end >= range.from {
        let monday = week_start(end);
        let start = monday.max(range.from);
        let window = DateRange::new(start, end);
        windows.push((window, window.is_calendar_week()));
        end = start - Duration::days(1);
    }
    windows
}

/// Format a date the way the store and the upstream API expect it.
pub fn date_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Parse the leading `YYYY-MM-DD` of a date or datetime string.
pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    let head = raw.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}
