//! Partitioned builds: splitting a build range into aligned sub-ranges.

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::fmt;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, Month, PrimitiveDateTime, Time};

const FORMATS: [&[BorrowedFormatItem<'static>]; 3] = [
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionGranularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl PartitionGranularity {
    /// Length of the formatted timestamp prefix used as table name suffix.
    fn suffix_len(self) -> usize {
        match self {
            Self::Minute => 16,
            Self::Hour => 13,
            Self::Day | Self::Week | Self::Month | Self::Quarter | Self::Year => 10,
        }
    }

    /// Start of the partition containing `at`.
    fn floor(self, at: PrimitiveDateTime) -> Result<PrimitiveDateTime> {
        let date = at.date();
        let time = at.time();
        let floored = match self {
            Self::Minute => at.replace_time(hms(time.hour(), time.minute())?),
            Self::Hour => at.replace_time(hms(time.hour(), 0)?),
            Self::Day => date.midnight(),
            Self::Week => {
                let monday = date
                    .checked_sub(Duration::days(i64::from(date.weekday().number_days_from_monday())))
                    .ok_or_raise(|| out_of_range(at))?;
                monday.midnight()
            },
            Self::Month => first_of_month(date.year(), date.month())?.midnight(),
            Self::Quarter => {
                let month = Month::try_from((u8::from(date.month()) - 1) / 3 * 3 + 1)
                    .or_raise(|| out_of_range(at))?;
                first_of_month(date.year(), month)?.midnight()
            },
            Self::Year => first_of_month(date.year(), Month::January)?.midnight(),
        };
        Ok(floored)
    }

    /// Start of the partition after the one starting at `start`.
    fn next(self, start: PrimitiveDateTime) -> Result<PrimitiveDateTime> {
        let advanced = match self {
            Self::Minute => start.checked_add(Duration::minutes(1)),
            Self::Hour => start.checked_add(Duration::hours(1)),
            Self::Day => start.checked_add(Duration::days(1)),
            Self::Week => start.checked_add(Duration::weeks(1)),
            Self::Month => Some(add_months(start.date(), 1)?.midnight()),
            Self::Quarter => Some(add_months(start.date(), 3)?.midnight()),
            Self::Year => Some(add_months(start.date(), 12)?.midnight()),
        };
        advanced.ok_or_raise(|| out_of_range(start))
    }
}

fn out_of_range(at: PrimitiveDateTime) -> ErrorKind {
    ErrorKind::User(format!("partition range around {} is out of range", format_timestamp(at)))
}

fn hms(hour: u8, minute: u8) -> Result<Time> {
    Time::from_hms(hour, minute, 0).or_raise(|| ErrorKind::User(format!("invalid time {hour}:{minute}")))
}

fn first_of_month(year: i32, month: Month) -> Result<Date> {
    Date::from_calendar_date(year, month, 1).or_raise(|| ErrorKind::User(format!("invalid date {year}-{month}")))
}

fn add_months(date: Date, months: u8) -> Result<Date> {
    let index = i32::from(u8::from(date.month()) - 1) + i32::from(months);
    let month = Month::try_from(u8::try_from(index % 12 + 1).unwrap_or(1))
        .or_raise(|| ErrorKind::User(format!("invalid month offset {months}")))?;
    first_of_month(date.year() + index / 12, month)
}

const TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]");

/// `YYYY-MM-DDTHH:MM:SS.mmm`, the format partition parameters are passed in.
pub fn format_timestamp(at: PrimitiveDateTime) -> String {
    // Formatting into a string only fails on missing components, and a
    // PrimitiveDateTime has all of them.
    at.format(TIMESTAMP).unwrap_or_default()
}

/// Parse a timestamp with or without fraction, or a plain date.
pub fn parse_timestamp(text: &str) -> Result<PrimitiveDateTime> {
    for format in FORMATS {
        if let Ok(at) = PrimitiveDateTime::parse(text, format) {
            return Ok(at);
        }
        if let Ok(date) = Date::parse(text, format) {
            return Ok(date.midnight());
        }
    }
    exn::bail!(ErrorKind::User(format!("invalid timestamp {text:?}")))
}

/// An inclusive range of timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: PrimitiveDateTime,
    pub end: PrimitiveDateTime,
}
impl DateRange {
    pub fn new(start: PrimitiveDateTime, end: PrimitiveDateTime) -> Result<Self> {
        if end < start {
            exn::bail!(ErrorKind::User(format!(
                "date range ends ({}) before it starts ({})",
                format_timestamp(end),
                format_timestamp(start)
            )));
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Self::new(parse_timestamp(start)?, parse_timestamp(end)?)
    }
}
impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", format_timestamp(self.start), format_timestamp(self.end))
    }
}

/// Split `range` into whole partitions of `granularity`.
///
/// The first partition starts at the aligned start of the partition holding
/// `range.start`; the last one is the partition holding `range.end`. Every
/// partition ends one millisecond before the next one starts.
pub fn partition_ranges(range: &DateRange, granularity: PartitionGranularity) -> Result<Vec<DateRange>> {
    let mut ranges = Vec::new();
    let mut start = granularity.floor(range.start)?;
    while start <= range.end {
        let next = granularity.next(start)?;
        ranges.push(DateRange {
            start,
            end: next - Duration::milliseconds(1),
        });
        start = next;
    }
    Ok(ranges)
}

/// `{table}{YYYYMMDD}` (or `YYYYMMDDHH`, `YYYYMMDDHHmm` for hourly and minutely
/// partitions), keyed by the partition start.
pub fn partition_table_name(table_name: &str, granularity: PartitionGranularity, range: &DateRange) -> String {
    let suffix: String = format_timestamp(range.start)
        .chars()
        .take(granularity.suffix_len())
        .filter(char::is_ascii_digit)
        .collect();
    format!("{table_name}{suffix}")
}
