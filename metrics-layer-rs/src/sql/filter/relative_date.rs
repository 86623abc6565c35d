//! Relative date expressions: "today", "3 days ago", "last week", "month to date"
//!
//! Every expression resolves to a closed range of whole seconds. The current
//! instant and the week start are passed in, never read from global state.

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime};
use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map_res, opt, recognize, value},
    sequence::{delimited, terminated, tuple},
    IResult,
};

use crate::core::{Interval, WeekStartDay};

/// Format used for range boundaries in generated SQL
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeDate {
    Today,
    Yesterday,
    /// `N units ago`: that single unit
    Ago { count: u32, unit: Interval },
    /// `this unit`
    This { unit: Interval },
    /// `last unit`, `last N units`: complete units before the current one
    Last { count: u32, unit: Interval },
    /// `unit to date`
    ToDate { unit: Interval },
    /// `N units ago to date`
    AgoToDate { count: u32, unit: Interval },
    /// `N units ago for M units`
    AgoFor {
        count: u32,
        unit: Interval,
        length: u32,
        length_unit: Interval,
    },
    /// `date until date`, inclusive of both days
    Until { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DateRange {
    pub fn start_literal(&self) -> String {
        self.start.format(DATETIME_FORMAT).to_string()
    }

    pub fn end_literal(&self) -> String {
        self.end.format(DATETIME_FORMAT).to_string()
    }
}

fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| s.parse::<u32>())(input)
}

fn unit(input: &str) -> IResult<&str, Interval> {
    alt((
        value(Interval::Day, alt((tag_no_case("days"), tag_no_case("day")))),
        value(Interval::Week, alt((tag_no_case("weeks"), tag_no_case("week")))),
        value(Interval::Month, alt((tag_no_case("months"), tag_no_case("month")))),
        value(Interval::Quarter, alt((tag_no_case("quarters"), tag_no_case("quarter")))),
        value(Interval::Year, alt((tag_no_case("years"), tag_no_case("year")))),
    ))(input)
}

fn date(input: &str) -> IResult<&str, NaiveDate> {
    map_res(
        recognize(tuple((digit1, char('-'), digit1, char('-'), digit1))),
        |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d"),
    )(input)
}

/// `N units ago`, the prefix shared by three forms
fn count_ago(input: &str) -> IResult<&str, (u32, Interval)> {
    let (input, count) = number(input)?;
    let (input, _) = multispace1(input)?;
    let (input, unit) = unit(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("ago")(input)?;
    Ok((input, (count, unit)))
}

fn ago_for(input: &str) -> IResult<&str, RelativeDate> {
    let (input, (count, unit)) = count_ago(input)?;
    let (input, _) = tuple((multispace1, tag_no_case("for"), multispace1))(input)?;
    let (input, length) = number(input)?;
    let (input, _) = multispace1(input)?;
    let (input, length_unit) = self::unit(input)?;
    Ok((
        input,
        RelativeDate::AgoFor {
            count,
            unit,
            length,
            length_unit,
        },
    ))
}

/// `N units ago to date`; without a count it means one unit
fn ago_to_date(input: &str) -> IResult<&str, RelativeDate> {
    let (input, count) = opt(terminated(number, multispace1))(input)?;
    let (input, unit) = unit(input)?;
    let (input, _) = tuple((multispace1, tag_no_case("ago")))(input)?;
    let count = count.unwrap_or(1);
    let (input, _) = tuple((multispace1, tag_no_case("to"), multispace1, tag_no_case("date")))(input)?;
    Ok((input, RelativeDate::AgoToDate { count, unit }))
}

fn ago(input: &str) -> IResult<&str, RelativeDate> {
    let (input, (count, unit)) = count_ago(input)?;
    Ok((input, RelativeDate::Ago { count, unit }))
}

fn this(input: &str) -> IResult<&str, RelativeDate> {
    let (input, _) = tuple((tag_no_case("this"), multispace1))(input)?;
    let (input, unit) = unit(input)?;
    Ok((input, RelativeDate::This { unit }))
}

fn last(input: &str) -> IResult<&str, RelativeDate> {
    let (input, _) = tuple((tag_no_case("last"), multispace1))(input)?;
    let (input, count) = opt(terminated(number, multispace1))(input)?;
    let (input, unit) = unit(input)?;
    Ok((
        input,
        RelativeDate::Last {
            count: count.unwrap_or(1),
            unit,
        },
    ))
}

fn to_date(input: &str) -> IResult<&str, RelativeDate> {
    let (input, unit) = unit(input)?;
    let (input, _) = tuple((multispace1, tag_no_case("to"), multispace1, tag_no_case("date")))(input)?;
    Ok((input, RelativeDate::ToDate { unit }))
}

fn until(input: &str) -> IResult<&str, RelativeDate> {
    let (input, start) = date(input)?;
    let (input, _) = tuple((multispace1, tag_no_case("until"), multispace1))(input)?;
    let (input, end) = date(input)?;
    Ok((input, RelativeDate::Until { start, end }))
}

fn relative_date(input: &str) -> IResult<&str, RelativeDate> {
    alt((
        value(RelativeDate::Today, tag_no_case("today")),
        value(RelativeDate::Yesterday, tag_no_case("yesterday")),
        ago_for,
        ago_to_date,
        ago,
        this,
        last,
        to_date,
        until,
    ))(input)
}

/// Parses a whole string as a relative date expression
pub fn parse_relative_date(input: &str) -> Option<RelativeDate> {
    all_consuming(delimited(multispace0, relative_date, multispace0))(input)
        .ok()
        .map(|(_, parsed)| parsed)
}

/// Parses `YYYY-MM-DD` with an optional time part
pub fn parse_datetime(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// Resolves relative dates against a fixed current instant
#[derive(Debug, Clone, Copy)]
pub struct DateRangeCalculator {
    now: NaiveDateTime,
    week_start_day: WeekStartDay,
}

impl DateRangeCalculator {
    pub fn new(now: NaiveDateTime, week_start_day: WeekStartDay) -> Self {
        Self { now, week_start_day }
    }

    /// Closed range for the expression, `None` only on calendar overflow
    pub fn range(&self, date: &RelativeDate) -> Option<DateRange> {
        let today = self.now.date();
        let (start, end) = match *date {
            RelativeDate::Today => (day_start(today), day_end(today)?),
            RelativeDate::Yesterday => {
                let day = shift(today, Interval::Day, -1)?;
                (day_start(day), day_end(day)?)
            }
            RelativeDate::Ago { count, unit } => {
                let start = shift(self.start_of(today, unit)?, unit, -(count as i32))?;
                (day_start(start), unit_end(start, unit, 1)?)
            }
            RelativeDate::This { unit } => {
                let start = self.start_of(today, unit)?;
                (day_start(start), unit_end(start, unit, 1)?)
            }
            RelativeDate::Last { count, unit } => {
                let current = self.start_of(today, unit)?;
                let start = shift(current, unit, -(count as i32))?;
                (day_start(start), day_start(current) - Duration::seconds(1))
            }
            RelativeDate::ToDate { unit } => (day_start(self.start_of(today, unit)?), day_end(today)?),
            RelativeDate::AgoToDate { count, unit } => {
                let day = shift(today, unit, -(count as i32))?;
                (day_start(self.start_of(day, unit)?), day_end(day)?)
            }
            RelativeDate::AgoFor {
                count,
                unit,
                length,
                length_unit,
            } => {
                let start = shift(self.start_of(today, unit)?, unit, -(count as i32))?;
                (day_start(start), unit_end(start, length_unit, length as i32)?)
            }
            RelativeDate::Until { start, end } => (day_start(start), day_end(end)?),
        };
        Some(DateRange { start, end })
    }

    fn start_of(&self, day: NaiveDate, unit: Interval) -> Option<NaiveDate> {
        match unit {
            Interval::Week => {
                let offset = (day.weekday().num_days_from_monday() + 7
                    - self.week_start_day.weekday().num_days_from_monday())
                    % 7;
                day.checked_sub_signed(Duration::days(offset as i64))
            }
            Interval::Month => NaiveDate::from_ymd_opt(day.year(), day.month(), 1),
            Interval::Quarter => NaiveDate::from_ymd_opt(day.year(), (day.month() - 1) / 3 * 3 + 1, 1),
            Interval::Year => NaiveDate::from_ymd_opt(day.year(), 1, 1),
            _ => Some(day),
        }
    }
}

fn day_start(day: NaiveDate) -> NaiveDateTime {
    day.and_time(NaiveTime::MIN)
}

fn day_end(day: NaiveDate) -> Option<NaiveDateTime> {
    day.and_hms_opt(23, 59, 59)
}

/// Last second of the `count` units starting at `start`
fn unit_end(start: NaiveDate, unit: Interval, count: i32) -> Option<NaiveDateTime> {
    Some(day_start(shift(start, unit, count)?) - Duration::seconds(1))
}

fn shift(day: NaiveDate, unit: Interval, count: i32) -> Option<NaiveDate> {
    let months = match unit {
        Interval::Week => return day.checked_add_signed(Duration::days(7 * count as i64)),
        Interval::Month => count,
        Interval::Quarter => 3 * count,
        Interval::Year => 12 * count,
        _ => return day.checked_add_signed(Duration::days(count as i64)),
    };
    if months >= 0 {
        day.checked_add_months(Months::new(months as u32))
    } else {
        day.checked_sub_months(Months::new(months.unsigned_abs()))
    }
}
