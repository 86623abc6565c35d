//! Date SQL: time-grain truncation, durations and timezone conversion

use tracing::warn;

use super::dialect::Dialect;
use crate::core::{Datatype, Interval, TimeFrame, WeekStartDay};

/// Dialects sharing one set of date functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateFamily {
    Snowflake,
    Postgres,
    Databricks,
    Druid,
    SqlServer,
    BigQuery,
    Trino,
    MySql,
}

impl From<Dialect> for DateFamily {
    fn from(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Snowflake | Dialect::Redshift => DateFamily::Snowflake,
            Dialect::Postgres | Dialect::DuckDb => DateFamily::Postgres,
            Dialect::Databricks => DateFamily::Databricks,
            Dialect::Druid => DateFamily::Druid,
            Dialect::SqlServer | Dialect::AzureSynapse => DateFamily::SqlServer,
            Dialect::BigQuery => DateFamily::BigQuery,
            Dialect::Trino => DateFamily::Trino,
            Dialect::MySql => DateFamily::MySql,
        }
    }
}

const DRUID_MONTH_NAMES: &str = "WHEN 1 THEN 'Jan' WHEN 2 THEN 'Feb' WHEN 3 THEN 'Mar' WHEN 4 THEN 'Apr' \
WHEN 5 THEN 'May' WHEN 6 THEN 'Jun' WHEN 7 THEN 'Jul' WHEN 8 THEN 'Aug' WHEN 9 THEN 'Sep' \
WHEN 10 THEN 'Oct' WHEN 11 THEN 'Nov' WHEN 12 THEN 'Dec' ELSE 'Invalid Month' END";

const DRUID_DAY_NAMES: &str = "WHEN 1 THEN 'Mon' WHEN 2 THEN 'Tue' WHEN 3 THEN 'Wed' WHEN 4 THEN 'Thu' \
WHEN 5 THEN 'Fri' WHEN 6 THEN 'Sat' WHEN 7 THEN 'Sun' ELSE 'Invalid Day' END";

/// Renders `sql` at the given time grain
pub fn time_grain_sql(
    sql: &str,
    timeframe: TimeFrame,
    dialect: Dialect,
    datatype: Datatype,
    week_start_day: WeekStartDay,
) -> String {
    let family = DateFamily::from(dialect);
    let timeframe = timeframe.canonical();
    let s = sql;

    match timeframe {
        TimeFrame::Raw => return s.to_string(),
        TimeFrame::Week => return week_sql(s, family, datatype, week_start_day),
        _ => {}
    }

    match family {
        DateFamily::Snowflake => match timeframe {
            TimeFrame::Time => format!("CAST({s} AS TIMESTAMP)"),
            TimeFrame::Second => format!("DATE_TRUNC('SECOND', {s})"),
            TimeFrame::Minute => format!("DATE_TRUNC('MINUTE', {s})"),
            TimeFrame::Hour => format!("DATE_TRUNC('HOUR', {s})"),
            TimeFrame::Date => format!("DATE_TRUNC('DAY', {s})"),
            TimeFrame::Month => format!("DATE_TRUNC('MONTH', {s})"),
            TimeFrame::Quarter => format!("DATE_TRUNC('QUARTER', {s})"),
            TimeFrame::Year => format!("DATE_TRUNC('YEAR', {s})"),
            TimeFrame::WeekIndex => format!("EXTRACT(WEEK FROM {s})"),
            TimeFrame::WeekOfMonth => {
                format!("EXTRACT(WEEK FROM {s}) - EXTRACT(WEEK FROM DATE_TRUNC('MONTH', {s})) + 1")
            }
            TimeFrame::MonthOfYearIndex => format!("EXTRACT(MONTH FROM {s})"),
            TimeFrame::MonthOfYear => format!("TO_CHAR(CAST({s} AS TIMESTAMP), 'Mon')"),
            TimeFrame::QuarterOfYear => format!("EXTRACT(QUARTER FROM {s})"),
            TimeFrame::HourOfDay => format!("HOUR(CAST({s} AS TIMESTAMP))"),
            TimeFrame::DayOfWeek => format!("TO_CHAR(CAST({s} AS TIMESTAMP), 'Dy')"),
            TimeFrame::DayOfMonth => format!("EXTRACT(DAY FROM {s})"),
            TimeFrame::DayOfYear => format!("EXTRACT(DOY FROM {s})"),
            _ => s.to_string(),
        },
        DateFamily::Postgres | DateFamily::Databricks | DateFamily::Druid | DateFamily::Trino => {
            let ts = format!("CAST({s} AS TIMESTAMP)");
            match timeframe {
                TimeFrame::Time => ts,
                TimeFrame::Second => format!("DATE_TRUNC('SECOND', {ts})"),
                TimeFrame::Minute => format!("DATE_TRUNC('MINUTE', {ts})"),
                TimeFrame::Hour => format!("DATE_TRUNC('HOUR', {ts})"),
                TimeFrame::Date => format!("DATE_TRUNC('DAY', {ts})"),
                TimeFrame::Month => format!("DATE_TRUNC('MONTH', {ts})"),
                TimeFrame::Quarter => format!("DATE_TRUNC('QUARTER', {ts})"),
                TimeFrame::Year => format!("DATE_TRUNC('YEAR', {ts})"),
                TimeFrame::WeekIndex => format!("EXTRACT(WEEK FROM {ts})"),
                TimeFrame::WeekOfMonth => {
                    format!("EXTRACT(WEEK FROM {ts}) - EXTRACT(WEEK FROM DATE_TRUNC('MONTH', {ts})) + 1")
                }
                TimeFrame::MonthOfYearIndex => format!("EXTRACT(MONTH FROM {ts})"),
                TimeFrame::MonthOfYear => match family {
                    DateFamily::Postgres => format!("TO_CHAR({ts}, 'Mon')"),
                    DateFamily::Databricks => format!("DATE_FORMAT({ts}, 'MMM')"),
                    DateFamily::Trino => format!("DATE_FORMAT({ts}, '%b')"),
                    _ => format!("CASE EXTRACT(MONTH FROM {ts}) {DRUID_MONTH_NAMES}"),
                },
                TimeFrame::QuarterOfYear => format!("EXTRACT(QUARTER FROM {ts})"),
                TimeFrame::HourOfDay => match family {
                    DateFamily::Postgres => format!("EXTRACT('HOUR' FROM {ts})"),
                    _ => format!("EXTRACT(HOUR FROM {ts})"),
                },
                TimeFrame::DayOfWeek => match family {
                    DateFamily::Postgres => format!("TO_CHAR({ts}, 'Dy')"),
                    DateFamily::Databricks => format!("DATE_FORMAT({ts}, 'E')"),
                    DateFamily::Trino => format!("DATE_FORMAT({ts}, '%a')"),
                    _ => format!("CASE EXTRACT(DOW FROM {ts}) {DRUID_DAY_NAMES}"),
                },
                TimeFrame::DayOfMonth => match family {
                    DateFamily::Postgres => format!("EXTRACT('DAY' FROM {ts})"),
                    _ => format!("EXTRACT(DAY FROM {ts})"),
                },
                TimeFrame::DayOfYear => match family {
                    DateFamily::Postgres => format!("EXTRACT('DOY' FROM {ts})"),
                    _ => format!("EXTRACT(DOY FROM {ts})"),
                },
                _ => s.to_string(),
            }
        }
        DateFamily::SqlServer => {
            let date = format!("CAST({s} AS DATE)");
            let datetime = format!("CAST({s} AS DATETIME)");
            match timeframe {
                TimeFrame::Time => datetime,
                TimeFrame::Second => format!("DATEADD(SECOND, DATEDIFF(SECOND, 0, {datetime}), 0)"),
                TimeFrame::Minute => format!("DATEADD(MINUTE, DATEDIFF(MINUTE, 0, {datetime}), 0)"),
                TimeFrame::Hour => format!("DATEADD(HOUR, DATEDIFF(HOUR, 0, {datetime}), 0)"),
                TimeFrame::Date => format!("CAST({date} AS DATETIME)"),
                TimeFrame::Month => format!("DATEADD(MONTH, DATEDIFF(MONTH, 0, {date}), 0)"),
                TimeFrame::Quarter => format!("DATEADD(QUARTER, DATEDIFF(QUARTER, 0, {date}), 0)"),
                TimeFrame::Year => format!("DATEADD(YEAR, DATEDIFF(YEAR, 0, {date}), 0)"),
                TimeFrame::WeekIndex => format!("EXTRACT(WEEK FROM {date})"),
                TimeFrame::WeekOfMonth => format!(
                    "EXTRACT(WEEK FROM {date}) - EXTRACT(WEEK FROM DATEADD(MONTH, DATEDIFF(MONTH, 0, {date}), 0)) + 1"
                ),
                TimeFrame::MonthOfYearIndex => format!("EXTRACT(MONTH FROM {date})"),
                TimeFrame::MonthOfYear => format!("LEFT(DATENAME(MONTH, {date}), 3)"),
                TimeFrame::QuarterOfYear => format!("DATEPART(QUARTER, {date})"),
                TimeFrame::HourOfDay => format!("DATEPART(HOUR, {datetime})"),
                TimeFrame::DayOfWeek => format!("LEFT(DATENAME(WEEKDAY, {date}), 3)"),
                TimeFrame::DayOfMonth => format!("DATEPART(DAY, {date})"),
                TimeFrame::DayOfYear => format!("DATEPART(Y, {date})"),
                _ => s.to_string(),
            }
        }
        DateFamily::BigQuery => {
            let dt = datatype.as_sql();
            let date_trunc = |unit: &str| format!("CAST(DATE_TRUNC(CAST({s} AS DATE), {unit}) AS {dt})");
            let datetime_trunc =
                |unit: &str| format!("CAST(DATETIME_TRUNC(CAST({s} AS DATETIME), {unit}) AS {dt})");
            match timeframe {
                TimeFrame::Time => format!("CAST({s} AS TIMESTAMP)"),
                TimeFrame::Second => datetime_trunc("SECOND"),
                TimeFrame::Minute => datetime_trunc("MINUTE"),
                TimeFrame::Hour => datetime_trunc("HOUR"),
                TimeFrame::Date => date_trunc("DAY"),
                TimeFrame::Month => date_trunc("MONTH"),
                TimeFrame::Quarter => date_trunc("QUARTER"),
                TimeFrame::Year => date_trunc("YEAR"),
                TimeFrame::WeekIndex => format!("EXTRACT(WEEK FROM {s})"),
                TimeFrame::WeekOfMonth => format!(
                    "EXTRACT(WEEK FROM {s}) - EXTRACT(WEEK FROM DATE_TRUNC(CAST({s} AS DATE), MONTH)) + 1"
                ),
                TimeFrame::MonthOfYearIndex => format!("EXTRACT(MONTH FROM {s})"),
                TimeFrame::MonthOfYear => format!("FORMAT_DATETIME('%B', CAST({s} as DATETIME))"),
                TimeFrame::QuarterOfYear => format!("EXTRACT(QUARTER FROM {s})"),
                TimeFrame::HourOfDay => format!("CAST({s} AS STRING FORMAT 'HH24')"),
                TimeFrame::DayOfWeek => format!("CAST({s} AS STRING FORMAT 'DAY')"),
                TimeFrame::DayOfMonth => format!("EXTRACT(DAY FROM {s})"),
                TimeFrame::DayOfYear => format!("EXTRACT(DAYOFYEAR FROM {s})"),
                _ => s.to_string(),
            }
        }
        DateFamily::MySql => match timeframe {
            TimeFrame::Time => format!("CAST({s} AS DATETIME)"),
            TimeFrame::Second => format!("DATE_FORMAT({s}, '%Y-%m-%d %H:%i:%s')"),
            TimeFrame::Minute => format!("DATE_FORMAT({s}, '%Y-%m-%d %H:%i:00')"),
            TimeFrame::Hour => format!("DATE_FORMAT({s}, '%Y-%m-%d %H:00:00')"),
            TimeFrame::Date => format!("DATE({s})"),
            TimeFrame::Month => format!("DATE_FORMAT({s}, '%Y-%m-01')"),
            TimeFrame::Quarter => format!("MAKEDATE(YEAR({s}), 1) + INTERVAL QUARTER({s}) - 1 QUARTER"),
            TimeFrame::Year => format!("MAKEDATE(YEAR({s}), 1)"),
            TimeFrame::WeekIndex => format!("WEEK({s}, 3)"),
            TimeFrame::WeekOfMonth => format!("WEEK({s}, 3) - WEEK(DATE_FORMAT({s}, '%Y-%m-01'), 3) + 1"),
            TimeFrame::MonthOfYearIndex => format!("MONTH({s})"),
            TimeFrame::MonthOfYear => format!("DATE_FORMAT({s}, '%b')"),
            TimeFrame::QuarterOfYear => format!("QUARTER({s})"),
            TimeFrame::HourOfDay => format!("HOUR({s})"),
            TimeFrame::DayOfWeek => format!("DATE_FORMAT({s}, '%a')"),
            TimeFrame::DayOfMonth => format!("DAYOFMONTH({s})"),
            TimeFrame::DayOfYear => format!("DAYOFYEAR({s})"),
            _ => s.to_string(),
        },
    }
}

fn week_sql(s: &str, family: DateFamily, datatype: Datatype, week_start_day: WeekStartDay) -> String {
    let casted = format!("CAST({s} AS DATE)");
    let offset = week_start_day.offset();
    match (family, offset) {
        (DateFamily::Snowflake, None) => format!("DATE_TRUNC('WEEK', {casted})"),
        (DateFamily::Snowflake, Some(off)) => format!("DATE_TRUNC('WEEK', {casted} + {off}) - {off}"),
        (DateFamily::Postgres | DateFamily::Druid | DateFamily::Databricks | DateFamily::Trino, None) => {
            format!("DATE_TRUNC('WEEK', CAST({s} AS TIMESTAMP))")
        }
        (DateFamily::Postgres | DateFamily::Druid | DateFamily::Databricks | DateFamily::Trino, Some(off)) => {
            format!("DATE_TRUNC('WEEK', CAST({s} AS TIMESTAMP) + INTERVAL '{off}' DAY) - INTERVAL '{off}' DAY")
        }
        (DateFamily::BigQuery, None) => format!("DATE_TRUNC({casted}, WEEK)"),
        (DateFamily::BigQuery, Some(off)) => {
            format!("CAST(DATE_TRUNC({casted} + {off}, WEEK) - {off} AS {})", datatype.as_sql())
        }
        (DateFamily::SqlServer, None) => format!("DATEADD(WEEK, DATEDIFF(WEEK, 0, {casted}), 0)"),
        (DateFamily::SqlServer, Some(off)) => format!(
            "DATEADD(DAY, -{off}, DATEADD(WEEK, DATEDIFF(WEEK, 0, DATEADD(DAY, {off}, {casted})), 0))"
        ),
        (DateFamily::MySql, None) => format!("DATE_SUB(DATE({s}), INTERVAL WEEKDAY({s}) DAY)"),
        (DateFamily::MySql, Some(off)) => {
            let shifted = format!("DATE_ADD(DATE({s}), INTERVAL {off} DAY)");
            format!("DATE_SUB({shifted}, INTERVAL WEEKDAY({shifted}) + {off} DAY)")
        }
    }
}

/// Whole `interval` units elapsed between `start` and `end`
pub fn duration_sql(start: &str, end: &str, interval: Interval, dialect: Dialect) -> String {
    let unit = interval.sql_unit();
    match dialect {
        Dialect::Snowflake | Dialect::Redshift | Dialect::DuckDb => format!("DATEDIFF('{unit}', {start}, {end})"),
        Dialect::Postgres => postgres_duration(start, end, interval),
        Dialect::Druid | Dialect::MySql => format!("TIMESTAMPDIFF({unit}, {start}, {end})"),
        Dialect::SqlServer | Dialect::AzureSynapse | Dialect::Databricks => {
            format!("DATEDIFF({unit}, {start}, {end})")
        }
        Dialect::Trino => format!("DATE_DIFF('{}', {start}, {end})", interval.as_str()),
        Dialect::BigQuery => match interval {
            Interval::Second | Interval::Minute | Interval::Hour => {
                format!("TIMESTAMP_DIFF(CAST({end} as TIMESTAMP), CAST({start} as TIMESTAMP), {unit})")
            }
            Interval::Week => format!("DATE_DIFF(CAST({end} as DATE), CAST({start} as DATE), ISOWEEK)"),
            Interval::Year => format!("DATE_DIFF(CAST({end} as DATE), CAST({start} as DATE), ISOYEAR)"),
            _ => format!("DATE_DIFF(CAST({end} as DATE), CAST({start} as DATE), {unit})"),
        },
    }
}

fn postgres_duration(start: &str, end: &str, interval: Interval) -> String {
    let age = format!("AGE({end}, {start})");
    match interval {
        Interval::Second => format!(
            "{} * 60 + DATE_PART('SECOND', {age})",
            postgres_duration(start, end, Interval::Minute)
        ),
        Interval::Minute => format!(
            "{} * 60 + DATE_PART('MINUTE', {age})",
            postgres_duration(start, end, Interval::Hour)
        ),
        Interval::Hour => format!(
            "{} * 24 + DATE_PART('HOUR', {age})",
            postgres_duration(start, end, Interval::Day)
        ),
        Interval::Day => format!("DATE_PART('DAY', {age})"),
        Interval::Week => format!("TRUNC(DATE_PART('DAY', {age})/7)"),
        Interval::Month => format!(
            "{} * 12 + (DATE_PART('month', {age}))",
            postgres_duration(start, end, Interval::Year)
        ),
        Interval::Quarter => format!(
            "{} * 4 + TRUNC(DATE_PART('month', {age})/3)",
            postgres_duration(start, end, Interval::Year)
        ),
        Interval::Year => format!("DATE_PART('YEAR', {age})"),
    }
}

/// Converts a UTC time column into `timezone`. Returns `None` when the dialect
/// cannot convert; the column is then used unchanged.
pub fn convert_timezone_sql(sql: &str, timezone: &str, dialect: Dialect, datatype: Datatype) -> Option<String> {
    let dt = datatype.as_sql();
    match dialect {
        Dialect::Snowflake | Dialect::Databricks => Some(format!(
            "CAST(CAST(CONVERT_TIMEZONE('{timezone}', {sql}) AS TIMESTAMP_NTZ) AS {dt})"
        )),
        Dialect::BigQuery => Some(format!("CAST(DATETIME(CAST({sql} AS TIMESTAMP), '{timezone}') AS {dt})")),
        Dialect::Redshift => Some(format!(
            "CAST(CAST(CONVERT_TIMEZONE('{timezone}', {sql}) AS TIMESTAMP) AS {dt})"
        )),
        Dialect::Postgres | Dialect::DuckDb => Some(format!(
            "CAST(CAST({sql} AS TIMESTAMP) at time zone 'utc' at time zone '{timezone}' AS {dt})"
        )),
        Dialect::Trino => Some(format!(
            "CAST(CAST({sql} AS TIMESTAMP) AT TIME ZONE '{timezone}' AS {dt})"
        )),
        Dialect::MySql => Some(format!("CAST(CONVERT_TZ({sql}, 'UTC', '{timezone}') AS {dt})")),
        Dialect::Druid | Dialect::SqlServer | Dialect::AzureSynapse => {
            warn!(dialect = %dialect, "timezone conversion is not supported, timezone will be ignored");
            None
        }
    }
}
