//! Field definitions: dimensions, dimension groups and measures

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static WINDOW_FUNCTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bover\s*\(").unwrap());

/// Field role within a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Dimension,
    DimensionGroup,
    Measure,
}

/// The `type` of a field. Dimension types and measure aggregations share one
/// namespace, mirroring how they are written in model files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    String,
    Number,
    Yesno,
    Tier,
    Date,
    Timestamp,
    Time,
    Duration,
    Sum,
    SumDistinct,
    Count,
    CountDistinct,
    #[serde(alias = "avg")]
    Average,
    AverageDistinct,
    Median,
    Max,
    Min,
    Cumulative,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Yesno => "yesno",
            ValueType::Tier => "tier",
            ValueType::Date => "date",
            ValueType::Timestamp => "timestamp",
            ValueType::Time => "time",
            ValueType::Duration => "duration",
            ValueType::Sum => "sum",
            ValueType::SumDistinct => "sum_distinct",
            ValueType::Count => "count",
            ValueType::CountDistinct => "count_distinct",
            ValueType::Average => "average",
            ValueType::AverageDistinct => "average_distinct",
            ValueType::Median => "median",
            ValueType::Max => "max",
            ValueType::Min => "min",
            ValueType::Cumulative => "cumulative",
        }
    }
}

/// Time grain selectable on a `time` dimension group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFrame {
    Raw,
    Time,
    Second,
    Minute,
    Hour,
    Date,
    Week,
    Month,
    Quarter,
    Year,
    WeekIndex,
    WeekOfYear,
    WeekOfMonth,
    MonthOfYear,
    MonthName,
    MonthOfYearIndex,
    MonthIndex,
    QuarterOfYear,
    HourOfDay,
    DayOfWeek,
    DayOfMonth,
    DayOfYear,
}

impl TimeFrame {
    pub const ALL: [TimeFrame; 22] = [
        TimeFrame::Raw,
        TimeFrame::Time,
        TimeFrame::Second,
        TimeFrame::Minute,
        TimeFrame::Hour,
        TimeFrame::Date,
        TimeFrame::Week,
        TimeFrame::Month,
        TimeFrame::Quarter,
        TimeFrame::Year,
        TimeFrame::WeekIndex,
        TimeFrame::WeekOfYear,
        TimeFrame::WeekOfMonth,
        TimeFrame::MonthOfYear,
        TimeFrame::MonthName,
        TimeFrame::MonthOfYearIndex,
        TimeFrame::MonthIndex,
        TimeFrame::QuarterOfYear,
        TimeFrame::HourOfDay,
        TimeFrame::DayOfWeek,
        TimeFrame::DayOfMonth,
        TimeFrame::DayOfYear,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::Raw => "raw",
            TimeFrame::Time => "time",
            TimeFrame::Second => "second",
            TimeFrame::Minute => "minute",
            TimeFrame::Hour => "hour",
            TimeFrame::Date => "date",
            TimeFrame::Week => "week",
            TimeFrame::Month => "month",
            TimeFrame::Quarter => "quarter",
            TimeFrame::Year => "year",
            TimeFrame::WeekIndex => "week_index",
            TimeFrame::WeekOfYear => "week_of_year",
            TimeFrame::WeekOfMonth => "week_of_month",
            TimeFrame::MonthOfYear => "month_of_year",
            TimeFrame::MonthName => "month_name",
            TimeFrame::MonthOfYearIndex => "month_of_year_index",
            TimeFrame::MonthIndex => "month_index",
            TimeFrame::QuarterOfYear => "quarter_of_year",
            TimeFrame::HourOfDay => "hour_of_day",
            TimeFrame::DayOfWeek => "day_of_week",
            TimeFrame::DayOfMonth => "day_of_month",
            TimeFrame::DayOfYear => "day_of_year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tf| tf.as_str() == s)
    }

    /// Collapses naming aliases onto the grain that defines their SQL
    pub fn canonical(self) -> Self {
        match self {
            TimeFrame::MonthName => TimeFrame::MonthOfYear,
            TimeFrame::MonthIndex => TimeFrame::MonthOfYearIndex,
            TimeFrame::WeekOfYear => TimeFrame::WeekIndex,
            other => other,
        }
    }
}

/// Interval unit for `duration` dimension groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Interval {
    pub const ALL: [Interval; 8] = [
        Interval::Second,
        Interval::Minute,
        Interval::Hour,
        Interval::Day,
        Interval::Week,
        Interval::Month,
        Interval::Quarter,
        Interval::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Second => "second",
            Interval::Minute => "minute",
            Interval::Hour => "hour",
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
            Interval::Quarter => "quarter",
            Interval::Year => "year",
        }
    }

    /// Parses singular or plural unit names ("day", "days")
    pub fn parse(s: &str) -> Option<Self> {
        let singular = s.strip_suffix('s').unwrap_or(s);
        Self::ALL.into_iter().find(|i| i.as_str() == singular)
    }

    pub fn sql_unit(&self) -> &'static str {
        match self {
            Interval::Second => "SECOND",
            Interval::Minute => "MINUTE",
            Interval::Hour => "HOUR",
            Interval::Day => "DAY",
            Interval::Week => "WEEK",
            Interval::Month => "MONTH",
            Interval::Quarter => "QUARTER",
            Interval::Year => "YEAR",
        }
    }
}

/// Grain selected for one use of a dimension group. This is never stored on the
/// field itself; it travels with the lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grain {
    Time(TimeFrame),
    Duration(Interval),
}

/// Storage type of a time column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Datatype {
    #[default]
    Timestamp,
    Date,
    Datetime,
}

impl Datatype {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Datatype::Timestamp => "TIMESTAMP",
            Datatype::Date => "DATE",
            Datatype::Datetime => "DATETIME",
        }
    }
}

/// A Looker-style filter attached to a measure or used as an always filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub value: String,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseWhen {
    pub sql: String,
    pub label: String,
}

/// Labelled CASE dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDefinition {
    pub whens: Vec<CaseWhen>,
    #[serde(rename = "else")]
    pub else_label: Option<String>,
}

/// End of the window a non-additive measure keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowChoice {
    Max,
    Min,
}

impl WindowChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowChoice::Max => "max",
            WindowChoice::Min => "min",
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            WindowChoice::Max => "MAX",
            WindowChoice::Min => "MIN",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Restricts a measure to the rows where a dimension is at its max (or min),
/// e.g. a balance that is only summed on the last day of each period.
///
/// The window is computed per combination of `window_groupings` and, unless
/// `window_aware_of_query_dimensions` is off, the query's own dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonAdditiveDimension {
    /// `field` in the measure's view or `view.field`, at a grain for groups
    pub name: String,
    pub window_choice: WindowChoice,
    #[serde(default)]
    pub window_groupings: Vec<String>,
    #[serde(default = "default_true")]
    pub window_aware_of_query_dimensions: bool,
    /// Match NULL grouping values to each other when joining the window
    #[serde(default)]
    pub nulls_are_equal: bool,
}

impl NonAdditiveDimension {
    pub fn new(name: impl Into<String>, window_choice: WindowChoice) -> Self {
        Self {
            name: name.into(),
            window_choice,
            window_groupings: Vec::new(),
            window_aware_of_query_dimensions: true,
            nulls_are_equal: false,
        }
    }

    pub fn with_window_grouping(mut self, grouping: impl Into<String>) -> Self {
        self.window_groupings.push(grouping.into());
        self
    }

    pub fn unaware_of_query_dimensions(mut self) -> Self {
        self.window_aware_of_query_dimensions = false;
        self
    }

    pub fn with_nulls_equal(mut self) -> Self {
        self.nulls_are_equal = true;
        self
    }
}

/// One semantic attribute of a view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub r#type: ValueType,
    /// SQL template, may contain `${TABLE}`, `${field}` or `${view.field}`
    pub sql: Option<String>,
    pub sql_start: Option<String>,
    pub sql_end: Option<String>,
    #[serde(default)]
    pub timeframes: Vec<TimeFrame>,
    #[serde(default)]
    pub intervals: Vec<Interval>,
    #[serde(default)]
    pub datatype: Datatype,
    pub convert_timezone: Option<bool>,
    /// Dimension group this measure is anchored to for time series
    pub canon_date: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    pub case: Option<CaseDefinition>,
    #[serde(default)]
    pub tiers: Vec<f64>,
    pub sql_distinct_key: Option<String>,
    /// Measure aggregated by a cumulative measure
    pub measure: Option<String>,
    pub cumulative_where: Option<String>,
    pub non_additive_dimension: Option<NonAdditiveDimension>,
    #[serde(default)]
    pub is_merged_result: bool,
    #[serde(default)]
    pub required_access_grants: Vec<String>,
    pub label: Option<String>,
    pub description: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType, r#type: ValueType) -> Self {
        Self {
            name: name.into(),
            field_type,
            r#type,
            sql: None,
            sql_start: None,
            sql_end: None,
            timeframes: Vec::new(),
            intervals: Vec::new(),
            datatype: Datatype::Timestamp,
            convert_timezone: None,
            canon_date: None,
            primary_key: false,
            hidden: false,
            tags: Vec::new(),
            filters: Vec::new(),
            case: None,
            tiers: Vec::new(),
            sql_distinct_key: None,
            measure: None,
            cumulative_where: None,
            non_additive_dimension: None,
            is_merged_result: false,
            required_access_grants: Vec::new(),
            label: None,
            description: None,
        }
    }

    pub fn dimension(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(name, FieldType::Dimension, ValueType::String).with_sql(sql)
    }

    pub fn time_group(name: impl Into<String>, sql: impl Into<String>, timeframes: Vec<TimeFrame>) -> Self {
        Self {
            timeframes,
            ..Self::new(name, FieldType::DimensionGroup, ValueType::Time).with_sql(sql)
        }
    }

    pub fn duration_group(
        name: impl Into<String>,
        sql_start: impl Into<String>,
        sql_end: impl Into<String>,
        intervals: Vec<Interval>,
    ) -> Self {
        Self {
            sql_start: Some(sql_start.into()),
            sql_end: Some(sql_end.into()),
            intervals,
            ..Self::new(name, FieldType::DimensionGroup, ValueType::Duration)
        }
    }

    pub fn measure(name: impl Into<String>, r#type: ValueType, sql: impl Into<String>) -> Self {
        Self::new(name, FieldType::Measure, r#type).with_sql(sql)
    }

    pub fn sum(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::measure(name, ValueType::Sum, sql)
    }

    /// A count with no SQL counts the view's primary key
    pub fn count(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Measure, ValueType::Count)
    }

    pub fn number(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::measure(name, ValueType::Number, sql)
    }

    pub fn cumulative(name: impl Into<String>, measure: impl Into<String>) -> Self {
        Self {
            measure: Some(measure.into()),
            ..Self::new(name, FieldType::Measure, ValueType::Cumulative)
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn with_type(mut self, r#type: ValueType) -> Self {
        self.r#type = r#type;
        self
    }

    pub fn with_primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(FieldFilter::new(field, value));
        self
    }

    pub fn with_canon_date(mut self, canon_date: impl Into<String>) -> Self {
        self.canon_date = Some(canon_date.into());
        self
    }

    pub fn with_datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_tiers(mut self, tiers: Vec<f64>) -> Self {
        self.r#type = ValueType::Tier;
        self.tiers = tiers;
        self
    }

    pub fn with_case(mut self, case: CaseDefinition) -> Self {
        self.case = Some(case);
        self
    }

    pub fn with_sql_distinct_key(mut self, key: impl Into<String>) -> Self {
        self.sql_distinct_key = Some(key.into());
        self
    }

    pub fn with_cumulative_where(mut self, condition: impl Into<String>) -> Self {
        self.cumulative_where = Some(condition.into());
        self
    }

    pub fn with_required_access_grant(mut self, grant: impl Into<String>) -> Self {
        self.required_access_grants.push(grant.into());
        self
    }

    pub fn with_non_additive_dimension(mut self, definition: NonAdditiveDimension) -> Self {
        self.non_additive_dimension = Some(definition);
        self
    }

    pub fn merged_result(mut self) -> Self {
        self.is_merged_result = true;
        self
    }

    pub fn is_measure(&self) -> bool {
        self.field_type == FieldType::Measure
    }

    pub fn is_dimension_group(&self) -> bool {
        self.field_type == FieldType::DimensionGroup
    }

    pub fn is_cumulative(&self) -> bool {
        self.is_measure() && self.r#type == ValueType::Cumulative
    }

    pub fn is_number_measure(&self) -> bool {
        self.is_measure() && self.r#type == ValueType::Number
    }

    /// The sql calls a window function (`... OVER (...)`)
    pub fn is_window_function(&self) -> bool {
        self.sql.as_deref().is_some_and(|sql| WINDOW_FUNCTION.is_match(sql))
    }

    /// A plain dimension computed by a window function. It is evaluated in a
    /// per-view CTE before the query's own grouping.
    pub fn is_window_dimension(&self) -> bool {
        self.field_type == FieldType::Dimension && self.is_window_function()
    }

    /// Matches a requested name against this field.
    ///
    /// Returns `Some(grain)` when `name` refers to this field. Time dimension
    /// groups answer to `{name}_{timeframe}` and, bare, to their raw value.
    /// Duration groups answer to `{interval}s_{name}`.
    pub fn matches_name(&self, name: &str) -> Option<Option<Grain>> {
        match (self.field_type, self.r#type) {
            (FieldType::DimensionGroup, ValueType::Time) => {
                if name == self.name {
                    return Some(Some(Grain::Time(TimeFrame::Raw)));
                }
                let suffix = name.strip_prefix(&self.name)?.strip_prefix('_')?;
                let timeframe = TimeFrame::parse(suffix)?;
                let allowed = self.timeframes.is_empty()
                    || timeframe == TimeFrame::Raw
                    || self.timeframes.contains(&timeframe);
                allowed.then_some(Some(Grain::Time(timeframe)))
            }
            (FieldType::DimensionGroup, ValueType::Duration) => {
                let prefix = name.strip_suffix(&self.name)?.strip_suffix('_')?;
                let interval = Interval::parse(prefix)?;
                let allowed = self.intervals.is_empty() || self.intervals.contains(&interval);
                allowed.then_some(Some(Grain::Duration(interval)))
            }
            _ => (name == self.name).then_some(None),
        }
    }

    /// Output name for this field at the given grain
    pub fn alias(&self, grain: Option<Grain>) -> String {
        match grain {
            Some(Grain::Time(timeframe)) => format!("{}_{}", self.name, timeframe.as_str()),
            Some(Grain::Duration(interval)) => format!("{}s_{}", interval.as_str(), self.name),
            None => self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_group_name_matching() {
        let field = Field::time_group(
            "order",
            "${TABLE}.order_date",
            vec![TimeFrame::Date, TimeFrame::Week, TimeFrame::Month],
        );

        assert_eq!(field.matches_name("order_month"), Some(Some(Grain::Time(TimeFrame::Month))));
        assert_eq!(field.matches_name("order"), Some(Some(Grain::Time(TimeFrame::Raw))));
        assert_eq!(field.matches_name("order_raw"), Some(Some(Grain::Time(TimeFrame::Raw))));
        assert_eq!(field.matches_name("order_year"), None);
        assert_eq!(field.matches_name("orders_month"), None);
    }

    #[test]
    fn test_duration_group_name_matching() {
        let field = Field::duration_group("waiting", "${created}", "${shipped}", vec![Interval::Day, Interval::Week]);

        assert_eq!(field.matches_name("days_waiting"), Some(Some(Grain::Duration(Interval::Day))));
        assert_eq!(field.matches_name("weeks_waiting"), Some(Some(Grain::Duration(Interval::Week))));
        assert_eq!(field.matches_name("hours_waiting"), None);
        assert_eq!(field.alias(Some(Grain::Duration(Interval::Day))), "days_waiting");
    }

    #[test]
    fn test_timeframe_aliases_share_sql() {
        assert_eq!(TimeFrame::MonthName.canonical(), TimeFrame::MonthOfYear);
        assert_eq!(TimeFrame::WeekOfYear.canonical(), TimeFrame::WeekIndex);
        assert_eq!(TimeFrame::Month.canonical(), TimeFrame::Month);
    }

    #[test]
    fn test_deserialize_measure() {
        let yaml = r#"
name: total_revenue
field_type: measure
type: avg
sql: ${revenue}
filters:
  - field: status
    value: "-cancelled"
"#;
        let field: Field = serde_yaml::from_str(yaml).unwrap();
        assert!(field.is_measure());
        assert_eq!(field.r#type, ValueType::Average);
        assert_eq!(field.filters[0].value, "-cancelled");
    }

    #[test]
    fn test_deserialize_non_additive_dimension() {
        let yaml = r#"
name: mrr_end_of_month
field_type: measure
type: sum
sql: ${TABLE}.mrr
non_additive_dimension:
  name: record_raw
  window_choice: max
  window_groupings: [account_id]
"#;
        let field: Field = serde_yaml::from_str(yaml).unwrap();
        let definition = field.non_additive_dimension.unwrap();
        assert_eq!(definition.window_choice, WindowChoice::Max);
        assert_eq!(definition.window_groupings, vec!["account_id".to_string()]);
        assert!(definition.window_aware_of_query_dimensions);
        assert!(!definition.nulls_are_equal);
    }

    #[test]
    fn test_window_function_detection() {
        let sequence = Field::dimension(
            "order_sequence",
            "dense_rank() over (partition by ${customer_id} order by ${order_date} asc)",
        );
        assert!(sequence.is_window_function());
        assert!(sequence.is_window_dimension());

        let share = Field::number("pct_of_revenue", "RATIO_TO_REPORT(${revenue}) OVER ()");
        assert!(share.is_window_function());
        assert!(!share.is_window_dimension());

        assert!(!Field::dimension("overdue", "${TABLE}.overdue_flag").is_window_function());
    }
}
