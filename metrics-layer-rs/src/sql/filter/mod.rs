//! Filter engine
//!
//! Request filters arrive as a literal SQL-ish string, a structured
//! `{field, expression, value}` condition, or a group of conditions. They are
//! bound against the project into [`Filter`] values and rendered to boolean
//! SQL for the compiling dialect.

mod literal;
mod relative_date;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use literal::{parse_literal, LiteralCondition};
pub use relative_date::{parse_relative_date, DateRange, DateRangeCalculator, RelativeDate, DATETIME_FORMAT};

use super::context::CompileContext;
use super::expand::FieldSqlExpander;
use crate::core::{AccessFilter, Datatype, FieldFilter, FieldRef, FieldType, Project, ValueType, View};
use crate::error::{MetricsLayerError, Result};

static LITERAL_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{[^}]+\}|[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?").unwrap()
});

static DATE_LIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").unwrap());

const SQL_KEYWORDS: [&str; 12] = [
    "and", "or", "not", "null", "is", "in", "like", "ilike", "between", "true", "false", "select",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterExpression {
    LessThan,
    LessOrEqualThan,
    EqualTo,
    NotEqualTo,
    GreaterOrEqualThan,
    GreaterThan,
    Like,
    Contains,
    DoesNotContain,
    ContainsCaseInsensitive,
    DoesNotContainCaseInsensitive,
    StartsWith,
    EndsWith,
    DoesNotStartWith,
    DoesNotEndWith,
    StartsWithCaseInsensitive,
    EndsWithCaseInsensitive,
    DoesNotStartWithCaseInsensitive,
    DoesNotEndWithCaseInsensitive,
    IsNull,
    IsNotNull,
    IsIn,
    IsNotIn,
    BooleanTrue,
    BooleanFalse,
    Matches,
    IsInQuery,
    IsNotInQuery,
}

impl FilterExpression {
    pub const ALL: [FilterExpression; 28] = [
        FilterExpression::LessThan,
        FilterExpression::LessOrEqualThan,
        FilterExpression::EqualTo,
        FilterExpression::NotEqualTo,
        FilterExpression::GreaterOrEqualThan,
        FilterExpression::GreaterThan,
        FilterExpression::Like,
        FilterExpression::Contains,
        FilterExpression::DoesNotContain,
        FilterExpression::ContainsCaseInsensitive,
        FilterExpression::DoesNotContainCaseInsensitive,
        FilterExpression::StartsWith,
        FilterExpression::EndsWith,
        FilterExpression::DoesNotStartWith,
        FilterExpression::DoesNotEndWith,
        FilterExpression::StartsWithCaseInsensitive,
        FilterExpression::EndsWithCaseInsensitive,
        FilterExpression::DoesNotStartWithCaseInsensitive,
        FilterExpression::DoesNotEndWithCaseInsensitive,
        FilterExpression::IsNull,
        FilterExpression::IsNotNull,
        FilterExpression::IsIn,
        FilterExpression::IsNotIn,
        FilterExpression::BooleanTrue,
        FilterExpression::BooleanFalse,
        FilterExpression::Matches,
        FilterExpression::IsInQuery,
        FilterExpression::IsNotInQuery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterExpression::LessThan => "less_than",
            FilterExpression::LessOrEqualThan => "less_or_equal_than",
            FilterExpression::EqualTo => "equal_to",
            FilterExpression::NotEqualTo => "not_equal_to",
            FilterExpression::GreaterOrEqualThan => "greater_or_equal_than",
            FilterExpression::GreaterThan => "greater_than",
            FilterExpression::Like => "like",
            FilterExpression::Contains => "contains",
            FilterExpression::DoesNotContain => "does_not_contain",
            FilterExpression::ContainsCaseInsensitive => "contains_case_insensitive",
            FilterExpression::DoesNotContainCaseInsensitive => "does_not_contain_case_insensitive",
            FilterExpression::StartsWith => "starts_with",
            FilterExpression::EndsWith => "ends_with",
            FilterExpression::DoesNotStartWith => "does_not_start_with",
            FilterExpression::DoesNotEndWith => "does_not_end_with",
            FilterExpression::StartsWithCaseInsensitive => "starts_with_case_insensitive",
            FilterExpression::EndsWithCaseInsensitive => "ends_with_case_insensitive",
            FilterExpression::DoesNotStartWithCaseInsensitive => "does_not_start_with_case_insensitive",
            FilterExpression::DoesNotEndWithCaseInsensitive => "does_not_end_with_case_insensitive",
            FilterExpression::IsNull => "is_null",
            FilterExpression::IsNotNull => "is_not_null",
            FilterExpression::IsIn => "isin",
            FilterExpression::IsNotIn => "isnotin",
            FilterExpression::BooleanTrue => "boolean_true",
            FilterExpression::BooleanFalse => "boolean_false",
            FilterExpression::Matches => "matches",
            FilterExpression::IsInQuery => "is_in_query",
            FilterExpression::IsNotInQuery => "is_not_in_query",
        }
    }

    fn needs_value(&self) -> bool {
        !matches!(
            self,
            FilterExpression::IsNull
                | FilterExpression::IsNotNull
                | FilterExpression::BooleanTrue
                | FilterExpression::BooleanFalse
        )
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterExpression {
    type Err = MetricsLayerError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| MetricsLayerError::Parse(format!("Unknown filter expression: {s}.")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogicalOperator {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

impl LogicalOperator {
    fn as_sql(&self) -> &'static str {
        match self {
            LogicalOperator::And => " AND ",
            LogicalOperator::Or => " OR ",
        }
    }
}

/// A where or having clause as written in a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterClause {
    Literal(String),
    List(Vec<FilterSpec>),
    Single(FilterSpec),
}

impl From<&str> for FilterClause {
    fn from(literal: &str) -> Self {
        FilterClause::Literal(literal.to_string())
    }
}

impl From<Vec<FilterSpec>> for FilterClause {
    fn from(specs: Vec<FilterSpec>) -> Self {
        FilterClause::List(specs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterSpec {
    Group {
        conditions: Vec<FilterSpec>,
        #[serde(default)]
        logical_operator: LogicalOperator,
    },
    Condition {
        field: String,
        expression: String,
        #[serde(default)]
        value: Option<Value>,
    },
}

impl FilterSpec {
    pub fn condition(field: impl Into<String>, expression: FilterExpression, value: impl Into<Value>) -> Self {
        FilterSpec::Condition {
            field: field.into(),
            expression: expression.as_str().to_string(),
            value: Some(value.into()),
        }
    }

    pub fn group(conditions: Vec<FilterSpec>, logical_operator: LogicalOperator) -> Self {
        FilterSpec::Group {
            conditions,
            logical_operator,
        }
    }

    /// Field names mentioned anywhere in the filter
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            FilterSpec::Condition { field, .. } => vec![field.as_str()],
            FilterSpec::Group { conditions, .. } => conditions.iter().flat_map(FilterSpec::field_names).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LiteralPart<'p> {
    Text(String),
    Field(FieldRef<'p>),
}

/// A filter bound to project fields
#[derive(Debug, Clone)]
pub enum Filter<'p> {
    Condition {
        field: FieldRef<'p>,
        expression: FilterExpression,
        value: Option<Value>,
    },
    Group {
        conditions: Vec<Filter<'p>>,
        operator: LogicalOperator,
    },
    /// SQL text with field names swapped for their SQL at render time
    Literal { parts: Vec<LiteralPart<'p>> },
    /// Membership in a column of a separately compiled CTE
    InQuery {
        field: FieldRef<'p>,
        negated: bool,
        cte_alias: String,
        column: String,
    },
}

impl<'p> Filter<'p> {
    pub fn condition(field: FieldRef<'p>, expression: FilterExpression, value: Option<Value>) -> Self {
        Filter::Condition {
            field,
            expression,
            value,
        }
    }

    /// Every field the filter touches
    pub fn fields(&self) -> Vec<FieldRef<'p>> {
        match self {
            Filter::Condition { field, .. } | Filter::InQuery { field, .. } => vec![*field],
            Filter::Group { conditions, .. } => conditions.iter().flat_map(Filter::fields).collect(),
            Filter::Literal { parts } => parts
                .iter()
                .filter_map(|part| match part {
                    LiteralPart::Field(field) => Some(*field),
                    LiteralPart::Text(_) => None,
                })
                .collect(),
        }
    }

    /// True if the filter compares an aggregate and belongs in HAVING
    pub fn is_measure_filter(&self) -> bool {
        self.fields().iter().any(FieldRef::is_measure)
    }

    pub fn required_views(&self, expander: &FieldSqlExpander<'p>) -> Result<BTreeSet<String>> {
        let mut views = BTreeSet::new();
        for field in self.fields() {
            views.extend(expander.required_views(field)?);
        }
        Ok(views)
    }

    /// Render with field SQL from the expander
    pub fn to_sql(&self, expander: &FieldSqlExpander<'p>, symmetric_views: &BTreeSet<String>) -> Result<String> {
        self.render(expander.context(), &|field| expander.sql_query(field, symmetric_views))
    }

    /// Render with a caller-supplied SQL for each field, e.g. an outer alias
    pub fn render(&self, ctx: &CompileContext, field_sql: &dyn Fn(FieldRef<'p>) -> Result<String>) -> Result<String> {
        match self {
            Filter::Condition {
                field,
                expression,
                value,
            } => {
                let sql = field_sql(*field)?;
                render_condition(&sql, *expression, value.as_ref(), *field, ctx)
            }
            Filter::Group { conditions, operator } => {
                let rendered = conditions
                    .iter()
                    .map(|c| c.render(ctx, field_sql))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", rendered.join(operator.as_sql())))
            }
            Filter::Literal { parts } => {
                let mut sql = String::new();
                for part in parts {
                    match part {
                        LiteralPart::Text(text) => sql.push_str(text),
                        LiteralPart::Field(field) => sql.push_str(&field_sql(*field)?),
                    }
                }
                Ok(sql)
            }
            Filter::InQuery {
                field,
                negated,
                cte_alias,
                column,
            } => {
                let not = if *negated { "NOT " } else { "" };
                Ok(format!(
                    "{} {not}IN (SELECT DISTINCT {column} FROM {cte_alias})",
                    field_sql(*field)?
                ))
            }
        }
    }
}

/// Compiles an `is_in_query` value into a CTE and returns `(cte alias, column)`
pub type SubqueryResolver<'a> = dyn FnMut(&Value) -> Result<(String, String)> + 'a;

/// Bind a request clause to project fields
pub fn bind_clause<'p>(
    project: &'p Project,
    clause: &FilterClause,
    subqueries: &mut SubqueryResolver<'_>,
) -> Result<Vec<Filter<'p>>> {
    match clause {
        FilterClause::Literal(text) if text.trim().is_empty() => Ok(Vec::new()),
        FilterClause::Literal(text) => Ok(vec![bind_literal(project, text)?]),
        FilterClause::List(specs) => specs.iter().map(|s| bind_spec(project, s, subqueries)).collect(),
        FilterClause::Single(spec) => Ok(vec![bind_spec(project, spec, subqueries)?]),
    }
}

pub fn bind_spec<'p>(
    project: &'p Project,
    spec: &FilterSpec,
    subqueries: &mut SubqueryResolver<'_>,
) -> Result<Filter<'p>> {
    match spec {
        FilterSpec::Group {
            conditions,
            logical_operator,
        } => {
            let conditions = conditions
                .iter()
                .map(|c| bind_spec(project, c, &mut *subqueries))
                .collect::<Result<Vec<_>>>()?;
            let measures = conditions.iter().filter(|c| c.is_measure_filter()).count();
            if measures > 0 && measures < conditions.len() {
                return Err(MetricsLayerError::Query(
                    "A filter group cannot mix dimensions and measures. Split the group into where and having filters"
                        .to_string(),
                ));
            }
            Ok(Filter::Group {
                conditions,
                operator: *logical_operator,
            })
        }
        FilterSpec::Condition {
            field,
            expression,
            value,
        } => {
            let expression: FilterExpression = expression.parse()?;
            let field_ref = project.find_field(field)?;
            if expression.needs_value() && value.as_ref().map_or(true, Value::is_null) {
                return Err(MetricsLayerError::Parse(format!(
                    "Filter on {field} with expression {expression} is missing a value"
                )));
            }
            match expression {
                FilterExpression::IsInQuery | FilterExpression::IsNotInQuery => {
                    let query = value.as_ref().unwrap_or(&Value::Null);
                    let (cte_alias, column) = subqueries(query)?;
                    Ok(Filter::InQuery {
                        field: field_ref,
                        negated: expression == FilterExpression::IsNotInQuery,
                        cte_alias,
                        column,
                    })
                }
                _ => Ok(Filter::condition(field_ref, expression, value.clone())),
            }
        }
    }
}

/// Splits a literal into text and field references. Names inside single
/// quotes are left alone; words that are not fields stay as text.
pub fn bind_literal<'p>(project: &'p Project, text: &str) -> Result<Filter<'p>> {
    let mut parts = Vec::new();
    let mut buffer = String::new();
    for (segment, quoted) in split_quoted(text) {
        if quoted {
            buffer.push_str(segment);
            continue;
        }
        let mut last = 0;
        for m in LITERAL_TOKEN.find_iter(segment) {
            buffer.push_str(&segment[last..m.start()]);
            last = m.end();
            let token = m.as_str();
            let (name, explicit) = match token.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
                Some(inner) => (inner.trim(), true),
                None => (token, false),
            };
            if !explicit && SQL_KEYWORDS.contains(&name.to_lowercase().as_str()) {
                buffer.push_str(token);
                continue;
            }
            match project.find_field(name) {
                Ok(field) => {
                    if !buffer.is_empty() {
                        parts.push(LiteralPart::Text(std::mem::take(&mut buffer)));
                    }
                    parts.push(LiteralPart::Field(field));
                }
                Err(MetricsLayerError::AccessDeniedOrDoesNotExist { .. }) if !explicit => buffer.push_str(token),
                Err(e) => return Err(e),
            }
        }
        buffer.push_str(&segment[last..]);
    }
    if !buffer.is_empty() {
        parts.push(LiteralPart::Text(buffer));
    }
    Ok(Filter::Literal { parts })
}

/// Splits text into `(segment, is_quoted)` runs on single quotes
fn split_quoted(text: &str) -> Vec<(&str, bool)> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in text.char_indices() {
        if c != '\'' {
            continue;
        }
        if quoted {
            segments.push((&text[start..=i], true));
            start = i + 1;
        } else {
            if start < i {
                segments.push((&text[start..i], false));
            }
            start = i;
        }
        quoted = !quoted;
    }
    if start < text.len() {
        segments.push((&text[start..], quoted));
    }
    segments
}

fn resolve_field<'p>(project: &'p Project, name: &str, owner: &'p View) -> Result<FieldRef<'p>> {
    if name.contains('.') {
        project.find_field(name)
    } else {
        project.find_field_in_view(owner, name)
    }
}

/// Always filters declared on a view or topic, as `matches` conditions
pub fn always_filters<'p>(project: &'p Project, filters: &[FieldFilter], owner: &'p View) -> Result<Vec<Filter<'p>>> {
    filters
        .iter()
        .map(|filter| {
            let field = resolve_field(project, &filter.field, owner)?;
            Ok(Filter::condition(
                field,
                FilterExpression::Matches,
                Some(Value::String(filter.value.clone())),
            ))
        })
        .collect()
}

/// Access filters for the current user. Attributes the user lacks filter nothing.
pub fn access_filters<'p>(
    project: &'p Project,
    filters: &[AccessFilter],
    owner: &'p View,
    user_attributes: &BTreeMap<String, String>,
) -> Result<Vec<Filter<'p>>> {
    let mut bound = Vec::new();
    for filter in filters {
        let Some(attribute) = user_attributes.get(&filter.user_attribute) else {
            continue;
        };
        let field = resolve_field(project, &filter.field, owner)?;
        let values: Vec<&str> = attribute.split(',').map(str::trim).collect();
        bound.push(if values.len() > 1 {
            Filter::condition(field, FilterExpression::IsIn, Some(Value::from(values)))
        } else {
            Filter::condition(field, FilterExpression::EqualTo, Some(Value::String(attribute.trim().to_string())))
        });
    }
    Ok(bound)
}

/// Render a literal such as `-cancelled` against already expanded field SQL
pub fn literal_filter_sql(field_sql: &str, field: FieldRef<'_>, literal: &str, ctx: &CompileContext) -> Result<String> {
    let calculator = DateRangeCalculator::new(ctx.now, ctx.week_start_day);
    let is_yesno = field.field.r#type == ValueType::Yesno;
    let conditions = parse_literal(literal, is_yesno, &calculator)?;
    let datatype = time_datatype(field);
    let rendered = conditions
        .iter()
        .map(|c| render_expression(field_sql, c.expression, Some(&c.value), datatype, ctx))
        .collect::<Result<Vec<_>>>()?;
    Ok(rendered.join(" AND "))
}

/// Storage type of the field when it holds dates or timestamps
fn time_datatype(field: FieldRef<'_>) -> Option<Datatype> {
    let f = field.field;
    match (f.field_type, f.r#type) {
        (FieldType::DimensionGroup, ValueType::Time) => Some(f.datatype),
        (_, ValueType::Date) => Some(Datatype::Date),
        (_, ValueType::Timestamp) => Some(f.datatype),
        _ => None,
    }
}

fn render_condition(
    sql: &str,
    expression: FilterExpression,
    value: Option<&Value>,
    field: FieldRef<'_>,
    ctx: &CompileContext,
) -> Result<String> {
    if expression == FilterExpression::Matches {
        let literal = match value {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => {
                return Err(MetricsLayerError::Parse(format!(
                    "Filter on {} with expression matches is missing a value",
                    field.id()
                )))
            }
            Some(other) => other.to_string(),
        };
        return literal_filter_sql(sql, field, &literal, ctx);
    }
    render_expression(sql, expression, value, time_datatype(field), ctx)
}

fn render_expression(
    sql: &str,
    expression: FilterExpression,
    value: Option<&Value>,
    datatype: Option<Datatype>,
    ctx: &CompileContext,
) -> Result<String> {
    use FilterExpression as E;

    let required = || {
        value.filter(|v| !v.is_null()).ok_or_else(|| {
            MetricsLayerError::Parse(format!("Filter expression {expression} requires a value"))
        })
    };
    let literal = |v: &Value| render_value(v, datatype, ctx);
    let pattern = |prefix: &str, suffix: &str| -> Result<String> {
        let text = match required()? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(quote(&format!("{prefix}{text}{suffix}")))
    };

    Ok(match expression {
        E::LessThan => format!("{sql}<{}", literal(required()?)?),
        E::LessOrEqualThan => format!("{sql}<={}", literal(required()?)?),
        E::EqualTo => format!("{sql}={}", literal(required()?)?),
        E::NotEqualTo => format!("{sql}<>{}", literal(required()?)?),
        E::GreaterOrEqualThan => format!("{sql}>={}", literal(required()?)?),
        E::GreaterThan => format!("{sql}>{}", literal(required()?)?),
        E::Like => format!("{sql} LIKE {}", literal(required()?)?),
        E::Contains => format!("{sql} LIKE {}", pattern("%", "%")?),
        E::DoesNotContain => format!("{sql} NOT LIKE {}", pattern("%", "%")?),
        E::StartsWith => format!("{sql} LIKE {}", pattern("", "%")?),
        E::EndsWith => format!("{sql} LIKE {}", pattern("%", "")?),
        E::DoesNotStartWith => format!("{sql} NOT LIKE {}", pattern("", "%")?),
        E::DoesNotEndWith => format!("{sql} NOT LIKE {}", pattern("%", "")?),
        E::ContainsCaseInsensitive => format!("LOWER({sql}) LIKE LOWER({})", pattern("%", "%")?),
        E::DoesNotContainCaseInsensitive => format!("LOWER({sql}) NOT LIKE LOWER({})", pattern("%", "%")?),
        E::StartsWithCaseInsensitive => format!("LOWER({sql}) LIKE LOWER({})", pattern("", "%")?),
        E::EndsWithCaseInsensitive => format!("LOWER({sql}) LIKE LOWER({})", pattern("%", "")?),
        E::DoesNotStartWithCaseInsensitive => format!("LOWER({sql}) NOT LIKE LOWER({})", pattern("", "%")?),
        E::DoesNotEndWithCaseInsensitive => format!("LOWER({sql}) NOT LIKE LOWER({})", pattern("%", "")?),
        E::IsNull => format!("{sql} IS NULL"),
        E::IsNotNull => format!("{sql} IS NOT NULL"),
        E::IsIn => format!("{sql} IN {}", list(required()?, datatype, ctx)?),
        E::IsNotIn => format!("{sql} NOT IN {}", list(required()?, datatype, ctx)?),
        E::BooleanTrue => sql.to_string(),
        E::BooleanFalse => format!("NOT {sql}"),
        E::Matches | E::IsInQuery | E::IsNotInQuery => {
            return Err(MetricsLayerError::Query(format!(
                "Filter expression {expression} must be bound before it is rendered"
            )))
        }
    })
}

fn list(value: &Value, datatype: Option<Datatype>, ctx: &CompileContext) -> Result<String> {
    match value {
        Value::Array(_) => render_value(value, datatype, ctx),
        scalar => Ok(format!("({})", render_value(scalar, datatype, ctx)?)),
    }
}

/// SQL literal for a JSON value
pub fn render_value(value: &Value, datatype: Option<Datatype>, ctx: &CompileContext) -> Result<String> {
    Ok(match value {
        Value::String(s) => match datatype {
            Some(datatype) if DATE_LIKE.is_match(s) => ctx.dialect.datetime_literal(&s.replace('\'', "''"), datatype),
            _ => quote(s),
        },
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Null => "NULL".to_string(),
        Value::Array(items) => {
            let rendered = items
                .iter()
                .map(|item| render_value(item, datatype, ctx))
                .collect::<Result<Vec<_>>>()?;
            format!("({})", rendered.join(","))
        }
        Value::Object(_) => {
            return Err(MetricsLayerError::Parse(format!(
                "Filter value {value} is an object, which cannot be compared"
            )))
        }
    })
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
