//! Looker-style filter literals: `-cancelled`, `>=100`, `web,app`, `%shoe%`,
//! `after 2024-01-01`, `last 3 months`
//!
//! A literal parses into conditions that are ANDed together.

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case},
    character::complete::multispace1,
    combinator::value,
    sequence::terminated,
    IResult,
};
use serde_json::Value;

use super::relative_date::{parse_datetime, parse_relative_date, DateRange, DateRangeCalculator, DATETIME_FORMAT};
use super::FilterExpression;
use crate::error::{MetricsLayerError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct LiteralCondition {
    pub expression: FilterExpression,
    pub value: Value,
}

impl LiteralCondition {
    fn new(expression: FilterExpression, value: Value) -> Self {
        Self { expression, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateKeyword {
    After,
    Before,
    On,
}

fn comparison_operator(input: &str) -> IResult<&str, FilterExpression> {
    alt((
        value(FilterExpression::LessOrEqualThan, tag("<=")),
        value(FilterExpression::GreaterOrEqualThan, tag(">=")),
        value(FilterExpression::NotEqualTo, tag("<>")),
        value(FilterExpression::NotEqualTo, tag("!=")),
        value(FilterExpression::EqualTo, tag("=")),
        value(FilterExpression::GreaterThan, tag(">")),
        value(FilterExpression::LessThan, tag("<")),
    ))(input)
}

fn date_keyword(input: &str) -> IResult<&str, DateKeyword> {
    terminated(
        alt((
            value(DateKeyword::After, tag_no_case("after")),
            value(DateKeyword::Before, tag_no_case("before")),
            value(DateKeyword::On, tag_no_case("on")),
        )),
        multispace1,
    )(input)
}

/// Parse a literal into ANDed conditions
pub fn parse_literal(
    literal: &str,
    is_yesno: bool,
    calculator: &DateRangeCalculator,
) -> Result<Vec<LiteralCondition>> {
    let text = literal.trim();
    if text.is_empty() {
        return Err(MetricsLayerError::Parse(
            "Filter literal is empty; a value is required".to_string(),
        ));
    }

    let keyword = match text.to_lowercase().as_str() {
        "null" => Some(FilterExpression::IsNull),
        "-null" => Some(FilterExpression::IsNotNull),
        "true" => Some(FilterExpression::BooleanTrue),
        "false" => Some(FilterExpression::BooleanFalse),
        "yes" if is_yesno => Some(FilterExpression::BooleanTrue),
        "no" if is_yesno => Some(FilterExpression::BooleanFalse),
        _ => None,
    };
    if let Some(expression) = keyword {
        return Ok(vec![LiteralCondition::new(expression, Value::Null)]);
    }

    if let Some(relative) = parse_relative_date(text) {
        let range = calculator.range(&relative).ok_or_else(|| {
            MetricsLayerError::Parse(format!("Could not compute a date range for {text}"))
        })?;
        return Ok(range_conditions(&range));
    }

    if let Ok((rest, keyword)) = date_keyword(text) {
        if let Some(datetime) = parse_datetime(rest) {
            let start = datetime.format(DATETIME_FORMAT).to_string();
            return Ok(match keyword {
                DateKeyword::After => vec![LiteralCondition::new(
                    FilterExpression::GreaterOrEqualThan,
                    Value::String(start),
                )],
                DateKeyword::Before => vec![LiteralCondition::new(FilterExpression::LessThan, Value::String(start))],
                DateKeyword::On => {
                    let day = datetime.date();
                    let range = calculator
                        .range(&super::relative_date::RelativeDate::Until { start: day, end: day })
                        .ok_or_else(|| MetricsLayerError::Parse(format!("Invalid date in {text}")))?;
                    range_conditions(&range)
                }
            });
        }
    }

    if text.contains(',') {
        return list_condition(text).map(|condition| vec![condition]);
    }

    if let Ok((rest, expression)) = comparison_operator(text) {
        let operand = rest.trim();
        if operand.is_empty() {
            return Err(MetricsLayerError::Parse(format!(
                "Filter literal {text} has an operator but no value"
            )));
        }
        return Ok(vec![LiteralCondition::new(expression, scalar(operand))]);
    }

    let (negated, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, text),
    };
    if let Some(condition) = wildcard_condition(body, negated) {
        return Ok(vec![condition]);
    }

    let expression = if negated {
        FilterExpression::NotEqualTo
    } else {
        FilterExpression::EqualTo
    };
    Ok(vec![LiteralCondition::new(expression, Value::String(body.to_string()))])
}

fn range_conditions(range: &DateRange) -> Vec<LiteralCondition> {
    vec![
        LiteralCondition::new(
            FilterExpression::GreaterOrEqualThan,
            Value::String(range.start_literal()),
        ),
        LiteralCondition::new(FilterExpression::LessOrEqualThan, Value::String(range.end_literal())),
    ]
}

fn list_condition(text: &str) -> Result<LiteralCondition> {
    let items: Vec<&str> = text.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    let negated = items.iter().filter(|item| item.starts_with('-')).count();

    let expression = if negated == 0 {
        FilterExpression::IsIn
    } else if negated == items.len() {
        FilterExpression::IsNotIn
    } else {
        return Err(MetricsLayerError::Query(format!(
            "The filter {text} mixes negated and non-negated values. Use either all negated or no negated values"
        )));
    };

    let values = items
        .iter()
        .map(|item| Value::String(item.trim_start_matches('-').trim().to_string()))
        .collect();
    Ok(LiteralCondition::new(expression, Value::Array(values)))
}

fn wildcard_condition(body: &str, negated: bool) -> Option<LiteralCondition> {
    let starts = body.starts_with('%');
    let ends = body.ends_with('%') && body.len() > 1;
    let inner = body.trim_start_matches('%').trim_end_matches('%');
    let expression = match (starts, ends, negated) {
        (true, true, false) => FilterExpression::ContainsCaseInsensitive,
        (true, true, true) => FilterExpression::DoesNotContainCaseInsensitive,
        (false, true, false) => FilterExpression::StartsWithCaseInsensitive,
        (false, true, true) => FilterExpression::DoesNotStartWithCaseInsensitive,
        (true, false, false) => FilterExpression::EndsWithCaseInsensitive,
        (true, false, true) => FilterExpression::DoesNotEndWithCaseInsensitive,
        (false, false, _) => return None,
    };
    Some(LiteralCondition::new(expression, Value::String(inner.to_string())))
}

/// Numbers stay numeric, everything else is a string
fn scalar(text: &str) -> Value {
    if let Ok(int) = text.parse::<i64>() {
        return Value::from(int);
    }
    match text.parse::<f64>() {
        Ok(float) if float.is_finite() => Value::from(float),
        _ => Value::String(text.trim_matches('\'').to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::core::WeekStartDay;

    fn create_test_calculator() -> DateRangeCalculator {
        let now = NaiveDate::from_ymd_opt(2024, 3, 13)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        DateRangeCalculator::new(now, WeekStartDay::Monday)
    }

    fn parse(literal: &str) -> Vec<LiteralCondition> {
        parse_literal(literal, false, &create_test_calculator()).unwrap()
    }

    fn single(literal: &str) -> LiteralCondition {
        let mut conditions = parse(literal);
        assert_eq!(conditions.len(), 1, "{literal}");
        conditions.remove(0)
    }

    #[test]
    fn test_null_and_booleans() {
        assert_eq!(single("NULL").expression, FilterExpression::IsNull);
        assert_eq!(single("-null").expression, FilterExpression::IsNotNull);
        assert_eq!(single("TRUE").expression, FilterExpression::BooleanTrue);
        assert_eq!(single("no").expression, FilterExpression::EqualTo);

        let yesno = parse_literal("no", true, &create_test_calculator()).unwrap();
        assert_eq!(yesno[0].expression, FilterExpression::BooleanFalse);
    }

    #[test]
    fn test_relative_date_becomes_range() {
        let conditions = parse("3 days ago");
        assert_eq!(
            conditions,
            vec![
                LiteralCondition::new(
                    FilterExpression::GreaterOrEqualThan,
                    Value::String("2024-03-10T00:00:00".to_string())
                ),
                LiteralCondition::new(
                    FilterExpression::LessOrEqualThan,
                    Value::String("2024-03-10T23:59:59".to_string())
                ),
            ]
        );
    }

    #[test]
    fn test_after_before_on() {
        let after = single("after 2024-01-01");
        assert_eq!(after.expression, FilterExpression::GreaterOrEqualThan);
        assert_eq!(after.value, Value::String("2024-01-01T00:00:00".to_string()));

        assert_eq!(single("before 2024-01-01").expression, FilterExpression::LessThan);
        assert_eq!(parse("on 2024-01-01").len(), 2);
    }

    #[test]
    fn test_lists() {
        let condition = single("web, app");
        assert_eq!(condition.expression, FilterExpression::IsIn);
        assert_eq!(condition.value, serde_json::json!(["web", "app"]));

        assert_eq!(single("-web,-app").expression, FilterExpression::IsNotIn);

        let err = parse_literal("web,-app", false, &create_test_calculator()).unwrap_err();
        assert!(matches!(err, MetricsLayerError::Query(_)));
    }

    #[test]
    fn test_comparisons_keep_numbers_unquoted() {
        let condition = single(">=100");
        assert_eq!(condition.expression, FilterExpression::GreaterOrEqualThan);
        assert_eq!(condition.value, Value::from(100));

        let condition = single("<> closed");
        assert_eq!(condition.expression, FilterExpression::NotEqualTo);
        assert_eq!(condition.value, Value::String("closed".to_string()));

        assert_eq!(single("<0.5").value, Value::from(0.5));
    }

    #[test]
    fn test_negation_and_wildcards() {
        assert_eq!(single("-cancelled").expression, FilterExpression::NotEqualTo);
        assert_eq!(single("%shoe%").expression, FilterExpression::ContainsCaseInsensitive);
        assert_eq!(single("shoe%").expression, FilterExpression::StartsWithCaseInsensitive);
        assert_eq!(single("%shoe").expression, FilterExpression::EndsWithCaseInsensitive);

        let condition = single("-%shoe%");
        assert_eq!(condition.expression, FilterExpression::DoesNotContainCaseInsensitive);
        assert_eq!(condition.value, Value::String("shoe".to_string()));
    }

    #[test]
    fn test_fallback_equality() {
        let condition = single("web");
        assert_eq!(condition.expression, FilterExpression::EqualTo);
        assert_eq!(condition.value, Value::String("web".to_string()));
    }

    #[test]
    fn test_empty_literal() {
        assert!(matches!(
            parse_literal("  ", false, &create_test_calculator()),
            Err(MetricsLayerError::Parse(_))
        ));
    }
}
