//! Query requests as they arrive from callers
//!
//! A [`QueryRequest`] names metrics and dimensions and carries filters,
//! ordering and the optional funnel or explicit merge definitions. It
//! deserializes from JSON or YAML and can be built in code.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dialect::Dialect;
use super::filter::FilterClause;
use crate::core::Interval;
use crate::error::{MetricsLayerError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub metrics: Vec<String>,
    pub dimensions: Vec<String>,
    #[serde(rename = "where")]
    pub where_clause: Option<FilterClause>,
    pub having: Option<FilterClause>,
    pub order_by: Option<OrderByClause>,
    pub funnel: Option<FunnelSpec>,
    /// Explicitly merged sub-queries, validated when the request is resolved
    pub merged_queries: Option<Vec<Value>>,
    pub limit: Option<u64>,
    pub query_type: Option<Dialect>,
    pub merged_result: bool,
    pub single_query: bool,
    pub force_group_by: bool,
    pub topic: Option<String>,
    #[serde(alias = "model_name")]
    pub model: Option<String>,
    pub user_attributes: BTreeMap<String, String>,
}

impl QueryRequest {
    pub fn new<M, D>(metrics: M, dimensions: D) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            metrics: metrics.into_iter().map(Into::into).collect(),
            dimensions: dimensions.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_where(mut self, clause: impl Into<FilterClause>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    pub fn with_having(mut self, clause: impl Into<FilterClause>) -> Self {
        self.having = Some(clause.into());
        self
    }

    pub fn with_order_by(mut self, order_by: impl Into<OrderByClause>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn with_funnel(mut self, funnel: FunnelSpec) -> Self {
        self.funnel = Some(funnel);
        self
    }

    pub fn with_merged_queries(mut self, queries: Vec<Value>) -> Self {
        self.merged_queries = Some(queries);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_query_type(mut self, dialect: Dialect) -> Self {
        self.query_type = Some(dialect);
        self
    }

    pub fn with_merged_result(mut self) -> Self {
        self.merged_result = true;
        self
    }

    pub fn with_single_query(mut self) -> Self {
        self.single_query = true;
        self
    }

    pub fn with_force_group_by(mut self) -> Self {
        self.force_group_by = true;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_user_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_attributes.insert(name.into(), value.into());
        self
    }

    /// Every field name the request mentions, in request order
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.iter().chain(&self.dimensions).cloned().collect();
        for clause in self.where_clause.iter().chain(&self.having) {
            if let FilterClause::List(specs) = clause {
                names.extend(specs.iter().flat_map(|s| s.field_names()).map(str::to_string));
            } else if let FilterClause::Single(spec) = clause {
                names.extend(spec.field_names().into_iter().map(str::to_string));
            }
        }
        if let Some(order_by) = &self.order_by {
            if let Ok(entries) = order_by.entries() {
                names.extend(entries.into_iter().map(|e| e.field));
            }
        }
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBySpec {
    pub field: String,
    #[serde(default)]
    pub sort: SortDirection,
}

impl OrderBySpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            sort: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            sort: SortDirection::Desc,
        }
    }
}

/// `"revenue desc, channel"` or a list of `{field, sort}` entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrderByClause {
    Literal(String),
    List(Vec<OrderBySpec>),
}

impl From<&str> for OrderByClause {
    fn from(literal: &str) -> Self {
        OrderByClause::Literal(literal.to_string())
    }
}

impl From<Vec<OrderBySpec>> for OrderByClause {
    fn from(entries: Vec<OrderBySpec>) -> Self {
        OrderByClause::List(entries)
    }
}

impl OrderByClause {
    /// Structured entries; literals are split on commas, ascending by default
    pub fn entries(&self) -> Result<Vec<OrderBySpec>> {
        let literal = match self {
            OrderByClause::List(entries) => return Ok(entries.clone()),
            OrderByClause::Literal(literal) => literal,
        };
        let mut entries = Vec::new();
        for item in literal.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let mut words = item.split_whitespace();
            let field = words.next().unwrap_or_default().to_string();
            let sort = match words.next().map(str::to_lowercase).as_deref() {
                None | Some("asc") => SortDirection::Asc,
                Some("desc") => SortDirection::Desc,
                Some(other) => {
                    return Err(MetricsLayerError::Parse(format!(
                        "Could not parse the order by clause {literal}: unexpected sort direction {other}"
                    )))
                }
            };
            if words.next().is_some() {
                return Err(MetricsLayerError::Parse(format!(
                    "Could not parse the order by clause {literal}: expected 'field [asc|desc]'"
                )));
            }
            entries.push(OrderBySpec { field, sort });
        }
        Ok(entries)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelWindow {
    pub value: i64,
    /// Interval unit, singular or plural ("day", "days")
    pub unit: String,
}

impl FunnelWindow {
    pub fn interval(&self) -> Result<Interval> {
        Interval::parse(&self.unit.trim().to_lowercase()).ok_or_else(|| {
            MetricsLayerError::Query(format!(
                "Funnel window unit {} is not a valid interval. Use one of second, minute, hour, day, week, \
month, quarter or year",
                self.unit
            ))
        })
    }
}

/// Ordered funnel steps, each a filter, and the window the steps must
/// complete within
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunnelSpec {
    pub steps: Vec<FilterClause>,
    pub within: Option<FunnelWindow>,
}

impl FunnelSpec {
    pub fn new(steps: Vec<FilterClause>, value: i64, unit: impl Into<String>) -> Self {
        Self {
            steps,
            within: Some(FunnelWindow {
                value,
                unit: unit.into(),
            }),
        }
    }

    pub fn validate(&self) -> Result<&FunnelWindow> {
        match (&self.within, self.steps.is_empty()) {
            (Some(within), false) => Ok(within),
            _ => Err(MetricsLayerError::Query(
                "Funnel query must have 'steps' and 'within' keys".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sql::filter::FilterSpec;

    #[test]
    fn test_deserialize_request() {
        let request: QueryRequest = serde_json::from_value(json!({
            "metrics": ["total_revenue"],
            "dimensions": ["channel"],
            "where": [{"field": "channel", "expression": "not_equal_to", "value": "web"}],
            "having": "total_revenue > 100",
            "order_by": [{"field": "total_revenue", "sort": "desc"}],
            "limit": 10,
            "query_type": "bigquery",
            "model_name": "core"
        }))
        .unwrap();

        assert_eq!(request.metrics, vec!["total_revenue"]);
        assert_eq!(request.query_type, Some(Dialect::BigQuery));
        assert_eq!(request.model.as_deref(), Some("core"));
        assert!(matches!(request.where_clause, Some(FilterClause::List(_))));
        assert_eq!(
            request.order_by.unwrap().entries().unwrap(),
            vec![OrderBySpec::desc("total_revenue")]
        );
    }

    #[test]
    fn test_order_by_literal() {
        let clause = OrderByClause::from("revenue desc, channel, order_date ASC");
        assert_eq!(
            clause.entries().unwrap(),
            vec![
                OrderBySpec::desc("revenue"),
                OrderBySpec::asc("channel"),
                OrderBySpec::asc("order_date"),
            ]
        );

        let err = OrderByClause::from("revenue sideways").entries().unwrap_err();
        assert!(matches!(err, MetricsLayerError::Parse(_)));
    }

    #[test]
    fn test_field_names() {
        let request = QueryRequest::new(["revenue"], ["channel"])
            .with_where(vec![FilterSpec::condition(
                "status",
                crate::sql::filter::FilterExpression::EqualTo,
                "done",
            )])
            .with_order_by("revenue desc");
        assert_eq!(request.field_names(), vec!["revenue", "channel", "status", "revenue"]);
    }

    #[test]
    fn test_funnel_validation() {
        let funnel: FunnelSpec = serde_json::from_value(json!({
            "steps": [[{"field": "event", "expression": "equal_to", "value": "signup"}], "event = 'buy'"],
            "within": {"value": 3, "unit": "days"}
        }))
        .unwrap();
        let within = funnel.validate().unwrap();
        assert_eq!(within.interval().unwrap(), Interval::Day);

        let missing = FunnelSpec {
            within: None,
            ..funnel
        };
        assert!(matches!(missing.validate(), Err(MetricsLayerError::Query(_))));
    }
}
