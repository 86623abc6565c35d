//! Cumulative metrics
//!
//! A cumulative measure totals its referenced measure over every row up to
//! each date. The query builds a date spine, one raw sub-query and one
//! aggregated CTE per cumulative measure, a `base` CTE for the ordinary
//! metrics, and joins them on the requested dimensions.

use std::collections::BTreeMap;

use super::dates::time_grain_sql;
use super::expand::FieldSqlExpander;
use super::filter::{Filter, LiteralPart};
use super::generator::{
    check_unique_aliases, limit_clause, order_by_clause, select_keyword, terminate, with_ctes, QueryGenerator,
    QueryPlan,
};
use super::resolver::Compiler;
use crate::core::{Datatype, FieldRef, Grain, TimeFrame};
use crate::error::{MetricsLayerError, Result};

const DATE_SPINE: &str = "date_spine";
const BASE: &str = "base";

/// Columns of the CTEs the final select reads from, by field
struct Columns {
    by_name: BTreeMap<String, String>,
}

impl Columns {
    fn column<'p>(&self, expander: &FieldSqlExpander<'p>, field: FieldRef<'p>) -> Result<String> {
        if let Some(column) = self.by_name.get(&field.qualified_name()) {
            return Ok(column.clone());
        }
        if field.field.is_number_measure() {
            let sql = expander.substitute_references(field, &|reference| self.column(expander, reference))?;
            return Ok(format!("({sql})"));
        }
        Err(MetricsLayerError::Query(format!(
            "The field {} is not available in the cumulative query. Add it to the metrics or dimensions",
            field.qualified_name()
        )))
    }
}

/// True if the metric is cumulative or computed from a cumulative measure
pub(crate) fn is_cumulative_metric<'p>(expander: &FieldSqlExpander<'p>, metric: FieldRef<'p>) -> Result<bool> {
    if metric.field.is_cumulative() {
        return Ok(true);
    }
    if !metric.field.is_number_measure() {
        return Ok(false);
    }
    Ok(expander
        .raw_measure_fields(metric)?
        .iter()
        .any(|leaf| leaf.field.is_cumulative()))
}

pub(crate) fn compile<'p>(compiler: &Compiler<'_, 'p>, plan: &QueryPlan<'p>, semicolon: bool) -> Result<String> {
    let expander = compiler.expander;
    let dialect = compiler.dialect();
    check_unique_aliases(plan.dimensions.iter().chain(&plan.metrics))?;

    let mut wanted = plan.metrics.clone();
    for filter in &plan.having_filters {
        for field in filter.fields() {
            if field.is_measure() && !wanted.iter().any(|m| m.same_field(&field)) {
                wanted.push(field);
            }
        }
    }

    let mut cumulative: Vec<FieldRef<'p>> = Vec::new();
    let mut others: Vec<FieldRef<'p>> = Vec::new();
    for metric in wanted {
        let leaves = if is_cumulative_metric(expander, metric)? && !metric.field.is_cumulative() {
            expander.raw_measure_fields(metric)?
        } else {
            vec![metric]
        };
        for leaf in leaves {
            let bucket = if leaf.field.is_cumulative() {
                &mut cumulative
            } else {
                &mut others
            };
            if !bucket.iter().any(|m| m.same_field(&leaf)) {
                bucket.push(leaf);
            }
        }
    }

    let mut ctes = plan.ctes.clone();
    ctes.push((DATE_SPINE.to_string(), dialect.date_spine_sql()?));
    let mut aggregated = Vec::with_capacity(cumulative.len());
    for metric in &cumulative {
        let (subquery, sub_sql, aggregate, agg_sql) = cumulative_ctes(compiler, plan, *metric)?;
        ctes.push((subquery, sub_sql));
        ctes.push((aggregate.clone(), agg_sql));
        aggregated.push((*metric, aggregate));
    }

    if !others.is_empty() {
        let base_plan = QueryPlan {
            metrics: others.clone(),
            dimensions: plan.dimensions.clone(),
            where_filters: plan.where_filters.clone(),
            force_group_by: plan.force_group_by,
            ..QueryPlan::default()
        };
        let design = base_plan.design(expander, compiler.topic)?;
        ctes.push((
            BASE.to_string(),
            QueryGenerator::new(&base_plan, &design, expander).generate(false)?,
        ));
    }

    let from = if others.is_empty() {
        aggregated
            .first()
            .map(|(_, alias)| alias.clone())
            .ok_or_else(|| MetricsLayerError::Query("The query has no cumulative metric".to_string()))?
    } else {
        BASE.to_string()
    };

    let mut by_name = BTreeMap::new();
    for dimension in &plan.dimensions {
        by_name.insert(dimension.qualified_name(), format!("{from}.{}", dimension.alias()));
    }
    for metric in &others {
        by_name.insert(metric.qualified_name(), format!("{BASE}.{}", metric.alias()));
    }
    for (metric, alias) in &aggregated {
        by_name.insert(metric.qualified_name(), format!("{alias}.{}", metric.alias()));
    }
    let columns = Columns { by_name };

    let mut select = Vec::new();
    for field in plan.dimensions.iter().chain(&plan.metrics) {
        select.push(format!("{} as {}", columns.column(expander, *field)?, field.alias()));
    }
    let mut sql = format!("{}{} FROM {from}", select_keyword(dialect, plan.limit), select.join(", "));

    for (_, alias) in aggregated.iter().filter(|(_, alias)| *alias != from) {
        let conditions: Vec<String> = plan
            .dimensions
            .iter()
            .map(|d| format!("{from}.{a}={alias}.{a}", a = d.alias()))
            .collect();
        let on = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" and ")
        };
        sql.push_str(&format!(" LEFT JOIN {alias} ON {on}"));
    }

    if !plan.having_filters.is_empty() {
        let ctx = compiler.context();
        let conditions = plan
            .having_filters
            .iter()
            .map(|f| f.render(ctx, &|field| columns.column(expander, field)))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }

    let entries: Vec<(String, bool)> = if plan.order_by.is_empty() {
        match (plan.metrics.first(), plan.dimensions.first()) {
            _ if !dialect.orders_by_default() => Vec::new(),
            (Some(metric), _) => vec![(metric.alias(), true)],
            (None, Some(dimension)) => vec![(dimension.alias(), false)],
            (None, None) => Vec::new(),
        }
    } else {
        plan.order_by
            .iter()
            .map(|order| {
                let selected = plan
                    .dimensions
                    .iter()
                    .chain(&plan.metrics)
                    .any(|f| f.same_field(&order.field));
                let key = if selected {
                    order.field.alias()
                } else {
                    columns.column(expander, order.field)?
                };
                Ok((key, order.descending))
            })
            .collect::<Result<_>>()?
    };
    sql.push_str(&order_by_clause(&entries, dialect));
    sql.push_str(&limit_clause(dialect, plan.limit));

    Ok(terminate(with_ctes(&ctes, sql), dialect, semicolon))
}

/// The raw sub-query and the aggregated CTE of one cumulative measure, as
/// `(subquery alias, sql, aggregated alias, sql)`
fn cumulative_ctes<'p>(
    compiler: &Compiler<'_, 'p>,
    plan: &QueryPlan<'p>,
    metric: FieldRef<'p>,
) -> Result<(String, String, String, String)> {
    let project = compiler.project;
    let expander = compiler.expander;
    let ctx = compiler.context();
    let dialect = ctx.dialect;
    let id = metric.id();

    let measure_name = metric
        .field
        .measure
        .as_deref()
        .ok_or_else(|| MetricsLayerError::Model(format!("Cumulative measure {id} must name the measure it totals")))?;
    let measure = expander.resolve_relative(measure_name, metric.view)?;
    if !measure.is_measure() || measure.field.is_cumulative() || measure.field.is_number_measure() {
        return Err(MetricsLayerError::Query(format!(
            "Cumulative measure {id} must reference a measure that aggregates a column, not {}",
            measure.id()
        )));
    }

    let date = match metric.field.canon_date {
        Some(_) => project.canon_date(metric)?,
        None => project.canon_date(measure)?,
    }
    .ok_or_else(|| {
        MetricsLayerError::Query(format!(
            "Could not find a date to total cumulative measure {id} over. Set a canon_date on it or a \
default_date on the view {}",
            measure.view.name
        ))
    })?;
    let day = date.with_grain(Some(Grain::Time(TimeFrame::Date)));
    let is_date = |d: &FieldRef<'p>| d.id() == date.id() && matches!(d.grain, Some(Grain::Time(_)));

    let mut dimensions: Vec<FieldRef<'p>> = plan.dimensions.iter().copied().filter(|d| !is_date(d)).collect();
    dimensions.push(day);
    let mut where_filters = plan.where_filters.clone();
    if let Some(condition) = &metric.field.cumulative_where {
        let sql = expander.expand_raw(condition, metric.view, &id)?;
        where_filters.push(Filter::Literal {
            parts: vec![LiteralPart::Text(sql)],
        });
    }
    let sub_plan = QueryPlan {
        metrics: vec![measure],
        dimensions,
        where_filters,
        raw: true,
        ..QueryPlan::default()
    };
    let design = sub_plan.design(expander, compiler.topic)?;
    let sub_sql = QueryGenerator::new(&sub_plan, &design, expander).generate(false)?;
    let subquery = format!("subquery_{}_{}", metric.view.name, metric.field.name);

    let truncate = |sql: &str, timeframe: TimeFrame| {
        time_grain_sql(sql, timeframe, dialect, Datatype::Date, ctx.week_start_day)
    };
    let spine_date = format!("{DATE_SPINE}.date");
    let mut select = Vec::new();
    let mut group_by = Vec::new();
    let mut period = None;
    for dimension in &plan.dimensions {
        let sql = match dimension.grain {
            Some(Grain::Time(timeframe)) if is_date(dimension) => {
                let timeframe = timeframe.canonical();
                if !matches!(
                    timeframe,
                    TimeFrame::Raw
                        | TimeFrame::Time
                        | TimeFrame::Date
                        | TimeFrame::Week
                        | TimeFrame::Month
                        | TimeFrame::Quarter
                        | TimeFrame::Year
                ) {
                    return Err(MetricsLayerError::Query(format!(
                        "Cumulative measure {id} can only be grouped by the date, week, month, quarter or year \
of {}, not {}",
                        date.id(),
                        dimension.alias()
                    )));
                }
                period.get_or_insert(timeframe);
                truncate(&spine_date, timeframe)
            }
            _ => format!("{subquery}.{}", dimension.alias()),
        };
        group_by.push(if dialect.groups_by_alias() {
            dimension.alias()
        } else {
            sql.clone()
        });
        select.push(format!("{sql} as {}", dimension.alias()));
    }
    let total = expander.aggregate_column(measure, &format!("{subquery}.{}", measure.alias()))?;
    select.push(format!("{total} as {}", metric.alias()));

    // Without a date dimension the total runs up to today; with a coarser
    // grain each period is represented by its first day
    let day_column = format!("{subquery}.{}", day.alias());
    let current_date = dialect.current_date_sql();
    let (on, conditions) = match period {
        None => (
            format!("{day_column}<={spine_date}"),
            vec![format!("{spine_date}={current_date}")],
        ),
        Some(TimeFrame::Raw | TimeFrame::Time | TimeFrame::Date) => (
            format!("{day_column}<={spine_date}"),
            vec![format!("{spine_date}<={current_date}")],
        ),
        Some(timeframe) => (
            format!("{}<={spine_date}", truncate(&day_column, timeframe)),
            vec![
                format!("{spine_date}<={current_date}"),
                format!("{spine_date}={}", truncate(&spine_date, timeframe)),
            ],
        ),
    };

    let mut agg_sql = format!(
        "SELECT {} FROM {DATE_SPINE} JOIN {subquery} ON {on} WHERE {}",
        select.join(", "),
        conditions.join(" AND ")
    );
    if !group_by.is_empty() {
        agg_sql.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
    }
    let aggregate = format!("aggregated_{}_{}", metric.view.name, metric.field.name);
    Ok((subquery, sub_sql, aggregate, agg_sql))
}

#[cfg(test)]
mod tests {
    use crate::core::{Field, Identifier, Project, TimeFrame, View};
    use crate::error::MetricsLayerError;
    use crate::sql::{Dialect, QueryRequest, QueryResolver};

    fn create_test_project() -> Project {
        let orders = View::new("orders")
            .with_table("analytics.orders")
            .with_default_date("order")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("status", "${TABLE}.status"))
            .with_field(Field::time_group(
                "order",
                "${TABLE}.order_date",
                vec![TimeFrame::Date, TimeFrame::Month, TimeFrame::DayOfWeek],
            ))
            .with_field(Field::sum("revenue", "${TABLE}.revenue"))
            .with_field(Field::cumulative("total_revenue", "revenue"))
            .with_field(Field::cumulative("total_paid_revenue", "revenue").with_cumulative_where("${status}='paid'"))
            .with_field(Field::number("revenue_share", "${revenue} / ${total_revenue}"))
            .with_identifier(Identifier::primary("order_id", "${TABLE}.id"));
        Project::new(vec![], vec![orders], vec![])
    }

    fn compile(request: QueryRequest) -> crate::error::Result<String> {
        let project = create_test_project();
        QueryResolver::new(&project).resolve_sql(&request.with_query_type(Dialect::Postgres))
    }

    #[test]
    fn test_cumulative_by_month() {
        let sql = compile(QueryRequest::new(["total_revenue"], ["order_month"])).unwrap();
        assert_eq!(
            sql,
            "WITH date_spine AS (select CAST(date AS DATE) as date from generate_series('2000-01-01'::date, \
'2040-01-01'::date, interval '1 day') as t(date)), \
subquery_orders_total_revenue AS (SELECT DATE_TRUNC('DAY', CAST(orders.order_date AS TIMESTAMP)) as order_date, \
orders.revenue as revenue FROM analytics.orders orders), \
aggregated_orders_total_revenue AS (SELECT DATE_TRUNC('MONTH', CAST(date_spine.date AS TIMESTAMP)) as order_month, \
SUM(subquery_orders_total_revenue.revenue) as total_revenue FROM date_spine JOIN subquery_orders_total_revenue \
ON DATE_TRUNC('MONTH', CAST(subquery_orders_total_revenue.order_date AS TIMESTAMP))<=date_spine.date \
WHERE date_spine.date<=CURRENT_DATE AND date_spine.date=DATE_TRUNC('MONTH', CAST(date_spine.date AS TIMESTAMP)) \
GROUP BY DATE_TRUNC('MONTH', CAST(date_spine.date AS TIMESTAMP))) \
SELECT aggregated_orders_total_revenue.order_month as order_month, \
aggregated_orders_total_revenue.total_revenue as total_revenue FROM aggregated_orders_total_revenue;"
        );
    }

    #[test]
    fn test_cumulative_with_plain_metric_joins_base() {
        let sql = compile(QueryRequest::new(["revenue", "total_revenue"], ["status"])).unwrap();
        assert!(sql.contains(
            ", base AS (SELECT orders.status as status, SUM(orders.revenue) as revenue FROM analytics.orders \
orders GROUP BY orders.status)"
        ));
        assert!(sql.contains("WHERE date_spine.date=CURRENT_DATE GROUP BY subquery_orders_total_revenue.status"));
        assert!(sql.ends_with(
            "SELECT base.status as status, base.revenue as revenue, aggregated_orders_total_revenue.total_revenue \
as total_revenue FROM base LEFT JOIN aggregated_orders_total_revenue ON \
base.status=aggregated_orders_total_revenue.status;"
        ));
    }

    #[test]
    fn test_cumulative_where_filters_the_subquery() {
        let sql = compile(QueryRequest::new(["total_paid_revenue"], ["order_date"])).unwrap();
        assert!(sql.contains("FROM analytics.orders orders WHERE orders.status='paid')"));
        assert!(sql.contains("ON subquery_orders_total_paid_revenue.order_date<=date_spine.date"));
    }

    #[test]
    fn test_number_measure_over_cumulative() {
        let sql = compile(QueryRequest::new(["revenue_share"], ["order_month"])).unwrap();
        assert!(sql.contains(
            "(base.revenue / aggregated_orders_total_revenue.total_revenue) as revenue_share FROM base \
LEFT JOIN aggregated_orders_total_revenue ON base.order_month=aggregated_orders_total_revenue.order_month"
        ));
    }

    #[test]
    fn test_unsupported_cases() {
        let err = compile(QueryRequest::new(["total_revenue"], ["order_day_of_week"])).unwrap_err();
        assert!(matches!(err, MetricsLayerError::Query(_)));

        let project = create_test_project();
        let mysql = QueryRequest::new(["total_revenue"], Vec::<String>::new()).with_query_type(Dialect::MySql);
        assert!(QueryResolver::new(&project).resolve_sql(&mysql).is_err());
    }
}
