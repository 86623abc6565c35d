//! Funnel queries
//!
//! A funnel counts, per step, the events of entities (tagged `customer`)
//! that went through every earlier step in order, each within the window of
//! the first step. The raw events are selected once into `base`; each step
//! is a CTE joined to the previous one.

use super::filter::Filter;
use super::generator::{limit_clause, order_by_clause, select_keyword, terminate, with_ctes, QueryGenerator, QueryPlan};
use super::request::{FunnelSpec, QueryRequest};
use super::resolver::Compiler;
use crate::core::FieldRef;
use crate::error::{MetricsLayerError, Result};

const LINK_TAG: &str = "customer";
const BASE: &str = "base";
const RESULT: &str = "result_cte";
const FIRST_STEP_TIME: &str = "step_1_time";

pub(crate) fn compile<'p>(
    compiler: &Compiler<'_, 'p>,
    request: &QueryRequest,
    spec: &FunnelSpec,
    semicolon: bool,
) -> Result<String> {
    let window = spec.validate()?;
    let interval = window.interval()?;
    let ctx = compiler.context();
    let dialect = ctx.dialect;

    let mut plan = compiler.plan(&QueryRequest {
        having: None,
        order_by: None,
        limit: None,
        funnel: None,
        ..request.clone()
    })?;
    if plan.metrics.is_empty() {
        return Err(MetricsLayerError::Query(
            "Funnel queries need at least one metric to count at each step".to_string(),
        ));
    }

    let mut ctes = std::mem::take(&mut plan.ctes);
    let mut having = std::mem::take(&mut plan.having_filters);
    if let Some(clause) = &request.having {
        having.extend(compiler.bind_filters(clause, &mut ctes)?);
    }
    let mut metrics = plan.metrics.clone();
    for field in having.iter().flat_map(Filter::fields) {
        if field.is_measure() && !metrics.iter().any(|m| m.same_field(&field)) {
            metrics.push(field);
        }
    }
    if let Some(metric) = metrics
        .iter()
        .find(|m| m.field.is_cumulative() || m.field.is_number_measure())
    {
        return Err(MetricsLayerError::Query(format!(
            "Funnel queries only support measures that aggregate a column, and {} does not",
            metric.id()
        )));
    }

    let event_date = event_date(compiler, &metrics)?;
    let link = link_field(compiler, &metrics)?;
    let event = event_date.alias();

    let mut steps: Vec<Vec<Filter<'p>>> = Vec::with_capacity(spec.steps.len());
    for clause in &spec.steps {
        let mut step_ctes = Vec::new();
        let filters = compiler.bind_filters(clause, &mut step_ctes)?;
        if !step_ctes.is_empty() {
            return Err(MetricsLayerError::Query(
                "Funnel steps cannot filter with is_in_query".to_string(),
            ));
        }
        if let Some(filter) = filters.iter().find(|f| f.is_measure_filter()) {
            let names: Vec<String> = filter.fields().iter().map(FieldRef::id).collect();
            return Err(MetricsLayerError::Query(format!(
                "Funnel steps can only filter on dimensions, not measures ({})",
                names.join(", ")
            )));
        }
        steps.push(filters);
    }

    let mut dimensions = plan.dimensions.clone();
    let step_fields = steps.iter().flatten().flat_map(Filter::fields);
    for field in [event_date, link].into_iter().chain(step_fields) {
        if !dimensions.iter().any(|d| d.same_field(&field)) {
            dimensions.push(field);
        }
    }
    let base_plan = QueryPlan {
        metrics: metrics.clone(),
        dimensions,
        where_filters: plan.where_filters.clone(),
        raw: true,
        ..QueryPlan::default()
    };
    let design = base_plan.design(compiler.expander, compiler.topic)?;
    ctes.push((
        BASE.to_string(),
        QueryGenerator::new(&base_plan, &design, compiler.expander).generate(false)?,
    ));

    let base_column = |field: FieldRef<'p>| -> Result<String> { Ok(format!("{BASE}.{}", field.alias())) };
    let link_alias = link.alias();
    for (index, filters) in steps.iter().enumerate() {
        let step = index + 1;
        let mut conditions = filters
            .iter()
            .map(|f| f.render(ctx, &base_column))
            .collect::<Result<Vec<_>>>()?;
        let sql = if step == 1 {
            format!("SELECT {BASE}.*, {BASE}.{event} as {FIRST_STEP_TIME} FROM {BASE}")
        } else {
            let previous = format!("step_{}", step - 1);
            let elapsed = dialect.date_diff_sql(
                interval.sql_unit(),
                &format!("{previous}.{FIRST_STEP_TIME}"),
                &format!("{BASE}.{event}"),
            );
            conditions.push(format!("{elapsed} <= {}", window.value));
            format!(
                "SELECT {BASE}.*, {previous}.{FIRST_STEP_TIME} as {FIRST_STEP_TIME} FROM {BASE} JOIN {previous} \
ON {BASE}.{link_alias}={previous}.{link_alias} and {previous}.{event}<{BASE}.{event}"
            )
        };
        let sql = if conditions.is_empty() {
            sql
        } else {
            format!("{sql} WHERE {}", conditions.join(" AND "))
        };
        ctes.push((format!("step_{step}"), sql));
    }

    let mut unions = Vec::with_capacity(steps.len());
    for step in 1..=steps.len() {
        let source = format!("step_{step}");
        let mut select = vec![format!("'Step {step}' as step"), format!("{step} as step_order")];
        let mut group_by = Vec::new();
        for dimension in &plan.dimensions {
            let alias = dimension.alias();
            select.push(format!("{source}.{alias} as {alias}"));
            group_by.push(if dialect.groups_by_alias() {
                alias
            } else {
                format!("{source}.{alias}")
            });
        }
        for metric in &metrics {
            let aggregate = compiler
                .expander
                .aggregate_column(*metric, &format!("{source}.{}", metric.alias()))?;
            select.push(format!("{aggregate} as {}", metric.alias()));
        }
        let mut sql = format!("SELECT {} FROM {source}", select.join(", "));
        if !group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
        }
        unions.push(sql);
    }
    ctes.push((RESULT.to_string(), unions.join(" UNION ALL ")));

    let mut sql = format!("{}* FROM {RESULT}", select_keyword(dialect, request.limit));
    if !having.is_empty() {
        let result_column = |field: FieldRef<'p>| -> Result<String> { Ok(format!("{RESULT}.{}", field.alias())) };
        let conditions = having
            .iter()
            .map(|f| f.render(ctx, &result_column))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }
    let entries: Vec<(String, bool)> = compiler
        .order_by(request)?
        .iter()
        .map(|order| (order.field.alias(), order.descending))
        .collect();
    sql.push_str(&order_by_clause(&entries, dialect));
    sql.push_str(&limit_clause(dialect, request.limit));

    Ok(terminate(with_ctes(&ctes, sql), dialect, semicolon))
}

/// The `default_date` shared by the views of every metric, at its raw grain
fn event_date<'p>(compiler: &Compiler<'_, 'p>, metrics: &[FieldRef<'p>]) -> Result<FieldRef<'p>> {
    let mut found: Option<FieldRef<'p>> = None;
    for metric in metrics {
        let Some(name) = metric.view.default_date.as_deref() else {
            continue;
        };
        let date = compiler.expander.resolve_relative(name, metric.view)?;
        match found {
            Some(existing) if existing.id() != date.id() => {
                return Err(MetricsLayerError::Query(format!(
                    "Could not determine event date for funnel, the metrics use both {} and {}",
                    existing.id(),
                    date.id()
                )))
            }
            Some(_) => {}
            None => found = Some(date),
        }
    }
    found.ok_or_else(|| {
        MetricsLayerError::Query(
            "Could not determine event date for funnel. Set a default_date on the views of the metrics".to_string(),
        )
    })
}

/// First `customer`-tagged field in the first metric's view, else in the
/// views it joins to
fn link_field<'p>(compiler: &Compiler<'_, 'p>, metrics: &[FieldRef<'p>]) -> Result<FieldRef<'p>> {
    let project = compiler.project;
    let no_link = || {
        let names: Vec<String> = metrics.iter().map(FieldRef::id).collect();
        MetricsLayerError::Query(format!(
            "No link ({LINK_TAG}) field found for query with metrics: [{}]. Make sure you have added a {LINK_TAG} \
tag to the view or a view that can be joined in.",
            names.join(", ")
        ))
    };
    let first = metrics.first().ok_or_else(no_link)?;
    let reachable = project.join_graph().reachable_from(&first.view.name);
    let others = reachable.iter().filter(|name| **name != first.view.name);

    if let Some(field) = first.view.fields_with_tag(LINK_TAG).next() {
        return Ok(FieldRef::new(first.view, field, None));
    }
    for name in others {
        let view = project.get_view(name)?;
        if let Some(field) = view.fields_with_tag(LINK_TAG).next() {
            return Ok(FieldRef::new(view, field, None));
        }
    }
    Err(no_link())
}
