//! Merged results
//!
//! Metrics whose views cannot be joined are compiled as separate queries,
//! one per canon date and merge group, and full outer joined on the
//! requested dimensions. Dimensions from another group are translated
//! through the model's mappings.

use std::collections::BTreeMap;

use tracing::debug;

use super::dialect::Dialect;
use super::expand::FieldSqlExpander;
use super::filter::{bind_literal, Filter, FilterClause, FilterSpec};
use super::generator::{limit_clause, order_by_clause, select_keyword, terminate, with_ctes};
use super::request::QueryRequest;
use super::resolver::Compiler;
use crate::core::{FieldRef, Grain};
use crate::error::{MetricsLayerError, Result};

/// One sub-query of the merged result
struct Group<'p> {
    merge_group: String,
    canon_date: Option<FieldRef<'p>>,
    metrics: Vec<FieldRef<'p>>,
    /// Request dimensions translated into this group, by request position
    dimensions: Vec<FieldRef<'p>>,
}

pub(crate) fn compile<'p>(compiler: &Compiler<'_, 'p>, request: &QueryRequest, semicolon: bool) -> Result<String> {
    if request.funnel.is_some() {
        return Err(MetricsLayerError::Query(
            "Funnel queries are not supported in merged results queries".to_string(),
        ));
    }
    let expander = compiler.expander;
    let dialect = compiler.dialect();

    let metrics = compiler.fields(&request.metrics)?;
    let dimensions = compiler.fields(&request.dimensions)?;

    let mut ctes = Vec::new();
    let mut outer_filters: Vec<Filter<'p>> = Vec::new();
    let mut pushed: Vec<FilterSpecOrLiteral> = Vec::new();
    if let Some(clause) = &request.where_clause {
        for item in split_clause(clause) {
            if item.is_measure_filter(compiler)? {
                outer_filters.extend(compiler.bind_filters(&item.to_clause(), &mut ctes)?);
            } else {
                pushed.push(item);
            }
        }
    }
    if let Some(clause) = &request.having {
        outer_filters.extend(compiler.bind_filters(clause, &mut ctes)?);
    }

    let mut groups: BTreeMap<String, Group<'p>> = BTreeMap::new();
    let hidden = outer_filters
        .iter()
        .flat_map(Filter::fields)
        .filter(FieldRef::is_measure);
    for metric in metrics.iter().copied().chain(hidden) {
        add_metric(compiler, &mut groups, metric)?;
    }
    if groups.is_empty() {
        return Err(MetricsLayerError::Query(
            "A merged result query needs at least one metric".to_string(),
        ));
    }

    let canon_dates: Vec<String> = groups
        .values()
        .filter_map(|g| g.canon_date.map(|d| d.id()))
        .collect();
    for group in groups.values_mut() {
        for dimension in &dimensions {
            let mapped = map_dimension(compiler, group, *dimension, &canon_dates)?;
            group.dimensions.push(mapped);
        }
    }
    debug!(groups = ?groups.keys().collect::<Vec<_>>(), "merged result groups");

    let mut applied = vec![false; pushed.len()];
    for (key, group) in &groups {
        let mut names: Vec<String> = Vec::new();
        for dimension in &group.dimensions {
            let name = dimension.qualified_name();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        let mut conditions = Vec::new();
        for (index, item) in pushed.iter().enumerate() {
            if let Some(spec) = item.push_down(compiler, group)? {
                conditions.push(spec);
                applied[index] = true;
            }
        }
        let (where_clause, having) = clauses_from(conditions);
        let sub = QueryRequest {
            metrics: group.metrics.iter().map(FieldRef::qualified_name).collect(),
            dimensions: names,
            where_clause,
            having,
            force_group_by: request.force_group_by,
            model: request.model.clone(),
            ..QueryRequest::default()
        };
        ctes.push((key.clone(), compiler.compile_single(&sub, false)?));
    }

    if let Some((item, _)) = pushed.iter().zip(&applied).find(|(_, applied)| !**applied) {
        let names: Vec<String> = item.fields(compiler)?.iter().map(FieldRef::qualified_name).collect();
        return Err(MetricsLayerError::Query(format!(
            "Could not apply the filter on {} to any of the merged results. The field is not \
reachable from the metrics in the query and has no mapping to them.",
            names.join(", ")
        )));
    }

    let keys: Vec<&String> = groups.keys().collect();
    let first = keys[0];

    let mut select = Vec::new();
    let mut selected = Vec::new();
    for metric in metrics.iter().filter(|m| !m.field.is_merged_result) {
        let alias = metric.alias();
        if selected.contains(&alias) {
            continue;
        }
        let column = metric_column(expander, &groups, *metric)?;
        select.push(format!("{column} as {alias}"));
        selected.push(alias);
    }
    for (index, dimension) in dimensions.iter().enumerate() {
        let columns: Vec<String> = groups
            .iter()
            .map(|(key, group)| format!("{key}.{}", group.dimensions[index].alias()))
            .collect();
        select.push(format!("{} as {}", coalesce(dialect, &columns), dimension.alias()));
        selected.push(dimension.alias());
    }
    for metric in metrics.iter().filter(|m| m.field.is_merged_result) {
        let sql = expander.substitute_references(*metric, &|reference| metric_column(expander, &groups, reference))?;
        select.push(format!("{sql} as {}", metric.alias()));
        selected.push(metric.alias());
    }

    let mut sql = format!("{}{} FROM {first}", select_keyword(dialect, request.limit), select.join(", "));
    let first_group = &groups[first];
    for key in keys.iter().skip(1) {
        let group = &groups[*key];
        if dimensions.is_empty() {
            if dialect.cross_joins_without_keys() {
                sql.push_str(&format!(" CROSS JOIN {key}"));
            } else {
                sql.push_str(&format!(" FULL OUTER JOIN {key} ON 1=1"));
            }
            continue;
        }
        let on: Vec<String> = first_group
            .dimensions
            .iter()
            .zip(&group.dimensions)
            .map(|(left, right)| {
                join_condition(
                    dialect,
                    (&format!("{first}.{}", left.alias()), *left),
                    (&format!("{key}.{}", right.alias()), *right),
                )
            })
            .collect();
        sql.push_str(&format!(" FULL OUTER JOIN {key} ON {}", on.join(" and ")));
    }

    if !outer_filters.is_empty() {
        let ctx = compiler.context();
        let column = |field: FieldRef<'p>| metric_column(expander, &groups, field);
        let conditions = outer_filters
            .iter()
            .map(|f| f.render(ctx, &column))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }

    let mut entries: Vec<(String, bool)> = Vec::new();
    for order in compiler.order_by(request)? {
        let alias = order.field.alias();
        if !selected.contains(&alias) {
            return Err(MetricsLayerError::Query(format!(
                "Could not order by {} because it is not selected by the merged results query. \
Add it to the metrics or dimensions to order by it.",
                order.field.qualified_name()
            )));
        }
        entries.push((alias, order.descending));
    }
    sql.push_str(&order_by_clause(&entries, dialect));
    sql.push_str(&limit_clause(dialect, request.limit));

    Ok(terminate(with_ctes(&ctes, sql), dialect, semicolon))
}

/// Place a metric in the group of its canon date and merge group. Merged
/// result metrics are placed through the fields they reference.
fn add_metric<'p>(
    compiler: &Compiler<'_, 'p>,
    groups: &mut BTreeMap<String, Group<'p>>,
    metric: FieldRef<'p>,
) -> Result<()> {
    if metric.field.is_merged_result {
        for reference in compiler.expander.referenced_fields(metric)? {
            add_metric(compiler, groups, reference)?;
        }
        return Ok(());
    }
    let graph = compiler.project.join_graph();
    let merge_group = graph
        .merge_group(&metric.view.name)
        .unwrap_or(metric.view.name.as_str())
        .to_string();
    let canon_date = compiler.project.canon_date(metric)?;
    let key = match canon_date {
        Some(date) => format!("{}__{merge_group}", date.id().replace('.', "_")),
        None => merge_group.clone(),
    };
    let group = groups.entry(key).or_insert_with(|| Group {
        merge_group,
        canon_date,
        metrics: Vec::new(),
        dimensions: Vec::new(),
    });
    if !group.metrics.iter().any(|m| m.same_field(&metric)) {
        group.metrics.push(metric);
    }
    Ok(())
}

/// The field answering `dimension` inside `group`: its canon date, the
/// dimension itself, or a mapped field
fn map_dimension<'p>(
    compiler: &Compiler<'_, 'p>,
    group: &Group<'p>,
    dimension: FieldRef<'p>,
    canon_dates: &[String],
) -> Result<FieldRef<'p>> {
    if let Some(date) = group.canon_date {
        if canon_dates.contains(&dimension.id()) && matches!(dimension.grain, Some(Grain::Time(_))) {
            return Ok(date.with_grain(dimension.grain));
        }
    }
    if let Some(mapped) = map_to_group(compiler, group, dimension)? {
        return Ok(mapped);
    }
    Err(MetricsLayerError::Query(format!(
        "Could not find mapping from field {} to other views. Please add a mapping to your model definition to \
allow the mapping if you'd like to use this field in a merged result query.",
        dimension.id()
    )))
}

/// `field` if it belongs to the group, else the field of the group that
/// shares a mapping with it
fn map_to_group<'p>(
    compiler: &Compiler<'_, 'p>,
    group: &Group<'p>,
    field: FieldRef<'p>,
) -> Result<Option<FieldRef<'p>>> {
    let project = compiler.project;
    let graph = project.join_graph();
    if graph.merge_group(&field.view.name) == Some(group.merge_group.as_str()) || field.view.name == group.merge_group {
        return Ok(Some(field));
    }
    let Some((_, mapping)) = project.mapping_containing(compiler.model, &field.id()) else {
        return Ok(None);
    };
    for name in &mapping.fields {
        let candidate = project.find_field(name)?;
        if graph.merge_group(&candidate.view.name) == Some(group.merge_group.as_str()) {
            let grain = if candidate.field.is_dimension_group() {
                field.grain
            } else {
                None
            };
            return Ok(Some(candidate.with_grain(grain)));
        }
    }
    Ok(None)
}

/// Column of a metric in the group that selected it; number measures are
/// computed from the columns of their references
fn metric_column<'p>(
    expander: &FieldSqlExpander<'p>,
    groups: &BTreeMap<String, Group<'p>>,
    field: FieldRef<'p>,
) -> Result<String> {
    for (key, group) in groups {
        if group.metrics.iter().any(|m| m.same_field(&field)) {
            return Ok(format!("{key}.{}", field.alias()));
        }
    }
    if field.field.is_number_measure() {
        let sql = expander.substitute_references(field, &|reference| metric_column(expander, groups, reference))?;
        return Ok(format!("({sql})"));
    }
    Err(MetricsLayerError::Query(format!(
        "The field {} is not available in the merged result. Add it to the metrics of the query",
        field.id()
    )))
}

/// `f(a, f(b, c))` with the dialect's null-coalescing function
pub(crate) fn coalesce(dialect: Dialect, columns: &[String]) -> String {
    let function = dialect.if_null_function();
    let mut iter = columns.iter().rev();
    let Some(last) = iter.next() else {
        return String::new();
    };
    iter.fold(last.clone(), |acc, column| format!("{function}({column}, {acc})"))
}

/// `left=right`; BigQuery cannot compare time columns of different types
pub(crate) fn join_condition(dialect: Dialect, left: (&str, FieldRef<'_>), right: (&str, FieldRef<'_>)) -> String {
    let (left_sql, left_field) = left;
    let (right_sql, right_field) = right;
    let is_time = |f: FieldRef<'_>| matches!(f.grain, Some(Grain::Time(_)));
    if dialect == Dialect::BigQuery
        && is_time(left_field)
        && is_time(right_field)
        && left_field.field.datatype != right_field.field.datatype
    {
        return format!("CAST({left_sql} AS TIMESTAMP)=CAST({right_sql} AS TIMESTAMP)");
    }
    format!("{left_sql}={right_sql}")
}

/// A top-level item of a where clause
enum FilterSpecOrLiteral {
    Spec(FilterSpec),
    Literal(String),
}

fn split_clause(clause: &FilterClause) -> Vec<FilterSpecOrLiteral> {
    match clause {
        FilterClause::Literal(text) if text.trim().is_empty() => Vec::new(),
        FilterClause::Literal(text) => vec![FilterSpecOrLiteral::Literal(text.clone())],
        FilterClause::List(specs) => specs.iter().cloned().map(FilterSpecOrLiteral::Spec).collect(),
        FilterClause::Single(spec) => vec![FilterSpecOrLiteral::Spec(spec.clone())],
    }
}

/// Sub-request clauses for the pushed items as `(where, having)`. Literals
/// ride in `having`; dimension filters there are still applied in WHERE.
fn clauses_from(items: Vec<FilterSpecOrLiteral>) -> (Option<FilterClause>, Option<FilterClause>) {
    let mut specs = Vec::new();
    let mut literals = Vec::new();
    for item in items {
        match item {
            FilterSpecOrLiteral::Spec(spec) => specs.push(spec),
            FilterSpecOrLiteral::Literal(text) => literals.push(format!("({text})")),
        }
    }
    let specs = (!specs.is_empty()).then(|| FilterClause::List(specs));
    let literals = (!literals.is_empty()).then(|| FilterClause::Literal(literals.join(" AND ")));
    (specs, literals)
}

impl FilterSpecOrLiteral {
    fn to_clause(&self) -> FilterClause {
        match self {
            FilterSpecOrLiteral::Spec(spec) => FilterClause::Single(spec.clone()),
            FilterSpecOrLiteral::Literal(text) => FilterClause::Literal(text.clone()),
        }
    }

    fn is_measure_filter(&self, compiler: &Compiler<'_, '_>) -> Result<bool> {
        Ok(self.fields(compiler)?.iter().any(FieldRef::is_measure))
    }

    fn fields<'p>(&self, compiler: &Compiler<'_, 'p>) -> Result<Vec<FieldRef<'p>>> {
        match self {
            FilterSpecOrLiteral::Literal(text) => Ok(bind_literal(compiler.project, text)?.fields()),
            FilterSpecOrLiteral::Spec(spec) => spec
                .field_names()
                .into_iter()
                .map(|name| compiler.project.find_field(name))
                .collect(),
        }
    }

    /// The item rewritten onto the group's fields, or `None` when a field
    /// has no counterpart in the group
    fn push_down<'p>(&self, compiler: &Compiler<'_, 'p>, group: &Group<'p>) -> Result<Option<FilterSpecOrLiteral>> {
        match self {
            FilterSpecOrLiteral::Literal(text) => {
                for field in self.fields(compiler)? {
                    if map_to_group(compiler, group, field)?.map_or(true, |f| !f.same_field(&field)) {
                        return Ok(None);
                    }
                }
                Ok(Some(FilterSpecOrLiteral::Literal(text.clone())))
            }
            FilterSpecOrLiteral::Spec(spec) => Ok(push_spec(compiler, group, spec)?.map(FilterSpecOrLiteral::Spec)),
        }
    }
}

fn push_spec<'p>(compiler: &Compiler<'_, 'p>, group: &Group<'p>, spec: &FilterSpec) -> Result<Option<FilterSpec>> {
    match spec {
        FilterSpec::Group {
            conditions,
            logical_operator,
        } => {
            let mut pushed = Vec::with_capacity(conditions.len());
            for condition in conditions {
                match push_spec(compiler, group, condition)? {
                    Some(condition) => pushed.push(condition),
                    None => return Ok(None),
                }
            }
            Ok(Some(FilterSpec::Group {
                conditions: pushed,
                logical_operator: *logical_operator,
            }))
        }
        FilterSpec::Condition {
            field,
            expression,
            value,
        } => {
            let bound = compiler.project.find_field(field)?;
            Ok(map_to_group(compiler, group, bound)?.map(|mapped| FilterSpec::Condition {
                field: mapped.qualified_name(),
                expression: expression.clone(),
                value: value.clone(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::config::ConnectionConfig;
    use crate::error::MetricsLayerError;
    use crate::core::{Field, Model, Project, TimeFrame, View};
    use crate::sql::filter::{FilterExpression, FilterSpec};
    use crate::sql::{Dialect, QueryRequest, QueryResolver};

    fn create_test_project() -> Project {
        create_test_project_with(Vec::new())
    }

    fn create_test_project_with(extra_views: Vec<View>) -> Project {
        let model = Model::new("core")
            .with_connection("warehouse")
            .with_mapping("source", vec!["orders.channel".to_string(), "sessions.utm_source".to_string()]);
        let orders = View::new("orders")
            .with_table("analytics.orders")
            .with_model("core")
            .with_default_date("order")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("status", "${TABLE}.status"))
            .with_field(Field::dimension("channel", "${TABLE}.sales_channel"))
            .with_field(Field::time_group("order", "${TABLE}.order_date", vec![TimeFrame::Date]))
            .with_field(Field::sum("revenue", "${TABLE}.revenue"));
        let sessions = View::new("sessions")
            .with_table("analytics.sessions")
            .with_model("core")
            .with_default_date("session")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("utm_source", "${TABLE}.utm_source"))
            .with_field(Field::time_group("session", "${TABLE}.session_date", vec![TimeFrame::Date]))
            .with_field(Field::sum("session_length", "${TABLE}.length"))
            .with_field(Field::number("revenue_per_second", "${orders.revenue} / ${session_length}").merged_result());
        let mut views = vec![orders, sessions];
        views.extend(extra_views);
        Project::new(vec![model], views, vec![])
            .with_connections(vec![ConnectionConfig::new("warehouse", Dialect::Postgres)])
    }

    fn resolve(request: &QueryRequest) -> String {
        let project = create_test_project();
        QueryResolver::new(&project).resolve_sql(request).unwrap()
    }

    #[test]
    fn test_mapped_dimension_joins_groups() {
        let sql = resolve(&QueryRequest::new(["revenue", "session_length"], ["source"]));
        assert_eq!(
            sql,
            "WITH orders_order__graph_0 AS (SELECT orders.sales_channel as channel, SUM(orders.revenue) as revenue \
FROM analytics.orders orders GROUP BY orders.sales_channel), \
sessions_session__graph_1 AS (SELECT sessions.utm_source as utm_source, SUM(sessions.length) as session_length \
FROM analytics.sessions sessions GROUP BY sessions.utm_source) \
SELECT orders_order__graph_0.revenue as revenue, sessions_session__graph_1.session_length as session_length, \
coalesce(orders_order__graph_0.channel, sessions_session__graph_1.utm_source) as channel \
FROM orders_order__graph_0 FULL OUTER JOIN sessions_session__graph_1 \
ON orders_order__graph_0.channel=sessions_session__graph_1.utm_source;"
        );
    }

    #[test]
    fn test_where_is_pushed_into_each_group() {
        let request = QueryRequest::new(["revenue", "session_length"], ["source"])
            .with_where(vec![FilterSpec::condition("source", FilterExpression::EqualTo, "google")])
            .with_having(vec![FilterSpec::condition("revenue", FilterExpression::GreaterThan, json!(100))]);
        let sql = resolve(&request);
        assert!(sql.contains("FROM analytics.orders orders WHERE orders.sales_channel='google'"));
        assert!(sql.contains("FROM analytics.sessions sessions WHERE sessions.utm_source='google'"));
        assert!(sql.ends_with(" WHERE orders_order__graph_0.revenue>100;"));
    }

    #[test]
    fn test_merged_result_metric_and_date_dimension() {
        let request = QueryRequest::new(["revenue_per_second"], ["date"]);
        let sql = resolve(&request);
        assert!(sql.contains(
            "SELECT coalesce(orders_order__graph_0.order_date, sessions_session__graph_1.session_date) as \
session_date, orders_order__graph_0.revenue / sessions_session__graph_1.session_length as revenue_per_second"
        ));
        assert!(sql.ends_with("ON orders_order__graph_0.order_date=sessions_session__graph_1.session_date;"));
    }

    #[test]
    fn test_unmapped_dimension_is_an_error() {
        let project = create_test_project();
        let request = QueryRequest::new(["revenue", "session_length"], ["status"]).with_merged_result();
        let err = QueryResolver::new(&project).resolve_sql(&request).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Could not find mapping from field orders.status to other views."));
    }

    #[test]
    fn test_no_dimensions() {
        let project = create_test_project();
        let request = QueryRequest::new(["revenue", "session_length"], Vec::<String>::new())
            .with_merged_result()
            .with_query_type(Dialect::Redshift);
        let sql = QueryResolver::new(&project).resolve_sql(&request).unwrap();
        assert!(sql.ends_with(" FROM orders_order__graph_0 CROSS JOIN sessions_session__graph_1;"));
    }

    #[test]
    fn test_unreachable_where_field_is_an_error() {
        let reviews = View::new("reviews")
            .with_table("analytics.reviews")
            .with_model("core")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("stars", "${TABLE}.stars"));
        let project = create_test_project_with(vec![reviews]);
        let request = QueryRequest::new(["revenue", "session_length"], ["date"])
            .with_where(vec![FilterSpec::condition("stars", FilterExpression::EqualTo, json!(5))]);
        let err = QueryResolver::new(&project).resolve_sql(&request).unwrap_err();
        assert!(matches!(err, MetricsLayerError::Query(_)), "{err}");
        assert!(err.to_string().contains("reviews.stars"));
    }

    #[test]
    fn test_order_by_must_be_selected() {
        let project = create_test_project();
        let resolver = QueryResolver::new(&project);

        let unselected = QueryRequest::new(["revenue", "session_length"], ["source"]).with_order_by("status");
        let err = resolver.resolve_sql(&unselected).unwrap_err();
        assert!(matches!(err, MetricsLayerError::Query(_)), "{err}");
        assert!(err.to_string().contains("orders.status"));

        let selected = QueryRequest::new(["revenue", "session_length"], ["source"]).with_order_by("revenue desc");
        let sql = resolver.resolve_sql(&selected).unwrap();
        assert!(sql.ends_with(" ORDER BY revenue DESC NULLS LAST;"), "{sql}");
    }
}
