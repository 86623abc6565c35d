//! SQL generator: compiles one connected query to SQL
//!
//! A [`QueryPlan`] holds the bound fields and filters of a query; together
//! with its [`Design`] the [`QueryGenerator`] renders a single SELECT.
//!
//! Views with window dimensions are read through a `<view>_window_functions`
//! CTE, measures with a non-additive dimension join a CTE holding the window's
//! max or min, and having filters on window measures are applied to the
//! finished query wrapped as `measure_window_functions`.

use std::collections::{BTreeMap, BTreeSet};

use super::design::Design;
use super::dialect::Dialect;
use super::expand::{FieldSqlExpander, NonAdditiveWindow};
use super::filter::{Filter, LogicalOperator};
use crate::core::{FieldRef, Join, JoinType, Topic, View};
use crate::error::{MetricsLayerError, Result};

#[derive(Debug, Clone, Copy)]
pub struct OrderBy<'p> {
    pub field: FieldRef<'p>,
    pub descending: bool,
}

impl<'p> OrderBy<'p> {
    pub fn asc(field: FieldRef<'p>) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    pub fn desc(field: FieldRef<'p>) -> Self {
        Self {
            field,
            descending: true,
        }
    }
}

/// Fields and filters of a single query, bound to the project
#[derive(Debug, Clone, Default)]
pub struct QueryPlan<'p> {
    pub metrics: Vec<FieldRef<'p>>,
    pub dimensions: Vec<FieldRef<'p>>,
    pub where_filters: Vec<Filter<'p>>,
    pub having_filters: Vec<Filter<'p>>,
    pub order_by: Vec<OrderBy<'p>>,
    pub limit: Option<u64>,
    /// CTEs the query depends on, e.g. compiled `is_in_query` filters
    pub ctes: Vec<(String, String)>,
    pub force_group_by: bool,
    /// Select unaggregated columns, one row per source row
    pub raw: bool,
}

impl<'p> QueryPlan<'p> {
    pub fn new(metrics: Vec<FieldRef<'p>>, dimensions: Vec<FieldRef<'p>>) -> Self {
        Self {
            metrics,
            dimensions,
            ..Self::default()
        }
    }

    /// A requested dimension is the primary key of the first metric's view,
    /// so every row is already at the finest grain
    pub fn is_no_group_by(&self) -> bool {
        if self.raw {
            return true;
        }
        if self.force_group_by {
            return false;
        }
        let Some(first) = self.metrics.first() else {
            return false;
        };
        self.dimensions
            .iter()
            .any(|d| d.field.primary_key && d.grain.is_none() && d.view.name == first.view.name)
    }

    /// Every view the query touches
    pub fn required_views(&self, expander: &FieldSqlExpander<'p>) -> Result<BTreeSet<String>> {
        let mut views = BTreeSet::new();
        for field in self.metrics.iter().chain(&self.dimensions) {
            views.extend(expander.required_views(*field)?);
        }
        for filter in self.where_filters.iter().chain(&self.having_filters) {
            views.extend(filter.required_views(expander)?);
        }
        for order in &self.order_by {
            views.extend(expander.required_views(order.field)?);
        }
        Ok(views)
    }

    /// Views tried, in order, as the root of the join tree
    pub fn preferred_base_views(&self) -> Vec<&'p str> {
        self.metrics
            .first()
            .into_iter()
            .chain(self.dimensions.first())
            .map(|f| f.view.name.as_str())
            .collect()
    }

    pub fn design(&self, expander: &FieldSqlExpander<'p>, topic: Option<&Topic>) -> Result<Design<'p>> {
        let required = self.required_views(expander)?;
        if required.is_empty() {
            return Err(MetricsLayerError::Query(
                "The query does not reference any fields. Add at least one metric or dimension".to_string(),
            ));
        }
        Design::new(expander.project(), &required, &self.preferred_base_views(), topic)
    }
}

pub struct QueryGenerator<'a, 'p> {
    plan: &'a QueryPlan<'p>,
    design: &'a Design<'p>,
    expander: &'a FieldSqlExpander<'p>,
}

impl<'a, 'p> QueryGenerator<'a, 'p> {
    pub fn new(plan: &'a QueryPlan<'p>, design: &'a Design<'p>, expander: &'a FieldSqlExpander<'p>) -> Self {
        Self {
            plan,
            design,
            expander,
        }
    }

    /// Render the query. `semicolon` is false for queries embedded as CTEs.
    pub fn generate(&self, semicolon: bool) -> Result<String> {
        let plan = self.plan;
        let dialect = self.expander.context().dialect;
        let symmetric = self.design.symmetric_views();
        let no_group_by = plan.is_no_group_by();

        if plan.metrics.is_empty() && plan.dimensions.is_empty() {
            return Err(MetricsLayerError::Query(
                "Select at least one metric or dimension".to_string(),
            ));
        }
        if no_group_by && !plan.having_filters.is_empty() {
            return Err(MetricsLayerError::Argument(
                "You cannot include the 'having' argument with the table's primary key as a dimension. \
There is no group by statement in this case, so no having can be applied"
                    .to_string(),
            ));
        }
        if no_group_by && !plan.order_by.is_empty() {
            return Err(MetricsLayerError::Argument(
                "You cannot include the 'order_by' argument with the table's primary key as a dimension. \
Metrics that reference multiple values cannot be ordered without a group by"
                    .to_string(),
            ));
        }
        check_unique_aliases(plan.dimensions.iter().chain(&plan.metrics))?;

        let (having_filters, window_filters) = split_window_filters(&plan.having_filters)?;
        let wrapped = !window_filters.is_empty();
        let mut hidden_metrics: Vec<FieldRef<'p>> = Vec::new();
        for field in window_filters.iter().flat_map(Filter::fields) {
            let selected = plan.metrics.iter().chain(&hidden_metrics).any(|m| m.same_field(&field));
            if is_window_measure(&field) && !selected {
                hidden_metrics.push(field);
            }
        }

        let mut ctes = plan.ctes.clone();
        let windowed = self.window_dimensions()?;
        for (view_name, fields) in &windowed {
            ctes.push((format!("{view_name}_window_functions"), self.window_function_cte(fields)?));
        }
        let source = self.source_clause(&windowed)?;
        let non_additive = self.non_additive_windows()?;
        let mut non_additive_joins = Vec::with_capacity(non_additive.len());
        for window in &non_additive {
            let group_by = self.non_additive_group_by(window);
            ctes.push((window.cte_alias.clone(), self.non_additive_cte(window, &group_by, &source)?));
            non_additive_joins.push(self.non_additive_join(window, &group_by)?);
        }

        let columns = self.select_columns(no_group_by, &hidden_metrics)?;
        let inner_limit = if wrapped { None } else { plan.limit };
        let mut sql = format!(
            "{}{} {source}",
            select_keyword(dialect, inner_limit),
            columns
                .iter()
                .map(|(sql, alias)| format!("{sql} as {alias}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        for join in &non_additive_joins {
            sql.push(' ');
            sql.push_str(join);
        }
        sql.push_str(&self.where_clause()?);

        if !no_group_by && !plan.dimensions.is_empty() {
            let group_by = plan
                .dimensions
                .iter()
                .map(|d| {
                    if dialect.groups_by_alias() {
                        Ok(d.alias())
                    } else {
                        self.expander.raw_sql(*d)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
        }

        if !having_filters.is_empty() {
            let conditions = having_filters
                .iter()
                .map(|f| f.to_sql(self.expander, symmetric))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" HAVING {}", conditions.join(" AND ")));
        }

        if wrapped {
            ctes.push(("measure_window_functions".to_string(), sql));
            let ctx = self.expander.context();
            let conditions = window_filters
                .iter()
                .map(|f| f.render(ctx, &|field| Ok(field.alias())))
                .collect::<Result<Vec<_>>>()?;
            sql = format!(
                "{}* FROM measure_window_functions WHERE {}",
                select_keyword(dialect, plan.limit),
                conditions.join(" AND ")
            );
        }

        if !no_group_by {
            let entries = self.order_entries(&columns, wrapped)?;
            sql.push_str(&order_by_clause(&entries, dialect));
        }
        sql.push_str(&limit_clause(dialect, plan.limit));

        Ok(terminate(with_ctes(&ctes, sql), dialect, semicolon))
    }

    /// `FROM base JOIN ...` over the design's views
    fn source_clause(&self, windowed: &BTreeMap<String, Vec<FieldRef<'p>>>) -> Result<String> {
        let mut sql = format!("FROM {}", self.table_item(self.design.base_view(), windowed)?);
        for join in self.design.joins() {
            sql.push(' ');
            sql.push_str(&self.join_clause(join, windowed)?);
        }
        Ok(sql)
    }

    fn where_clause(&self) -> Result<String> {
        if self.plan.where_filters.is_empty() {
            return Ok(String::new());
        }
        let conditions = self
            .plan
            .where_filters
            .iter()
            .map(|f| f.to_sql(self.expander, self.design.symmetric_views()))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(" WHERE {}", conditions.join(" AND ")))
    }

    fn table_item(&self, view: &View, windowed: &BTreeMap<String, Vec<FieldRef<'p>>>) -> Result<String> {
        if windowed.contains_key(&view.name) {
            return Ok(format!("{0}_window_functions {0}", view.name));
        }
        self.expander.from_item(view)
    }

    /// Window dimensions the query reads, directly or through other fields,
    /// keyed by view
    fn window_dimensions(&self) -> Result<BTreeMap<String, Vec<FieldRef<'p>>>> {
        let plan = self.plan;
        let mut pending: Vec<FieldRef<'p>> = plan.metrics.iter().chain(&plan.dimensions).copied().collect();
        for filter in plan.where_filters.iter().chain(&plan.having_filters) {
            pending.extend(filter.fields());
        }
        pending.extend(plan.order_by.iter().map(|o| o.field));

        let mut seen = BTreeSet::new();
        let mut found: BTreeMap<String, Vec<FieldRef<'p>>> = BTreeMap::new();
        while let Some(field) = pending.pop() {
            if !seen.insert(field.qualified_name()) {
                continue;
            }
            if field.field.is_window_dimension() {
                let fields = found.entry(field.view.name.clone()).or_default();
                if !fields.iter().any(|f| f.field.name == field.field.name) {
                    fields.push(field);
                }
                continue;
            }
            pending.extend(self.expander.referenced_fields(field)?);
        }
        for fields in found.values_mut() {
            fields.sort_by(|a, b| a.field.name.cmp(&b.field.name));
        }
        Ok(found)
    }

    /// `SELECT <window sql> as <view>_<name>, ..., <view>.* FROM <view> [joins]`
    fn window_function_cte(&self, fields: &[FieldRef<'p>]) -> Result<String> {
        let Some(first) = fields.first() else {
            return Err(MetricsLayerError::Query("No window dimensions to compute".to_string()));
        };
        let view = first.view;
        let mut required = BTreeSet::new();
        let mut columns = Vec::with_capacity(fields.len() + 1);
        for field in fields {
            required.extend(self.expander.window_required_views(*field)?);
            columns.push(format!(
                "{} as {}",
                self.expander.window_function_sql(*field)?,
                FieldSqlExpander::window_column(*field)
            ));
        }
        columns.push(format!("{}.*", view.name));

        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), self.expander.from_item(view)?);
        if required.len() > 1 {
            let design = Design::new(self.expander.project(), &required, &[view.name.as_str()], None)?;
            if design.base_view().name != view.name {
                return Err(MetricsLayerError::Query(format!(
                    "The window functions of view {} reference views that cannot be joined from it",
                    view.name
                )));
            }
            for join in design.joins() {
                sql.push(' ');
                sql.push_str(&self.join_clause(join, &BTreeMap::new())?);
            }
        }
        Ok(sql)
    }

    /// Non-additive windows of every measure the query aggregates, by CTE alias
    fn non_additive_windows(&self) -> Result<Vec<NonAdditiveWindow<'p>>> {
        let plan = self.plan;
        let candidates: Vec<FieldRef<'p>> = plan
            .metrics
            .iter()
            .copied()
            .chain(plan.having_filters.iter().flat_map(Filter::fields))
            .chain(plan.order_by.iter().map(|o| o.field))
            .filter(FieldRef::is_measure)
            .collect();
        let mut windows: Vec<NonAdditiveWindow<'p>> = Vec::new();
        for candidate in candidates {
            for measure in self.expander.raw_measure_fields(candidate)? {
                if let Some(window) = self.expander.non_additive_window(measure)? {
                    if !windows.iter().any(|w| w.cte_alias == window.cte_alias) {
                        windows.push(window);
                    }
                }
            }
        }
        windows.sort_by(|a, b| a.cte_alias.cmp(&b.cte_alias));
        Ok(windows)
    }

    /// Window groupings, then the query dimensions the window is computed per
    fn non_additive_group_by(&self, window: &NonAdditiveWindow<'p>) -> Vec<FieldRef<'p>> {
        let mut group_by = window.groupings.clone();
        for dimension in &self.plan.dimensions {
            let varies_window = dimension.view.name == window.dimension.view.name
                && dimension.field.name == window.dimension.field.name;
            if !window.definition.window_aware_of_query_dimensions && !varies_window {
                continue;
            }
            if !group_by.iter().any(|g| g.same_field(dimension)) {
                group_by.push(*dimension);
            }
        }
        group_by
    }

    fn non_additive_cte(
        &self,
        window: &NonAdditiveWindow<'p>,
        group_by: &[FieldRef<'p>],
        source: &str,
    ) -> Result<String> {
        let mut columns = Vec::with_capacity(group_by.len() + 1);
        let mut group_sql = Vec::with_capacity(group_by.len());
        for field in group_by {
            let sql = self.expander.raw_sql(*field)?;
            let column = NonAdditiveWindow::grouping_column(*field);
            columns.push(format!("{sql} as {column}"));
            group_sql.push(if self.expander.context().dialect.groups_by_alias() {
                column
            } else {
                sql
            });
        }
        columns.push(format!(
            "{}({}) as {}",
            window.definition.window_choice.as_sql(),
            self.expander.raw_sql(window.dimension)?,
            window.column
        ));

        let mut sql = format!("SELECT {} {source}{}", columns.join(", "), self.where_clause()?);
        if !group_sql.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_sql.join(", ")));
        }
        Ok(sql)
    }

    fn non_additive_join(&self, window: &NonAdditiveWindow<'p>, group_by: &[FieldRef<'p>]) -> Result<String> {
        let cte = &window.cte_alias;
        if group_by.is_empty() {
            return Ok(format!("LEFT JOIN {cte} ON 1=1"));
        }
        let dialect = self.expander.context().dialect;
        let conditions = group_by
            .iter()
            .map(|field| {
                let sql = self.expander.raw_sql(*field)?;
                let column = format!("{cte}.{}", NonAdditiveWindow::grouping_column(*field));
                Ok(match (window.definition.nulls_are_equal, dialect) {
                    (true, Dialect::Snowflake) => format!("equal_null({sql}, {column})"),
                    (true, _) => format!("({sql}={column} OR ({sql} IS NULL AND {column} IS NULL))"),
                    (false, _) => format!("{sql}={column}"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("LEFT JOIN {cte} ON {}", conditions.join(" AND ")))
    }

    /// `(sql, alias)` pairs in select order: dimensions, then measures
    fn select_columns(&self, no_group_by: bool, hidden_metrics: &[FieldRef<'p>]) -> Result<Vec<(String, String)>> {
        let plan = self.plan;
        let mut columns = Vec::with_capacity(plan.dimensions.len() + plan.metrics.len());
        for dimension in &plan.dimensions {
            columns.push((self.expander.raw_sql(*dimension)?, dimension.alias()));
        }
        if no_group_by {
            for metric in &plan.metrics {
                for leaf in self.expander.raw_measure_fields(*metric)? {
                    let alias = leaf.alias();
                    if !columns.iter().any(|(_, a)| a == &alias) {
                        columns.push((self.expander.raw_sql(leaf)?, alias));
                    }
                }
            }
        } else {
            let symmetric = self.design.symmetric_views();
            for metric in plan.metrics.iter().chain(hidden_metrics) {
                columns.push((self.expander.sql_query(*metric, symmetric)?, metric.alias()));
            }
        }
        Ok(columns)
    }

    fn join_clause(&self, join: &Join, windowed: &BTreeMap<String, Vec<FieldRef<'p>>>) -> Result<String> {
        let project = self.expander.project();
        let item = self.table_item(project.get_view(&join.join_view)?, windowed)?;
        if join.join_type == JoinType::Cross {
            return Ok(format!("CROSS JOIN {item}"));
        }
        let base = project.get_view(&join.base_view)?;
        let on = self.expander.expand_raw(
            &join.sql_on,
            base,
            &format!("the join from {} to {}", join.base_view, join.join_view),
        )?;
        Ok(format!("{} {item} ON {on}", join.join_type.as_sql()))
    }

    /// Explicit ordering, or the first measure descending (else the first
    /// dimension ascending) on dialects that need a deterministic order.
    /// Over a wrapped query only selected columns can be ordered by.
    fn order_entries(&self, columns: &[(String, String)], wrapped: bool) -> Result<Vec<(String, bool)>> {
        let plan = self.plan;
        if plan.order_by.is_empty() {
            if !self.expander.context().dialect.orders_by_default() {
                return Ok(Vec::new());
            }
            return Ok(match (plan.metrics.first(), plan.dimensions.first()) {
                (Some(metric), _) => vec![(metric.alias(), true)],
                (None, Some(dimension)) => vec![(dimension.alias(), false)],
                (None, None) => Vec::new(),
            });
        }
        plan.order_by
            .iter()
            .map(|order| {
                let alias = order.field.alias();
                let key = if columns.iter().any(|(_, a)| a == &alias) {
                    alias
                } else if wrapped {
                    return Err(MetricsLayerError::Query(format!(
                        "Could not order by {} because it is not selected. Queries filtering on window \
functions can only be ordered by their metrics and dimensions",
                        order.field.id()
                    )));
                } else {
                    self.expander.sql_query(order.field, self.design.symmetric_views())?
                };
                Ok((key, order.descending))
            })
            .collect()
    }
}

fn is_window_measure(field: &FieldRef<'_>) -> bool {
    field.is_measure() && field.field.is_window_function()
}

/// Splits having filters into those kept in HAVING and those on window
/// measures, which can only be applied once the query is computed
fn split_window_filters<'p>(filters: &[Filter<'p>]) -> Result<(Vec<Filter<'p>>, Vec<Filter<'p>>)> {
    let mut having = Vec::new();
    let mut outer = Vec::new();
    for filter in filters {
        let Some(window_field) = filter.fields().into_iter().find(is_window_measure) else {
            having.push(filter.clone());
            continue;
        };
        match filter {
            Filter::Group { conditions, operator } => {
                let nested = conditions
                    .iter()
                    .filter(|c| matches!(c, Filter::Group { .. }))
                    .flat_map(Filter::fields)
                    .find(is_window_measure);
                if let Some(nested) = nested {
                    return Err(MetricsLayerError::Query(format!(
                        "Window functions filters cannot be nested. Please move the filter on {} to the top level \
of the having filters",
                        nested.id()
                    )));
                }
                if *operator == LogicalOperator::Or {
                    return Err(MetricsLayerError::Query(format!(
                        "Window functions filters cannot be in OR statements. Please move the filter on {} out of \
the OR group",
                        window_field.id()
                    )));
                }
                for condition in conditions {
                    if condition.fields().iter().any(is_window_measure) {
                        outer.push(condition.clone());
                    } else {
                        having.push(condition.clone());
                    }
                }
            }
            _ => outer.push(filter.clone()),
        }
    }
    Ok((having, outer))
}

pub(crate) fn check_unique_aliases<'a, 'p: 'a>(fields: impl Iterator<Item = &'a FieldRef<'p>>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for field in fields {
        let alias = field.alias();
        if !seen.insert(alias.clone()) {
            return Err(MetricsLayerError::Query(format!(
                "Ambiguous field names in the metrics and dimensions. The name {alias} is used by more than one \
field, e.g. {}. Rename one of the fields",
                field.id()
            )));
        }
    }
    Ok(())
}

/// `SELECT ` or `SELECT TOP n ` on T-SQL dialects
pub(crate) fn select_keyword(dialect: Dialect, limit: Option<u64>) -> String {
    match limit {
        Some(n) if dialect.uses_top() => format!("SELECT TOP {n} "),
        _ => "SELECT ".to_string(),
    }
}

pub(crate) fn limit_clause(dialect: Dialect, limit: Option<u64>) -> String {
    match limit {
        Some(n) if !dialect.uses_top() => format!(" LIMIT {n}"),
        _ => String::new(),
    }
}

/// ` ORDER BY a DESC NULLS LAST, b ASC NULLS LAST`, empty without entries
pub(crate) fn order_by_clause(entries: &[(String, bool)], dialect: Dialect) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let nulls = if dialect.supports_nulls_last() { " NULLS LAST" } else { "" };
    let rendered: Vec<String> = entries
        .iter()
        .map(|(key, descending)| format!("{key} {}{nulls}", if *descending { "DESC" } else { "ASC" }))
        .collect();
    format!(" ORDER BY {}", rendered.join(", "))
}

pub(crate) fn with_ctes(ctes: &[(String, String)], body: String) -> String {
    if ctes.is_empty() {
        return body;
    }
    let rendered: Vec<String> = ctes.iter().map(|(name, sql)| format!("{name} AS ({sql})")).collect();
    format!("WITH {} {body}", rendered.join(", "))
}

pub(crate) fn terminate(sql: String, dialect: Dialect, semicolon: bool) -> String {
    if semicolon && dialect.supports_semicolon() {
        format!("{sql};")
    } else {
        sql
    }
}
