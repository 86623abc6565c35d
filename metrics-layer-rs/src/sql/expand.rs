//! Field SQL expansion
//!
//! Replaces `${...}` references in field templates with the referenced
//! field's SQL, applies time grains, durations, tiers and CASE labels, and
//! wraps measures in their aggregate. One expander lives for one compilation;
//! it memoizes unaggregated SQL and detects reference cycles.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use super::context::CompileContext;
use super::dates::{convert_timezone_sql, duration_sql, time_grain_sql};
use super::filter::literal_filter_sql;
use super::symmetric::{supports_symmetric_aggregates, symmetric_average, symmetric_count, symmetric_sum};
use crate::core::{
    extract_references, render_sql, CaseDefinition, FieldRef, FieldType, Grain, NonAdditiveDimension, Project,
    TimeFrame, ValueType, View, FIELD_REFERENCE,
};
use crate::error::{MetricsLayerError, Result};

/// How measure references inside a template are rendered
#[derive(Clone, Copy)]
enum Expansion<'s> {
    /// Unaggregated SQL
    Raw,
    /// Fully aggregated SQL; the set names views needing symmetric aggregates
    Aggregate(&'s BTreeSet<String>),
}

/// The CTE holding the max (or min) of a measure's non-additive dimension
#[derive(Debug, Clone)]
pub struct NonAdditiveWindow<'p> {
    pub measure: FieldRef<'p>,
    pub dimension: FieldRef<'p>,
    pub groupings: Vec<FieldRef<'p>>,
    pub definition: &'p NonAdditiveDimension,
    pub cte_alias: String,
    /// Column of the CTE holding the window's max or min
    pub column: String,
}

impl<'p> NonAdditiveWindow<'p> {
    /// Column name of a group-by field inside the CTE
    pub fn grouping_column(field: FieldRef<'_>) -> String {
        format!("{}_{}", field.view.name, field.alias())
    }
}

pub struct FieldSqlExpander<'p> {
    project: &'p Project,
    ctx: &'p CompileContext,
    memo: RefCell<HashMap<String, String>>,
    in_progress: RefCell<Vec<String>>,
}

impl<'p> FieldSqlExpander<'p> {
    pub fn new(project: &'p Project, ctx: &'p CompileContext) -> Self {
        Self {
            project,
            ctx,
            memo: RefCell::new(HashMap::new()),
            in_progress: RefCell::new(Vec::new()),
        }
    }

    pub fn project(&self) -> &'p Project {
        self.project
    }

    pub fn context(&self) -> &'p CompileContext {
        self.ctx
    }

    /// SQL of a field as it appears in a grouped SELECT: dimensions at their
    /// grain, measures aggregated.
    pub fn sql_query(&self, field: FieldRef<'p>, symmetric_views: &BTreeSet<String>) -> Result<String> {
        if field.is_measure() {
            self.aggregate_sql(field, symmetric_views)
        } else {
            self.raw_sql(field)
        }
    }

    /// Unaggregated SQL. For measures this is the column fed to the aggregate,
    /// with measure filters applied.
    pub fn raw_sql(&self, field: FieldRef<'p>) -> Result<String> {
        if field.is_measure() {
            return self.measure_expression(field);
        }
        let key = field.qualified_name();
        if let Some(sql) = self.memo.borrow().get(&key) {
            return Ok(sql.clone());
        }
        let sql = self.with_cycle_check(field.id(), || self.dimension_sql(field))?;
        self.memo.borrow_mut().insert(key, sql.clone());
        Ok(sql)
    }

    /// Expand a template owned by `view`, e.g. a join condition or a literal filter
    pub fn expand_raw(&self, template: &str, view: &'p View, requester: &str) -> Result<String> {
        self.expand(template, view, requester, Expansion::Raw)
    }

    /// `table alias` or `(derived sql) alias` for a view
    pub fn from_item(&self, view: &View) -> Result<String> {
        let attributes = &self.ctx.user_attributes;
        match (&view.sql_table_name, &view.derived_table) {
            (Some(table), _) => Ok(format!("{} {}", render_sql(table, attributes)?, view.name)),
            (None, Some(derived)) => Ok(format!("({}) {}", render_sql(&derived.sql, attributes)?, view.name)),
            (None, None) => Err(MetricsLayerError::Query(format!(
                "View {} has neither a sql_table_name nor a derived_table",
                view.name
            ))),
        }
    }

    /// Column a window dimension is selected as in its view's
    /// `<view>_window_functions` CTE
    pub fn window_column(field: FieldRef<'_>) -> String {
        format!("{}_{}", field.view.name, field.field.name)
    }

    /// The window expression of a window dimension, as computed inside the CTE
    pub fn window_function_sql(&self, field: FieldRef<'p>) -> Result<String> {
        let template = self.template_or_column(field);
        self.with_cycle_check(field.id(), || self.expand(&template, field.view, &field.id(), Expansion::Raw))
    }

    /// Views the window expression itself reads from
    pub fn window_required_views(&self, field: FieldRef<'p>) -> Result<BTreeSet<String>> {
        let mut views = BTreeSet::from([field.view.name.clone()]);
        for reference in self.referenced_fields(field)? {
            if reference.field.is_window_dimension() {
                return Err(MetricsLayerError::Query(format!(
                    "Window dimension {} references the window dimension {}. Window functions cannot be nested",
                    field.id(),
                    reference.id()
                )));
            }
            views.extend(self.required_views(reference)?);
        }
        Ok(views)
    }

    /// The window CTE a measure with a `non_additive_dimension` reads from
    pub fn non_additive_window(&self, field: FieldRef<'p>) -> Result<Option<NonAdditiveWindow<'p>>> {
        let Some(definition) = &field.field.non_additive_dimension else {
            return Ok(None);
        };
        let dimension = self.resolve_relative(&definition.name, field.view)?;
        if dimension.is_measure() {
            return Err(MetricsLayerError::Model(format!(
                "The non_additive_dimension {} of measure {} must be a dimension, not a measure",
                definition.name,
                field.id()
            )));
        }
        let groupings = definition
            .window_groupings
            .iter()
            .map(|name| self.resolve_relative(name, field.view))
            .collect::<Result<Vec<_>>>()?;
        let cte_alias = format!("cte_{}_{}", field.field.name, dimension.alias());
        let column = format!(
            "{}_{}_{}",
            field.view.name,
            definition.window_choice.as_str(),
            dimension.alias()
        );
        Ok(Some(NonAdditiveWindow {
            measure: field,
            dimension,
            groupings,
            definition,
            cte_alias,
            column,
        }))
    }

    /// Fields referenced directly by this field's templates and filters
    pub fn referenced_fields(&self, field: FieldRef<'p>) -> Result<Vec<FieldRef<'p>>> {
        let f = field.field;
        let mut templates: Vec<&str> = Vec::new();
        templates.extend(f.sql.as_deref());
        templates.extend(f.sql_start.as_deref());
        templates.extend(f.sql_end.as_deref());
        templates.extend(f.sql_distinct_key.as_deref());
        if let Some(case) = &f.case {
            templates.extend(case.whens.iter().map(|w| w.sql.as_str()));
        }

        let mut refs = Vec::new();
        for template in templates {
            let rendered = render_sql(template, &self.ctx.user_attributes)?;
            for token in extract_references(&rendered) {
                if token != "TABLE" {
                    refs.push(self.resolve_token(&token, field.view, &field.id())?);
                }
            }
        }
        for filter in &f.filters {
            refs.push(self.resolve_relative(&filter.field, field.view)?);
        }
        if let Some(measure) = &f.measure {
            refs.push(self.resolve_relative(measure, field.view)?);
        }
        if let Some(window) = self.non_additive_window(field)? {
            refs.push(window.dimension);
            refs.extend(window.groupings);
        }
        Ok(refs)
    }

    /// Leaf fields of a measure: itself, or for `number` measures the fields
    /// it is computed from, without duplicates
    pub fn raw_measure_fields(&self, field: FieldRef<'p>) -> Result<Vec<FieldRef<'p>>> {
        if !field.field.is_number_measure() {
            return Ok(vec![field]);
        }
        let mut leaves: Vec<FieldRef<'p>> = Vec::new();
        self.with_cycle_check(field.id(), || {
            for reference in self.referenced_fields(field)? {
                for leaf in self.raw_measure_fields(reference)? {
                    if !leaves.iter().any(|l| l.same_field(&leaf)) {
                        leaves.push(leaf);
                    }
                }
            }
            Ok(())
        })?;
        Ok(leaves)
    }

    /// Every view a field needs joined in, including its own
    pub fn required_views(&self, field: FieldRef<'p>) -> Result<BTreeSet<String>> {
        let mut views = BTreeSet::from([field.view.name.clone()]);
        if field.field.is_window_dimension() {
            return Ok(views);
        }
        self.with_cycle_check(field.id(), || {
            for reference in self.referenced_fields(field)? {
                if reference.view.name == field.view.name && reference.field.name == field.field.name {
                    continue;
                }
                views.extend(self.required_views(reference)?);
            }
            Ok(())
        })?;
        Ok(views)
    }

    /// Resolves `name` or `view.name` relative to `view`
    pub fn resolve_relative(&self, name: &str, view: &'p View) -> Result<FieldRef<'p>> {
        if name.contains('.') {
            return self.project.find_field(name);
        }
        self.project.find_field_in_view(view, name)
    }

    /// Aggregate an already selected column with the measure's aggregation,
    /// e.g. when re-aggregating the raw rows of a CTE
    pub fn aggregate_column(&self, field: FieldRef<'p>, column: &str) -> Result<String> {
        let dialect = self.ctx.dialect;
        Ok(match field.field.r#type {
            ValueType::Sum | ValueType::SumDistinct => format!("SUM({column})"),
            ValueType::Count => format!("COUNT({column})"),
            ValueType::CountDistinct => format!("COUNT(DISTINCT({column}))"),
            ValueType::Average | ValueType::AverageDistinct => format!("AVG({column})"),
            ValueType::Max => format!("MAX({column})"),
            ValueType::Min => format!("MIN({column})"),
            ValueType::Median if dialect.supports_median() => format!("MEDIAN({column})"),
            other => {
                return Err(MetricsLayerError::Query(format!(
                    "Measure {} of type {} cannot be aggregated over a derived column in {dialect}",
                    field.id(),
                    other.as_str()
                )))
            }
        })
    }

    /// SQL of a number measure with each reference replaced by `column`,
    /// e.g. the column of a CTE that already aggregated it
    pub fn substitute_references(
        &self,
        field: FieldRef<'p>,
        column: &dyn Fn(FieldRef<'p>) -> Result<String>,
    ) -> Result<String> {
        let id = field.id();
        let template = field
            .field
            .sql
            .as_deref()
            .ok_or_else(|| MetricsLayerError::Query(format!("Measure {id} has no sql")))?;
        let rendered = render_sql(template, &self.ctx.user_attributes)?;
        let mut out = String::with_capacity(rendered.len());
        let mut last = 0;
        for m in FIELD_REFERENCE.find_iter(&rendered) {
            out.push_str(&rendered[last..m.start()]);
            last = m.end();
            let token = m.as_str()[2..m.as_str().len() - 1].trim();
            out.push_str(&column(self.resolve_token(token, field.view, &id)?)?);
        }
        out.push_str(&rendered[last..]);
        Ok(out)
    }

    fn dimension_sql(&self, field: FieldRef<'p>) -> Result<String> {
        let f = field.field;
        let requester = field.id();
        match (f.field_type, f.r#type) {
            (FieldType::DimensionGroup, ValueType::Duration) => {
                let Some(Grain::Duration(interval)) = field.grain else {
                    return Err(MetricsLayerError::Query(format!(
                        "Duration dimension group {requester} must be requested with an interval, e.g. days_{}",
                        f.name
                    )));
                };
                let (Some(start), Some(end)) = (&f.sql_start, &f.sql_end) else {
                    return Err(MetricsLayerError::Query(format!(
                        "Duration dimension group {requester} needs both sql_start and sql_end"
                    )));
                };
                let start = self.expand(start, field.view, &requester, Expansion::Raw)?;
                let end = self.expand(end, field.view, &requester, Expansion::Raw)?;
                Ok(duration_sql(&start, &end, interval, self.ctx.dialect))
            }
            (FieldType::DimensionGroup, _) => {
                let template = self.template_or_column(field);
                let sql = self.expand(&template, field.view, &requester, Expansion::Raw)?;
                let sql = self.convert_timezone(sql, field);
                let timeframe = match field.grain {
                    Some(Grain::Time(timeframe)) => timeframe,
                    _ => TimeFrame::Raw,
                };
                Ok(time_grain_sql(
                    &sql,
                    timeframe,
                    self.ctx.dialect,
                    f.datatype,
                    self.ctx.week_start_day,
                ))
            }
            _ => {
                if f.is_window_dimension() {
                    return Ok(format!("{}.{}", field.view.name, Self::window_column(field)));
                }
                if let Some(case) = &f.case {
                    return self.case_sql(case, field);
                }
                let template = self.template_or_column(field);
                let sql = self.expand(&template, field.view, &requester, Expansion::Raw)?;
                if f.r#type == ValueType::Tier {
                    return Ok(tier_sql(&sql, &f.tiers));
                }
                Ok(sql)
            }
        }
    }

    /// Dimensions without SQL read the column of the same name
    fn template_or_column(&self, field: FieldRef<'p>) -> String {
        field
            .field
            .sql
            .clone()
            .unwrap_or_else(|| format!("${{TABLE}}.{}", field.field.name))
    }

    fn convert_timezone(&self, sql: String, field: FieldRef<'p>) -> String {
        let enabled = field
            .field
            .convert_timezone
            .unwrap_or(self.ctx.convert_timezone_default);
        match (&self.ctx.timezone, enabled) {
            (Some(timezone), true) => {
                convert_timezone_sql(&sql, timezone, self.ctx.dialect, field.field.datatype).unwrap_or(sql)
            }
            _ => sql,
        }
    }

    fn case_sql(&self, case: &CaseDefinition, field: FieldRef<'p>) -> Result<String> {
        let requester = field.id();
        let mut parts = vec!["CASE".to_string()];
        for when in &case.whens {
            let condition = self.expand(&when.sql, field.view, &requester, Expansion::Raw)?;
            parts.push(format!("WHEN {condition} THEN {}", quote(&when.label)));
        }
        if let Some(else_label) = &case.else_label {
            parts.push(format!("ELSE {}", quote(else_label)));
        }
        parts.push("END".to_string());
        Ok(parts.join(" "))
    }

    fn measure_expression(&self, field: FieldRef<'p>) -> Result<String> {
        let key = format!("{}#raw", field.id());
        if let Some(sql) = self.memo.borrow().get(&key) {
            return Ok(sql.clone());
        }
        let sql = self.with_cycle_check(field.id(), || {
            let f = field.field;
            let id = field.id();
            let base = match (&f.sql, f.r#type) {
                (_, ValueType::Cumulative) => return Err(cumulative_as_aggregate(&id)),
                (_, ValueType::Number) => {
                    return Err(MetricsLayerError::Query(format!(
                        "Measure {id} of type number has no single column; select the measures it references instead"
                    )))
                }
                (Some(sql), _) => self.expand(sql, field.view, &id, Expansion::Raw)?,
                (None, ValueType::Count) => match field.view.primary_key() {
                    Some(pk) => self.raw_sql(FieldRef::new(field.view, pk, None))?,
                    None if f.filters.is_empty() && f.non_additive_dimension.is_none() => "*".to_string(),
                    None => {
                        return Err(MetricsLayerError::Query(format!(
                            "Count measure {id} has filters or a non_additive_dimension, so it needs either sql or a \
primary key on view {}",
                            field.view.name
                        )))
                    }
                },
                (None, _) => return Err(MetricsLayerError::Query(format!("Measure {id} has no sql"))),
            };
            let mut conditions = Vec::with_capacity(f.filters.len());
            if let Some(window) = self.non_additive_window(field)? {
                conditions.push(format!(
                    "{}={}.{}",
                    self.raw_sql(window.dimension)?,
                    window.cte_alias,
                    window.column
                ));
                for grouping in &window.groupings {
                    conditions.push(format!(
                        "{}={}.{}",
                        self.raw_sql(*grouping)?,
                        window.cte_alias,
                        NonAdditiveWindow::grouping_column(*grouping)
                    ));
                }
            }
            for filter in &f.filters {
                let target = self.resolve_relative(&filter.field, field.view)?;
                let target_sql = self.raw_sql(target)?;
                conditions.push(literal_filter_sql(&target_sql, target, &filter.value, self.ctx)?);
            }
            if conditions.is_empty() {
                return Ok(base);
            }
            Ok(format!("CASE WHEN {} THEN {base} END", conditions.join(" AND ")))
        })?;
        self.memo.borrow_mut().insert(key, sql.clone());
        Ok(sql)
    }

    fn aggregate_sql(&self, field: FieldRef<'p>, symmetric_views: &BTreeSet<String>) -> Result<String> {
        let f = field.field;
        let id = field.id();
        let dialect = self.ctx.dialect;
        match f.r#type {
            ValueType::Number => {
                let sql = f
                    .sql
                    .as_deref()
                    .ok_or_else(|| MetricsLayerError::Query(format!("Measure {id} has no sql")))?;
                self.with_cycle_check(id.clone(), || {
                    self.expand(sql, field.view, &id, Expansion::Aggregate(symmetric_views))
                })
            }
            ValueType::Cumulative => Err(cumulative_as_aggregate(&id)),
            ValueType::CountDistinct => Ok(format!("COUNT(DISTINCT({}))", self.measure_expression(field)?)),
            ValueType::Max => Ok(format!("MAX({})", self.measure_expression(field)?)),
            ValueType::Min => Ok(format!("MIN({})", self.measure_expression(field)?)),
            ValueType::Median => {
                if !dialect.supports_median() {
                    return Err(MetricsLayerError::Query(format!(
                        "Median is not supported in {dialect}. Measure {id} cannot be compiled"
                    )));
                }
                Ok(format!("MEDIAN({})", self.measure_expression(field)?))
            }
            ValueType::Sum | ValueType::Count | ValueType::Average => {
                let sql = self.measure_expression(field)?;
                if symmetric_views.contains(&field.view.name) {
                    if let Some(pk_sql) = self.symmetric_key(field)? {
                        return match f.r#type {
                            ValueType::Sum => symmetric_sum(&sql, &pk_sql, dialect),
                            ValueType::Count => Ok(symmetric_count(&sql, &pk_sql)),
                            _ => symmetric_average(&sql, &pk_sql, dialect),
                        };
                    }
                }
                Ok(match f.r#type {
                    ValueType::Sum => format!("SUM({sql})"),
                    ValueType::Count => format!("COUNT({sql})"),
                    _ => format!("AVG({sql})"),
                })
            }
            ValueType::SumDistinct | ValueType::AverageDistinct => {
                let key = f.sql_distinct_key.as_deref().ok_or_else(|| {
                    MetricsLayerError::Query(format!(
                        "Measure {id} of type {} needs a sql_distinct_key",
                        f.r#type.as_str()
                    ))
                })?;
                let key_sql = self.expand(key, field.view, &id, Expansion::Raw)?;
                let sql = self.measure_expression(field)?;
                if f.r#type == ValueType::SumDistinct {
                    symmetric_sum(&sql, &key_sql, dialect)
                } else {
                    symmetric_average(&sql, &key_sql, dialect)
                }
            }
            other => Err(MetricsLayerError::Query(format!(
                "Measure {id} has type {}, which is not an aggregate",
                other.as_str()
            ))),
        }
    }

    /// Primary key SQL used to de-duplicate fanned-out rows. `None` means the
    /// dialect cannot do it and the plain aggregate is used.
    fn symmetric_key(&self, field: FieldRef<'p>) -> Result<Option<String>> {
        let dialect = self.ctx.dialect;
        if !supports_symmetric_aggregates(dialect) {
            let message = format!(
                "Symmetric aggregates are not supported in {dialect}. The value of {} may be inflated by a one-to-many join",
                field.id()
            );
            if self.ctx.strict_symmetric_aggregates {
                return Err(MetricsLayerError::Query(message));
            }
            self.ctx.warn(message);
            return Ok(None);
        }
        let pk = field.view.primary_key().ok_or_else(|| {
            MetricsLayerError::Query(format!(
                "The primary key for the view {} is not defined. To use symmetric aggregates, you need to define \
the primary key. Define the primary key by adding primary_key: yes to the field that is the primary key of the table.",
                field.view.name
            ))
        })?;
        Ok(Some(self.raw_sql(FieldRef::new(field.view, pk, None))?))
    }

    fn expand(&self, template: &str, view: &'p View, requester: &str, mode: Expansion<'_>) -> Result<String> {
        let rendered = render_sql(template, &self.ctx.user_attributes)?;
        let mut out = String::with_capacity(rendered.len());
        let mut last = 0;
        for m in FIELD_REFERENCE.find_iter(&rendered) {
            out.push_str(&rendered[last..m.start()]);
            last = m.end();
            let token = m.as_str()[2..m.as_str().len() - 1].trim();
            if token == "TABLE" {
                out.push_str(&view.name);
                continue;
            }
            let reference = self.resolve_token(token, view, requester)?;
            let sql = match mode {
                Expansion::Aggregate(symmetric_views) if reference.is_measure() => {
                    let sql = self.aggregate_sql(reference, symmetric_views)?;
                    if reference.field.is_number_measure() {
                        format!("({sql})")
                    } else {
                        sql
                    }
                }
                _ => self.raw_sql(reference)?,
            };
            out.push_str(&sql);
        }
        out.push_str(&rendered[last..]);
        Ok(out)
    }

    fn resolve_token(&self, token: &str, view: &'p View, requester: &str) -> Result<FieldRef<'p>> {
        let found = match token.split_once('.') {
            Some((view_name, field_name)) => self.project.get_view(view_name).ok().and_then(|other| {
                other
                    .get_field(field_name)
                    .map(|(field, grain)| FieldRef::new(other, field, grain))
            }),
            None => view
                .get_field(token)
                .map(|(field, grain)| FieldRef::new(view, field, grain)),
        };
        found.ok_or_else(|| {
            MetricsLayerError::Parse(format!(
                "Could not locate reference {token} in field {requester}"
            ))
        })
    }

    fn with_cycle_check<T>(&self, id: String, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.in_progress.borrow().contains(&id) {
            let mut chain = self.in_progress.borrow().clone();
            chain.push(id.clone());
            let start = chain.iter().position(|c| c == &id).unwrap_or(0);
            return Err(MetricsLayerError::Model(format!(
                "Circular reference detected in field {id}: {}",
                chain[start..].join(" -> ")
            )));
        }
        self.in_progress.borrow_mut().push(id);
        let result = f();
        self.in_progress.borrow_mut().pop();
        result
    }
}

fn cumulative_as_aggregate(id: &str) -> MetricsLayerError {
    MetricsLayerError::Query(format!(
        "Cumulative measure {id} cannot be compiled as a plain aggregate. Request it as a metric instead"
    ))
}

fn quote(label: &str) -> String {
    format!("'{}'", label.replace('\'', "''"))
}

/// Formats a tier boundary without a trailing `.0`
pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn tier_sql(sql: &str, tiers: &[f64]) -> String {
    let (Some(first), Some(last)) = (tiers.first(), tiers.last()) else {
        return sql.to_string();
    };
    let mut whens = vec![format!(
        "WHEN {sql} < {t} THEN 'Below {t}'",
        t = format_number(*first)
    )];
    for pair in tiers.windows(2) {
        let (low, high) = (format_number(pair[0]), format_number(pair[1]));
        whens.push(format!("WHEN {sql} >= {low} AND {sql} < {high} THEN '[{low},{high})'"));
    }
    whens.push(format!(
        "WHEN {sql} >= {t} THEN '[{t},inf)'",
        t = format_number(*last)
    ));
    format!("CASE {} ELSE 'Unknown' END", whens.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CaseWhen, Field, Identifier, Interval};
    use crate::sql::Dialect;

    fn create_test_project() -> Project {
        let orders = View::new("orders")
            .with_table("analytics.orders")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("status", "${TABLE}.status"))
            .with_field(Field::dimension("amount", "${TABLE}.amount").with_type(ValueType::Number))
            .with_field(Field::time_group(
                "order",
                "${TABLE}.order_date",
                vec![TimeFrame::Date, TimeFrame::Month],
            ))
            .with_field(Field::time_group("shipped", "${TABLE}.shipped_at", vec![]))
            .with_field(Field::duration_group("waiting", "${order}", "${shipped}", vec![Interval::Day]))
            .with_field(Field::dimension("amount_tier", "${amount}").with_tiers(vec![0.0, 10.0, 100.5]))
            .with_field(Field::dimension("status_group", "").with_case(CaseDefinition {
                whens: vec![CaseWhen {
                    sql: "${status} = 'done'".to_string(),
                    label: "Finished".to_string(),
                }],
                else_label: Some("Other".to_string()),
            }))
            .with_field(Field::sum("total_revenue", "${amount}"))
            .with_field(Field::count("number_of_orders"))
            .with_field(Field::sum("completed_revenue", "${amount}").with_filter("status", "done"))
            .with_field(Field::number("revenue_per_order", "${total_revenue} / NULLIF(${number_of_orders}, 0)"))
            .with_field(Field::number("doubled_ratio", "${revenue_per_order} * 2"))
            .with_field(Field::measure("median_amount", ValueType::Median, "${amount}"))
            .with_field(Field::cumulative("cumulative_revenue", "total_revenue"))
            .with_field(Field::dimension("customer_name", "${customers.name}"))
            .with_identifier(Identifier::primary("order_id", "${id}"));
        let customers = View::new("customers")
            .with_table("analytics.customers")
            .with_field(Field::dimension("name", "${TABLE}.name"))
            .with_field(Field::sum("lifetime_value", "${TABLE}.ltv"));
        let loops = View::new("loops")
            .with_table("analytics.loops")
            .with_field(Field::dimension("a", "${b}"))
            .with_field(Field::dimension("b", "${a}"))
            .with_field(Field::dimension("broken", "${missing}"));
        Project::new(vec![], vec![orders, customers, loops], vec![])
    }

    fn field<'p>(project: &'p Project, name: &str) -> FieldRef<'p> {
        project.find_field(name).unwrap()
    }

    #[test]
    fn test_table_and_reference_expansion() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Snowflake);
        let expander = FieldSqlExpander::new(&project, &ctx);

        assert_eq!(expander.raw_sql(field(&project, "orders.amount")).unwrap(), "orders.amount");
        assert_eq!(
            expander.raw_sql(field(&project, "orders.customer_name")).unwrap(),
            "customers.name"
        );
        assert_eq!(
            expander.raw_sql(field(&project, "orders.order_date")).unwrap(),
            "DATE_TRUNC('DAY', orders.order_date)"
        );
    }

    #[test]
    fn test_plain_and_symmetric_aggregates() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Postgres);
        let expander = FieldSqlExpander::new(&project, &ctx);
        let none = BTreeSet::new();
        let orders = BTreeSet::from(["orders".to_string()]);

        let count = field(&project, "orders.number_of_orders");
        assert_eq!(expander.sql_query(count, &none).unwrap(), "COUNT(orders.id)");
        assert_eq!(
            expander.sql_query(count, &orders).unwrap(),
            "NULLIF(COUNT(DISTINCT CASE WHEN orders.id IS NOT NULL THEN orders.id ELSE NULL END),0)"
        );

        let revenue = field(&project, "orders.total_revenue");
        assert_eq!(expander.sql_query(revenue, &none).unwrap(), "SUM(orders.amount)");
        assert!(expander.sql_query(revenue, &orders).unwrap().contains("SUM(DISTINCT"));
    }

    #[test]
    fn test_symmetric_without_primary_key_fails() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Snowflake);
        let expander = FieldSqlExpander::new(&project, &ctx);
        let customers = BTreeSet::from(["customers".to_string()]);

        let err = expander
            .sql_query(field(&project, "customers.lifetime_value"), &customers)
            .unwrap_err();
        assert!(err.to_string().contains("primary_key: yes"));
    }

    #[test]
    fn test_unsupported_symmetric_dialect_warns() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Druid);
        let expander = FieldSqlExpander::new(&project, &ctx);
        let orders = BTreeSet::from(["orders".to_string()]);

        let sql = expander
            .sql_query(field(&project, "orders.total_revenue"), &orders)
            .unwrap();
        assert_eq!(sql, "SUM(orders.amount)");
        assert_eq!(ctx.warnings().len(), 1);

        let strict = CompileContext::new(Dialect::Druid).with_strict_symmetric_aggregates(true);
        let expander = FieldSqlExpander::new(&project, &strict);
        assert!(expander
            .sql_query(field(&project, "orders.total_revenue"), &orders)
            .is_err());
    }

    #[test]
    fn test_number_measures_nest_aggregates() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Snowflake);
        let expander = FieldSqlExpander::new(&project, &ctx);
        let none = BTreeSet::new();

        assert_eq!(
            expander
                .sql_query(field(&project, "orders.revenue_per_order"), &none)
                .unwrap(),
            "SUM(orders.amount) / NULLIF(COUNT(orders.id), 0)"
        );
        assert_eq!(
            expander.sql_query(field(&project, "orders.doubled_ratio"), &none).unwrap(),
            "(SUM(orders.amount) / NULLIF(COUNT(orders.id), 0)) * 2"
        );

        let leaves: Vec<String> = expander
            .raw_measure_fields(field(&project, "orders.doubled_ratio"))
            .unwrap()
            .iter()
            .map(FieldRef::id)
            .collect();
        assert_eq!(leaves, vec!["orders.total_revenue", "orders.number_of_orders"]);
    }

    #[test]
    fn test_measure_filters_become_case_when() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Snowflake);
        let expander = FieldSqlExpander::new(&project, &ctx);

        assert_eq!(
            expander
                .sql_query(field(&project, "orders.completed_revenue"), &BTreeSet::new())
                .unwrap(),
            "SUM(CASE WHEN orders.status='done' THEN orders.amount END)"
        );
    }

    #[test]
    fn test_tiers_case_and_duration() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Snowflake);
        let expander = FieldSqlExpander::new(&project, &ctx);

        assert_eq!(
            expander.raw_sql(field(&project, "orders.amount_tier")).unwrap(),
            "CASE WHEN orders.amount < 0 THEN 'Below 0' \
WHEN orders.amount >= 0 AND orders.amount < 10 THEN '[0,10)' \
WHEN orders.amount >= 10 AND orders.amount < 100.5 THEN '[10,100.5)' \
WHEN orders.amount >= 100.5 THEN '[100.5,inf)' ELSE 'Unknown' END"
        );
        assert_eq!(
            expander.raw_sql(field(&project, "orders.status_group")).unwrap(),
            "CASE WHEN orders.status = 'done' THEN 'Finished' ELSE 'Other' END"
        );
        let waiting = expander.raw_sql(field(&project, "orders.days_waiting")).unwrap();
        assert!(waiting.contains("orders.order_date"));
        assert!(waiting.contains("orders.shipped_at"));
    }

    #[test]
    fn test_median_unsupported_on_postgres() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Postgres);
        let expander = FieldSqlExpander::new(&project, &ctx);
        assert!(expander
            .sql_query(field(&project, "orders.median_amount"), &BTreeSet::new())
            .is_err());
    }

    #[test]
    fn test_cumulative_is_not_a_plain_aggregate() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Snowflake);
        let expander = FieldSqlExpander::new(&project, &ctx);
        let err = expander
            .sql_query(field(&project, "orders.cumulative_revenue"), &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, MetricsLayerError::Query(_)));
    }

    #[test]
    fn test_cycles_and_missing_references() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Snowflake);
        let expander = FieldSqlExpander::new(&project, &ctx);

        let err = expander.raw_sql(field(&project, "loops.a")).unwrap_err();
        assert!(matches!(err, MetricsLayerError::Model(_)));

        let err = expander.raw_sql(field(&project, "loops.broken")).unwrap_err();
        assert!(matches!(err, MetricsLayerError::Parse(_)));
        assert!(err.to_string().contains("missing"));
        assert!(err.to_string().contains("loops.broken"));
    }

    #[test]
    fn test_required_views_follow_references() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Snowflake);
        let expander = FieldSqlExpander::new(&project, &ctx);

        let views = expander
            .required_views(field(&project, "orders.customer_name"))
            .unwrap();
        assert_eq!(
            views,
            BTreeSet::from(["customers".to_string(), "orders".to_string()])
        );
    }

    #[test]
    fn test_timezone_conversion() {
        let project = create_test_project();
        let ctx = CompileContext::new(Dialect::Snowflake).with_timezone(Some("America/New_York".to_string()));
        let expander = FieldSqlExpander::new(&project, &ctx);
        let sql = expander.raw_sql(field(&project, "orders.order_month")).unwrap();
        assert!(sql.starts_with("DATE_TRUNC('MONTH', CAST(CAST(CONVERT_TIMEZONE('America/New_York'"));
    }
}
