//! Query resolution
//!
//! [`QueryResolver`] picks the model, dialect and connection for a request,
//! resolves mapped field names, enforces access grants and compiles the
//! request. A request whose views cannot be joined in one query is compiled
//! again as a merged result unless the caller asked for a single query.

use std::collections::{BTreeMap, BTreeSet};

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

use super::context::{now_in_timezone, CompileContext};
use super::dialect::Dialect;
use super::expand::FieldSqlExpander;
use super::filter::{access_filters, always_filters, bind_clause, Filter, FilterClause, FilterSpec};
use super::generator::{OrderBy, QueryGenerator, QueryPlan};
use super::request::{OrderByClause, OrderBySpec, QueryRequest, SortDirection};
use super::{arbitrary, cumulative, funnel, merged};
use crate::core::{FieldRef, Grain, Model, Project, TimeFrame, Topic, View};
use crate::error::{MetricsLayerError, Result};

/// Dimension names that resolve to the canon date of the query's metrics
const DATE_MAPPINGS: [&str; 5] = ["date", "week", "month", "quarter", "year"];

/// SQL for a request along with what it was compiled for
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub dialect: Dialect,
    /// Connection of the chosen model, if it names one
    pub connection: Option<String>,
    pub warnings: Vec<String>,
}

pub struct QueryResolver<'p> {
    project: &'p Project,
}

impl<'p> QueryResolver<'p> {
    pub fn new(project: &'p Project) -> Self {
        Self { project }
    }

    pub fn resolve(&self, request: &QueryRequest) -> Result<CompiledQuery> {
        let topic = request
            .topic
            .as_deref()
            .map(|name| self.project.get_topic(name))
            .transpose()?;
        let model = self.choose_model(request, topic)?;
        let (dialect, connection) = self.choose_dialect(request, model)?;
        let ctx = self.context(request, model, dialect)?;
        let expander = FieldSqlExpander::new(self.project, &ctx);
        let compiler = Compiler {
            project: self.project,
            model,
            topic,
            expander: &expander,
        };

        if let Some(model) = model {
            compiler.check_grants(Some(model), &model.required_access_grants, "model", &model.name)?;
        }
        if let Some(topic) = topic {
            compiler.check_grants(model, &topic.required_access_grants, "topic", &topic.name)?;
        }

        let sql = match &request.merged_queries {
            Some(queries) => arbitrary::compile(&compiler, request, queries, true)?,
            None => compiler.compile(request, true)?,
        };
        debug!(dialect = %dialect, model = model.map(|m| m.name.as_str()), "resolved query");
        Ok(CompiledQuery {
            sql,
            dialect,
            connection,
            warnings: ctx.warnings(),
        })
    }

    pub fn resolve_sql(&self, request: &QueryRequest) -> Result<String> {
        Ok(self.resolve(request)?.sql)
    }

    fn choose_model(&self, request: &QueryRequest, topic: Option<&'p Topic>) -> Result<Option<&'p Model>> {
        let named = request
            .model
            .as_deref()
            .or_else(|| topic.and_then(|t| t.model_name.as_deref()));
        if let Some(name) = named {
            return self
                .project
                .get_model(name)
                .map(Some)
                .ok_or_else(|| MetricsLayerError::AccessDeniedOrDoesNotExist {
                    message: format!("Could not find or you do not have access to model {name}"),
                    object_name: name.to_string(),
                    object_type: "model".to_string(),
                });
        }

        let models = self.project.models();
        if models.len() < 2 {
            return Ok(models.first());
        }

        let mut names = request.metrics.clone();
        names.extend(request.dimensions.iter().cloned());
        for query in request.merged_queries.iter().flatten() {
            for key in ["metrics", "dimensions"] {
                let listed = query.get(key).and_then(Value::as_array).into_iter().flatten();
                names.extend(listed.filter_map(Value::as_str).map(str::to_string));
            }
        }
        let found: BTreeSet<&str> = names
            .iter()
            .filter_map(|name| self.project.find_field(name).ok())
            .filter_map(|field| field.view.model_name.as_deref())
            .collect();
        match found.len() {
            1 => Ok(found.first().and_then(|name| self.project.get_model(name))),
            0 => Err(MetricsLayerError::Query(
                "Could not determine the model for this query. Please specify a model to use by passing the \
name of the model using the 'model_name' parameter"
                    .to_string(),
            )),
            _ => Err(MetricsLayerError::Query(format!(
                "More than one model found in this query ({}). Please specify a model to use by either passing \
the name of the model using the 'model_name' parameter or by setting the `model_name` property on the view.",
                found.into_iter().collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    fn choose_dialect(&self, request: &QueryRequest, model: Option<&Model>) -> Result<(Dialect, Option<String>)> {
        let connection = model.and_then(|m| m.connection.clone());
        let dialect = request
            .query_type
            .or_else(|| {
                connection
                    .as_deref()
                    .and_then(|name| self.project.connection_dialect(name))
            })
            .or(self.project.options().default_dialect)
            .ok_or_else(|| {
                MetricsLayerError::Query(
                    "Could not determine query_type. Please have connection information for your warehouse in the \
configuration or explicitly pass the 'query_type' argument"
                        .to_string(),
                )
            })?;
        Ok((dialect, connection))
    }

    fn context(&self, request: &QueryRequest, model: Option<&Model>, dialect: Dialect) -> Result<CompileContext> {
        let options = self.project.options();
        let timezone = model
            .and_then(|m| m.timezone.clone())
            .or_else(|| options.timezone.clone());
        let week_start_day = model
            .and_then(|m| m.week_start_day)
            .or(options.week_start_day)
            .unwrap_or_default();
        let now = match options.now {
            Some(now) => now,
            None => now_in_timezone(timezone.as_deref())?,
        };
        let mut user_attributes = self.project.user_attributes().clone();
        user_attributes.extend(request.user_attributes.clone());

        let mut ctx = CompileContext::new(dialect)
            .with_timezone(timezone)
            .with_week_start_day(week_start_day)
            .with_now(now)
            .with_user_attributes(user_attributes)
            .with_strict_symmetric_aggregates(options.strict_symmetric_aggregates);
        ctx.convert_timezone_default = model.map_or(true, |m| m.default_convert_timezone);
        ctx.suppress_warnings = options.suppress_warnings;
        Ok(ctx)
    }
}

/// Compiles requests for one resolved model and dialect. Nested requests
/// (subquery filters, merged groups) go through the same compiler.
pub(crate) struct Compiler<'a, 'p> {
    pub project: &'p Project,
    pub model: Option<&'p Model>,
    pub topic: Option<&'p Topic>,
    pub expander: &'a FieldSqlExpander<'p>,
}

impl<'a, 'p> Compiler<'a, 'p> {
    pub fn context(&self) -> &'p CompileContext {
        self.expander.context()
    }

    pub fn dialect(&self) -> Dialect {
        self.context().dialect
    }

    /// Look up a field and check the user may query it
    pub fn field(&self, name: &str) -> Result<FieldRef<'p>> {
        let field = self.project.find_field(name)?;
        self.check_access(field)?;
        Ok(field)
    }

    /// Compile a request, falling back to a merged result when its views
    /// have no join path
    pub fn compile(&self, request: &QueryRequest, semicolon: bool) -> Result<String> {
        let (request, forces_merge) = self.resolve_mappings(request)?;
        let has_merged_metric = request
            .metrics
            .iter()
            .filter_map(|name| self.project.find_field(name).ok())
            .any(|field| field.field.is_merged_result);

        if !(request.merged_result || forces_merge || has_merged_metric) {
            match self.compile_single(&request, semicolon) {
                Err(e) if e.is_recoverable_join_error() && !request.single_query => {
                    debug!(error = %e, "no join path between the requested views, compiling a merged result");
                }
                result => return result,
            }
        }
        merged::compile(self, &request, semicolon)
    }

    /// Compile a request as one query, without the merged fallback
    pub fn compile_single(&self, request: &QueryRequest, semicolon: bool) -> Result<String> {
        if let Some(spec) = &request.funnel {
            return funnel::compile(self, request, spec, semicolon);
        }
        let plan = self.plan(request)?;
        for metric in &plan.metrics {
            if cumulative::is_cumulative_metric(self.expander, *metric)? {
                return cumulative::compile(self, &plan, semicolon);
            }
        }
        let design = plan.design(self.expander, self.topic)?;
        QueryGenerator::new(&plan, &design, self.expander).generate(semicolon)
    }

    /// Bind a request's fields and filters, adding the always and access
    /// filters of every view it touches
    pub fn plan(&self, request: &QueryRequest) -> Result<QueryPlan<'p>> {
        let metrics = self.fields(&request.metrics)?;
        let dimensions = self.fields(&request.dimensions)?;
        if let Some(field) = metrics.iter().find(|f| !f.is_measure()) {
            return Err(MetricsLayerError::Query(format!(
                "The field {} is a dimension. Request it under dimensions instead of metrics",
                field.id()
            )));
        }
        if let Some(field) = dimensions.iter().find(|f| f.is_measure()) {
            return Err(MetricsLayerError::Query(format!(
                "The field {} is a measure. Request it under metrics instead of dimensions",
                field.id()
            )));
        }

        let mut ctes = Vec::new();
        let mut where_filters = Vec::new();
        let mut having_filters = Vec::new();
        for clause in request.where_clause.iter().chain(&request.having) {
            for filter in self.bind_filters(clause, &mut ctes)? {
                if filter.is_measure_filter() {
                    having_filters.push(filter);
                } else {
                    where_filters.push(filter);
                }
            }
        }

        let mut views = BTreeSet::new();
        for field in metrics.iter().chain(&dimensions) {
            views.extend(self.expander.required_views(*field)?);
        }
        for filter in where_filters.iter().chain(&having_filters) {
            views.extend(filter.required_views(self.expander)?);
        }
        let mut scoped = self.always_filters(&views)?;
        scoped.extend(self.access_filters(&views)?);
        scoped.extend(where_filters);

        Ok(QueryPlan {
            metrics,
            dimensions,
            where_filters: scoped,
            having_filters,
            order_by: self.order_by(request)?,
            limit: request.limit,
            ctes,
            force_group_by: request.force_group_by,
            raw: false,
        })
    }

    pub fn fields(&self, names: &[String]) -> Result<Vec<FieldRef<'p>>> {
        names.iter().map(|name| self.field(name)).collect()
    }

    pub fn order_by(&self, request: &QueryRequest) -> Result<Vec<OrderBy<'p>>> {
        let Some(clause) = &request.order_by else {
            return Ok(Vec::new());
        };
        clause
            .entries()?
            .iter()
            .map(|entry| {
                let field = self.field(&entry.field)?;
                Ok(match entry.sort {
                    SortDirection::Asc => OrderBy::asc(field),
                    SortDirection::Desc => OrderBy::desc(field),
                })
            })
            .collect()
    }

    /// Bind a where or having clause; `is_in_query` values compile into CTEs
    /// appended to `ctes`
    pub fn bind_filters(&self, clause: &FilterClause, ctes: &mut Vec<(String, String)>) -> Result<Vec<Filter<'p>>> {
        let mut subquery = |value: &Value| self.subquery(value, ctes);
        let filters = bind_clause(self.project, clause, &mut subquery)?;
        for filter in &filters {
            for field in filter.fields() {
                self.check_access(field)?;
            }
        }
        Ok(filters)
    }

    fn subquery(&self, value: &Value, ctes: &mut Vec<(String, String)>) -> Result<(String, String)> {
        let invalid = || {
            MetricsLayerError::Query(format!(
                "The is_in_query filter value must be an object with the keys 'query' and 'field'. It was {value}"
            ))
        };
        let query = value.get("query").filter(|q| q.is_object()).ok_or_else(invalid)?;
        let field_name = value.get("field").and_then(Value::as_str).ok_or_else(invalid)?;
        let mut request: QueryRequest = serde_json::from_value(query.clone())
            .map_err(|e| MetricsLayerError::Parse(format!("Could not parse the is_in_query subquery: {e}")))?;
        if value.get("apply_limit").and_then(Value::as_bool) == Some(false) {
            request.limit = None;
        }

        let field = self.field(field_name)?;
        let column = request
            .dimensions
            .iter()
            .filter_map(|name| self.project.find_field(name).ok())
            .find(|d| d.id() == field.id())
            .map(|d| d.alias())
            .ok_or_else(|| {
                MetricsLayerError::Query(format!(
                    "The field {} is not a dimension of the is_in_query subquery. Add it to the subquery \
dimensions to filter on it",
                    field.id()
                ))
            })?;

        let sql = self.compile(&request, false)?;
        let alias = format!("filter_subquery_{}", ctes.len());
        ctes.push((alias.clone(), sql));
        Ok((alias, column))
    }

    fn always_filters(&self, views: &BTreeSet<String>) -> Result<Vec<Filter<'p>>> {
        let mut sources: Vec<&'p View> = Vec::new();
        for name in views {
            sources.push(self.project.get_view(name)?);
        }

        let mut seen = BTreeSet::new();
        let mut bound = Vec::new();
        let mut keep = |filters: Vec<Filter<'p>>, values: Vec<&String>| {
            for (filter, value) in filters.into_iter().zip(values) {
                let field = filter.fields().first().map(FieldRef::qualified_name).unwrap_or_default();
                if seen.insert((field, value.clone())) {
                    bound.push(filter);
                }
            }
        };
        for view in sources {
            let values = view.always_filter.iter().map(|f| &f.value).collect();
            keep(always_filters(self.project, &view.always_filter, view)?, values);
        }
        if let Some(topic) = self.topic {
            let base = self.project.get_view(&topic.base_view)?;
            let values = topic.always_filter.iter().map(|f| &f.value).collect();
            keep(always_filters(self.project, &topic.always_filter, base)?, values);
        }
        Ok(bound)
    }

    fn access_filters(&self, views: &BTreeSet<String>) -> Result<Vec<Filter<'p>>> {
        let attributes = &self.context().user_attributes;
        let mut bound = Vec::new();
        for name in views {
            if self.topic.is_some_and(|t| t.overrides_access_filters(name)) {
                continue;
            }
            let view = self.project.get_view(name)?;
            bound.extend(access_filters(self.project, &view.access_filters, view, attributes)?);
        }
        if let Some(topic) = self.topic {
            let base = self.project.get_view(&topic.base_view)?;
            bound.extend(access_filters(self.project, &topic.access_filters, base, attributes)?);
        }
        Ok(bound)
    }

    fn check_access(&self, field: FieldRef<'p>) -> Result<()> {
        if self.context().user_attributes.is_empty() {
            return Ok(());
        }
        let model = self.project.model_for_view(field.view).or(self.model);
        if let Some(model) = model {
            self.check_grants(Some(model), &model.required_access_grants, "model", &model.name)?;
        }
        self.check_grants(model, &field.view.required_access_grants, "view", &field.view.name)?;
        self.check_grants(model, &field.field.required_access_grants, "field", &field.id())
    }

    /// Every grant must be defined in the model and allow one of the user's
    /// values for its attribute. Nothing is checked without user attributes.
    pub fn check_grants(
        &self,
        model: Option<&Model>,
        grants: &[String],
        object_type: &str,
        object_name: &str,
    ) -> Result<()> {
        let attributes = &self.context().user_attributes;
        if attributes.is_empty() {
            return Ok(());
        }
        for name in grants {
            let grant = model.and_then(|m| m.get_access_grant(name)).ok_or_else(|| {
                MetricsLayerError::Query(format!(
                    "The access grant {name} required by {object_type} {object_name} is not defined in the model"
                ))
            })?;
            let allowed = attributes.get(&grant.user_attribute).is_some_and(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .any(|v| grant.allowed_values.iter().any(|a| a == v))
            });
            if !allowed {
                return Err(MetricsLayerError::AccessDeniedOrDoesNotExist {
                    message: format!("Could not find or you do not have access to {object_type} {object_name}"),
                    object_name: object_name.to_string(),
                    object_type: object_type.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Replace names that are not fields but mappings with a real field.
    /// Returns the rewritten request and whether it must be merged.
    pub fn resolve_mappings(&self, request: &QueryRequest) -> Result<(QueryRequest, bool)> {
        let names = request.field_names();
        let anchors: Vec<FieldRef<'p>> = names
            .iter()
            .filter_map(|name| self.project.find_field(name).ok())
            .collect();

        let mut replacements = BTreeMap::new();
        let mut forces_merge = false;
        for name in &names {
            let key = name.trim().to_lowercase();
            if replacements.contains_key(&key) {
                continue;
            }
            if !matches!(
                self.project.find_field(&key),
                Err(MetricsLayerError::AccessDeniedOrDoesNotExist { .. })
            ) {
                continue;
            }
            if let Some(timeframe) = date_mapping(&key) {
                let (target, differs) = self.map_date(request, timeframe)?;
                forces_merge |= differs;
                replacements.insert(key, target);
            } else if let Some(mapping) = self.project.get_mapping(self.model, &key) {
                let target = self.map_field(&mapping.fields, &anchors)?;
                replacements.insert(key, target);
            }
        }

        if replacements.is_empty() {
            return Ok((request.clone(), forces_merge));
        }
        debug!(?replacements, forces_merge, "resolved mapped fields");
        Ok((rename_fields(request, &replacements), forces_merge))
    }

    /// Canon date of the first metric at `timeframe`; metrics on different
    /// canon dates can only be answered by a merged result
    fn map_date(&self, request: &QueryRequest, timeframe: TimeFrame) -> Result<(String, bool)> {
        let mut dates: Vec<FieldRef<'p>> = Vec::new();
        for metric in request.metrics.iter().filter_map(|n| self.project.find_field(n).ok()) {
            if let Some(date) = self.project.canon_date(metric)? {
                if !dates.iter().any(|d| d.id() == date.id()) {
                    dates.push(date);
                }
            }
        }
        let first = dates.first().ok_or_else(|| {
            MetricsLayerError::Query(format!(
                "Could not map {} to a date. Add a metric with a canon_date, or a default_date on its view, \
to the query",
                timeframe.as_str()
            ))
        })?;
        Ok((
            first.with_grain(Some(Grain::Time(timeframe))).qualified_name(),
            dates.len() > 1,
        ))
    }

    /// First mapped field joinable from every other field in the request,
    /// else the first in the same merge group, else the first listed
    fn map_field(&self, candidates: &[String], anchors: &[FieldRef<'p>]) -> Result<String> {
        let graph = self.project.join_graph();
        let fields = candidates
            .iter()
            .map(|name| self.project.find_field(name))
            .collect::<Result<Vec<_>>>()?;
        let joinable = |field: &&FieldRef<'p>| {
            anchors.iter().all(|anchor| {
                anchor.view.name == field.view.name || graph.reachable_from(&anchor.view.name).contains(&field.view.name)
            })
        };
        let same_group = |field: &&FieldRef<'p>| {
            anchors
                .first()
                .is_some_and(|anchor| graph.merge_group(&anchor.view.name) == graph.merge_group(&field.view.name))
        };
        fields
            .iter()
            .find(joinable)
            .or_else(|| fields.iter().find(same_group))
            .or(fields.first())
            .map(FieldRef::qualified_name)
            .ok_or_else(|| MetricsLayerError::Model("A mapping must list at least one field".to_string()))
    }
}

fn date_mapping(name: &str) -> Option<TimeFrame> {
    DATE_MAPPINGS
        .contains(&name)
        .then(|| TimeFrame::parse(name))
        .flatten()
}

fn rename_fields(request: &QueryRequest, replacements: &BTreeMap<String, String>) -> QueryRequest {
    let rename = |name: &String| {
        replacements
            .get(&name.trim().to_lowercase())
            .cloned()
            .unwrap_or_else(|| name.clone())
    };
    let mut renamed = request.clone();
    renamed.metrics = request.metrics.iter().map(rename).collect();
    renamed.dimensions = request.dimensions.iter().map(rename).collect();
    renamed.where_clause = request.where_clause.as_ref().map(|c| rename_clause(c, replacements));
    renamed.having = request.having.as_ref().map(|c| rename_clause(c, replacements));
    if let Some(Ok(entries)) = request.order_by.as_ref().map(OrderByClause::entries) {
        let entries = entries
            .into_iter()
            .map(|entry| OrderBySpec {
                field: rename(&entry.field),
                ..entry
            })
            .collect();
        renamed.order_by = Some(OrderByClause::List(entries));
    }
    renamed
}

fn rename_clause(clause: &FilterClause, replacements: &BTreeMap<String, String>) -> FilterClause {
    match clause {
        FilterClause::Literal(text) => FilterClause::Literal(rename_literal(text, replacements)),
        FilterClause::List(specs) => FilterClause::List(specs.iter().map(|s| rename_spec(s, replacements)).collect()),
        FilterClause::Single(spec) => FilterClause::Single(rename_spec(spec, replacements)),
    }
}

fn rename_spec(spec: &FilterSpec, replacements: &BTreeMap<String, String>) -> FilterSpec {
    match spec {
        FilterSpec::Group {
            conditions,
            logical_operator,
        } => FilterSpec::Group {
            conditions: conditions.iter().map(|c| rename_spec(c, replacements)).collect(),
            logical_operator: *logical_operator,
        },
        FilterSpec::Condition {
            field,
            expression,
            value,
        } => FilterSpec::Condition {
            field: replacements
                .get(&field.trim().to_lowercase())
                .cloned()
                .unwrap_or_else(|| field.clone()),
            expression: expression.clone(),
            value: value.clone(),
        },
    }
}

/// Swap whole-word names in a literal filter; `view.name` references are left alone
fn rename_literal(text: &str, replacements: &BTreeMap<String, String>) -> String {
    let mut renamed = text.to_string();
    for (from, to) in replacements {
        let Ok(pattern) = Regex::new(&format!(r"(?i)(^|[^\w.]){}\b", regex::escape(from))) else {
            continue;
        };
        renamed = pattern
            .replace_all(&renamed, |caps: &Captures| format!("{}{to}", &caps[1]))
            .into_owned();
    }
    renamed
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{CompileOptions, ConnectionConfig};
    use crate::core::{Field, Identifier};
    use crate::sql::filter::FilterExpression;

    fn create_test_project() -> Project {
        let model = Model::new("core")
            .with_connection("warehouse")
            .with_mapping("source", vec!["orders.channel".to_string(), "sessions.utm_source".to_string()])
            .with_access_grant("finance_only", "department", vec!["finance".to_string()]);
        let orders = View::new("orders")
            .with_table("analytics.orders")
            .with_model("core")
            .with_default_date("order")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("status", "${TABLE}.status"))
            .with_field(Field::dimension("channel", "${TABLE}.sales_channel"))
            .with_field(Field::dimension("customer_id", "${TABLE}.customer_id"))
            .with_field(Field::time_group(
                "order",
                "${TABLE}.order_date",
                vec![TimeFrame::Date, TimeFrame::Month],
            ))
            .with_field(Field::sum("revenue", "${TABLE}.revenue"))
            .with_field(Field::sum("margin", "${TABLE}.margin").with_required_access_grant("finance_only"))
            .with_identifier(Identifier::primary("order_id", "${TABLE}.id"));
        let sessions = View::new("sessions")
            .with_table("analytics.sessions")
            .with_model("core")
            .with_default_date("session")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("utm_source", "${TABLE}.utm_source"))
            .with_field(Field::time_group(
                "session",
                "${TABLE}.session_date",
                vec![TimeFrame::Date, TimeFrame::Month],
            ))
            .with_field(Field::sum("session_length", "${TABLE}.length"));
        Project::new(vec![model], vec![orders, sessions], vec![])
            .with_connections(vec![ConnectionConfig::new("warehouse", Dialect::Postgres)])
    }

    fn resolve(project: &Project, request: &QueryRequest) -> Result<String> {
        QueryResolver::new(project).resolve_sql(request)
    }

    #[test]
    fn test_dialect_and_connection_come_from_the_model() {
        let project = create_test_project();
        let request = QueryRequest::new(["revenue"], ["status"]);
        let compiled = QueryResolver::new(&project).resolve(&request).unwrap();

        assert_eq!(compiled.dialect, Dialect::Postgres);
        assert_eq!(compiled.connection.as_deref(), Some("warehouse"));
        assert_eq!(
            compiled.sql,
            "SELECT orders.status as status, SUM(orders.revenue) as revenue FROM analytics.orders orders \
GROUP BY orders.status;"
        );

        let snowflake = request.with_query_type(Dialect::Snowflake);
        let sql = resolve(&project, &snowflake).unwrap();
        assert!(sql.ends_with("GROUP BY orders.status ORDER BY revenue DESC NULLS LAST;"));
    }

    #[test]
    fn test_missing_dialect_is_an_error() {
        let project = Project::new(vec![], create_test_project().views().to_vec(), vec![]);
        let err = resolve(&project, &QueryRequest::new(["revenue"], Vec::<String>::new())).unwrap_err();
        assert!(err.to_string().starts_with("Could not determine query_type"));

        let project = project.with_options(CompileOptions::default().with_default_dialect(Dialect::DuckDb));
        assert!(resolve(&project, &QueryRequest::new(["revenue"], Vec::<String>::new())).is_ok());
    }

    #[test]
    fn test_unknown_model_is_denied() {
        let project = create_test_project();
        let request = QueryRequest::new(["revenue"], ["status"]).with_model("finance");
        assert!(matches!(
            resolve(&project, &request),
            Err(MetricsLayerError::AccessDeniedOrDoesNotExist { object_type, .. }) if object_type == "model"
        ));
    }

    #[test]
    fn test_measure_filters_in_where_move_to_having() {
        let project = create_test_project();
        let request = QueryRequest::new(["revenue"], ["status"]).with_where(vec![
            FilterSpec::condition("revenue", FilterExpression::GreaterThan, 100),
            FilterSpec::condition("status", FilterExpression::NotEqualTo, "void"),
        ]);
        let sql = resolve(&project, &request).unwrap();
        assert_eq!(
            sql,
            "SELECT orders.status as status, SUM(orders.revenue) as revenue FROM analytics.orders orders \
WHERE orders.status<>'void' GROUP BY orders.status HAVING SUM(orders.revenue)>100;"
        );
    }

    #[test]
    fn test_access_grants() {
        let project = create_test_project();
        let request = QueryRequest::new(["margin"], ["status"]);

        // No user attributes, nothing to enforce
        assert!(resolve(&project, &request).is_ok());

        let denied = request.clone().with_user_attribute("department", "marketing");
        assert!(matches!(
            resolve(&project, &denied),
            Err(MetricsLayerError::AccessDeniedOrDoesNotExist { object_name, .. }) if object_name == "orders.margin"
        ));

        let allowed = request.with_user_attribute("department", "sales, finance");
        assert!(resolve(&project, &allowed).is_ok());
    }

    #[test]
    fn test_model_mapping_resolves_to_joinable_field() {
        let project = create_test_project();
        let request = QueryRequest::new(["revenue"], ["source"]).with_order_by("source desc");
        let sql = resolve(&project, &request).unwrap();
        assert_eq!(
            sql,
            "SELECT orders.sales_channel as channel, SUM(orders.revenue) as revenue FROM analytics.orders orders \
GROUP BY orders.sales_channel ORDER BY channel DESC NULLS LAST;"
        );
    }

    #[test]
    fn test_date_mapping_uses_canon_date() {
        let project = create_test_project();
        let compiler_request = QueryRequest::new(["revenue"], ["month"]);
        let sql = resolve(&project, &compiler_request).unwrap();
        assert!(sql.starts_with("SELECT DATE_TRUNC('MONTH', CAST(orders.order_date AS TIMESTAMP)) as order_month"));
    }

    #[test]
    fn test_unjoinable_views_fall_back_to_merged_result() {
        let project = create_test_project();
        let request = QueryRequest::new(["revenue", "session_length"], ["date"]);
        let sql = resolve(&project, &request).unwrap();
        assert!(sql.starts_with("WITH "));
        assert!(sql.contains(" FULL OUTER JOIN "));
        assert!(sql.contains("as order_date"));

        let single = QueryRequest::new(["revenue", "session_length"], Vec::<String>::new()).with_single_query();
        assert!(matches!(
            resolve(&project, &single),
            Err(e) if e.is_recoverable_join_error()
        ));
    }

    #[test]
    fn test_is_in_query_compiles_to_cte() {
        let project = create_test_project();
        let request = QueryRequest::new(["revenue"], ["status"]).with_where(vec![FilterSpec::condition(
            "customer_id",
            FilterExpression::IsInQuery,
            json!({
                "query": {"metrics": ["revenue"], "dimensions": ["customer_id"], "having": [
                    {"field": "revenue", "expression": "greater_than", "value": 1000}
                ]},
                "field": "customer_id"
            }),
        )]);
        let sql = resolve(&project, &request).unwrap();
        assert_eq!(
            sql,
            "WITH filter_subquery_0 AS (SELECT orders.customer_id as customer_id, SUM(orders.revenue) as revenue \
FROM analytics.orders orders GROUP BY orders.customer_id HAVING SUM(orders.revenue)>1000) \
SELECT orders.status as status, SUM(orders.revenue) as revenue FROM analytics.orders orders \
WHERE orders.customer_id IN (SELECT DISTINCT customer_id FROM filter_subquery_0) GROUP BY orders.status;"
        );
    }

    #[test]
    fn test_rename_literal_keeps_qualified_names() {
        let replacements = BTreeMap::from([("source".to_string(), "orders.channel".to_string())]);
        assert_eq!(
            rename_literal("source = 'web' and sessions.source is null", &replacements),
            "orders.channel = 'web' and sessions.source is null"
        );
    }
}
