//! Explicitly merged queries
//!
//! `merged_queries` lists complete requests. Each compiles into its own CTE
//! and every query after the first is joined to the first on its
//! `join_fields`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use super::filter::Filter;
use super::generator::{limit_clause, order_by_clause, select_keyword, terminate, with_ctes};
use super::merged::join_condition;
use super::request::QueryRequest;
use super::resolver::Compiler;
use crate::core::{FieldRef, JoinType};
use crate::error::{MetricsLayerError, Result};

#[derive(Debug, Clone, Deserialize)]
struct JoinField {
    field: String,
    source_field: String,
}

/// One validated item of `merged_queries`
struct MergedQuery<'p> {
    request: QueryRequest,
    metrics: Vec<FieldRef<'p>>,
    dimensions: Vec<FieldRef<'p>>,
    /// `(dimension in this query, dimension in the first query)`
    join_on: Vec<(FieldRef<'p>, FieldRef<'p>)>,
    join_type: JoinType,
}

pub(crate) fn compile<'p>(
    compiler: &Compiler<'_, 'p>,
    request: &QueryRequest,
    queries: &[Value],
    semicolon: bool,
) -> Result<String> {
    let dialect = compiler.dialect();
    let mut parsed: Vec<MergedQuery<'p>> = Vec::with_capacity(queries.len());
    let mut join_fields: Vec<Vec<JoinField>> = Vec::with_capacity(queries.len());
    for (index, item) in queries.iter().enumerate() {
        let (query, fields) = parse_item(compiler, request, item, index)?;
        parsed.push(query);
        join_fields.push(fields);
    }
    let Some(first) = parsed.first() else {
        return Err(MetricsLayerError::Query(
            "merged_queries must list at least one query".to_string(),
        ));
    };
    let first_dimensions = first.dimensions.clone();

    for (index, fields) in join_fields.iter().enumerate().skip(1) {
        let mut join_on = Vec::with_capacity(fields.len());
        for join_field in fields {
            let field = find_dimension(compiler, &parsed[index].dimensions, &join_field.field)
                .ok_or_else(|| missing_join_field(&join_field.field, index + 1))?;
            let source = find_dimension(compiler, &first_dimensions, &join_field.source_field)
                .ok_or_else(|| missing_join_field(&join_field.source_field, 1))?;
            join_on.push((field, source));
        }
        parsed[index].join_on = join_on;
    }

    let mut ctes = Vec::with_capacity(parsed.len());
    for (index, query) in parsed.iter().enumerate() {
        ctes.push((cte_name(index), compiler.compile(&query.request, false)?));
    }

    let mut select = Vec::new();
    let mut columns: BTreeMap<String, String> = BTreeMap::new();
    for (index, query) in parsed.iter().enumerate() {
        let cte = cte_name(index);
        for field in query.metrics.iter().chain(&query.dimensions) {
            if query.join_on.iter().any(|(joined, _)| joined.same_field(field)) {
                continue;
            }
            let alias = field.alias();
            if columns.contains_key(&alias) {
                continue;
            }
            let column = format!("{cte}.{alias}");
            select.push(format!("{column} as {alias}"));
            columns.insert(alias, column);
        }
    }

    let first_cte = cte_name(0);
    let mut sql = format!(
        "{}{} FROM {first_cte}",
        select_keyword(dialect, request.limit),
        select.join(", ")
    );
    for (index, query) in parsed.iter().enumerate().skip(1) {
        let cte = cte_name(index);
        if query.join_type == JoinType::Cross || query.join_on.is_empty() {
            sql.push_str(&format!(" CROSS JOIN {cte}"));
            continue;
        }
        let on: Vec<String> = query
            .join_on
            .iter()
            .map(|(field, source)| {
                join_condition(
                    dialect,
                    (&format!("{first_cte}.{}", source.alias()), *source),
                    (&format!("{cte}.{}", field.alias()), *field),
                )
            })
            .collect();
        sql.push_str(&format!(" {} {cte} ON {}", query.join_type.as_sql(), on.join(" and ")));
    }

    let mut ctes_for_filters = Vec::new();
    let mut filters: Vec<Filter<'p>> = Vec::new();
    for clause in request.where_clause.iter().chain(&request.having) {
        filters.extend(compiler.bind_filters(clause, &mut ctes_for_filters)?);
    }
    if !filters.is_empty() {
        let column = |field: FieldRef<'p>| -> Result<String> {
            columns.get(&field.alias()).cloned().ok_or_else(|| {
                MetricsLayerError::Query(format!(
                    "The field {} is filtered on but is not selected by any of the merged queries",
                    field.id()
                ))
            })
        };
        let ctx = compiler.context();
        let conditions = filters
            .iter()
            .map(|f| f.render(ctx, &column))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }
    ctes.extend(ctes_for_filters);

    let entries: Vec<(String, bool)> = compiler
        .order_by(request)?
        .iter()
        .map(|order| (order.field.alias(), order.descending))
        .collect();
    sql.push_str(&order_by_clause(&entries, dialect));
    sql.push_str(&limit_clause(dialect, request.limit));

    Ok(terminate(with_ctes(&ctes, sql), dialect, semicolon))
}

fn cte_name(index: usize) -> String {
    format!("merged_query_{index}")
}

fn parse_item<'p>(
    compiler: &Compiler<'_, 'p>,
    outer: &QueryRequest,
    item: &Value,
    index: usize,
) -> Result<(MergedQuery<'p>, Vec<JoinField>)> {
    let has = |key: &str| item.get(key).is_some();
    if !(item.is_object() && has("metrics") && has("dimensions")) {
        return Err(MetricsLayerError::Query(
            "Each item in merged_queries must have 'metrics' and 'dimensions' keys.".to_string(),
        ));
    }
    if has("funnel") {
        return Err(MetricsLayerError::Query(
            "Funnel queries are not supported in merged_queries".to_string(),
        ));
    }

    let mut join_fields = Vec::new();
    if index > 0 {
        let listed = item.get("join_fields").ok_or_else(|| {
            MetricsLayerError::Query(
                "Each item in merged_queries after the first must have 'join_fields' key.".to_string(),
            )
        })?;
        let parsed: Vec<JoinField> = serde_json::from_value(listed.clone()).map_err(|_| {
            MetricsLayerError::Query(
                "Each item in join_fields must be an object with the keys 'field' and 'source_field'".to_string(),
            )
        })?;
        join_fields = parsed
            .into_iter()
            .map(|j| JoinField {
                field: j.field.trim().to_lowercase(),
                source_field: j.source_field.trim().to_lowercase(),
            })
            .collect();
    }
    let join_type = match item.get("join_type") {
        Some(value) => JoinType::deserialize(value).map_err(|_| {
            MetricsLayerError::Query(format!(
                "The join_type {value} is not valid. Use one of left_outer, inner, full_outer or cross"
            ))
        })?,
        None => JoinType::default(),
    };

    let mut request: QueryRequest = serde_json::from_value(item.clone())
        .map_err(|e| MetricsLayerError::Parse(format!("Could not parse item {} of merged_queries: {e}", index + 1)))?;
    if request.model.is_none() {
        request.model = outer.model.clone();
    }
    let (request, _) = compiler.resolve_mappings(&request)?;
    let metrics = compiler.fields(&request.metrics)?;
    let dimensions = compiler.fields(&request.dimensions)?;
    Ok((
        MergedQuery {
            request,
            metrics,
            dimensions,
            join_on: Vec::new(),
            join_type,
        },
        join_fields,
    ))
}

/// The dimension of a query a join field names, directly or through a mapping
fn find_dimension<'p>(compiler: &Compiler<'_, 'p>, dimensions: &[FieldRef<'p>], name: &str) -> Option<FieldRef<'p>> {
    let named = compiler.project.find_field(name).ok();
    let mapping = compiler.project.get_mapping(compiler.model, name);
    dimensions.iter().copied().find(|dimension| {
        dimension.alias() == name
            || dimension.qualified_name() == name
            || named.is_some_and(|field| field.same_field(dimension))
            || mapping.is_some_and(|m| m.fields.iter().any(|f| f.eq_ignore_ascii_case(&dimension.id())))
    })
}

fn missing_join_field(name: &str, query_number: usize) -> MetricsLayerError {
    MetricsLayerError::join(format!(
        "Join field {name} not found in the query number {query_number}. To be used as a join the field must \
be included in query {query_number}."
    ))
}
