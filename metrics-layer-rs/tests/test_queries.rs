//! Single-query compilation through the public resolver API

mod common;

use common::{compile, create_test_project};
use metrics_layer::{FilterExpression, FilterSpec, MetricsLayerError, QueryRequest, QueryResolver};
use pretty_assertions::assert_eq;

#[test]
fn test_count_across_fanout_is_symmetric() {
    let project = create_test_project();
    let sql = compile(&project, &QueryRequest::new(["number_of_orders"], ["channel"]));
    assert_eq!(
        sql,
        "SELECT order_lines.sales_channel as channel, NULLIF(COUNT(DISTINCT CASE WHEN orders.id IS NOT NULL \
THEN orders.id ELSE NULL END),0) as number_of_orders FROM analytics.order_line_items order_lines LEFT JOIN \
analytics.orders orders ON order_lines.order_unique_id=orders.id GROUP BY order_lines.sales_channel;"
    );
}

#[test]
fn test_primary_key_dimension_skips_group_by() {
    let project = create_test_project();
    let sql = compile(&project, &QueryRequest::new(["total_item_revenue"], ["order_line_id"]));
    assert_eq!(
        sql,
        "SELECT order_lines.order_line_id as order_line_id, order_lines.revenue as total_item_revenue \
FROM analytics.order_line_items order_lines;"
    );
}

#[test]
fn test_relative_date_filter_uses_configured_now() {
    let project = create_test_project();
    let request = QueryRequest::new(["total_item_revenue"], ["channel"]).with_where(vec![FilterSpec::condition(
        "order_date",
        FilterExpression::Matches,
        "3 days ago",
    )]);
    let sql = compile(&project, &request);
    assert!(sql.contains(">='2024-06-12T00:00:00'"), "{sql}");
    assert!(sql.contains("<='2024-06-12T23:59:59'"), "{sql}");
}

#[test]
fn test_compilation_is_deterministic() {
    let request = QueryRequest::new(["number_of_orders", "total_item_revenue"], ["channel", "status"])
        .with_where(vec![FilterSpec::condition("status", FilterExpression::EqualTo, "complete")])
        .with_limit(10);
    let first = compile(&create_test_project(), &request);
    let second = compile(&create_test_project(), &request);
    assert_eq!(first, second);
}

#[test]
fn test_unknown_field() {
    let project = create_test_project();
    let err = QueryResolver::new(&project)
        .resolve_sql(&QueryRequest::new(["does_not_exist"], ["channel"]))
        .unwrap_err();
    assert!(matches!(err, MetricsLayerError::AccessDeniedOrDoesNotExist { .. }));
}

#[test]
fn test_resolve_reports_connection_and_dialect() {
    let project = create_test_project();
    let compiled = QueryResolver::new(&project)
        .resolve(&QueryRequest::new(["total_item_revenue"], ["channel"]))
        .unwrap();
    assert_eq!(compiled.dialect, metrics_layer::Dialect::Postgres);
    assert_eq!(compiled.connection.as_deref(), Some("warehouse"));
    assert!(compiled.sql.ends_with(';'));
}
