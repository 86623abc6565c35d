//! Shared fixtures for integration tests

#![allow(dead_code)]

use metrics_layer::{load_from_string, Project, QueryRequest, QueryResolver};

/// Order lines fan out from orders; sessions are only reachable through the `source` mapping
pub const PROJECT_YAML: &str = r#"
models:
  - name: core
    connection: warehouse
    mappings:
      source:
        fields: [order_lines.channel, sessions.utm_source]
connections:
  - name: warehouse
    type: postgres
options:
  now: "2024-06-15T10:00:00"
views:
  - name: order_lines
    model_name: core
    sql_table_name: analytics.order_line_items
    default_date: order
    identifiers:
      - name: order_id
        type: foreign
        sql: ${TABLE}.order_unique_id
    fields:
      - name: order_line_id
        field_type: dimension
        sql: ${TABLE}.order_line_id
        primary_key: true
      - name: channel
        field_type: dimension
        sql: ${TABLE}.sales_channel
      - name: order
        field_type: dimension_group
        type: time
        sql: ${TABLE}.order_date
        timeframes: [raw, date, week, month]
      - name: total_item_revenue
        field_type: measure
        type: sum
        sql: ${TABLE}.revenue
  - name: orders
    model_name: core
    sql_table_name: analytics.orders
    identifiers:
      - name: order_id
        type: primary
        sql: ${TABLE}.id
    fields:
      - name: id
        field_type: dimension
        sql: ${TABLE}.id
        primary_key: true
      - name: status
        field_type: dimension
        sql: ${TABLE}.status
      - name: number_of_orders
        field_type: measure
        type: count
        sql: ${id}
  - name: sessions
    model_name: core
    sql_table_name: analytics.sessions
    default_date: session
    fields:
      - name: session_id
        field_type: dimension
        sql: ${TABLE}.id
        primary_key: true
      - name: utm_source
        field_type: dimension
        sql: ${TABLE}.utm_source
      - name: session
        field_type: dimension_group
        type: time
        sql: ${TABLE}.session_date
        timeframes: [raw, date, week, month]
      - name: number_of_sessions
        field_type: measure
        type: count
        sql: ${session_id}
"#;

pub fn create_test_project() -> Project {
    load_from_string(PROJECT_YAML).expect("test project should load")
}

pub fn compile(project: &Project, request: &QueryRequest) -> String {
    QueryResolver::new(project)
        .resolve_sql(request)
        .expect("request should compile")
}
