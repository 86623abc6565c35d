//! Non-additive dimensions and window functions declared in YAML

use metrics_layer::{load_from_string, FilterExpression, FilterSpec, Project, QueryRequest, QueryResolver};
use pretty_assertions::assert_eq;

const WINDOW_YAML: &str = r#"
models:
  - name: finance
    connection: warehouse
connections:
  - name: warehouse
    type: postgres
views:
  - name: mrr
    model_name: finance
    sql_table_name: analytics.mrr_by_customer
    fields:
      - name: plan_name
        field_type: dimension
        sql: ${TABLE}.plan_name
      - name: record
        field_type: dimension_group
        type: time
        sql: ${TABLE}.record_date
        timeframes: [raw, date]
      - name: mrr_end_of_month
        field_type: measure
        type: sum
        sql: ${TABLE}.mrr
        non_additive_dimension:
          name: record_raw
          window_choice: max
  - name: order_lines
    model_name: finance
    sql_table_name: analytics.order_line_items
    fields:
      - name: product_name
        field_type: dimension
        sql: ${TABLE}.product_name
      - name: total_item_revenue
        field_type: measure
        type: sum
        sql: ${TABLE}.revenue
      - name: pct_of_total_item_revenue
        field_type: measure
        type: number
        sql: RATIO_TO_REPORT((${total_item_revenue})) OVER ()
"#;

fn create_window_project() -> Project {
    load_from_string(WINDOW_YAML).expect("window project should load")
}

fn compile(project: &Project, request: &QueryRequest) -> String {
    QueryResolver::new(project)
        .resolve_sql(request)
        .expect("request should compile")
}

#[test]
fn test_non_additive_measure_from_yaml() {
    let project = create_window_project();
    let request = QueryRequest::new(["mrr_end_of_month"], ["plan_name"]).with_where(vec![FilterSpec::condition(
        "plan_name",
        FilterExpression::EqualTo,
        "Enterprise",
    )]);
    let sql = compile(&project, &request);
    let cte = "cte_mrr_end_of_month_record_raw";
    assert_eq!(
        sql,
        format!(
            "WITH {cte} AS (SELECT mrr.plan_name as mrr_plan_name, MAX(mrr.record_date) as mrr_max_record_raw \
FROM analytics.mrr_by_customer mrr WHERE mrr.plan_name='Enterprise' GROUP BY mrr.plan_name) \
SELECT mrr.plan_name as plan_name, SUM(CASE WHEN mrr.record_date={cte}.mrr_max_record_raw THEN mrr.mrr END) \
as mrr_end_of_month FROM analytics.mrr_by_customer mrr LEFT JOIN {cte} ON mrr.plan_name={cte}.mrr_plan_name \
WHERE mrr.plan_name='Enterprise' GROUP BY mrr.plan_name;"
        )
    );
}

#[test]
fn test_window_measure_having_from_yaml() {
    let project = create_window_project();
    let request = QueryRequest::new(["pct_of_total_item_revenue"], ["product_name"]).with_having(vec![
        FilterSpec::condition("pct_of_total_item_revenue", FilterExpression::GreaterThan, 0.1),
    ]);
    let sql = compile(&project, &request);
    assert_eq!(
        sql,
        "WITH measure_window_functions AS (SELECT order_lines.product_name as product_name, \
RATIO_TO_REPORT((SUM(order_lines.revenue))) OVER () as pct_of_total_item_revenue FROM \
analytics.order_line_items order_lines GROUP BY order_lines.product_name) SELECT * FROM \
measure_window_functions WHERE pct_of_total_item_revenue>0.1;"
    );
}

#[test]
fn test_non_additive_dimension_must_exist() {
    let yaml = WINDOW_YAML.replace("name: record_raw", "name: recorded_at");
    let err = load_from_string(&yaml).unwrap_err();
    assert!(err.to_string().contains("references recorded_at"));
}
