//! Dependency analysis for field SQL
//!
//! Extracts `${...}` references from field definitions and checks the
//! reference graph for cycles.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use super::field::Field;
use super::view::View;

/// `${...}` token; the first group is the reference inside the braces
pub(crate) static FIELD_REFERENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Raw `${...}` tokens in a SQL template, in order of appearance
pub fn extract_references(sql: &str) -> Vec<String> {
    FIELD_REFERENCE
        .captures_iter(sql)
        .map(|cap| cap[1].trim().to_string())
        .collect()
}

/// Extract all field dependencies of a field as `view.field` ids
///
/// Bare references resolve against the owning view. References that do not
/// resolve to a field are skipped; they surface as parse errors at compile
/// time instead.
pub fn extract_dependencies(view: &View, field: &Field, views: &HashMap<&str, &View>) -> HashSet<String> {
    let mut templates: Vec<&str> = Vec::new();
    templates.extend(field.sql.as_deref());
    templates.extend(field.sql_start.as_deref());
    templates.extend(field.sql_end.as_deref());
    if let Some(case) = &field.case {
        templates.extend(case.whens.iter().map(|w| w.sql.as_str()));
    }

    let mut deps = HashSet::new();
    for template in templates {
        for token in extract_references(template) {
            if token == "TABLE" {
                continue;
            }
            if let Some(id) = resolve_reference(&token, view, views) {
                deps.insert(id);
            }
        }
    }

    // Cumulative measures depend on the measure they accumulate
    if let Some(measure) = &field.measure {
        if let Some(id) = resolve_reference(measure, view, views) {
            deps.insert(id);
        }
    }

    deps
}

fn resolve_reference(token: &str, view: &View, views: &HashMap<&str, &View>) -> Option<String> {
    let (target, name) = match token.split_once('.') {
        Some((view_name, name)) => (*views.get(view_name)?, name),
        None => (view, token),
    };
    target
        .get_field(name)
        .map(|(field, _)| format!("{}.{}", target.name, field.name))
}

/// Build a dependency graph for all fields and check for cycles
pub fn check_circular_dependencies(views: &[View]) -> Result<(), String> {
    let by_name: HashMap<&str, &View> = views.iter().map(|v| (v.name.as_str(), v)).collect();

    let mut adj: HashMap<String, HashSet<String>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for view in views {
        for field in &view.fields {
            let id = format!("{}.{}", view.name, field.name);
            adj.insert(id.clone(), extract_dependencies(view, field, &by_name));
            order.push(id);
        }
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut rec_stack: HashSet<String> = HashSet::new();

    fn has_cycle(
        node: &str,
        adj: &HashMap<String, HashSet<String>>,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
    ) -> bool {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());

        if let Some(neighbors) = adj.get(node) {
            for neighbor in neighbors {
                if !visited.contains(neighbor) {
                    if has_cycle(neighbor, adj, visited, rec_stack) {
                        return true;
                    }
                } else if rec_stack.contains(neighbor) {
                    return true;
                }
            }
        }

        rec_stack.remove(node);
        false
    }

    for id in &order {
        if !visited.contains(id) && has_cycle(id, &adj, &mut visited, &mut rec_stack) {
            return Err(format!("Circular reference detected involving field '{id}'"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::field::TimeFrame;

    fn create_test_views() -> Vec<View> {
        vec![
            View::new("orders")
                .with_table("analytics.orders")
                .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
                .with_field(Field::dimension("revenue", "${TABLE}.revenue"))
                .with_field(Field::time_group("order", "${TABLE}.order_date", vec![TimeFrame::Date]))
                .with_field(Field::sum("total_revenue", "${revenue}"))
                .with_field(Field::number("revenue_per_day", "${total_revenue} / ${order_date}")),
            View::new("customers")
                .with_table("analytics.customers")
                .with_field(Field::dimension("lifetime_revenue", "${orders.total_revenue}")),
        ]
    }

    #[test]
    fn test_extract_dependencies() {
        let views = create_test_views();
        let by_name: HashMap<&str, &View> = views.iter().map(|v| (v.name.as_str(), v)).collect();

        let field = &views[0].fields[4];
        let deps = extract_dependencies(&views[0], field, &by_name);
        assert!(deps.contains("orders.total_revenue"));
        assert!(deps.contains("orders.order"));

        let cross = extract_dependencies(&views[1], &views[1].fields[0], &by_name);
        assert!(cross.contains("orders.total_revenue"));
    }

    #[test]
    fn test_table_token_is_not_a_dependency() {
        let views = create_test_views();
        let by_name: HashMap<&str, &View> = views.iter().map(|v| (v.name.as_str(), v)).collect();
        assert!(extract_dependencies(&views[0], &views[0].fields[0], &by_name).is_empty());
    }

    #[test]
    fn test_extract_references_trims_tokens() {
        assert_eq!(
            extract_references("${TABLE}.id + ${ orders.revenue } - ${shipping}"),
            vec!["TABLE", "orders.revenue", "shipping"]
        );
        assert!(extract_references("SUM(amount)").is_empty());
    }

    #[test]
    fn test_no_cycles() {
        assert!(check_circular_dependencies(&create_test_views()).is_ok());
    }

    #[test]
    fn test_detects_cycle() {
        let views = vec![View::new("orders")
            .with_table("analytics.orders")
            .with_field(Field::dimension("a", "${b} + 1"))
            .with_field(Field::dimension("b", "${a} + 1"))];

        let err = check_circular_dependencies(&views).unwrap_err();
        assert!(err.contains("Circular reference"));
    }
}
