//! Jinja templating of SQL with user attributes

use std::collections::BTreeMap;

use minijinja::{context, Environment};

use crate::error::{MetricsLayerError, Result};

/// Returns true if the SQL contains template syntax
pub fn is_template(sql: &str) -> bool {
    sql.contains("{{") || sql.contains("{%")
}

/// Renders `{{ user_attributes.x }}` style templates. Plain SQL is returned unchanged.
pub fn render_sql(sql: &str, user_attributes: &BTreeMap<String, String>) -> Result<String> {
    if !is_template(sql) {
        return Ok(sql.to_string());
    }
    let env = Environment::new();
    env.render_str(sql, context! { user_attributes => user_attributes })
        .map_err(|e| MetricsLayerError::Parse(format!("Could not render template in SQL {sql}: {e}")))
}
