//! Loading project definitions from YAML strings, files and directories

use std::path::Path;

use tracing::debug;

use super::schema::{ConfigObject, ProjectConfig};
use crate::core::Project;
use crate::error::{MetricsLayerError, Result};

/// Parse one YAML document into a config without validating it
pub fn parse_document(yaml: &str) -> Result<ProjectConfig> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let is_single_object = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| matches!(t, "model" | "view" | "topic"))
        .unwrap_or(false);

    if is_single_object {
        let object: ConfigObject = serde_yaml::from_value(value)?;
        Ok(object.into())
    } else {
        Ok(serde_yaml::from_value(value)?)
    }
}

/// Load a project from a YAML string
pub fn load_from_string(yaml: &str) -> Result<Project> {
    Project::from_config(parse_document(yaml)?)
}

/// Load a project from a single YAML file
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Project> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    load_from_string(&contents)
}

/// Load every `.yml`/`.yaml` file under a directory into one project
pub fn load_from_directory(dir: impl AsRef<Path>) -> Result<Project> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(MetricsLayerError::Config(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    collect_yaml_files(dir, &mut files)?;
    files.sort();

    let mut config = ProjectConfig::default();
    for file in &files {
        debug!(path = %file.display(), "loading definitions");
        let contents = std::fs::read_to_string(file)?;
        let document = parse_document(&contents).map_err(|e| {
            MetricsLayerError::Config(format!("Failed to load {}: {e}", file.display()))
        })?;
        config.merge(document);
    }

    Project::from_config(config)
}

fn collect_yaml_files(dir: &Path, files: &mut Vec<std::path::PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_yaml_files(&path, files)?;
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yml" | "yaml")) {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Dialect;

    #[test]
    fn test_load_project_document() {
        let yaml = r#"
models:
  - name: core
    connection: warehouse
connections:
  - name: warehouse
    type: snowflake
views:
  - name: orders
    sql_table_name: analytics.orders
    fields:
      - name: id
        field_type: dimension
        sql: ${TABLE}.id
        primary_key: true
      - name: total_revenue
        field_type: measure
        type: sum
        sql: ${TABLE}.revenue
options:
  strict_symmetric_aggregates: true
"#;
        let project = load_from_string(yaml).unwrap();
        assert_eq!(project.views().len(), 1);
        assert_eq!(project.connection_dialect("warehouse"), Some(Dialect::Snowflake));
        assert!(project.options().strict_symmetric_aggregates);
    }

    #[test]
    fn test_single_object_document() {
        let yaml = r#"
type: view
name: customers
sql_table_name: analytics.customers
fields:
  - name: customer_id
    sql: ${TABLE}.id
    primary_key: true
"#;
        let config = parse_document(yaml).unwrap();
        assert_eq!(config.views.len(), 1);
        assert_eq!(config.views[0].name, "customers");
    }

    #[test]
    fn test_invalid_project_is_config_error() {
        let yaml = r#"
views:
  - name: orders
"#;
        assert!(matches!(load_from_string(yaml), Err(MetricsLayerError::Config(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(parse_document("views: [name: x"), Err(MetricsLayerError::Yaml(_))));
    }
}
