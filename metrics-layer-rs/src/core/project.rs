//! Project: the aggregate root holding every model, view and topic

use std::collections::{BTreeMap, HashSet};

use super::dependency::check_circular_dependencies;
use super::field::{Field, Grain};
use super::join_graph::JoinGraph;
use super::model::{Mapping, Model};
use super::topic::Topic;
use super::view::View;
use crate::config::{CompileOptions, ConnectionConfig, ProjectConfig};
use crate::error::{MetricsLayerError, Result};
use crate::sql::Dialect;

/// A field selected at a specific grain
#[derive(Debug, Clone, Copy)]
pub struct FieldRef<'p> {
    pub view: &'p View,
    pub field: &'p Field,
    pub grain: Option<Grain>,
}

impl<'p> FieldRef<'p> {
    pub fn new(view: &'p View, field: &'p Field, grain: Option<Grain>) -> Self {
        Self { view, field, grain }
    }

    /// `view.field`, without grain
    pub fn id(&self) -> String {
        format!("{}.{}", self.view.name, self.field.name)
    }

    /// `view.alias`, including the grain suffix
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.view.name, self.alias())
    }

    pub fn alias(&self) -> String {
        self.field.alias(self.grain)
    }

    pub fn with_grain(&self, grain: Option<Grain>) -> Self {
        Self { grain, ..*self }
    }

    pub fn is_measure(&self) -> bool {
        self.field.is_measure()
    }

    pub fn same_field(&self, other: &FieldRef<'_>) -> bool {
        self.view.name == other.view.name && self.field.name == other.field.name && self.grain == other.grain
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    models: Vec<Model>,
    views: Vec<View>,
    topics: Vec<Topic>,
    connections: Vec<ConnectionConfig>,
    options: CompileOptions,
    user_attributes: BTreeMap<String, String>,
    join_graph: JoinGraph,
}

impl Project {
    pub fn new(models: Vec<Model>, views: Vec<View>, topics: Vec<Topic>) -> Self {
        let join_graph = JoinGraph::from_views(&views);
        Self {
            models,
            views,
            topics,
            connections: Vec::new(),
            options: CompileOptions::default(),
            user_attributes: BTreeMap::new(),
            join_graph,
        }
    }

    /// Build and validate a project from loaded configuration
    pub fn from_config(config: ProjectConfig) -> Result<Self> {
        let project = Self::new(config.models, config.views, config.topics)
            .with_connections(config.connections)
            .with_options(config.options.unwrap_or_default());
        project.validate()?;
        Ok(project)
    }

    pub fn with_connections(mut self, connections: Vec<ConnectionConfig>) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_user_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_attributes.insert(name.into(), value.into());
        self
    }

    /// Check definitions that would otherwise fail at compile time
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for view in &self.views {
            if !seen.insert(view.name.as_str()) {
                return Err(MetricsLayerError::Config(format!(
                    "Duplicate view name {} in the project",
                    view.name
                )));
            }
            if view.sql_table_name.is_none() && view.derived_table.is_none() {
                return Err(MetricsLayerError::Config(format!(
                    "View {} needs either a sql_table_name or a derived_table",
                    view.name
                )));
            }
            let mut field_names = HashSet::new();
            for field in &view.fields {
                if field.name.trim().is_empty() {
                    return Err(MetricsLayerError::Config(format!(
                        "View {} has a {} without a name",
                        view.name,
                        if field.is_measure() { "measure" } else { "dimension" }
                    )));
                }
                if !field_names.insert(field.name.as_str()) {
                    return Err(MetricsLayerError::Config(format!(
                        "Duplicate field name {} in view {}",
                        field.name, view.name
                    )));
                }
            }
            if let Some(model_name) = &view.model_name {
                if self.get_model(model_name).is_none() {
                    return Err(MetricsLayerError::Config(format!(
                        "View {} references unknown model {model_name}",
                        view.name
                    )));
                }
            }
        }

        for view in &self.views {
            for field in &view.fields {
                self.validate_non_additive_dimension(view, field)?;
            }
        }

        for topic in &self.topics {
            if !seen.contains(topic.base_view.as_str()) {
                return Err(MetricsLayerError::Config(format!(
                    "Topic {} has unknown base view {}",
                    topic.name, topic.base_view
                )));
            }
            if let Some(view) = topic.views.keys().find(|v| !seen.contains(v.as_str())) {
                return Err(MetricsLayerError::Config(format!(
                    "Topic {} references unknown view {view}",
                    topic.name
                )));
            }
        }

        check_circular_dependencies(&self.views).map_err(MetricsLayerError::Config)
    }

    fn validate_non_additive_dimension(&self, view: &View, field: &Field) -> Result<()> {
        let Some(definition) = &field.non_additive_dimension else {
            return Ok(());
        };
        if !field.is_measure() {
            return Err(MetricsLayerError::Config(format!(
                "Field {}.{} has a non_additive_dimension, which only measures can have",
                view.name, field.name
            )));
        }
        for name in std::iter::once(&definition.name).chain(&definition.window_groupings) {
            let found = if name.contains('.') {
                self.find_field(name)
            } else {
                self.find_field_in_view(view, name)
            };
            match found {
                Ok(reference) if !reference.is_measure() => {}
                _ => {
                    return Err(MetricsLayerError::Config(format!(
                        "The non_additive_dimension of measure {}.{} references {name}, which is not a dimension \
in the project",
                        view.name, field.name
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn user_attributes(&self) -> &BTreeMap<String, String> {
        &self.user_attributes
    }

    pub fn join_graph(&self) -> &JoinGraph {
        &self.join_graph
    }

    pub fn get_model(&self, name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn get_view(&self, name: &str) -> Result<&View> {
        self.views
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| MetricsLayerError::view_not_found(name))
    }

    pub fn get_topic(&self, name: &str) -> Result<&Topic> {
        self.topics
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| MetricsLayerError::AccessDeniedOrDoesNotExist {
                message: format!("Topic {name} not found in the project, or you do not have access to it"),
                object_name: name.to_string(),
                object_type: "topic".to_string(),
            })
    }

    /// The view's declared model, or the only model in the project
    pub fn model_for_view(&self, view: &View) -> Option<&Model> {
        match &view.model_name {
            Some(name) => self.get_model(name),
            None if self.models.len() == 1 => self.models.first(),
            None => None,
        }
    }

    /// Dialect of a named connection
    pub fn connection_dialect(&self, connection: &str) -> Option<Dialect> {
        self.connections
            .iter()
            .find(|c| c.name == connection)
            .map(|c| c.r#type)
    }

    /// Resolve `field`, `view.field` or grain-suffixed names to a field
    pub fn find_field(&self, name: &str) -> Result<FieldRef<'_>> {
        let name = name.trim().to_lowercase();
        if let Some((view_name, field_name)) = name.split_once('.') {
            let view = self
                .get_view(view_name)
                .map_err(|_| MetricsLayerError::field_not_found(&name))?;
            return self.find_field_in_view(view, field_name);
        }

        let matches: Vec<FieldRef<'_>> = self
            .views
            .iter()
            .filter_map(|view| {
                view.get_field(&name)
                    .map(|(field, grain)| FieldRef::new(view, field, grain))
            })
            .collect();

        match matches.len() {
            0 => Err(MetricsLayerError::field_not_found(&name)),
            1 => Ok(matches[0]),
            _ => {
                let names: Vec<String> = matches.iter().map(FieldRef::id).collect();
                Err(MetricsLayerError::Query(format!(
                    "Multiple fields found for the name {name} - those fields were [{}]. \
Please specify a view name like this: 'view_name.field_name'",
                    names.join(", ")
                )))
            }
        }
    }

    pub fn find_field_in_view<'p>(&'p self, view: &'p View, name: &str) -> Result<FieldRef<'p>> {
        view.get_field(name)
            .map(|(field, grain)| FieldRef::new(view, field, grain))
            .ok_or_else(|| MetricsLayerError::field_not_found(&format!("{}.{}", view.name, name)))
    }

    /// Returns true if the name resolves to a real field
    pub fn has_field(&self, name: &str) -> bool {
        self.find_field(name).is_ok()
    }

    /// Mapping declared under `name` in the model, or in any model when none is given
    pub fn get_mapping<'a>(&'a self, model: Option<&'a Model>, name: &str) -> Option<&'a Mapping> {
        match model {
            Some(model) => model.mappings.get(name),
            None => self.models.iter().find_map(|m| m.mappings.get(name)),
        }
    }

    /// Name of the mapping that lists `field_id` among its fields
    pub fn mapping_containing<'a>(
        &'a self,
        model: Option<&'a Model>,
        field_id: &str,
    ) -> Option<(&'a str, &'a Mapping)> {
        let models: Vec<&'a Model> = match model {
            Some(model) => vec![model],
            None => self.models.iter().collect(),
        };
        models.into_iter().find_map(|m| {
            m.mappings
                .iter()
                .find(|(_, mapping)| mapping.fields.iter().any(|f| f.eq_ignore_ascii_case(field_id)))
                .map(|(name, mapping)| (name.as_str(), mapping))
        })
    }

    /// Dimension group a measure is anchored to in time: its `canon_date`,
    /// else its view's `default_date`
    pub fn canon_date<'p>(&'p self, field: FieldRef<'p>) -> Result<Option<FieldRef<'p>>> {
        let name = field
            .field
            .canon_date
            .as_deref()
            .or(field.view.default_date.as_deref());
        let Some(name) = name else {
            return Ok(None);
        };
        let date = if name.contains('.') {
            self.find_field(name)?
        } else {
            self.find_field_in_view(field.view, name)?
        };
        if !date.field.is_dimension_group() {
            return Err(MetricsLayerError::Model(format!(
                "The canon date {name} of {} is not a dimension group",
                field.id()
            )));
        }
        Ok(Some(date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::field::{NonAdditiveDimension, TimeFrame, WindowChoice};
    use crate::core::view::Identifier;

    fn create_test_project() -> Project {
        let model = Model::new("core").with_mapping(
            "source",
            vec!["sessions.utm_source".to_string(), "orders.order_source".to_string()],
        );
        let orders = View::new("orders")
            .with_table("analytics.orders")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("order_source", "${TABLE}.source"))
            .with_field(Field::dimension("status", "${TABLE}.status"))
            .with_field(Field::time_group("order", "${TABLE}.order_date", vec![TimeFrame::Date]))
            .with_identifier(Identifier::primary("order_id", "${id}"));
        let sessions = View::new("sessions")
            .with_table("analytics.sessions")
            .with_field(Field::dimension("id", "${TABLE}.id").with_primary_key())
            .with_field(Field::dimension("utm_source", "${TABLE}.utm_source"));
        Project::new(vec![model], vec![orders, sessions], vec![])
    }

    #[test]
    fn test_find_field_forms() {
        let project = create_test_project();

        let field = project.find_field("status").unwrap();
        assert_eq!(field.id(), "orders.status");

        let field = project.find_field("orders.order_date").unwrap();
        assert_eq!(field.alias(), "order_date");
        assert_eq!(field.qualified_name(), "orders.order_date");
    }

    #[test]
    fn test_ambiguous_field_requires_view() {
        let project = create_test_project();
        let err = project.find_field("id").unwrap_err();
        assert!(matches!(err, MetricsLayerError::Query(_)));
        assert!(err.to_string().contains("view_name.field_name"));
        assert!(project.find_field("sessions.id").is_ok());
    }

    #[test]
    fn test_missing_field() {
        let project = create_test_project();
        assert!(matches!(
            project.find_field("orders.revenue"),
            Err(MetricsLayerError::AccessDeniedOrDoesNotExist { .. })
        ));
        assert!(!project.has_field("nothing"));
    }

    #[test]
    fn test_model_for_view_defaults_to_only_model() {
        let project = create_test_project();
        let view = project.get_view("orders").unwrap();
        assert_eq!(project.model_for_view(view).unwrap().name, "core");
        assert!(project.get_mapping(None, "source").is_some());
    }

    #[test]
    fn test_canon_date_falls_back_to_default_date() {
        let orders = View::new("orders")
            .with_table("analytics.orders")
            .with_default_date("order")
            .with_field(Field::time_group("order", "${TABLE}.order_date", vec![TimeFrame::Date]))
            .with_field(Field::time_group("shipped", "${TABLE}.shipped_at", vec![TimeFrame::Date]))
            .with_field(Field::sum("revenue", "${TABLE}.revenue"))
            .with_field(Field::sum("shipping", "${TABLE}.shipping").with_canon_date("shipped"));
        let project = Project::new(vec![], vec![orders], vec![]);

        let revenue = project.find_field("revenue").unwrap();
        assert_eq!(project.canon_date(revenue).unwrap().unwrap().id(), "orders.order");

        let shipping = project.find_field("shipping").unwrap();
        assert_eq!(project.canon_date(shipping).unwrap().unwrap().id(), "orders.shipped");
    }

    #[test]
    fn test_mapping_containing() {
        let project = create_test_project();
        let (name, mapping) = project.mapping_containing(None, "orders.order_source").unwrap();
        assert_eq!(name, "source");
        assert_eq!(mapping.fields.len(), 2);
        assert!(project.mapping_containing(None, "orders.status").is_none());
    }

    #[test]
    fn test_validate_rejects_duplicate_views() {
        let view = View::new("orders").with_table("analytics.orders");
        let project = Project::new(vec![], vec![view.clone(), view], vec![]);
        assert!(matches!(project.validate(), Err(MetricsLayerError::Config(_))));
    }

    #[test]
    fn test_validate_checks_non_additive_dimension_references() {
        let balance = |definition: NonAdditiveDimension| {
            View::new("balances")
                .with_table("analytics.balances")
                .with_field(Field::dimension("account_id", "${TABLE}.account_id"))
                .with_field(Field::time_group("record", "${TABLE}.record_date", vec![TimeFrame::Date]))
                .with_field(Field::sum("balance", "${TABLE}.balance").with_non_additive_dimension(definition))
        };

        let valid =
            balance(NonAdditiveDimension::new("record_date", WindowChoice::Max).with_window_grouping("account_id"));
        assert!(Project::new(vec![], vec![valid], vec![]).validate().is_ok());

        let unknown =
            balance(NonAdditiveDimension::new("record_date", WindowChoice::Max).with_window_grouping("region"));
        let err = Project::new(vec![], vec![unknown], vec![]).validate().unwrap_err();
        assert!(err.to_string().contains("references region"));
    }

    #[test]
    fn test_validate_rejects_view_without_table() {
        let project = Project::new(vec![], vec![View::new("orders")], vec![]);
        let err = project.validate().unwrap_err();
        assert!(err.to_string().contains("sql_table_name"));
    }
}
