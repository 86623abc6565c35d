//! YAML schema for project definitions and compile options

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::core::{Model, Topic, View, WeekStartDay};
use crate::sql::Dialect;

/// Named warehouse connection; only its dialect matters to compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub r#type: Dialect,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, r#type: Dialect) -> Self {
        Self {
            name: name.into(),
            r#type,
        }
    }
}

/// Project-wide compilation settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Dialect used when neither the request nor the connection names one
    pub default_dialect: Option<Dialect>,
    /// Fallback timezone for models that do not declare one
    pub timezone: Option<String>,
    pub week_start_day: Option<WeekStartDay>,
    /// Fixed "now" for relative date filters
    pub now: Option<NaiveDateTime>,
    /// Fail instead of warning when a dialect cannot compute symmetric aggregates
    pub strict_symmetric_aggregates: bool,
    pub suppress_warnings: bool,
}

impl CompileOptions {
    pub fn with_default_dialect(mut self, dialect: Dialect) -> Self {
        self.default_dialect = Some(dialect);
        self
    }

    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn with_strict_symmetric_aggregates(mut self) -> Self {
        self.strict_symmetric_aggregates = true;
        self
    }
}

/// A document holding any number of definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub models: Vec<Model>,
    pub views: Vec<View>,
    pub topics: Vec<Topic>,
    pub connections: Vec<ConnectionConfig>,
    pub options: Option<CompileOptions>,
}

impl ProjectConfig {
    /// Appends another document's definitions. Later options replace earlier ones.
    pub fn merge(&mut self, other: ProjectConfig) {
        self.models.extend(other.models);
        self.views.extend(other.views);
        self.topics.extend(other.topics);
        self.connections.extend(other.connections);
        if other.options.is_some() {
            self.options = other.options;
        }
    }
}

/// A document holding a single definition, discriminated by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigObject {
    Model(Model),
    View(View),
    Topic(Topic),
}

impl From<ConfigObject> for ProjectConfig {
    fn from(object: ConfigObject) -> Self {
        let mut config = ProjectConfig::default();
        match object {
            ConfigObject::Model(model) => config.models.push(model),
            ConfigObject::View(view) => config.views.push(view),
            ConfigObject::Topic(topic) => config.topics.push(topic),
        }
        config
    }
}
