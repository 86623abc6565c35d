//! Error types for metrics-layer

use thiserror::Error;

/// Where a join failure originated.
///
/// Failures inside a topic are final: the resolver never retries them as a
/// merged-result query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinErrorLocation {
    Graph,
    Topic,
}

#[derive(Error, Debug)]
pub enum MetricsLayerError {
    /// Malformed filter or field reference
    #[error("{0}")]
    Parse(String),

    /// Structurally invalid request
    #[error("{0}")]
    Argument(String),

    #[error("{message}")]
    Join {
        message: String,
        location: JoinErrorLocation,
    },

    #[error("{0}")]
    Query(String),

    #[error("{message}")]
    AccessDeniedOrDoesNotExist {
        message: String,
        object_name: String,
        object_type: String,
    },

    /// Invalid model definitions, e.g. a field that references itself
    #[error("{0}")]
    Model(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetricsLayerError {
    pub fn join(message: impl Into<String>) -> Self {
        Self::Join {
            message: message.into(),
            location: JoinErrorLocation::Graph,
        }
    }

    pub fn topic_join(message: impl Into<String>) -> Self {
        Self::Join {
            message: message.into(),
            location: JoinErrorLocation::Topic,
        }
    }

    pub fn field_not_found(name: &str) -> Self {
        Self::AccessDeniedOrDoesNotExist {
            message: format!("Field {name} not found in the project, or you do not have access to it"),
            object_name: name.to_string(),
            object_type: "field".to_string(),
        }
    }

    pub fn view_not_found(name: &str) -> Self {
        Self::AccessDeniedOrDoesNotExist {
            message: format!("View {name} not found in the project, or you do not have access to it"),
            object_name: name.to_string(),
            object_type: "view".to_string(),
        }
    }

    /// True for join failures that may be retried as a merged-result query
    pub fn is_recoverable_join_error(&self) -> bool {
        matches!(
            self,
            Self::Join {
                location: JoinErrorLocation::Graph,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, MetricsLayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_join_errors_are_final() {
        assert!(MetricsLayerError::join("no path").is_recoverable_join_error());
        assert!(!MetricsLayerError::topic_join("not in topic").is_recoverable_join_error());
        assert!(!MetricsLayerError::Query("bad".into()).is_recoverable_join_error());
    }

    #[test]
    fn test_field_not_found_carries_context() {
        match MetricsLayerError::field_not_found("orders.revenue") {
            MetricsLayerError::AccessDeniedOrDoesNotExist {
                object_name,
                object_type,
                ..
            } => {
                assert_eq!(object_name, "orders.revenue");
                assert_eq!(object_type, "field");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
