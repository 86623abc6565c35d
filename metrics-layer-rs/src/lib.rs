//! metrics-layer: a semantic layer that compiles metric requests to SQL
//!
//! Views declare dimensions, dimension groups and measures over warehouse
//! tables and how they join; models group views and carry connections,
//! mappings and access grants. A [`QueryRequest`] names metrics and
//! dimensions, and the [`QueryResolver`] turns it into SQL for the target
//! [`Dialect`].
//!
//! ```
//! use metrics_layer::{Dialect, Field, Project, QueryRequest, QueryResolver, View};
//!
//! let orders = View::new("orders")
//!     .with_table("analytics.orders")
//!     .with_field(Field::dimension("status", "${TABLE}.status"))
//!     .with_field(Field::sum("revenue", "${TABLE}.revenue"));
//! let project = Project::new(vec![], vec![orders], vec![]);
//!
//! let request = QueryRequest::new(["revenue"], ["status"]).with_query_type(Dialect::Postgres);
//! let sql = QueryResolver::new(&project).resolve_sql(&request)?;
//! assert_eq!(
//!     sql,
//!     "SELECT orders.status as status, SUM(orders.revenue) as revenue FROM analytics.orders orders \
//! GROUP BY orders.status;"
//! );
//! # Ok::<(), metrics_layer::MetricsLayerError>(())
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod sql;

pub use config::{load_from_directory, load_from_file, load_from_string, CompileOptions, ConnectionConfig};
pub use crate::core::{Field, FieldRef, Identifier, Model, Project, TimeFrame, Topic, ValueType, View};
pub use error::{MetricsLayerError, Result};
pub use sql::{CompiledQuery, Dialect, FilterExpression, FilterSpec, QueryRequest, QueryResolver};
