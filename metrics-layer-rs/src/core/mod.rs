//! Core semantic model: fields, views, joins, models, topics and the project

mod dependency;
mod field;
mod join;
mod join_graph;
mod model;
mod project;
mod template;
mod topic;
mod view;

pub(crate) use dependency::FIELD_REFERENCE;
pub use dependency::{check_circular_dependencies, extract_dependencies, extract_references};
pub use field::{
    CaseDefinition, CaseWhen, Datatype, Field, FieldFilter, FieldType, Grain, Interval, NonAdditiveDimension, TimeFrame,
    ValueType, WindowChoice,
};
pub use join::{Join, JoinType, Relationship};
pub use join_graph::JoinGraph;
pub use model::{AccessGrant, Mapping, Model, WeekStartDay};
pub use project::{FieldRef, Project};
pub use template::render_sql;
pub use topic::{Topic, TopicJoin, TopicView};
pub use view::{AccessFilter, DerivedTable, Identifier, IdentifierType, View};
