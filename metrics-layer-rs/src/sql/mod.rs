//! SQL compilation: requests, filters, join design and dialect rendering

mod arbitrary;
pub mod context;
mod cumulative;
mod dates;
mod design;
mod dialect;
mod expand;
pub mod filter;
mod funnel;
mod generator;
mod merged;
pub mod request;
mod resolver;
mod symmetric;

pub use context::CompileContext;
pub use dates::{convert_timezone_sql, duration_sql, time_grain_sql};
pub use design::{solve_joins, Design, FunctionalPk};
pub use dialect::Dialect;
pub use expand::FieldSqlExpander;
pub use filter::{Filter, FilterClause, FilterExpression, FilterSpec, LogicalOperator};
pub use generator::{OrderBy, QueryGenerator, QueryPlan};
pub use request::{FunnelSpec, FunnelWindow, OrderByClause, OrderBySpec, QueryRequest, SortDirection};
pub use resolver::{CompiledQuery, QueryResolver};
pub use symmetric::supports_symmetric_aggregates;
