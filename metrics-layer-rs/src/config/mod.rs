//! Configuration loading for project definitions
//!
//! Documents either list `models`, `views`, `topics` and `connections`, or
//! hold a single object discriminated by `type: model|view|topic`.

mod loader;
mod schema;

pub use loader::{load_from_directory, load_from_file, load_from_string, parse_document};
pub use schema::{CompileOptions, ConfigObject, ConnectionConfig, ProjectConfig};
