// Common Module
//
// Identifier types and configuration shared by the catalog and the planner.

pub mod types;
pub mod config;

pub use self::config::{ImplicitAggregate, OptimizerConfig};
pub use self::types::{GroupId, IndexId, TableId};
