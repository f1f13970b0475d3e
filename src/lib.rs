// Bayun Query Optimizer
//
// Rule-based planner that turns a lowered logical plan into a physical
// operator tree.

pub mod common;
pub mod catalog;
pub mod query;

// Re-export key items for convenient access
pub use catalog::Catalog;
pub use common::config::{ImplicitAggregate, OptimizerConfig};
pub use query::executor::result::{DataValue, QueryError, QueryResult};
pub use query::planner::context::PlanContext;
pub use query::planner::optimizer::Optimizer;
pub use query::planner::operator_assembler::{AssembledPlan, OperatorAssembler};
pub use query::planner::plan::{NodeId, PlanGraph};
pub use query::types::{TypeInstance, TypeClass};
pub use query::types::registry::{StandardTypesRegistry, TypesRegistry};
