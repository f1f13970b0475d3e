// Query Planner Module
//
// This module turns a lowered logical plan into a physical operator tree:
// the plan graph model, the rewrite rules and the pipeline driving them, and
// the assembler emitting operators.

pub mod context;
pub mod cost_model;
pub mod equivalence;
pub mod operator_assembler;
pub mod optimizer;
pub mod plan;
pub mod rules;

// Export key types
pub use self::context::PlanContext;
pub use self::operator_assembler::{AssembledPlan, OperatorAssembler};
pub use self::optimizer::{Optimizer, Rule};
pub use self::plan::{NodeId, PlanBuilder, PlanGraph};
