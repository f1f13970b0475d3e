// Query Executor Module
//
// The boundary to the execution engine: shared value and error types and the
// factory through which physical operators are created.

pub mod operators;
pub mod result;

// Export key types
pub use self::operators::{OperatorFactory, PlanOperatorFactory};
pub use self::result::QueryResult;
