// BayunDB Query Processing Module
//
// This module contains components for type resolution, query planning and
// the physical operator boundary.

pub mod executor;
pub mod planner;
pub mod types;

// Export key public interfaces
pub use executor::result::QueryResult;
pub use planner::optimizer::Optimizer;
