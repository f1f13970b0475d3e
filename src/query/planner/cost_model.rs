// Cost Model for Query Optimization
//
// The planner consumes cost estimates to rank candidate access paths. The
// estimator is supplied by the embedding system; `DefaultCostEstimator` is a
// simple row-count driven model.

use std::collections::HashMap;

use crate::catalog::{Index, Table};
use crate::common::types::TableId;

/// Estimated output size and cost of a plan fragment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub rows: f64,
    pub cost: f64,
}

impl CostEstimate {
    pub fn new(rows: f64, cost: f64) -> Self {
        CostEstimate { rows, cost }
    }
}

pub trait CostEstimator {
    /// Expected number of rows in a table
    fn table_rows(&self, table: &Table) -> f64;

    /// Cost of scanning an index with `equality_columns` leading key columns
    /// bound by equality and an optional range on the next one
    fn cost_index_scan(&self, index: &Index, leaf: &Table, equality_columns: usize, has_range: bool, covering: bool)
        -> CostEstimate;

    /// Cost of reading every row of the given tables from their group
    fn cost_group_scan(&self, tables: &[&Table]) -> CostEstimate;
}

/// A simple cost model driven by per-table row counts
#[derive(Debug, Clone)]
pub struct DefaultCostEstimator {
    row_counts: HashMap<TableId, f64>,
    default_rows: f64,
}

impl Default for DefaultCostEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultCostEstimator {
    /// Create a new cost model
    pub fn new() -> Self {
        DefaultCostEstimator { row_counts: HashMap::new(), default_rows: 1000.0 }
    }

    pub fn with_row_count(mut self, table: TableId, rows: f64) -> Self {
        self.row_counts.insert(table, rows);
        self
    }
}

impl CostEstimator for DefaultCostEstimator {
    fn table_rows(&self, table: &Table) -> f64 {
        self.row_counts.get(&table.id()).copied().unwrap_or(self.default_rows)
    }

    fn cost_index_scan(
        &self,
        index: &Index,
        leaf: &Table,
        equality_columns: usize,
        has_range: bool,
        covering: bool,
    ) -> CostEstimate {
        let total = self.table_rows(leaf);
        let mut rows = total;
        if index.unique && equality_columns >= index.columns.len() && !index.columns.is_empty() {
            rows = 1.0;
        } else {
            // Each bound key column keeps a tenth of the rows
            for _ in 0..equality_columns {
                rows *= 0.1;
            }
            if has_range {
                rows *= 0.3;
            }
        }
        let rows = rows.max(1.0);
        // Non-covering scans pay for fetching each row from the group
        let per_row = if covering { 1.0 } else { 2.5 };
        CostEstimate::new(rows, 10.0 + rows * per_row)
    }

    fn cost_group_scan(&self, tables: &[&Table]) -> CostEstimate {
        let rows: f64 = tables.iter().map(|t| self.table_rows(t)).sum();
        CostEstimate::new(rows, 20.0 + rows * 1.5)
    }
}
