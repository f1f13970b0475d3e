// Index Metadata Module
//
// Table, group, spatial and full-text index definitions.

use serde::{Deserialize, Serialize};

use crate::common::types::{IndexId, TableId};

/// Join semantics of a group index spanning several tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupIndexJoin {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Columns of a single table
    Table,
    /// Columns of a branch of tables from `root` down to the leaf table
    Group { root: TableId, join: GroupIndexJoin },
    /// A table index whose columns starting at `first_spatial` form one
    /// spatial key of `dimensions` coordinates
    Spatial { first_spatial: usize, dimensions: usize },
    /// Full-text index over text columns
    FullText,
}

/// One key column of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub table: TableId,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub id: IndexId,
    pub name: String,
    /// The leaf-most table the index covers
    pub table: TableId,
    pub kind: IndexKind,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
}

impl Index {
    pub fn is_group_index(&self) -> bool {
        matches!(self.kind, IndexKind::Group { .. })
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self.kind, IndexKind::Spatial { .. })
    }

    /// Whether the given column is one of the index keys
    pub fn covers_column(&self, table: TableId, position: usize) -> bool {
        self.columns.iter().any(|c| c.table == table && c.position == position)
    }
}
