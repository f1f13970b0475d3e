// Schema Relationships Module
//
// Storage groups and the key relationships between tables: grouping joins
// that nest a child table inside its parent's group, and foreign keys.

use serde::{Deserialize, Serialize};

use crate::common::types::{GroupId, TableId};

/// A hierarchical storage group: a root table and all its descendants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub root: TableId,
}

/// One (parent column, child column) pair of a key relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinColumn {
    /// Column position in the parent (referenced) table
    pub parent: usize,
    /// Column position in the child (referencing) table
    pub child: usize,
}

/// The join that places a child table in its parent's group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingJoin {
    pub parent: TableId,
    pub columns: Vec<JoinColumn>,
}

/// A foreign key from the owning table to `referenced_table`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub referenced_table: TableId,
    pub columns: Vec<JoinColumn>,
}
