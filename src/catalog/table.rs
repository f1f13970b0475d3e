//! Table Management Module
//!
//! This module defines the Table type that represents a database table schema
//! together with its place in a storage group.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::column::Column;
use super::schema::{ForeignKey, GroupingJoin};
use crate::common::types::{GroupId, TableId};

/// Represents a database table schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Table ID (unique within the catalog)
    id: TableId,
    /// Table name
    name: String,
    /// Columns in the table
    columns: Vec<Column>,
    /// Column name to index lookup
    column_map: HashMap<String, usize>,
    /// Primary key column indices
    primary_key_columns: Vec<usize>,
    /// Storage group holding this table's rows
    group: GroupId,
    /// Position in the group's depth-first ordering; a parent's ordinal is
    /// always below its children's
    ordinal: u32,
    /// Distance from the group root
    depth: u32,
    /// Join to the parent table within the group
    parent_join: Option<GroupingJoin>,
    /// Foreign keys declared on this table
    foreign_keys: Vec<ForeignKey>,
    /// Whether any foreign key references this table
    referenced: bool,
}

impl Table {
    pub(crate) fn new(
        id: TableId,
        name: String,
        columns: Vec<Column>,
        primary_key_columns: Vec<usize>,
        group: GroupId,
        ordinal: u32,
        depth: u32,
        parent_join: Option<GroupingJoin>,
    ) -> Self {
        let column_map = columns
            .iter()
            .enumerate()
            .map(|(i, col)| (col.name().to_string(), i))
            .collect();
        Table {
            id,
            name,
            columns,
            column_map,
            primary_key_columns,
            group,
            ordinal,
            depth,
            parent_join,
            foreign_keys: Vec::new(),
            referenced: false,
        }
    }

    /// Get the table ID
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Get the table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get all columns
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Get a column by name
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.column_map.get(name).map(|&idx| &self.columns[idx])
    }

    /// Get a column by position
    pub fn column_at(&self, position: usize) -> Option<&Column> {
        self.columns.get(position)
    }

    /// Get the column index for a column name
    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.column_map.get(name).copied()
    }

    /// Primary key column indices
    pub fn primary_key_columns(&self) -> &[usize] {
        &self.primary_key_columns
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn parent_join(&self) -> Option<&GroupingJoin> {
        self.parent_join.as_ref()
    }

    pub fn parent_table(&self) -> Option<TableId> {
        self.parent_join.as_ref().map(|join| join.parent)
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn is_referenced(&self) -> bool {
        self.referenced
    }

    /// Whether a column participates in this table's hierarchical key:
    /// the primary key or the join to the parent.
    pub fn is_hkey_column(&self, position: usize) -> bool {
        self.primary_key_columns.contains(&position)
            || self
                .parent_join
                .as_ref()
                .is_some_and(|join| join.columns.iter().any(|c| c.child == position))
    }

    pub(crate) fn add_foreign_key(&mut self, foreign_key: ForeignKey) {
        self.foreign_keys.push(foreign_key);
    }

    pub(crate) fn set_referenced(&mut self) {
        self.referenced = true;
    }
}
