// Table Groups
//
// Equivalence classes of table references joined through their group's
// parent/child keys. Merging is union-find over the graph's group list.

use std::fmt;

use super::NodeId;
use crate::common::types::GroupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableGroupId(pub usize);

impl fmt::Display for TableGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableGroup {
    /// The storage group in the catalog
    pub group: GroupId,
    /// Table sources in this class
    pub tables: Vec<NodeId>,
    /// Set once this class has been merged into another
    pub merged_into: Option<TableGroupId>,
}

/// The table groups discovered in one statement
#[derive(Debug, Clone, Default)]
pub struct TableGroups {
    groups: Vec<TableGroup>,
}

impl TableGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, group: GroupId, table: NodeId) -> TableGroupId {
        self.groups.push(TableGroup { group, tables: vec![table], merged_into: None });
        TableGroupId(self.groups.len() - 1)
    }

    /// Add `table` to the class of `id` unless it is already a member
    pub fn add_table(&mut self, id: TableGroupId, table: NodeId) {
        let id = self.find(id);
        let tables = &mut self.groups[id.0].tables;
        if !tables.contains(&table) {
            tables.push(table);
        }
    }

    /// Representative of the class `id` belongs to
    pub fn find(&self, mut id: TableGroupId) -> TableGroupId {
        while let Some(next) = self.groups[id.0].merged_into {
            id = next;
        }
        id
    }

    pub fn get(&self, id: TableGroupId) -> &TableGroup {
        &self.groups[self.find(id).0]
    }

    /// Merge the class of `other` into the class of `into`, returning the
    /// surviving representative
    pub fn merge(&mut self, into: TableGroupId, other: TableGroupId) -> TableGroupId {
        let (into, other) = (self.find(into), self.find(other));
        if into == other {
            return into;
        }
        let tables = std::mem::take(&mut self.groups[other.0].tables);
        self.groups[into.0].tables.extend(tables);
        self.groups[other.0].merged_into = Some(into);
        into
    }

    /// Representatives of all live classes
    pub fn live(&self) -> Vec<TableGroupId> {
        (0..self.groups.len())
            .filter(|&i| self.groups[i].merged_into.is_none())
            .map(TableGroupId)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_follows_representatives() {
        let mut groups = TableGroups::new();
        let a = groups.create(0, NodeId(1));
        let b = groups.create(0, NodeId(2));
        let c = groups.create(0, NodeId(3));
        groups.merge(b, c);
        let root = groups.merge(a, c);
        assert_eq!(root, a);
        assert_eq!(groups.find(c), a);
        assert_eq!(groups.get(b).tables, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(groups.live(), vec![a]);
    }
}
