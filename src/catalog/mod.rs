//! Catalog Management Module
//!
//! Read-only schema metadata consumed by the planner: tables with their
//! columns and keys, storage groups, and indexes. A catalog is assembled
//! once with a `CatalogBuilder` and then shared immutably.

pub mod column;
pub mod index;
pub mod schema;
pub mod table;

pub use self::column::Column;
pub use self::index::{GroupIndexJoin, Index, IndexColumn, IndexKind};
pub use self::schema::{ForeignKey, Group, GroupingJoin, JoinColumn};
pub use self::table::Table;

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::types::{GroupId, IndexId, TableId};
use crate::query::executor::result::{QueryError, QueryResult};
use crate::query::types::TypeInstance;

/// The central repository for schema information
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    groups: Vec<Group>,
    tables: Vec<Arc<Table>>,
    table_names: HashMap<String, TableId>,
    indexes: Vec<Arc<Index>>,
}

impl Catalog {
    pub fn table(&self, id: TableId) -> QueryResult<&Arc<Table>> {
        self.tables
            .get(id as usize)
            .ok_or_else(|| QueryError::CatalogError(format!("No table with id {}", id)))
    }

    pub fn table_by_name(&self, name: &str) -> Option<&Arc<Table>> {
        self.table_names.get(name).and_then(|id| self.tables.get(*id as usize))
    }

    pub fn tables(&self) -> &[Arc<Table>] {
        &self.tables
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id as usize)
    }

    pub fn index(&self, id: IndexId) -> Option<&Arc<Index>> {
        self.indexes.get(id as usize)
    }

    pub fn index_by_name(&self, name: &str) -> Option<&Arc<Index>> {
        self.indexes.iter().find(|index| index.name == name)
    }

    /// Table and spatial indexes declared on a table
    pub fn table_indexes(&self, table: TableId) -> impl Iterator<Item = &Arc<Index>> {
        self.indexes
            .iter()
            .filter(move |index| index.table == table && !index.is_group_index())
    }

    /// Every index with a key column from the table
    pub fn indexes_touching(&self, table: TableId) -> impl Iterator<Item = &Arc<Index>> {
        self.indexes
            .iter()
            .filter(move |index| index.columns.iter().any(|c| c.table == table))
    }

    /// Whether `ancestor` is `descendant` or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: TableId, descendant: TableId) -> bool {
        let mut current = Some(descendant);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.tables.get(id as usize).and_then(|t| t.parent_table());
        }
        false
    }
}

/// Assembles a `Catalog`, assigning ids, ordinals and depths
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    groups: Vec<Group>,
    tables: Vec<Table>,
    table_names: HashMap<String, TableId>,
    indexes: Vec<Index>,
    next_ordinal: HashMap<GroupId, u32>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table that roots a new group of the same name.
    pub fn create_table(
        &mut self,
        name: &str,
        columns: &[(&str, TypeInstance)],
        primary_key: &[&str],
    ) -> QueryResult<TableId> {
        if self.table_names.contains_key(name) {
            return Err(QueryError::CatalogError(format!("Table already exists: {}", name)));
        }
        let group = self.groups.len() as GroupId;
        let id = self.tables.len() as TableId;
        self.groups.push(Group { id: group, name: name.to_string(), root: id });
        self.add_table(name, columns, primary_key, group, 0, None)
    }

    /// Create a table nested in `parent`'s group. `join` pairs parent
    /// column names with child column names.
    pub fn create_child_table(
        &mut self,
        name: &str,
        columns: &[(&str, TypeInstance)],
        primary_key: &[&str],
        parent: &str,
        join: &[(&str, &str)],
    ) -> QueryResult<TableId> {
        let parent_id = self.table_id(parent)?;
        let parent_table = &self.tables[parent_id as usize];
        let (group, depth) = (parent_table.group(), parent_table.depth() + 1);
        let mut join_columns = Vec::with_capacity(join.len());
        for (parent_column, child_column) in join {
            let parent_position = column_position(parent_table, parent_column)?;
            let child_position = columns
                .iter()
                .position(|(n, _)| n == child_column)
                .ok_or_else(|| QueryError::CatalogError(format!("No column {}.{}", name, child_column)))?;
            join_columns.push(JoinColumn { parent: parent_position, child: child_position });
        }
        let grouping = GroupingJoin { parent: parent_id, columns: join_columns };
        self.add_table(name, columns, primary_key, group, depth, Some(grouping))
    }

    fn add_table(
        &mut self,
        name: &str,
        columns: &[(&str, TypeInstance)],
        primary_key: &[&str],
        group: GroupId,
        depth: u32,
        parent_join: Option<GroupingJoin>,
    ) -> QueryResult<TableId> {
        if self.table_names.contains_key(name) {
            return Err(QueryError::CatalogError(format!("Table already exists: {}", name)));
        }
        let id = self.tables.len() as TableId;
        let columns: Vec<Column> = columns
            .iter()
            .enumerate()
            .map(|(i, (n, t))| Column::new(*n, t.clone(), i))
            .collect();
        let mut pk = Vec::with_capacity(primary_key.len());
        for key in primary_key {
            let position = columns
                .iter()
                .position(|c| c.name() == *key)
                .ok_or_else(|| QueryError::CatalogError(format!("No column {}.{}", name, key)))?;
            pk.push(position);
        }
        let ordinal = self.next_ordinal.entry(group).or_insert(0);
        *ordinal += 1;
        let table = Table::new(id, name.to_string(), columns, pk, group, *ordinal, depth, parent_join);
        self.tables.push(table);
        self.table_names.insert(name.to_string(), id);
        if !primary_key.is_empty() {
            let unique_name = format!("{}_pkey", name);
            self.create_index(&unique_name, name, primary_key, true)?;
        }
        Ok(id)
    }

    /// Declare a foreign key on `table` referencing `referenced`. `columns`
    /// pairs referenced column names with referencing column names.
    pub fn add_foreign_key(
        &mut self,
        name: &str,
        table: &str,
        referenced: &str,
        columns: &[(&str, &str)],
    ) -> QueryResult<()> {
        let table_id = self.table_id(table)?;
        let referenced_id = self.table_id(referenced)?;
        let mut pairs = Vec::with_capacity(columns.len());
        for (parent_column, child_column) in columns {
            pairs.push(JoinColumn {
                parent: column_position(&self.tables[referenced_id as usize], parent_column)?,
                child: column_position(&self.tables[table_id as usize], child_column)?,
            });
        }
        self.tables[table_id as usize].add_foreign_key(ForeignKey {
            name: name.to_string(),
            referenced_table: referenced_id,
            columns: pairs,
        });
        self.tables[referenced_id as usize].set_referenced();
        Ok(())
    }

    pub fn create_index(&mut self, name: &str, table: &str, columns: &[&str], unique: bool) -> QueryResult<IndexId> {
        self.add_index(name, table, columns, unique, IndexKind::Table)
    }

    pub fn create_spatial_index(
        &mut self,
        name: &str,
        table: &str,
        columns: &[&str],
        first_spatial: usize,
        dimensions: usize,
    ) -> QueryResult<IndexId> {
        if first_spatial + dimensions > columns.len() {
            return Err(QueryError::CatalogError(format!("Spatial index {} has too few columns", name)));
        }
        self.add_index(name, table, columns, false, IndexKind::Spatial { first_spatial, dimensions })
    }

    pub fn create_full_text_index(&mut self, name: &str, table: &str, columns: &[&str]) -> QueryResult<IndexId> {
        self.add_index(name, table, columns, false, IndexKind::FullText)
    }

    /// Create an index over columns of several tables of one group. The
    /// columns are (table, column) pairs; the deepest table is the leaf.
    pub fn create_group_index(
        &mut self,
        name: &str,
        columns: &[(&str, &str)],
        join: GroupIndexJoin,
    ) -> QueryResult<IndexId> {
        let mut index_columns = Vec::with_capacity(columns.len());
        let mut leaf: Option<&Table> = None;
        let mut root: Option<&Table> = None;
        for (table_name, column_name) in columns {
            let table = &self.tables[self.table_id(table_name)? as usize];
            if leaf.is_none_or(|l| table.depth() > l.depth()) {
                leaf = Some(table);
            }
            if root.is_none_or(|r| table.depth() < r.depth()) {
                root = Some(table);
            }
            index_columns.push(IndexColumn { table: table.id(), position: column_position(table, column_name)? });
        }
        let (leaf, root) = match (leaf, root) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(QueryError::CatalogError(format!("Group index {} has no columns", name))),
        };
        if leaf.group() != root.group() {
            return Err(QueryError::CatalogError(format!("Group index {} spans groups", name)));
        }
        let index = Index {
            id: self.indexes.len() as IndexId,
            name: name.to_string(),
            table: leaf.id(),
            kind: IndexKind::Group { root: root.id(), join },
            columns: index_columns,
            unique: false,
        };
        let id = index.id;
        self.indexes.push(index);
        Ok(id)
    }

    fn add_index(
        &mut self,
        name: &str,
        table: &str,
        columns: &[&str],
        unique: bool,
        kind: IndexKind,
    ) -> QueryResult<IndexId> {
        let table_id = self.table_id(table)?;
        let owner = &self.tables[table_id as usize];
        let mut index_columns = Vec::with_capacity(columns.len());
        for column in columns {
            index_columns.push(IndexColumn { table: table_id, position: column_position(owner, column)? });
        }
        let id = self.indexes.len() as IndexId;
        self.indexes.push(Index { id, name: name.to_string(), table: table_id, kind, columns: index_columns, unique });
        Ok(id)
    }

    fn table_id(&self, name: &str) -> QueryResult<TableId> {
        self.table_names
            .get(name)
            .copied()
            .ok_or_else(|| QueryError::CatalogError(format!("Table not found: {}", name)))
    }

    pub fn build(self) -> Catalog {
        Catalog {
            groups: self.groups,
            tables: self.tables.into_iter().map(Arc::new).collect(),
            table_names: self.table_names,
            indexes: self.indexes.into_iter().map(Arc::new).collect(),
        }
    }
}

fn column_position(table: &Table, column: &str) -> QueryResult<usize> {
    table
        .get_column_index(column)
        .ok_or_else(|| QueryError::CatalogError(format!("No column {}.{}", table.name(), column)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coi() -> Catalog {
        let mut builder = CatalogBuilder::new();
        builder
            .create_table(
                "customers",
                &[("cid", TypeInstance::integer(false)), ("name", TypeInstance::varchar(32, true))],
                &["cid"],
            )
            .unwrap();
        builder
            .create_child_table(
                "orders",
                &[("oid", TypeInstance::integer(false)), ("cid", TypeInstance::integer(false))],
                &["oid"],
                "customers",
                &[("cid", "cid")],
            )
            .unwrap();
        builder
            .create_child_table(
                "items",
                &[("iid", TypeInstance::integer(false)), ("oid", TypeInstance::integer(false))],
                &["iid"],
                "orders",
                &[("oid", "oid")],
            )
            .unwrap();
        builder.create_index("name_idx", "customers", &["name"], false).unwrap();
        builder
            .create_group_index("cname_oid", &[("customers", "name"), ("orders", "oid")], GroupIndexJoin::Left)
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_ordinals_and_depths() {
        let catalog = coi();
        let customers = catalog.table_by_name("customers").unwrap();
        let orders = catalog.table_by_name("orders").unwrap();
        let items = catalog.table_by_name("items").unwrap();
        assert_eq!(customers.group(), orders.group());
        assert!(customers.ordinal() < orders.ordinal());
        assert!(orders.ordinal() < items.ordinal());
        assert_eq!(items.depth(), 2);
        assert_eq!(items.parent_table(), Some(orders.id()));
        assert!(catalog.is_ancestor_or_self(customers.id(), items.id()));
        assert!(!catalog.is_ancestor_or_self(items.id(), customers.id()));
    }

    #[test]
    fn test_hkey_columns() {
        let catalog = coi();
        let orders = catalog.table_by_name("orders").unwrap();
        assert!(orders.is_hkey_column(0));
        assert!(orders.is_hkey_column(1));
    }

    #[test]
    fn test_group_index_leaf() {
        let catalog = coi();
        let index = catalog.index_by_name("cname_oid").unwrap();
        let orders = catalog.table_by_name("orders").unwrap();
        assert_eq!(index.table, orders.id());
        assert!(index.is_group_index());
    }

    #[test]
    fn test_foreign_key_marks_referenced() {
        let mut builder = CatalogBuilder::new();
        builder.create_table("a", &[("id", TypeInstance::integer(false))], &["id"]).unwrap();
        builder
            .create_table("b", &[("id", TypeInstance::integer(false)), ("aid", TypeInstance::integer(true))], &["id"])
            .unwrap();
        builder.add_foreign_key("b_a", "b", "a", &[("id", "aid")]).unwrap();
        let catalog = builder.build();
        assert!(catalog.table_by_name("a").unwrap().is_referenced());
        assert_eq!(catalog.table_by_name("b").unwrap().foreign_keys().len(), 1);
    }

    #[test]
    fn test_duplicate_table() {
        let mut builder = CatalogBuilder::new();
        builder.create_table("a", &[("id", TypeInstance::integer(false))], &[]).unwrap();
        assert!(builder.create_table("a", &[("id", TypeInstance::integer(false))], &[]).is_err());
    }
}
