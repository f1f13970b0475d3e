// Plan Nodes
//
// One tagged variant per plan node kind. Structure is expressed through
// `NodeId` handles into the owning `PlanGraph`.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::expression::Expression;
use super::group::TableGroupId;
use super::NodeId;
use crate::catalog::{Index, Table};
use crate::query::types::TypeInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Semi,
    Anti,
    /// Semi join whose inner side is already free of duplicates, so it may
    /// be turned around into an inner join
    SemiInnerAlreadyDistinct,
    /// Semi join that may be turned around into an inner join once the
    /// inner side is made distinct
    SemiInnerIfDistinct,
}

impl JoinType {
    pub fn is_inner(self) -> bool {
        self == JoinType::Inner
    }

    pub fn is_outer(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Right | JoinType::Full)
    }

    pub fn is_semi(self) -> bool {
        matches!(
            self,
            JoinType::Semi | JoinType::SemiInnerAlreadyDistinct | JoinType::SemiInnerIfDistinct
        )
    }

    /// Whether the left side may be NULL-extended
    pub fn left_optional(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }

    /// Whether the right side may be NULL-extended
    pub fn right_optional(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }
}

/// Physical strategy chosen for a join
#[derive(Debug, Clone, PartialEq)]
pub enum JoinImplementation {
    NestedLoops,
    /// Check a bloom filter loaded from `loader` before running the inner side
    BloomFilter {
        loader: NodeId,
        /// Key expressions over the loader's rows
        loader_keys: Vec<Expression>,
        /// Key expressions over the outer rows
        lookup: Vec<Expression>,
        estimated_size: u64,
    },
    /// Load the right side into a hash table keyed by `keys` and look it up
    /// with `lookup` from the left
    HashTable { keys: Vec<Expression>, lookup: Vec<Expression> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinNode {
    pub left: NodeId,
    pub right: NodeId,
    pub join_type: JoinType,
    pub conditions: Vec<Expression>,
    pub implementation: JoinImplementation,
}

impl JoinNode {
    pub fn new(left: NodeId, right: NodeId, join_type: JoinType) -> Self {
        JoinNode { left, right, join_type, conditions: Vec::new(), implementation: JoinImplementation::NestedLoops }
    }

    pub fn with_conditions(mut self, conditions: Vec<Expression>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Swap the operands, turning a RIGHT join into a LEFT one
    pub fn reverse(&mut self) {
        std::mem::swap(&mut self.left, &mut self.right);
        self.join_type = match self.join_type {
            JoinType::Left => JoinType::Right,
            JoinType::Right => JoinType::Left,
            other => other,
        };
    }
}

/// Where the conditions of a group join were found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupJoinOrigin {
    /// The condition list of a `Select`
    Where(NodeId),
    /// The condition list of a `Join`
    Join(NodeId),
}

/// A join from a table source to its parent within one table group
#[derive(Debug, Clone, PartialEq)]
pub struct TableGroupJoin {
    pub parent: NodeId,
    pub conditions: Vec<Expression>,
    pub group: TableGroupId,
    pub origin: GroupJoinOrigin,
}

/// A base table reference
#[derive(Debug, Clone)]
pub struct TableSource {
    pub table: Arc<Table>,
    /// Correlation name
    pub name: String,
    pub group: Option<TableGroupId>,
    pub parent_join: Option<TableGroupJoin>,
    /// Join through a referencing foreign key, when no grouping join matched
    pub parent_fk_join: Option<TableGroupJoin>,
}

impl TableSource {
    pub fn new(table: Arc<Table>, name: &str) -> Self {
        TableSource { table, name: name.to_string(), group: None, parent_join: None, parent_fk_join: None }
    }
}

/// One table of a `TableGroupJoinTree`
#[derive(Debug, Clone, PartialEq)]
pub struct TableGroupJoinNode {
    /// The `TableSource` this node stands for
    pub table: NodeId,
    pub parent: Option<usize>,
    /// Ordered by table ordinal
    pub children: Vec<usize>,
    /// How this node joins to its parent
    pub parent_join_type: JoinType,
    pub join_conditions: Vec<Expression>,
    pub state: u8,
}

impl TableGroupJoinNode {
    pub const REQUIRED: u8 = 1;
    pub const PARENT: u8 = 2;
    pub const LEFT_PARENT: u8 = 4;
    pub const BRANCHPOINT: u8 = 8;
    pub const PENDING: u8 = 16;

    pub fn new(table: NodeId) -> Self {
        TableGroupJoinNode {
            table,
            parent: None,
            children: Vec::new(),
            parent_join_type: JoinType::Inner,
            join_conditions: Vec::new(),
            state: 0,
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.state & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.state |= flag;
    }

    pub fn clear(&mut self, flag: u8) {
        self.state &= !flag;
    }
}

/// All the tables of one table group joined within a query, as a tree
/// mirroring the group's hierarchy
#[derive(Debug, Clone, PartialEq)]
pub struct TableGroupJoinTree {
    pub group: TableGroupId,
    pub nodes: Vec<TableGroupJoinNode>,
    pub root: usize,
    /// Tables whose rows must be produced
    pub required: BTreeSet<NodeId>,
    /// Chosen access path
    pub scan: Option<NodeId>,
    /// Access paths considered when none has been chosen
    pub candidates: Vec<NodeId>,
}

impl TableGroupJoinTree {
    pub fn single(group: TableGroupId, table: NodeId) -> Self {
        TableGroupJoinTree {
            group,
            nodes: vec![TableGroupJoinNode::new(table)],
            root: 0,
            required: BTreeSet::new(),
            scan: None,
            candidates: Vec::new(),
        }
    }

    pub fn find(&self, table: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.table == table)
    }

    pub fn depth(&self, mut index: usize) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.nodes[index].parent {
            depth += 1;
            index = parent;
        }
        depth
    }

    /// Node indexes in tree order: parents before children, children by
    /// ordinal
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            order.push(index);
            for &child in self.nodes[index].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    pub fn tables(&self) -> Vec<NodeId> {
        self.preorder().into_iter().map(|i| self.nodes[i].table).collect()
    }

    /// Whether `ancestor` is `descendant` or above it
    pub fn is_ancestor_or_self(&self, ancestor: usize, descendant: usize) -> bool {
        let mut current = Some(descendant);
        while let Some(index) = current {
            if index == ancestor {
                return true;
            }
            current = self.nodes[index].parent;
        }
        false
    }

    /// Move every node of `other` into this tree, hanging its root below
    /// `parent`. `position` orders the new child among its siblings.
    pub fn graft(&mut self, other: TableGroupJoinTree, parent: usize, position: usize, join_type: JoinType) -> usize {
        let offset = self.nodes.len();
        let other_root = other.root + offset;
        for mut node in other.nodes {
            node.parent = node.parent.map(|p| p + offset);
            for child in node.children.iter_mut() {
                *child += offset;
            }
            self.nodes.push(node);
        }
        self.nodes[other_root].parent = Some(parent);
        self.nodes[other_root].parent_join_type = join_type;
        let children = &mut self.nodes[parent].children;
        children.insert(position.min(children.len()), other_root);
        self.required.extend(other.required);
        other_root
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistinctState {
    /// Some rows contain non-constant expressions
    HasExpressions,
    /// Rows are constants or parameters
    HasParameters,
    /// Constant rows without duplicates, some containing NULL
    DistinctWithNull,
    /// Constant rows without duplicates
    Distinct,
    /// Must be made distinct when executed
    NeedDistinct,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ordering {
    pub expression: Expression,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultField {
    pub name: String,
    pub ty: Option<TypeInstance>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateColumn {
    /// Column position in the target table
    pub column: usize,
    pub expression: Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperationType {
    Union,
    Intersect,
    Except,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    pub value: Expression,
    pub inclusive: bool,
}

/// Spatial predicate served by a spatial index
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialComparand {
    /// One expression per dimension
    pub center: Vec<Expression>,
    /// `None` for a point lookup
    pub radius: Option<Expression>,
}

#[derive(Debug, Clone)]
pub struct IndexScan {
    pub index: Arc<Index>,
    /// Source of the index's leaf table
    pub leaf: NodeId,
    /// Source of the rootmost table the index covers
    pub root_table: NodeId,
    /// Sources of all tables whose columns are in the index
    pub tables: Vec<NodeId>,
    pub equality: Vec<Expression>,
    pub low: Option<RangeBound>,
    pub high: Option<RangeBound>,
    pub spatial: Option<SpatialComparand>,
    pub ascending: bool,
    /// Whether the index alone supplies every needed column
    pub covering: bool,
    pub estimated_rows: u64,
    /// Tables that must still be fetched through lookups
    pub required_tables: Option<BTreeSet<NodeId>>,
}

#[derive(Debug, Clone)]
pub enum PlanNodeKind {
    // Statements
    ResultSet { input: NodeId, fields: Vec<ResultField> },
    Insert { input: NodeId, table: Arc<Table>, target_columns: Vec<usize> },
    Update { input: NodeId, table: Arc<Table>, target: NodeId, update_columns: Vec<UpdateColumn> },
    Delete { input: NodeId, table: Arc<Table>, target: NodeId },

    // Relational operators
    Select { input: NodeId, conditions: Vec<Expression> },
    Project { input: NodeId, fields: Vec<Expression> },
    Sort { input: NodeId, orderings: Vec<Ordering> },
    Limit { input: NodeId, offset: usize, limit: Option<usize> },
    Distinct { input: NodeId },
    Buffer { input: NodeId },
    /// Output row: grouping keys, then aggregate results
    AggregateSource { input: NodeId, group_by: Vec<Expression>, aggregates: Vec<Expression> },
    Join(JoinNode),
    SetOperation { left: NodeId, right: NodeId, operation: SetOperationType, all: bool },
    /// Run `inner` once per `outer` row with the outer row bound
    MapJoin { outer: NodeId, inner: NodeId, join_type: JoinType },
    /// Produce one empty row only when the input is empty
    OnlyIfEmpty { input: NodeId },
    /// Produce one NULL row when the input is empty
    NullIfEmpty { input: NodeId },
    UsingBloomFilter { loader: NodeId, input: NodeId, filter: u32, loader_keys: Vec<Expression>, estimated_size: u64 },
    BloomFilterFilter { input: NodeId, filter: u32, lookup: Vec<Expression> },
    UsingHashTable { loader: NodeId, input: NodeId, hash_table: u32, keys: Vec<Expression> },
    /// Rows of the loader matching `lookup`
    HashTableLookup { hash_table: u32, loader: NodeId, lookup: Vec<Expression> },

    // Sources
    TableSource(TableSource),
    TableGroupJoinTree(TableGroupJoinTree),
    ExpressionsSource { rows: Vec<Vec<Expression>>, distinct_state: DistinctState, field_types: Vec<Option<TypeInstance>> },
    NullSource,
    /// Root of a nested query
    Subquery { input: NodeId },
    /// A nested query used as a derived table
    SubquerySource { input: NodeId, name: String },

    // Scans
    IndexScan(IndexScan),
    /// Rows present in both scans, compared on their shared key prefix
    IndexIntersection { output_scan: NodeId, selector_scan: NodeId, comparison_fields: usize, estimated_rows: u64 },
    GroupScan { group: crate::common::types::GroupId, tables: Vec<NodeId> },
    /// Rows of `inside` located through the hkey of an outer row of `outside`
    GroupLoopScan { inside: NodeId, outside: NodeId, inside_parent: bool, join_conditions: Vec<Expression> },
    FullTextScan { index: Arc<Index>, table: NodeId, query: Expression, limit: Option<usize> },

    // Hierarchical lookups
    AncestorLookup { input: NodeId, descendant: NodeId, ancestors: Vec<NodeId> },
    BranchLookup { input: Option<NodeId>, source: NodeId, branch: NodeId, tables: Vec<NodeId> },
    Flatten { input: NodeId, tables: Vec<NodeId>, join_types: Vec<JoinType> },
    Product { ancestor: Option<NodeId>, subplans: Vec<NodeId> },
}

impl PlanNodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            PlanNodeKind::ResultSet { .. } => "ResultSet",
            PlanNodeKind::Insert { .. } => "InsertStatement",
            PlanNodeKind::Update { .. } => "UpdateStatement",
            PlanNodeKind::Delete { .. } => "DeleteStatement",
            PlanNodeKind::Select { .. } => "Select",
            PlanNodeKind::Project { .. } => "Project",
            PlanNodeKind::Sort { .. } => "Sort",
            PlanNodeKind::Limit { .. } => "Limit",
            PlanNodeKind::Distinct { .. } => "Distinct",
            PlanNodeKind::Buffer { .. } => "Buffer",
            PlanNodeKind::AggregateSource { .. } => "AggregateSource",
            PlanNodeKind::Join(_) => "JoinNode",
            PlanNodeKind::SetOperation { .. } => "SetPlanNode",
            PlanNodeKind::MapJoin { .. } => "MapJoin",
            PlanNodeKind::OnlyIfEmpty { .. } => "OnlyIfEmpty",
            PlanNodeKind::NullIfEmpty { .. } => "NullIfEmpty",
            PlanNodeKind::UsingBloomFilter { .. } => "UsingBloomFilter",
            PlanNodeKind::BloomFilterFilter { .. } => "BloomFilterFilter",
            PlanNodeKind::UsingHashTable { .. } => "UsingHashTable",
            PlanNodeKind::HashTableLookup { .. } => "HashTableLookup",
            PlanNodeKind::TableSource(_) => "TableSource",
            PlanNodeKind::TableGroupJoinTree(_) => "TableGroupJoinTree",
            PlanNodeKind::ExpressionsSource { .. } => "ExpressionsSource",
            PlanNodeKind::NullSource => "NullSource",
            PlanNodeKind::Subquery { .. } => "Subquery",
            PlanNodeKind::SubquerySource { .. } => "SubquerySource",
            PlanNodeKind::IndexScan(_) => "SingleIndexScan",
            PlanNodeKind::IndexIntersection { .. } => "MultiIndexIntersectScan",
            PlanNodeKind::GroupScan { .. } => "GroupScan",
            PlanNodeKind::GroupLoopScan { .. } => "GroupLoopScan",
            PlanNodeKind::FullTextScan { .. } => "FullTextScan",
            PlanNodeKind::AncestorLookup { .. } => "AncestorLookup",
            PlanNodeKind::BranchLookup { .. } => "BranchLookup",
            PlanNodeKind::Flatten { .. } => "Flatten",
            PlanNodeKind::Product { .. } => "Product",
        }
    }

    /// Plan-node inputs, in visiting order
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            PlanNodeKind::ResultSet { input, .. }
            | PlanNodeKind::Insert { input, .. }
            | PlanNodeKind::Update { input, .. }
            | PlanNodeKind::Delete { input, .. }
            | PlanNodeKind::Select { input, .. }
            | PlanNodeKind::Project { input, .. }
            | PlanNodeKind::Sort { input, .. }
            | PlanNodeKind::Limit { input, .. }
            | PlanNodeKind::Distinct { input }
            | PlanNodeKind::Buffer { input }
            | PlanNodeKind::AggregateSource { input, .. }
            | PlanNodeKind::OnlyIfEmpty { input }
            | PlanNodeKind::NullIfEmpty { input }
            | PlanNodeKind::BloomFilterFilter { input, .. }
            | PlanNodeKind::Subquery { input }
            | PlanNodeKind::SubquerySource { input, .. }
            | PlanNodeKind::AncestorLookup { input, .. }
            | PlanNodeKind::Flatten { input, .. } => vec![*input],
            PlanNodeKind::Join(join) => vec![join.left, join.right],
            PlanNodeKind::SetOperation { left, right, .. } => vec![*left, *right],
            PlanNodeKind::MapJoin { outer, inner, .. } => vec![*outer, *inner],
            PlanNodeKind::UsingBloomFilter { loader, input, .. }
            | PlanNodeKind::UsingHashTable { loader, input, .. } => vec![*loader, *input],
            PlanNodeKind::IndexIntersection { output_scan, selector_scan, .. } => {
                vec![*output_scan, *selector_scan]
            }
            PlanNodeKind::BranchLookup { input, .. } => input.iter().copied().collect(),
            PlanNodeKind::Product { subplans, .. } => subplans.clone(),
            PlanNodeKind::HashTableLookup { .. }
            | PlanNodeKind::TableSource(_)
            | PlanNodeKind::TableGroupJoinTree(_)
            | PlanNodeKind::ExpressionsSource { .. }
            | PlanNodeKind::NullSource
            | PlanNodeKind::IndexScan(_)
            | PlanNodeKind::GroupScan { .. }
            | PlanNodeKind::GroupLoopScan { .. }
            | PlanNodeKind::FullTextScan { .. } => Vec::new(),
        }
    }

    /// Replace one input handle. Returns false when `old` is not an input.
    pub fn replace_input(&mut self, old: NodeId, new: NodeId) -> bool {
        let mut replaced = false;
        let mut swap = |slot: &mut NodeId| {
            if *slot == old && !replaced {
                *slot = new;
                replaced = true;
            }
        };
        match self {
            PlanNodeKind::ResultSet { input, .. }
            | PlanNodeKind::Insert { input, .. }
            | PlanNodeKind::Update { input, .. }
            | PlanNodeKind::Delete { input, .. }
            | PlanNodeKind::Select { input, .. }
            | PlanNodeKind::Project { input, .. }
            | PlanNodeKind::Sort { input, .. }
            | PlanNodeKind::Limit { input, .. }
            | PlanNodeKind::Distinct { input }
            | PlanNodeKind::Buffer { input }
            | PlanNodeKind::AggregateSource { input, .. }
            | PlanNodeKind::OnlyIfEmpty { input }
            | PlanNodeKind::NullIfEmpty { input }
            | PlanNodeKind::BloomFilterFilter { input, .. }
            | PlanNodeKind::Subquery { input }
            | PlanNodeKind::SubquerySource { input, .. }
            | PlanNodeKind::AncestorLookup { input, .. }
            | PlanNodeKind::Flatten { input, .. } => swap(input),
            PlanNodeKind::Join(join) => {
                swap(&mut join.left);
                swap(&mut join.right);
            }
            PlanNodeKind::SetOperation { left, right, .. } => {
                swap(left);
                swap(right);
            }
            PlanNodeKind::MapJoin { outer, inner, .. } => {
                swap(outer);
                swap(inner);
            }
            PlanNodeKind::UsingBloomFilter { loader, input, .. }
            | PlanNodeKind::UsingHashTable { loader, input, .. } => {
                swap(loader);
                swap(input);
            }
            PlanNodeKind::IndexIntersection { output_scan, selector_scan, .. } => {
                swap(output_scan);
                swap(selector_scan);
            }
            PlanNodeKind::BranchLookup { input: Some(input), .. } => swap(input),
            PlanNodeKind::Product { subplans, .. } => subplans.iter_mut().for_each(&mut swap),
            _ => {}
        }
        replaced
    }

    /// Nodes referenced other than as inputs: table sources described by
    /// trees, scans and lookups, and the loader of a bloom filter join
    pub fn referenced_nodes(&self) -> Vec<NodeId> {
        match self {
            PlanNodeKind::Update { target, .. } | PlanNodeKind::Delete { target, .. } => vec![*target],
            PlanNodeKind::Join(join) => match &join.implementation {
                JoinImplementation::BloomFilter { loader, .. } => vec![*loader],
                _ => Vec::new(),
            },
            PlanNodeKind::HashTableLookup { loader, .. } => vec![*loader],
            PlanNodeKind::TableGroupJoinTree(tree) => {
                let mut nodes: Vec<NodeId> = tree.nodes.iter().map(|n| n.table).collect();
                nodes.extend(tree.scan);
                nodes
            }
            PlanNodeKind::IndexScan(scan) => {
                let mut nodes = vec![scan.leaf, scan.root_table];
                nodes.extend(scan.tables.iter().copied());
                nodes
            }
            PlanNodeKind::GroupScan { tables, .. } => tables.clone(),
            PlanNodeKind::GroupLoopScan { inside, outside, .. } => vec![*inside, *outside],
            PlanNodeKind::FullTextScan { table, .. } => vec![*table],
            PlanNodeKind::AncestorLookup { descendant, ancestors, .. } => {
                let mut nodes = vec![*descendant];
                nodes.extend(ancestors.iter().copied());
                nodes
            }
            PlanNodeKind::BranchLookup { source, branch, tables, .. } => {
                let mut nodes = vec![*source, *branch];
                nodes.extend(tables.iter().copied());
                nodes
            }
            PlanNodeKind::Flatten { tables, .. } => tables.clone(),
            PlanNodeKind::Product { ancestor, .. } => ancestor.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Every expression slot of this node, in a stable order
    pub fn expressions(&self) -> Vec<&Expression> {
        match self {
            PlanNodeKind::Update { update_columns, .. } => update_columns.iter().map(|c| &c.expression).collect(),
            PlanNodeKind::Select { conditions, .. } => conditions.iter().collect(),
            PlanNodeKind::Project { fields, .. } => fields.iter().collect(),
            PlanNodeKind::Sort { orderings, .. } => orderings.iter().map(|o| &o.expression).collect(),
            PlanNodeKind::AggregateSource { group_by, aggregates, .. } => {
                group_by.iter().chain(aggregates.iter()).collect()
            }
            PlanNodeKind::Join(join) => {
                let mut expressions: Vec<&Expression> = join.conditions.iter().collect();
                match &join.implementation {
                    JoinImplementation::NestedLoops => {}
                    JoinImplementation::BloomFilter { loader_keys, lookup, .. } => {
                        expressions.extend(loader_keys.iter().chain(lookup.iter()))
                    }
                    JoinImplementation::HashTable { keys, lookup } => {
                        expressions.extend(keys.iter().chain(lookup.iter()))
                    }
                }
                expressions
            }
            PlanNodeKind::UsingBloomFilter { loader_keys, .. } => loader_keys.iter().collect(),
            PlanNodeKind::BloomFilterFilter { lookup, .. } | PlanNodeKind::HashTableLookup { lookup, .. } => {
                lookup.iter().collect()
            }
            PlanNodeKind::UsingHashTable { keys, .. } => keys.iter().collect(),
            PlanNodeKind::TableGroupJoinTree(tree) => {
                tree.nodes.iter().flat_map(|n| n.join_conditions.iter()).collect()
            }
            PlanNodeKind::ExpressionsSource { rows, .. } => rows.iter().flatten().collect(),
            PlanNodeKind::IndexScan(scan) => index_scan_expressions(scan),
            PlanNodeKind::GroupLoopScan { join_conditions, .. } => join_conditions.iter().collect(),
            PlanNodeKind::FullTextScan { query, .. } => vec![query],
            _ => Vec::new(),
        }
    }

    /// Mutable counterpart of `expressions`, same order
    pub fn expressions_mut(&mut self) -> Vec<&mut Expression> {
        match self {
            PlanNodeKind::Update { update_columns, .. } => {
                update_columns.iter_mut().map(|c| &mut c.expression).collect()
            }
            PlanNodeKind::Select { conditions, .. } => conditions.iter_mut().collect(),
            PlanNodeKind::Project { fields, .. } => fields.iter_mut().collect(),
            PlanNodeKind::Sort { orderings, .. } => orderings.iter_mut().map(|o| &mut o.expression).collect(),
            PlanNodeKind::AggregateSource { group_by, aggregates, .. } => {
                group_by.iter_mut().chain(aggregates.iter_mut()).collect()
            }
            PlanNodeKind::Join(join) => {
                let mut expressions: Vec<&mut Expression> = join.conditions.iter_mut().collect();
                match &mut join.implementation {
                    JoinImplementation::NestedLoops => {}
                    JoinImplementation::BloomFilter { loader_keys, lookup, .. } => {
                        expressions.extend(loader_keys.iter_mut().chain(lookup.iter_mut()))
                    }
                    JoinImplementation::HashTable { keys, lookup } => {
                        expressions.extend(keys.iter_mut().chain(lookup.iter_mut()))
                    }
                }
                expressions
            }
            PlanNodeKind::UsingBloomFilter { loader_keys, .. } => loader_keys.iter_mut().collect(),
            PlanNodeKind::BloomFilterFilter { lookup, .. } | PlanNodeKind::HashTableLookup { lookup, .. } => {
                lookup.iter_mut().collect()
            }
            PlanNodeKind::UsingHashTable { keys, .. } => keys.iter_mut().collect(),
            PlanNodeKind::TableGroupJoinTree(tree) => {
                tree.nodes.iter_mut().flat_map(|n| n.join_conditions.iter_mut()).collect()
            }
            PlanNodeKind::ExpressionsSource { rows, .. } => rows.iter_mut().flatten().collect(),
            PlanNodeKind::IndexScan(scan) => {
                let mut expressions: Vec<&mut Expression> = scan.equality.iter_mut().collect();
                expressions.extend(scan.low.iter_mut().map(|b| &mut b.value));
                expressions.extend(scan.high.iter_mut().map(|b| &mut b.value));
                if let Some(spatial) = &mut scan.spatial {
                    expressions.extend(spatial.center.iter_mut());
                    expressions.extend(spatial.radius.iter_mut());
                }
                expressions
            }
            PlanNodeKind::GroupLoopScan { join_conditions, .. } => join_conditions.iter_mut().collect(),
            PlanNodeKind::FullTextScan { query, .. } => vec![query],
            _ => Vec::new(),
        }
    }

    /// Whether columns can reference this node
    pub fn is_column_source(&self) -> bool {
        matches!(
            self,
            PlanNodeKind::TableSource(_)
                | PlanNodeKind::Project { .. }
                | PlanNodeKind::AggregateSource { .. }
                | PlanNodeKind::ExpressionsSource { .. }
                | PlanNodeKind::NullSource
                | PlanNodeKind::SubquerySource { .. }
        )
    }

    /// Whether the node can be an operand of a join
    pub fn is_joinable(&self) -> bool {
        matches!(
            self,
            PlanNodeKind::Join(_)
                | PlanNodeKind::TableSource(_)
                | PlanNodeKind::TableGroupJoinTree(_)
                | PlanNodeKind::SubquerySource { .. }
                | PlanNodeKind::ExpressionsSource { .. }
                | PlanNodeKind::NullSource
        )
    }

    /// Single-input nodes that pass their input's rows through
    pub fn single_input(&self) -> Option<NodeId> {
        match self {
            PlanNodeKind::ResultSet { input, .. }
            | PlanNodeKind::Insert { input, .. }
            | PlanNodeKind::Update { input, .. }
            | PlanNodeKind::Delete { input, .. }
            | PlanNodeKind::Select { input, .. }
            | PlanNodeKind::Project { input, .. }
            | PlanNodeKind::Sort { input, .. }
            | PlanNodeKind::Limit { input, .. }
            | PlanNodeKind::Distinct { input }
            | PlanNodeKind::Buffer { input }
            | PlanNodeKind::AggregateSource { input, .. }
            | PlanNodeKind::Subquery { input }
            | PlanNodeKind::SubquerySource { input, .. } => Some(*input),
            _ => None,
        }
    }
}

fn index_scan_expressions(scan: &IndexScan) -> Vec<&Expression> {
    let mut expressions: Vec<&Expression> = scan.equality.iter().collect();
    expressions.extend(scan.low.iter().map(|b| &b.value));
    expressions.extend(scan.high.iter().map(|b| &b.value));
    if let Some(spatial) = &scan.spatial {
        expressions.extend(spatial.center.iter());
        expressions.extend(spatial.radius.iter());
    }
    expressions
}
