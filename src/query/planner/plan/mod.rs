// Plan Graph
//
// The statement's plan as an arena of nodes addressed by `NodeId`. Every node
// records its single output; inputs are held by the owning node's kind.
// Structure changes go through `replace_input` so both directions stay in
// agreement.

pub mod builder;
pub mod expression;
pub mod group;
pub mod node;
pub mod visitor;

use std::collections::HashSet;
use std::fmt;
use std::fmt::Write as _;

use self::expression::Expression;
use self::group::TableGroups;
use self::node::{JoinNode, PlanNodeKind, TableGroupJoinTree, TableSource};
use crate::query::executor::result::{QueryError, QueryResult};

pub use self::builder::PlanBuilder;
pub use self::expression::{ColumnExpression, ComparisonOp, ExpressionKind};
pub use self::node::JoinType;

/// Handle of a node in a `PlanGraph`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub kind: PlanNodeKind,
    /// The node consuming this one; `None` for the root and detached nodes
    pub output: Option<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanGraph {
    nodes: Vec<PlanNode>,
    root: Option<NodeId>,
    /// Table groups discovered by group-join finding
    pub groups: TableGroups,
    next_marker: u32,
}

impl PlanGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, making it the output of each of its inputs
    pub fn add(&mut self, kind: PlanNodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        for input in kind.inputs() {
            if let Some(node) = self.nodes.get_mut(input.0) {
                node.output = Some(id);
            }
        }
        self.nodes.push(PlanNode { kind, output: None });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> QueryResult<NodeId> {
        self.root.ok_or_else(|| QueryError::Internal("plan has no root".to_string()))
    }

    pub fn set_root(&mut self, id: NodeId) {
        self.nodes[id.0].output = None;
        self.root = Some(id);
    }

    pub fn node(&self, id: NodeId) -> &PlanNode {
        &self.nodes[id.0]
    }

    pub fn kind(&self, id: NodeId) -> &PlanNodeKind {
        &self.nodes[id.0].kind
    }

    pub fn kind_mut(&mut self, id: NodeId) -> &mut PlanNodeKind {
        &mut self.nodes[id.0].kind
    }

    pub fn output(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].output
    }

    pub fn set_output(&mut self, id: NodeId, output: Option<NodeId>) {
        self.nodes[id.0].output = output;
    }

    pub fn inputs(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id.0].kind.inputs()
    }

    /// Swap input `old` of `parent` for `new`, and make `parent` the output
    /// of `new`
    pub fn replace_input(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> QueryResult<()> {
        if !self.nodes[parent.0].kind.replace_input(old, new) {
            return Err(QueryError::Internal(format!(
                "{} is not an input of {} {}",
                old,
                self.kind(parent).name(),
                parent
            )));
        }
        self.nodes[new.0].output = Some(parent);
        Ok(())
    }

    /// Put `new` where `old` is, whether `old` is the root or an input
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> QueryResult<()> {
        match self.output(old) {
            Some(parent) => self.replace_input(parent, old, new),
            None if self.root == Some(old) => {
                self.set_root(new);
                Ok(())
            }
            None => Err(QueryError::Internal(format!(
                "{} {} has no output to replace it in",
                self.kind(old).name(),
                old
            ))),
        }
    }

    /// Insert a new node directly above `node`, built around it
    pub fn wrap(&mut self, node: NodeId, build: impl FnOnce(NodeId) -> PlanNodeKind) -> QueryResult<NodeId> {
        let parent = self.output(node);
        let was_root = self.root == Some(node);
        let wrapper = self.add(build(node));
        match parent {
            Some(parent) => self.replace_input(parent, node, wrapper)?,
            None if was_root => self.set_root(wrapper),
            None => {}
        }
        Ok(wrapper)
    }

    /// Remove a single-input node, connecting its input to its output
    pub fn splice_out(&mut self, node: NodeId) -> QueryResult<NodeId> {
        let input = self.kind(node).single_input().ok_or_else(|| {
            QueryError::Internal(format!("cannot remove {} {}", self.kind(node).name(), node))
        })?;
        self.replace_node(node, input)?;
        Ok(input)
    }

    /// Fresh identifier for pairing bloom filter and hash table nodes
    pub fn allocate_marker(&mut self) -> u32 {
        self.next_marker += 1;
        self.next_marker
    }

    pub fn table_source(&self, id: NodeId) -> QueryResult<&TableSource> {
        match self.kind(id) {
            PlanNodeKind::TableSource(source) => Ok(source),
            other => Err(expected("TableSource", other.name(), id)),
        }
    }

    pub fn table_source_mut(&mut self, id: NodeId) -> QueryResult<&mut TableSource> {
        match self.kind_mut(id) {
            PlanNodeKind::TableSource(source) => Ok(source),
            other => Err(expected("TableSource", other.name(), id)),
        }
    }

    pub fn join(&self, id: NodeId) -> QueryResult<&JoinNode> {
        match self.kind(id) {
            PlanNodeKind::Join(join) => Ok(join),
            other => Err(expected("JoinNode", other.name(), id)),
        }
    }

    pub fn join_mut(&mut self, id: NodeId) -> QueryResult<&mut JoinNode> {
        match self.kind_mut(id) {
            PlanNodeKind::Join(join) => Ok(join),
            other => Err(expected("JoinNode", other.name(), id)),
        }
    }

    pub fn tree(&self, id: NodeId) -> QueryResult<&TableGroupJoinTree> {
        match self.kind(id) {
            PlanNodeKind::TableGroupJoinTree(tree) => Ok(tree),
            other => Err(expected("TableGroupJoinTree", other.name(), id)),
        }
    }

    pub fn tree_mut(&mut self, id: NodeId) -> QueryResult<&mut TableGroupJoinTree> {
        match self.kind_mut(id) {
            PlanNodeKind::TableGroupJoinTree(tree) => Ok(tree),
            other => Err(expected("TableGroupJoinTree", other.name(), id)),
        }
    }

    /// Move the expressions of a node out so they can be rewritten while the
    /// graph is borrowed mutably. Must be paired with `restore_expressions`.
    pub fn take_expressions(&mut self, id: NodeId) -> Vec<Expression> {
        self.nodes[id.0]
            .kind
            .expressions_mut()
            .into_iter()
            .map(|slot| std::mem::replace(slot, Expression::null()))
            .collect()
    }

    pub fn restore_expressions(&mut self, id: NodeId, expressions: Vec<Expression>) -> QueryResult<()> {
        let mut slots = self.nodes[id.0].kind.expressions_mut();
        if slots.len() != expressions.len() {
            return Err(QueryError::Internal(format!(
                "expression count of {} changed while rewriting",
                id
            )));
        }
        for (slot, expression) in slots.iter_mut().zip(expressions) {
            **slot = expression;
        }
        Ok(())
    }

    /// All nodes reachable from `start` through inputs, referenced nodes and
    /// subquery expressions, parents first
    pub fn reachable(&self, start: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            let kind = self.kind(id);
            let mut next: Vec<NodeId> = kind.inputs();
            next.extend(kind.referenced_nodes());
            for expression in kind.expressions() {
                next.extend(expression.subqueries());
            }
            for n in next.into_iter().rev() {
                if !seen.contains(&n) {
                    stack.push(n);
                }
            }
        }
        order
    }

    /// Indented outline of the plan below `id`, one node per line
    pub fn describe(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.describe_into(id, 0, &mut out);
        out
    }

    fn describe_into(&self, id: NodeId, depth: usize, out: &mut String) {
        let _ = writeln!(out, "{}{}", "  ".repeat(depth), self.summary(id));
        for input in self.inputs(id) {
            self.describe_into(input, depth + 1, out);
        }
    }

    /// One-line description of a node
    pub fn summary(&self, id: NodeId) -> String {
        let kind = self.kind(id);
        let list = |expressions: &[Expression]| {
            expressions.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
        };
        let names = |tables: &[NodeId]| {
            tables.iter().map(|t| self.source_name(*t)).collect::<Vec<_>>().join(", ")
        };
        match kind {
            PlanNodeKind::Select { conditions, .. } => format!("Select[{}]", list(conditions)),
            PlanNodeKind::Project { fields, .. } => format!("Project[{}]", list(fields)),
            PlanNodeKind::AggregateSource { group_by, aggregates, .. } => {
                format!("AggregateSource([{}],[{}])", list(group_by), list(aggregates))
            }
            PlanNodeKind::Join(join) => {
                format!("JoinNode({:?}[{}])", join.join_type, list(&join.conditions))
            }
            PlanNodeKind::MapJoin { join_type, .. } => format!("MapJoin({:?})", join_type),
            PlanNodeKind::Limit { offset, limit, .. } => match limit {
                Some(limit) => format!("Limit({}, {})", offset, limit),
                None => format!("Limit({})", offset),
            },
            PlanNodeKind::TableSource(source) => format!("TableSource({})", source.name),
            PlanNodeKind::TableGroupJoinTree(tree) => {
                format!("TableGroupJoinTree({})", names(&tree.tables()))
            }
            PlanNodeKind::ExpressionsSource { rows, .. } => {
                let rows: Vec<String> = rows.iter().map(|r| format!("[{}]", list(r))).collect();
                format!("ExpressionsSource[{}]", rows.join(", "))
            }
            PlanNodeKind::SubquerySource { name, .. } => format!("SubquerySource({})", name),
            PlanNodeKind::IndexScan(scan) => {
                let covering = if scan.covering { "covering" } else { "" };
                format!("SingleIndexScan({} {}[{}])", scan.index.name, covering, list(&scan.equality))
            }
            PlanNodeKind::GroupScan { tables, .. } => format!("GroupScan({})", names(tables)),
            PlanNodeKind::AncestorLookup { descendant, ancestors, .. } => {
                format!("AncestorLookup({} -> [{}])", self.source_name(*descendant), names(ancestors))
            }
            PlanNodeKind::BranchLookup { source, tables, .. } => {
                format!("BranchLookup({} -> [{}])", self.source_name(*source), names(tables))
            }
            PlanNodeKind::Flatten { tables, join_types, .. } => {
                let types: Vec<String> = join_types.iter().map(|t| format!("{:?}", t).to_uppercase()).collect();
                format!("Flatten({} | {})", names(tables), types.join(" "))
            }
            PlanNodeKind::Insert { table, .. } => format!("InsertStatement({})", table.name()),
            PlanNodeKind::Update { table, update_columns, .. } => {
                let sets: Vec<String> = update_columns
                    .iter()
                    .map(|c| format!("{}={}", c.column, c.expression))
                    .collect();
                format!("UpdateStatement({}[{}])", table.name(), sets.join(", "))
            }
            PlanNodeKind::Delete { table, .. } => format!("DeleteStatement({})", table.name()),
            other => other.name().to_string(),
        }
    }

    fn source_name(&self, id: NodeId) -> String {
        match self.kind(id) {
            PlanNodeKind::TableSource(source) => source.name.clone(),
            other => format!("{}{}", other.name(), id),
        }
    }
}

fn expected(wanted: &str, found: &str, id: NodeId) -> QueryError {
    QueryError::Internal(format!("expected {} at {}, found {}", wanted, id, found))
}
