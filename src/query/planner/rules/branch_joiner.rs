// Branch Joiner
//
// Turns each table group join tree into homogeneous rows: flattened
// single branches, with any further branches brought in by products. The
// chosen scan anchors the first branch; lookups fetch the ancestors and
// descendants it does not produce itself.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, trace};

use super::find_nodes;
use crate::catalog::{Catalog, Table};
use crate::query::executor::result::{QueryError, QueryResult};
use crate::query::planner::context::PlanContext;
use crate::query::planner::cost_model::CostEstimator;
use crate::query::planner::optimizer::Rule;
use crate::query::planner::plan::node::{PlanNodeKind, TableGroupJoinNode, TableGroupJoinTree};
use crate::query::planner::plan::{JoinType, NodeId, PlanGraph};

const REQUIRED: u8 = TableGroupJoinNode::REQUIRED;
const PARENT: u8 = TableGroupJoinNode::PARENT;
const LEFT_PARENT: u8 = TableGroupJoinNode::LEFT_PARENT;
const BRANCHPOINT: u8 = TableGroupJoinNode::BRANCHPOINT;
const PENDING: u8 = TableGroupJoinNode::PENDING;

pub struct BranchJoiner;

impl Rule for BranchJoiner {
    fn name(&self) -> &'static str {
        "BranchJoiner"
    }

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        let catalog = context.catalog;
        let costs = context.cost_estimator;
        let graph = &mut context.plan;
        let root = graph.root()?;
        let trees = find_nodes(graph, root, |kind| matches!(kind, PlanNodeKind::TableGroupJoinTree(_)));
        for &id in &trees {
            if graph.tree(id)?.scan.is_none() {
                pick_scan(graph, catalog, costs, id)?;
            }
            let tree = graph.tree(id)?.clone();
            let mut joiner = Joiner { graph: &mut *graph, tree };
            let joined = joiner.join_branches()?;
            let marked = joiner.tree;
            *graph.tree_mut(id)? = marked;
            graph.replace_node(id, joined)?;
            trace!("Group join tree {} became {}", id, graph.summary(joined));
        }
        debug!("Joined branches of {} table groups", trees.len());
        Ok(())
    }
}

/// Choose the cheapest of the tree's candidate scans and a scan of the
/// whole group
fn pick_scan(graph: &mut PlanGraph, catalog: &Catalog, costs: &dyn CostEstimator, id: NodeId) -> QueryResult<()> {
    let tree = graph.tree(id)?;
    let root_table = tree.nodes[tree.root].table;
    let group = graph.table_source(root_table)?.table.group();
    let (tables, candidates) = (tree.tables(), tree.candidates.clone());
    let group_scan = graph.add(PlanNodeKind::GroupScan { group, tables });

    let mut best: Option<(NodeId, f64)> = None;
    for scan in candidates.into_iter().chain(std::iter::once(group_scan)) {
        let cost = scan_cost(graph, catalog, costs, scan)?;
        trace!("Candidate {} costs {:.1}", graph.summary(scan), cost);
        if best.map_or(true, |(_, lowest)| cost < lowest) {
            best = Some((scan, cost));
        }
    }
    let (scan, cost) = best.ok_or_else(|| QueryError::Internal(format!("no scan for group join tree {}", id)))?;
    debug!("Picked {} for {} at cost {:.1}", graph.summary(scan), id, cost);
    graph.tree_mut(id)?.scan = Some(scan);
    Ok(())
}

fn scan_cost(graph: &PlanGraph, catalog: &Catalog, costs: &dyn CostEstimator, scan: NodeId) -> QueryResult<f64> {
    match graph.kind(scan) {
        PlanNodeKind::IndexScan(index_scan) => {
            let leaf = &graph.table_source(index_scan.leaf)?.table;
            let has_range = index_scan.low.is_some() || index_scan.high.is_some();
            Ok(costs
                .cost_index_scan(&index_scan.index, leaf, index_scan.equality.len(), has_range, index_scan.covering)
                .cost)
        }
        PlanNodeKind::IndexIntersection { output_scan, selector_scan, .. } => {
            Ok(scan_cost(graph, catalog, costs, *output_scan)? + scan_cost(graph, catalog, costs, *selector_scan)?)
        }
        PlanNodeKind::GroupScan { group, .. } => {
            let tables: Vec<&Table> =
                catalog.tables().iter().filter(|t| t.group() == *group).map(Arc::as_ref).collect();
            Ok(costs.cost_group_scan(&tables).cost)
        }
        other => Err(QueryError::Internal(format!("cannot cost {} as a group access path", other.name()))),
    }
}

/// Tables whose rows the scan does not supply itself, or `None` for all
fn required_tables(graph: &PlanGraph, scan: NodeId) -> Option<BTreeSet<NodeId>> {
    match graph.kind(scan) {
        PlanNodeKind::IndexScan(index_scan) => index_scan.required_tables.clone(),
        PlanNodeKind::IndexIntersection { output_scan, .. } => required_tables(graph, *output_scan),
        _ => None,
    }
}

/// Table the rows of an index-driven scan belong to
fn leaf_most_table(graph: &PlanGraph, scan: NodeId) -> QueryResult<NodeId> {
    match graph.kind(scan) {
        PlanNodeKind::IndexScan(index_scan) => Ok(index_scan.leaf),
        PlanNodeKind::IndexIntersection { output_scan, .. } => leaf_most_table(graph, *output_scan),
        other => Err(QueryError::Internal(format!("{} is not an index scan", other.name()))),
    }
}

struct Joiner<'g> {
    graph: &'g mut PlanGraph,
    tree: TableGroupJoinTree,
}

impl<'g> Joiner<'g> {
    fn join_branches(&mut self) -> QueryResult<NodeId> {
        let root = self.tree.root;
        let scan = self
            .tree
            .scan
            .ok_or_else(|| QueryError::Internal("group join tree without a scan".to_string()))?;
        if let PlanNodeKind::IndexScan(index_scan) = self.graph.kind(scan) {
            if index_scan.covering {
                return Ok(scan);
            }
        }
        let required = required_tables(self.graph, scan);
        self.mark_branches(root, required.as_ref());

        let joined = match self.graph.kind(scan).clone() {
            PlanNodeKind::IndexScan(_) | PlanNodeKind::IndexIntersection { .. } => {
                let index_table = leaf_most_table(self.graph, scan)?;
                self.anchored_scan(scan, index_table, true)?
            }
            PlanNodeKind::FullTextScan { table, .. } => self.anchored_scan(scan, table, false)?,
            PlanNodeKind::GroupScan { .. } => self.fill_branch(root, root, root, |graph, tables| {
                if let PlanNodeKind::GroupScan { tables: scanned, .. } = graph.kind_mut(scan) {
                    *scanned = tables;
                }
                scan
            })?,
            PlanNodeKind::GroupLoopScan { inside, outside, inside_parent, .. } => {
                if inside_parent {
                    let parent = self.index_of(inside)?;
                    let ancestors = self.pending_tables(parent, root)?;
                    let lookup = self.graph.add(PlanNodeKind::AncestorLookup {
                        input: scan,
                        descendant: outside,
                        ancestors,
                    });
                    let flattened = self.flatten(lookup, parent, root)?;
                    self.fill_group_loop_branches(flattened, parent, root)?
                } else {
                    if inside != self.table(root) {
                        return Err(QueryError::Internal(format!(
                            "group loop inside table {} is not the root of its tree",
                            inside
                        )));
                    }
                    self.fill_branch(root, root, root, |graph, tables| {
                        graph.add(PlanNodeKind::BranchLookup {
                            input: Some(scan),
                            source: outside,
                            branch: inside,
                            tables,
                        })
                    })?
                }
            }
            other => {
                return Err(QueryError::Internal(format!("unknown group join tree scan {}", other.name())));
            }
        };

        if let Some(pending) = self.tree.nodes.iter().find(|n| n.has(PENDING)) {
            return Err(QueryError::Internal(format!("table {} left pending", pending.table)));
        }
        Ok(joined)
    }

    /// Start from rows of `index_table`: fetch what is pending above it,
    /// and its own branch when it has required descendants
    fn anchored_scan(&mut self, mut scan: NodeId, index_table: NodeId, side_jump: bool) -> QueryResult<NodeId> {
        let root = self.tree.root;
        let mut leaf = self.index_of(index_table)?;
        let mut ancestors = self.pending_tables(leaf, root)?;
        if self.has(leaf, PARENT) {
            // The index table moves from the ancestors to the branch
            if let Some(position) = ancestors.iter().position(|t| *t == index_table) {
                ancestors.remove(position);
                self.tree.nodes[leaf].set(PENDING);
            }
            let (branch_leaf, tables) = self.single_branch_pending(leaf)?;
            scan = self.graph.add(PlanNodeKind::BranchLookup {
                input: Some(scan),
                source: index_table,
                branch: index_table,
                tables,
            });
            leaf = branch_leaf;
        } else if side_jump && !self.has(leaf, REQUIRED) {
            if let Some(jumped) = self.try_side_branch(scan, leaf, index_table, &mut ancestors)? {
                return Ok(jumped);
            }
        }
        if !ancestors.is_empty() {
            scan = self.graph.add(PlanNodeKind::AncestorLookup { input: scan, descendant: index_table, ancestors });
        }
        let flattened = self.flatten(scan, leaf, root)?;
        self.fill_side_branches(flattened, leaf, root)
    }

    /// Nothing is needed from the index table's own branch: go straight
    /// over to a branch that is
    fn try_side_branch(
        &mut self,
        scan: NodeId,
        leaf: usize,
        index_table: NodeId,
        ancestors: &mut Vec<NodeId>,
    ) -> QueryResult<Option<NodeId>> {
        let root = self.tree.root;
        // With ancestors to fetch the jump must start below the
        // leaf-most of them
        let find_required = !ancestors.is_empty();
        let mut leaf_most_child = leaf;
        let mut leaf_most_parent = None;
        while leaf_most_child != root {
            let parent = self.parent(leaf_most_child)?;
            if self.has(parent, if find_required { REQUIRED } else { PARENT }) {
                leaf_most_parent = Some(parent);
                break;
            }
            leaf_most_child = parent;
        }
        let Some(leaf_most_parent) = leaf_most_parent else {
            return Ok(None);
        };
        let mut side_branch = None;
        let mut child_parent = None;
        for &child in &self.tree.nodes[leaf_most_parent].children {
            if self.has(child, REQUIRED) {
                side_branch = Some(child);
                break;
            }
            if self.has(child, PARENT) {
                child_parent = Some(child);
            }
        }
        let Some(side_branch) = side_branch.or(child_parent) else {
            return Ok(None);
        };

        let parent_table = self.table(leaf_most_parent);
        let same_row_type = self.graph.table_source(self.table(leaf_most_child))?.table.id()
            == self.graph.table_source(self.table(side_branch))?.table.id();
        let mut input = scan;
        if !ancestors.is_empty() || same_row_type {
            // One index row cannot feed both lookups
            if !ancestors.contains(&parent_table) {
                ancestors.push(parent_table);
            }
            input = self.graph.add(PlanNodeKind::AncestorLookup {
                input,
                descendant: index_table,
                ancestors: ancestors.clone(),
            });
        }
        let branch = self.table(side_branch);
        trace!("Jumping from {} to side branch {}", index_table, branch);
        let jumped = self.fill_branch(side_branch, root, root, |graph, tables| {
            graph.add(PlanNodeKind::BranchLookup { input: Some(input), source: parent_table, branch, tables })
        })?;
        Ok(Some(jumped))
    }

    /// Pick a pending branch under `under_root`, produce its rows with
    /// `start`, flatten it up to `flatten_root` and bring in the other
    /// branches up to `side_root`
    fn fill_branch(
        &mut self,
        under_root: usize,
        flatten_root: usize,
        side_root: usize,
        start: impl FnOnce(&mut PlanGraph, Vec<NodeId>) -> NodeId,
    ) -> QueryResult<NodeId> {
        let (leaf, tables) = self.single_branch_pending(under_root)?;
        let input = start(&mut *self.graph, tables);
        let flattened = self.flatten(input, leaf, flatten_root)?;
        self.fill_side_branches(flattened, leaf, side_root)
    }

    /// One flatten of the required tables from `leaf` up to `root`
    fn flatten(&mut self, mut input: NodeId, leaf: usize, root: usize) -> QueryResult<NodeId> {
        let mut tables = Vec::new();
        let mut join_types = Vec::new();
        let mut join_type: Option<JoinType> = None;
        let mut conditions = Vec::new();
        let mut index = leaf;
        loop {
            let node = &self.tree.nodes[index];
            if node.has(REQUIRED) {
                join_types.extend(join_type);
                tables.push(node.table);
                if index != root {
                    join_type = Some(node.parent_join_type);
                    conditions.extend(node.join_conditions.iter().filter(|c| !c.is_group_join()).cloned());
                }
            }
            if index == root {
                break;
            }
            index = self.parent(index)?;
        }
        tables.reverse();
        join_types.reverse();
        if !conditions.is_empty() {
            input = self.graph.add(PlanNodeKind::Select { input, conditions });
        }
        Ok(self.graph.add(PlanNodeKind::Flatten { input, tables, join_types }))
    }

    /// Product in the pending branches beside the one flattened from
    /// `leaf`, at each branchpoint up to `root`
    fn fill_side_branches(&mut self, mut input: NodeId, leaf: usize, root: usize) -> QueryResult<NodeId> {
        let mut branch = leaf;
        while branch != root {
            let parent = self.parent(branch)?;
            if self.has(parent, BRANCHPOINT) {
                let mut subplans = vec![input];
                for sibling in self.tree.nodes[parent].children.clone() {
                    if sibling == branch || self.leaf_left_most_pending(sibling).is_none() {
                        continue;
                    }
                    let (source, target) = (self.table(parent), self.table(sibling));
                    // No input: nested under the product's bound row
                    let subplan = self.fill_branch(sibling, parent, sibling, |graph, tables| {
                        graph.add(PlanNodeKind::BranchLookup { input: None, source, branch: target, tables })
                    })?;
                    subplans.push(subplan);
                }
                if subplans.len() > 1 {
                    let ancestor = Some(self.table(parent));
                    input = self.graph.add(PlanNodeKind::Product { ancestor, subplans });
                }
            }
            branch = parent;
        }
        Ok(input)
    }

    /// Ancestors from `parent` up are flattened and the child is in
    /// another tree: fill out the branches beneath
    fn fill_group_loop_branches(&mut self, mut input: NodeId, parent: usize, root: usize) -> QueryResult<NodeId> {
        let mut leaf = parent;
        if self.has(parent, PARENT) {
            let first = self.tree.nodes[parent].children.first().copied();
            if let Some(first) = first {
                leaf = first;
                let (source, branch) = (self.table(parent), self.table(first));
                input = self.fill_branch(first, parent, first, |graph, tables| {
                    graph.add(PlanNodeKind::BranchLookup { input: Some(input), source, branch, tables })
                })?;
            }
        }
        self.fill_side_branches(input, leaf, root)
    }

    fn single_branch_pending(&mut self, root: usize) -> QueryResult<(usize, Vec<NodeId>)> {
        let leaf = self
            .leaf_left_most_pending(root)
            .ok_or_else(|| QueryError::Internal(format!("no pending branch under {}", self.table(root))))?;
        let tables = self.pending_tables(leaf, root)?;
        Ok((leaf, tables))
    }

    /// Pending tables from `root` down to `leaf`, no longer pending
    fn pending_tables(&mut self, leaf: usize, root: usize) -> QueryResult<Vec<NodeId>> {
        let mut tables = Vec::new();
        let mut index = leaf;
        loop {
            let node = &mut self.tree.nodes[index];
            if node.has(PENDING) {
                node.clear(PENDING);
                tables.push(node.table);
            }
            if index == root {
                break;
            }
            index = self.parent(index)?;
        }
        tables.reverse();
        Ok(tables)
    }

    /// Deepest pending table along the first pending path under `root`
    fn leaf_left_most_pending(&self, root: usize) -> Option<usize> {
        let mut leaf = None;
        for index in self.subtree(root) {
            if let Some(found) = leaf {
                if !self.tree.is_ancestor_or_self(found, index) {
                    break;
                }
            }
            if self.has(index, PENDING) {
                leaf = Some(index);
            }
        }
        leaf
    }

    /// Flag each node bottom-up; returns whether any flag was set
    fn mark_branches(&mut self, index: usize, required: Option<&BTreeSet<NodeId>>) -> bool {
        let mut flags = 0;
        for child in self.tree.nodes[index].children.clone() {
            if self.mark_branches(child, required) {
                if flags & PARENT == 0 {
                    flags |= PARENT;
                } else {
                    flags |= BRANCHPOINT;
                }
                if self.tree.nodes[child].parent_join_type == JoinType::Left {
                    flags |= LEFT_PARENT;
                }
            }
        }
        let node = &mut self.tree.nodes[index];
        if required.map_or(true, |r| r.contains(&node.table))
            || flags & (BRANCHPOINT | LEFT_PARENT) != 0
            || node.parent_join_type == JoinType::Right
        {
            flags |= REQUIRED | PENDING;
        }
        node.state = flags;
        flags != 0
    }

    fn subtree(&self, root: usize) -> Vec<usize> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            order.push(index);
            stack.extend(self.tree.nodes[index].children.iter().rev());
        }
        order
    }

    fn has(&self, index: usize, flag: u8) -> bool {
        self.tree.nodes[index].has(flag)
    }

    fn table(&self, index: usize) -> NodeId {
        self.tree.nodes[index].table
    }

    fn parent(&self, index: usize) -> QueryResult<usize> {
        self.tree.nodes[index]
            .parent
            .ok_or_else(|| QueryError::Internal(format!("table {} has no parent in its tree", self.table(index))))
    }

    fn index_of(&self, table: NodeId) -> QueryResult<usize> {
        self.tree
            .find(table)
            .ok_or_else(|| QueryError::Internal(format!("table {} is not in its group join tree", table)))
    }
}
