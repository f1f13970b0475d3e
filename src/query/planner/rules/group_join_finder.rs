// Group Join Finder
//
// Finds joins between tables of one storage group that follow the group's
// parent/child keys, and replaces each connected run of them with a single
// `TableGroupJoinTree`. Work is done per join island: a maximal tree of
// joins (or a lone table) together with the WHERE list directly above it.
//
// The passes are:
//  1. move inner join conditions up into WHERE and normalize comparisons
//  2. match each table to its parent through grouping-join conditions,
//     then through foreign keys, merging the table groups found
//  3. reorder runs of plain inner joins by group and ordinal
//  4. fold same-group joins into trees
//  5. attach group conditions to their tree nodes and push the remaining
//     WHERE conditions down to the narrowest inner join covering them

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, trace};

use super::{find_nodes, nodes_below};
use crate::catalog::{Catalog, JoinColumn, Table};
use crate::common::types::{GroupId, TableId};
use crate::query::executor::result::{QueryError, QueryResult};
use crate::query::planner::context::PlanContext;
use crate::query::planner::equivalence::{ColumnEquivalences, EquivalenceFinder};
use crate::query::planner::optimizer::Rule;
use crate::query::planner::plan::expression::{
    ColumnExpression, ComparisonOp, ConditionImplementation, Expression, ExpressionKind,
};
use crate::query::planner::plan::group::TableGroupId;
use crate::query::planner::plan::node::{
    GroupJoinOrigin, JoinNode, PlanNodeKind, TableGroupJoin, TableGroupJoinTree,
};
use crate::query::planner::plan::{JoinType, NodeId, PlanGraph};

pub struct GroupJoinFinder;

impl Rule for GroupJoinFinder {
    fn name(&self) -> &'static str {
        "GroupJoinFinder"
    }

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        let root = context.plan.root()?;
        let mut finder = Finder { graph: &mut context.plan, catalog: context.catalog };
        let mut islands = finder.find_islands(root);
        if islands.is_empty() {
            return Ok(());
        }
        for island in &islands {
            finder.move_and_normalize_where_conditions(island)?;
        }
        for island in islands.iter_mut() {
            finder.find_group_joins(island)?;
        }
        for island in &islands {
            finder.find_fk_groups(island)?;
            finder.find_single_groups(island.root)?;
        }
        for island in islands.iter_mut() {
            finder.reorder_joins(island)?;
        }
        for island in islands.iter_mut() {
            finder.isolate_groups(island)?;
        }
        for island in &islands {
            finder.move_join_conditions(island)?;
        }
        debug!(
            "Grouped {} join islands into {} table groups",
            islands.len(),
            finder.graph.groups.live().len()
        );
        Ok(())
    }
}

/// A maximal tree of joinables and the node consuming it
struct JoinIsland {
    root: NodeId,
    output: NodeId,
    where_select: Option<NodeId>,
    /// Tables whose parent join was found in the WHERE list
    where_joins: Vec<NodeId>,
    equivalences: ColumnEquivalences,
}

/// A group condition found for one grouping-join column, and whether it
/// was derived through equivalences rather than written in the query
type FoundCondition = Option<(Expression, bool)>;

struct Finder<'a> {
    graph: &'a mut PlanGraph,
    catalog: &'a Catalog,
}

impl Finder<'_> {
    fn find_islands(&self, root: NodeId) -> Vec<JoinIsland> {
        let candidates = find_nodes(self.graph, root, |kind| {
            matches!(
                kind,
                PlanNodeKind::Join(_) | PlanNodeKind::TableSource(_) | PlanNodeKind::TableGroupJoinTree(_)
            )
        });
        let mut scopes: HashMap<NodeId, ColumnEquivalences> = HashMap::new();
        let mut islands = Vec::new();
        for id in candidates {
            let Some(output) = self.graph.output(id) else {
                continue;
            };
            let consumer = self.graph.kind(output);
            if consumer.is_joinable() {
                continue;
            }
            let where_select = matches!(consumer, PlanNodeKind::Select { .. }).then_some(output);
            let scope = self.scope_of(id);
            let equivalences = scopes
                .entry(scope)
                .or_insert_with(|| ColumnEquivalences::for_scope(self.graph, scope))
                .clone();
            islands.push(JoinIsland { root: id, output, where_select, where_joins: Vec::new(), equivalences });
        }
        islands
    }

    /// The root of the query block containing `node`
    fn scope_of(&self, mut node: NodeId) -> NodeId {
        while let Some(output) = self.graph.output(node) {
            if matches!(self.graph.kind(node), PlanNodeKind::Subquery { .. }) {
                break;
            }
            node = output;
        }
        node
    }

    // Pass 1

    fn move_and_normalize_where_conditions(&mut self, island: &JoinIsland) -> QueryResult<()> {
        if let Some(select) = island.where_select {
            let mut moved = Vec::new();
            self.move_inner_join_conditions(island.root, &mut moved)?;
            let mut conditions = std::mem::take(conditions_mut(self.graph, GroupJoinOrigin::Where(select))?);
            conditions.extend(moved);
            let normalized = self.normalize_column_comparisons(conditions);
            *conditions_mut(self.graph, GroupJoinOrigin::Where(select))? = normalized;
        }
        for join in self.joins_below(island.root) {
            let conditions = std::mem::take(&mut self.graph.join_mut(join)?.conditions);
            let normalized = self.normalize_column_comparisons(conditions);
            self.graph.join_mut(join)?.conditions = normalized;
        }
        Ok(())
    }

    /// Lift the conditions of inner joins reachable without crossing into
    /// an optional side
    fn move_inner_join_conditions(&mut self, node: NodeId, moved: &mut Vec<Expression>) -> QueryResult<()> {
        let Ok(join) = self.graph.join(node) else {
            return Ok(());
        };
        let (left, right, join_type) = (join.left, join.right, join.join_type);
        if join_type.is_inner() {
            moved.append(&mut self.graph.join_mut(node)?.conditions);
        }
        if !join_type.left_optional() {
            self.move_inner_join_conditions(left, moved)?;
        }
        if matches!(join_type, JoinType::Inner | JoinType::Right) {
            self.move_inner_join_conditions(right, moved)?;
        }
        Ok(())
    }

    /// Put a column on the left of each comparison, the child table's
    /// column when both sides are columns, and drop duplicates
    fn normalize_column_comparisons(&self, conditions: Vec<Expression>) -> Vec<Expression> {
        let mut normalized: Vec<Expression> = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let flip = match &condition.kind {
                ExpressionKind::Comparison { left, right, .. } => match (left.as_column(), right.as_column()) {
                    (Some(l), Some(r)) => self.compare_column_sources(l.source, r.source) == Ordering::Less,
                    (None, Some(_)) => true,
                    _ => false,
                },
                _ => false,
            };
            let condition = if flip { reverse_comparison(condition) } else { condition };
            if !normalized.contains(&condition) {
                normalized.push(condition);
            }
        }
        normalized
    }

    fn joins_below(&self, node: NodeId) -> Vec<NodeId> {
        let mut joins = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let PlanNodeKind::Join(join) = self.graph.kind(id) {
                joins.push(id);
                stack.push(join.left);
                stack.push(join.right);
            }
        }
        joins
    }

    // Pass 2

    fn find_group_joins(&mut self, island: &mut JoinIsland) -> QueryResult<()> {
        let mut where_joins = Vec::new();
        self.find_group_joins_below(
            island.root,
            &mut Vec::new(),
            island.where_select,
            &mut where_joins,
            &island.equivalences.columns,
        )?;
        island.where_joins = where_joins;
        Ok(())
    }

    /// `outputs` holds the joins whose conditions may join `node` to its
    /// parent, outermost first
    fn find_group_joins_below(
        &mut self,
        node: NodeId,
        outputs: &mut Vec<NodeId>,
        where_select: Option<NodeId>,
        where_joins: &mut Vec<NodeId>,
        equivalences: &EquivalenceFinder<ColumnExpression>,
    ) -> QueryResult<()> {
        if matches!(self.graph.kind(node), PlanNodeKind::TableSource(_)) {
            for &join in outputs.iter().rev() {
                if self.find_parent_join(node, GroupJoinOrigin::Join(join), equivalences)? {
                    return Ok(());
                }
            }
            if let Some(select) = where_select {
                if self.find_parent_join(node, GroupJoinOrigin::Where(select), equivalences)? {
                    where_joins.push(node);
                }
            }
            return Ok(());
        }
        let Ok(join) = self.graph.join(node) else {
            return Ok(());
        };
        let (left, right, join_type) = (join.left, join.right, join.join_type);
        outputs.push(node);
        if join_type.is_inner() {
            self.find_group_joins_below(left, outputs, where_select, where_joins, equivalences)?;
            self.find_group_joins_below(right, outputs, where_select, where_joins, equivalences)?;
        } else {
            // The optional side only sees this join's own conditions
            let mut single = vec![node];
            if join_type.left_optional() {
                self.find_group_joins_below(left, &mut single, None, where_joins, equivalences)?;
            } else {
                self.find_group_joins_below(left, outputs, where_select, where_joins, equivalences)?;
            }
            if join_type == JoinType::Right {
                self.find_group_joins_below(right, outputs, where_select, where_joins, equivalences)?;
            } else {
                self.find_group_joins_below(right, &mut single, None, where_joins, equivalences)?;
            }
        }
        outputs.pop();
        Ok(())
    }

    /// Look in the conditions of `holder` for a complete grouping join from
    /// `child` to a parent table source
    fn find_parent_join(
        &mut self,
        child: NodeId,
        holder: GroupJoinOrigin,
        equivalences: &EquivalenceFinder<ColumnExpression>,
    ) -> QueryResult<bool> {
        let conditions = conditions(self.graph, holder)?.clone();
        if conditions.is_empty() {
            return Ok(false);
        }
        let table = self.graph.table_source(child)?.table.clone();
        let Some(grouping) = table.parent_join() else {
            return Ok(false);
        };
        let count = grouping.columns.len();
        let mut parents: BTreeMap<NodeId, Vec<FoundCondition>> = BTreeMap::new();
        for (i, column) in grouping.columns.iter().enumerate() {
            let target = ColumnTarget { column, child, parent_table: grouping.parent };
            let found = self.find_group_condition(&target, i, count, &conditions, true, equivalences, &mut parents)
                || self.find_group_condition(&target, i, count, &conditions, false, equivalences, &mut parents);
            if !found {
                return Ok(false);
            }
        }
        let mut complete: Vec<(NodeId, Vec<(Expression, bool)>)> = parents
            .into_iter()
            .filter_map(|(parent, found)| found.into_iter().collect::<Option<Vec<_>>>().map(|f| (parent, f)))
            .collect();
        if complete.len() > 1 {
            let position = |c: &Expression| conditions.iter().position(|x| x == c).unwrap_or(usize::MAX);
            let (first, second) = (&complete[0].1[0].0, &complete[1].1[0].0);
            let earlier = if position(second) < position(first) { second } else { first };
            return Err(QueryError::UnsupportedSql(format!(
                "Found two possible parent joins: {}",
                earlier.sql.clone().unwrap_or_else(|| earlier.to_string())
            )));
        }
        let Some((parent, found)) = complete.pop() else {
            return Ok(false);
        };

        let group = self.join_groups(parent, child, table.group())?;
        let group_conditions: Vec<Expression> = found
            .iter()
            .map(|(condition, _)| {
                let mut condition = condition.clone();
                condition.implementation = ConditionImplementation::GroupJoin;
                condition
            })
            .collect();
        let list = conditions_mut(self.graph, holder)?;
        for (condition, generated) in found {
            if generated {
                list.push(condition);
            }
        }
        for condition in list.iter_mut() {
            if group_conditions.contains(condition) {
                condition.implementation = ConditionImplementation::GroupJoin;
            }
        }
        trace!("{} joins to parent {} through {:?}", child, parent, holder);
        self.graph.table_source_mut(child)?.parent_join =
            Some(TableGroupJoin { parent, conditions: group_conditions, group, origin: holder });
        Ok(true)
    }

    /// Record the conditions of `conditions` that join the target column,
    /// keyed by parent source. `exact` requires the columns as written.
    #[allow(clippy::too_many_arguments)]
    fn find_group_condition(
        &self,
        target: &ColumnTarget<'_>,
        index: usize,
        count: usize,
        conditions: &[Expression],
        exact: bool,
        equivalences: &EquivalenceFinder<ColumnExpression>,
        parents: &mut BTreeMap<NodeId, Vec<FoundCondition>>,
    ) -> bool {
        let mut found = false;
        for condition in conditions {
            let Some((left, right)) = self.table_column_pair(condition) else {
                continue;
            };
            let Some((normalized, generated)) =
                self.normalized_condition(target, left, right, condition, exact, equivalences)
            else {
                continue;
            };
            let Some(parent) = right_column_source(&normalized) else {
                continue;
            };
            found = true;
            parents.entry(parent).or_insert_with(|| vec![None; count])[index] = Some((normalized, generated));
        }
        found
    }

    /// `condition` rewritten as child column = parent column, using
    /// equivalent columns when the written ones do not match
    fn normalized_condition(
        &self,
        target: &ColumnTarget<'_>,
        left: &Expression,
        right: &Expression,
        condition: &Expression,
        exact: bool,
        equivalences: &EquivalenceFinder<ColumnExpression>,
    ) -> Option<(Expression, bool)> {
        let (l, r) = (left.as_column()?, right.as_column()?);
        let is_child = |c: &ColumnExpression| c.source == target.child && c.position == target.column.child;
        let is_parent = |c: &ColumnExpression| {
            c.position == target.column.parent && self.table(c.source).map(|t| t.id()) == Some(target.parent_table)
        };
        let child_column = if is_child(l) { l.clone() } else { equivalences.find_equivalents(l).find(|c| is_child(c))? };
        let parent_column =
            if is_parent(r) { r.clone() } else { equivalences.find_equivalents(r).find(|c| is_parent(c))? };
        if child_column == *l && parent_column == *r {
            return Some((condition.clone(), false));
        }
        if exact {
            return None;
        }
        let generated = Expression {
            kind: ExpressionKind::Comparison {
                op: ComparisonOp::Eq,
                left: Box::new(Expression { kind: ExpressionKind::Column(child_column), ..left.clone() }),
                right: Box::new(Expression { kind: ExpressionKind::Column(parent_column), ..right.clone() }),
            },
            ty: condition.ty.clone(),
            sql: condition.sql.clone(),
            implementation: ConditionImplementation::Normal,
        };
        Some((generated, true))
    }

    /// Both sides of an equality, when both are columns of table sources
    fn table_column_pair<'e>(&self, condition: &'e Expression) -> Option<(&'e Expression, &'e Expression)> {
        let ExpressionKind::Comparison { op: ComparisonOp::Eq, left, right } = &condition.kind else {
            return None;
        };
        let (l, r) = (left.as_column()?, right.as_column()?);
        (self.table(l.source).is_some() && self.table(r.source).is_some()).then_some((left.as_ref(), right.as_ref()))
    }

    /// Put `parent` and `child` in one table group
    fn join_groups(&mut self, parent: NodeId, child: NodeId, catalog_group: GroupId) -> QueryResult<TableGroupId> {
        let parent_group = self.table_group(parent);
        let child_group = self.table_group(child);
        let groups = &mut self.graph.groups;
        let group = match (parent_group, child_group) {
            (Some(p), Some(c)) => groups.merge(p, c),
            (Some(p), None) => p,
            (None, Some(c)) => c,
            (None, None) => groups.create(catalog_group, child),
        };
        groups.add_table(group, parent);
        groups.add_table(group, child);
        self.graph.table_source_mut(parent)?.group = Some(group);
        self.graph.table_source_mut(child)?.group = Some(group);
        Ok(group)
    }

    fn find_fk_groups(&mut self, island: &JoinIsland) -> QueryResult<()> {
        self.find_fk_groups_below(island.root, &mut Vec::new(), island.where_select, &island.equivalences.foreign_keys)
    }

    fn find_fk_groups_below(
        &mut self,
        node: NodeId,
        outputs: &mut Vec<NodeId>,
        where_select: Option<NodeId>,
        equivalences: &EquivalenceFinder<ColumnExpression>,
    ) -> QueryResult<()> {
        if matches!(self.graph.kind(node), PlanNodeKind::TableSource(_)) {
            for &join in outputs.iter().rev() {
                if self.table_group(node).is_some() {
                    return Ok(());
                }
                self.find_parent_fk_join(node, GroupJoinOrigin::Join(join), equivalences)?;
            }
            if let Some(select) = where_select {
                if self.table_group(node).is_none() {
                    self.find_parent_fk_join(node, GroupJoinOrigin::Where(select), equivalences)?;
                }
            }
            return Ok(());
        }
        let Ok(join) = self.graph.join(node) else {
            return Ok(());
        };
        let (left, right) = (join.left, join.right);
        outputs.push(node);
        self.find_fk_groups_below(left, outputs, where_select, equivalences)?;
        self.find_fk_groups_below(right, outputs, where_select, equivalences)?;
        outputs.pop();
        Ok(())
    }

    /// Join an ungrouped table to the table one of its foreign keys
    /// references. A table matching more than one key gets none.
    fn find_parent_fk_join(
        &mut self,
        child: NodeId,
        holder: GroupJoinOrigin,
        equivalences: &EquivalenceFinder<ColumnExpression>,
    ) -> QueryResult<()> {
        let conditions = conditions(self.graph, holder)?.clone();
        if conditions.is_empty() {
            return Ok(());
        }
        let table = self.graph.table_source(child)?.table.clone();
        for key in table.foreign_keys() {
            let Some((parent, found)) =
                self.find_fk_conditions(child, &conditions, &key.columns, key.referenced_table, equivalences)
            else {
                continue;
            };
            match self.table_group(child) {
                None => {
                    let group = self.graph.groups.create(table.group(), child);
                    let source = self.graph.table_source_mut(child)?;
                    source.group = Some(group);
                    source.parent_fk_join =
                        Some(TableGroupJoin { parent, conditions: found, group, origin: holder });
                    trace!("{} joins {} through foreign key {}", child, parent, key.name);
                }
                Some(_) => self.graph.table_source_mut(child)?.parent_fk_join = None,
            }
        }
        Ok(())
    }

    fn find_fk_conditions(
        &self,
        child: NodeId,
        conditions: &[Expression],
        columns: &[JoinColumn],
        referenced: TableId,
        equivalences: &EquivalenceFinder<ColumnExpression>,
    ) -> Option<(NodeId, Vec<Expression>)> {
        let mut found = Vec::with_capacity(columns.len());
        let mut parent = None;
        for column in columns {
            let target = ColumnTarget { column, child, parent_table: referenced };
            for condition in conditions {
                let Some((left, right)) = self.table_column_pair(condition) else {
                    continue;
                };
                let normalized = self
                    .normalized_condition(&target, left, right, condition, true, equivalences)
                    .or_else(|| self.normalized_condition(&target, left, right, condition, false, equivalences));
                if let Some((normalized, _)) = normalized {
                    parent = right_column_source(&normalized);
                    found.push(normalized);
                    break;
                }
            }
        }
        if found.len() != columns.len() {
            return None;
        }
        parent.map(|p| (p, found))
    }

    fn find_single_groups(&mut self, node: NodeId) -> QueryResult<()> {
        match self.graph.kind(node) {
            PlanNodeKind::TableSource(source) if source.group.is_none() => {
                let catalog_group = source.table.group();
                let group = self.graph.groups.create(catalog_group, node);
                self.graph.table_source_mut(node)?.group = Some(group);
            }
            PlanNodeKind::Join(join) => {
                let (left, right) = (join.left, join.right);
                self.find_single_groups(left)?;
                self.find_single_groups(right)?;
            }
            _ => {}
        }
        Ok(())
    }

    // Pass 3

    fn reorder_joins(&mut self, island: &mut JoinIsland) -> QueryResult<()> {
        let root = self.reorder(island.root)?;
        if root != island.root {
            self.graph.replace_input(island.output, island.root, root)?;
            island.root = root;
        }
        Ok(())
    }

    fn reorder(&mut self, node: NodeId) -> QueryResult<NodeId> {
        if self.count_inner_joins(node) > 1 {
            let mut operands = Vec::new();
            self.inner_join_operands(node, &mut operands);
            let mut reordered = Vec::with_capacity(operands.len());
            for operand in operands {
                reordered.push(self.reorder(operand)?);
            }
            return self.order_inner_joins(reordered);
        }
        let Ok(join) = self.graph.join(node) else {
            return Ok(node);
        };
        let (left, right) = (join.left, join.right);
        let new_left = self.reorder(left)?;
        if new_left != left {
            self.graph.replace_input(node, left, new_left)?;
        }
        let new_right = self.reorder(right)?;
        if new_right != right {
            self.graph.replace_input(node, right, new_right)?;
        }
        if self.compare_joinables(new_left, new_right) == Ordering::Greater {
            self.graph.join_mut(node)?.reverse();
        }
        Ok(node)
    }

    /// An inner join with no conditions of its own
    fn is_simple_inner_join(&self, node: NodeId) -> bool {
        matches!(self.graph.kind(node), PlanNodeKind::Join(join) if join.join_type.is_inner() && join.conditions.is_empty())
    }

    fn count_inner_joins(&self, node: NodeId) -> usize {
        match self.graph.kind(node) {
            PlanNodeKind::Join(join) if self.is_simple_inner_join(node) => {
                1 + self.count_inner_joins(join.left) + self.count_inner_joins(join.right)
            }
            _ => 0,
        }
    }

    fn inner_join_operands(&self, node: NodeId, operands: &mut Vec<NodeId>) {
        match self.graph.kind(node) {
            PlanNodeKind::Join(join) if self.is_simple_inner_join(node) => {
                self.inner_join_operands(join.left, operands);
                self.inner_join_operands(join.right, operands);
            }
            _ => operands.push(node),
        }
    }

    /// Left-deep joins within each table group, in ordinal order; the
    /// groups and any other operands then joined right-deep
    fn order_inner_joins(&mut self, operands: Vec<NodeId>) -> QueryResult<NodeId> {
        let mut buckets: Vec<(TableGroupId, Vec<NodeId>)> = Vec::new();
        let mut others = Vec::new();
        for operand in operands {
            let Some(group) = self.table_group(operand) else {
                others.push(operand);
                continue;
            };
            match buckets.iter_mut().find(|(g, _)| *g == group) {
                Some((_, tables)) => tables.push(operand),
                None => buckets.push((group, vec![operand])),
            }
        }
        buckets.sort_by_cached_key(|(group, _)| self.group_sort_key(*group));
        let mut joinables = Vec::with_capacity(buckets.len() + others.len());
        for (_, mut tables) in buckets {
            tables.sort_by(|a, b| self.compare_table_sources(*a, *b));
            let mut tables = tables.into_iter();
            let Some(mut joined) = tables.next() else {
                continue;
            };
            for table in tables {
                joined = self.graph.add(PlanNodeKind::Join(JoinNode::new(joined, table, JoinType::Inner)));
            }
            joinables.push(joined);
        }
        joinables.extend(others);
        let Some(mut joined) = joinables.pop() else {
            return Err(QueryError::Internal("inner join without operands".to_string()));
        };
        while let Some(joinable) = joinables.pop() {
            joined = self.graph.add(PlanNodeKind::Join(JoinNode::new(joinable, joined, JoinType::Inner)));
        }
        Ok(joined)
    }

    /// Storage group name, then the lowest ordinal and its table's name
    fn group_sort_key(&self, group: TableGroupId) -> (String, u32, String) {
        let tables = &self.graph.groups.get(group).tables;
        let first = tables
            .iter()
            .filter_map(|t| self.table(*t).map(|table| (table.ordinal(), *t)))
            .min_by_key(|(ordinal, _)| *ordinal);
        let catalog_group = self.graph.groups.get(group).group;
        match first {
            Some((ordinal, table)) => {
                (self.group_name(catalog_group).to_string(), ordinal, self.source_name(table).to_string())
            }
            None => (self.group_name(catalog_group).to_string(), u32::MAX, String::new()),
        }
    }

    // Pass 4

    fn isolate_groups(&mut self, island: &mut JoinIsland) -> QueryResult<()> {
        if let Some(tree) = self.isolate_group_joins(island.root)? {
            let node = self.group_join_tree(tree, island.root)?;
            self.graph.replace_input(island.output, island.root, node)?;
            island.root = node;
        }
        Ok(())
    }

    /// The tree for `node` when it can be folded further up; otherwise
    /// every finished tree below is installed in place
    fn isolate_group_joins(&mut self, node: NodeId) -> QueryResult<Option<TableGroupJoinTree>> {
        if matches!(self.graph.kind(node), PlanNodeKind::TableSource(_)) {
            let group = self
                .table_group(node)
                .ok_or_else(|| QueryError::Internal(format!("table source {} has no table group", node)))?;
            return Ok(Some(TableGroupJoinTree::single(group, node)));
        }
        let Ok(join) = self.graph.join(node) else {
            return Ok(None);
        };
        let (left, right, join_type, join_conditions) = (join.left, join.right, join.join_type, join.conditions.clone());
        let left_tree = self.isolate_group_joins(left)?;
        let right_tree = self.isolate_group_joins(right)?;
        if let (Some(lt), Some(rt)) = (&left_tree, &right_tree) {
            if self.graph.groups.find(lt.group) == self.graph.groups.find(rt.group) {
                let join_ok = match join_type {
                    JoinType::Inner => true,
                    JoinType::Left => !self.has_illegal_references(&join_conditions, Some(lt)),
                    JoinType::Right => !self.has_illegal_references(&join_conditions, None),
                    _ => false,
                };
                if join_ok {
                    let (left_depth, right_depth) = (self.root_table(lt)?.depth(), self.root_table(rt)?.depth());
                    let spliced = match left_depth.cmp(&right_depth) {
                        Ordering::Less => self.splice(lt.clone(), rt.clone(), join_type, join_conditions)?,
                        Ordering::Greater => {
                            self.splice(rt.clone(), lt.clone(), reversed(join_type), join_conditions)?
                        }
                        Ordering::Equal => None,
                    };
                    if spliced.is_some() {
                        return Ok(spliced);
                    }
                }
            }
        }
        if let Some(tree) = left_tree {
            let installed = self.group_join_tree(tree, left)?;
            self.graph.replace_input(node, left, installed)?;
        }
        if let Some(tree) = right_tree {
            let installed = self.group_join_tree(tree, right)?;
            self.graph.replace_input(node, right, installed)?;
        }
        if join_type == JoinType::Right {
            self.graph.join_mut(node)?.reverse();
        }
        Ok(None)
    }

    /// Whether an outer join has conditions other than group joins that
    /// would need the preserved side. With no preserved tree any such
    /// condition is illegal.
    fn has_illegal_references(&self, conditions: &[Expression], preserved: Option<&TableGroupJoinTree>) -> bool {
        conditions.iter().filter(|c| !c.is_group_join()).any(|condition| match preserved {
            None => true,
            Some(tree) => {
                let tables: BTreeSet<NodeId> = tree.tables().into_iter().collect();
                condition.column_sources().iter().any(|s| tables.contains(s))
            }
        })
    }

    /// Hang `child` below the node of its root table's parent in `parent`.
    /// `join_type` is relative to the parent.
    fn splice(
        &self,
        mut parent: TableGroupJoinTree,
        child: TableGroupJoinTree,
        join_type: JoinType,
        join_conditions: Vec<Expression>,
    ) -> QueryResult<Option<TableGroupJoinTree>> {
        let child_table = self.root_table(&child)?;
        let Some(parent_table) = child_table.parent_table() else {
            return Ok(None);
        };
        let Some(branch) =
            parent.nodes.iter().position(|n| self.table(n.table).map(|t| t.id()) == Some(parent_table))
        else {
            return Ok(None);
        };
        let ordinal = child_table.ordinal();
        let position = parent.nodes[branch]
            .children
            .iter()
            .position(|&c| self.table(parent.nodes[c].table).is_some_and(|t| t.ordinal() > ordinal))
            .unwrap_or(parent.nodes[branch].children.len());
        let index = parent.graft(child, branch, position, join_type);
        parent.nodes[index].join_conditions.extend(join_conditions);
        Ok(Some(parent))
    }

    /// Install `tree` as a plan node standing for the joins under `joins`
    fn group_join_tree(&mut self, mut tree: TableGroupJoinTree, joins: NodeId) -> QueryResult<NodeId> {
        let mut required = BTreeSet::new();
        self.required_tables(joins, &mut required);
        tree.required = required;
        let tables = tree.tables();
        let node = self.graph.add(PlanNodeKind::TableGroupJoinTree(tree));
        for table in tables {
            self.graph.set_output(table, Some(node));
        }
        Ok(node)
    }

    /// Tables reachable without crossing into an optional side
    fn required_tables(&self, node: NodeId, required: &mut BTreeSet<NodeId>) {
        match self.graph.kind(node) {
            PlanNodeKind::TableSource(_) => {
                required.insert(node);
            }
            PlanNodeKind::Join(join) => {
                if !join.join_type.left_optional() {
                    self.required_tables(join.left, required);
                }
                if !join.join_type.right_optional() {
                    self.required_tables(join.right, required);
                }
            }
            _ => {}
        }
    }

    // Pass 5

    fn move_join_conditions(&mut self, island: &JoinIsland) -> QueryResult<()> {
        self.move_group_join_conditions(island.root, island)?;
        let Some(select) = island.where_select else {
            return Ok(());
        };
        let sources: BTreeSet<NodeId> = nodes_below(self.graph, island.root)
            .into_iter()
            .filter(|id| self.graph.kind(*id).is_column_source())
            .collect();
        let conditions = std::mem::take(conditions_mut(self.graph, GroupJoinOrigin::Where(select))?);
        let mut kept = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let mut referenced: BTreeSet<NodeId> =
                condition.column_sources().intersection(&sources).copied().collect();
            if referenced.is_empty() || !self.move_where_condition(&mut referenced, &condition, island.root)? {
                kept.push(condition);
            }
        }
        let empty = kept.is_empty();
        *conditions_mut(self.graph, GroupJoinOrigin::Where(select))? = kept;
        if empty {
            self.graph.splice_out(select)?;
        }
        Ok(())
    }

    fn move_group_join_conditions(&mut self, node: NodeId, island: &JoinIsland) -> QueryResult<()> {
        if let PlanNodeKind::TableGroupJoinTree(tree) = self.graph.kind(node) {
            let entries: Vec<(usize, NodeId, bool)> =
                tree.nodes.iter().enumerate().map(|(i, n)| (i, n.table, n.parent.is_none())).collect();
            for (index, table, is_root) in entries {
                let Some(parent_join) = self.graph.table_source(table)?.parent_join.clone() else {
                    continue;
                };
                if is_root {
                    self.reject(island, table, &parent_join)?;
                } else if island.where_joins.contains(&table) {
                    if let Some(select) = island.where_select {
                        conditions_mut(self.graph, GroupJoinOrigin::Where(select))?
                            .retain(|c| !parent_join.conditions.contains(c));
                    }
                    self.graph.tree_mut(node)?.nodes[index].join_conditions.extend(parent_join.conditions);
                }
            }
            return Ok(());
        }
        let Ok(join) = self.graph.join(node) else {
            return Ok(());
        };
        let (left, right) = (join.left, join.right);
        self.move_group_join_conditions(left, island)?;
        self.move_group_join_conditions(right, island)
    }

    /// Drop a group join whose tables did not end up in one tree
    fn reject(&mut self, island: &JoinIsland, child: NodeId, parent_join: &TableGroupJoin) -> QueryResult<()> {
        trace!("Rejecting group join from {} to {}", child, parent_join.parent);
        self.graph.table_source_mut(child)?.parent_join = None;
        let mut holders: Vec<NodeId> = nodes_below(self.graph, island.root).into_iter().collect();
        holders.extend(island.where_select);
        for id in holders {
            for expression in self.graph.kind_mut(id).expressions_mut() {
                if expression.is_group_join() && parent_join.conditions.contains(&*expression) {
                    expression.implementation = ConditionImplementation::Normal;
                }
            }
        }
        Ok(())
    }

    /// Push `condition` to the deepest inner join whose operands cover
    /// `sources`. Sources found below `node` are removed from `sources`.
    fn move_where_condition(
        &mut self,
        sources: &mut BTreeSet<NodeId>,
        condition: &Expression,
        node: NodeId,
    ) -> QueryResult<bool> {
        if is_subquery_condition(condition) {
            return Ok(false);
        }
        match self.graph.kind(node) {
            PlanNodeKind::TableGroupJoinTree(tree) => {
                for table in tree.tables() {
                    sources.remove(&table);
                }
                Ok(false)
            }
            PlanNodeKind::Join(join) => {
                if !join.join_type.is_inner() {
                    return Ok(false);
                }
                let (left, right) = (join.left, join.right);
                let mut for_left = sources.clone();
                let mut for_right = sources.clone();
                if self.move_where_condition(&mut for_left, condition, left)?
                    || self.move_where_condition(&mut for_right, condition, right)?
                {
                    return Ok(true);
                }
                sources.retain(|s| for_left.contains(s) && for_right.contains(s));
                if sources.is_empty() {
                    self.graph.join_mut(node)?.conditions.push(condition.clone());
                    return Ok(true);
                }
                Ok(false)
            }
            _ => {
                sources.remove(&node);
                Ok(false)
            }
        }
    }

    // Ordering

    fn table(&self, id: NodeId) -> Option<&Arc<Table>> {
        match self.graph.kind(id) {
            PlanNodeKind::TableSource(source) => Some(&source.table),
            _ => None,
        }
    }

    fn table_group(&self, id: NodeId) -> Option<TableGroupId> {
        match self.graph.kind(id) {
            PlanNodeKind::TableSource(source) => source.group.map(|g| self.graph.groups.find(g)),
            _ => None,
        }
    }

    fn root_table(&self, tree: &TableGroupJoinTree) -> QueryResult<&Arc<Table>> {
        Ok(&self.graph.table_source(tree.nodes[tree.root].table)?.table)
    }

    fn source_name(&self, id: NodeId) -> &str {
        match self.graph.kind(id) {
            PlanNodeKind::TableSource(source) => &source.name,
            _ => "",
        }
    }

    fn group_name(&self, group: GroupId) -> &str {
        self.catalog.group(group).map(|g| g.name.as_str()).unwrap_or("")
    }

    fn compare_column_sources(&self, a: NodeId, b: NodeId) -> Ordering {
        match (self.table(a).is_some(), self.table(b).is_some()) {
            (true, true) => self.compare_table_sources(a, b),
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => Ordering::Equal,
        }
    }

    /// By storage group name, then table group, then ordinal within a group
    fn compare_table_sources(&self, a: NodeId, b: NodeId) -> Ordering {
        let (Some(ta), Some(tb)) = (self.table(a), self.table(b)) else {
            return Ordering::Equal;
        };
        if ta.group() != tb.group() {
            return self.group_name(ta.group()).cmp(self.group_name(tb.group()));
        }
        let (ga, gb) = (self.table_group(a), self.table_group(b));
        if ga == gb {
            if ta.id() == tb.id() {
                return self.source_name(a).cmp(self.source_name(b));
            }
            return ta.ordinal().cmp(&tb.ordinal());
        }
        self.min_ordinal(ga, ta).cmp(&self.min_ordinal(gb, tb))
    }

    fn min_ordinal(&self, group: Option<TableGroupId>, table: &Table) -> u32 {
        group
            .and_then(|g| self.graph.groups.get(g).tables.iter().filter_map(|t| self.table(*t)).map(|t| t.ordinal()).min())
            .unwrap_or(table.ordinal())
    }

    fn compare_joinables(&self, a: NodeId, b: NodeId) -> Ordering {
        if self.table(a).is_some() && self.table(b).is_some() {
            return self.compare_table_sources(a, b);
        }
        match (self.catalog_group(a), self.catalog_group(b)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(ga), Some(gb)) if ga != gb => self.group_name(ga).cmp(self.group_name(gb)),
            _ => {
                let ((min_a, max_a), (min_b, max_b)) = (self.ordinal_range(a), self.ordinal_range(b));
                if max_a < min_b {
                    Ordering::Less
                } else if min_a > max_b {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            }
        }
    }

    /// The storage group of every table under `node`, if there is one
    fn catalog_group(&self, node: NodeId) -> Option<GroupId> {
        match self.graph.kind(node) {
            PlanNodeKind::TableSource(source) => Some(source.table.group()),
            PlanNodeKind::Join(join) => {
                let left = self.catalog_group(join.left)?;
                let right = self.catalog_group(join.right)?;
                (left == right).then_some(left)
            }
            PlanNodeKind::TableGroupJoinTree(tree) => self.table(tree.nodes[tree.root].table).map(|t| t.group()),
            _ => None,
        }
    }

    fn ordinal_range(&self, node: NodeId) -> (u32, u32) {
        match self.graph.kind(node) {
            PlanNodeKind::TableSource(source) => (source.table.ordinal(), source.table.ordinal()),
            PlanNodeKind::Join(join) => {
                let ((l_min, l_max), (r_min, r_max)) = (self.ordinal_range(join.left), self.ordinal_range(join.right));
                (l_min.min(r_min), l_max.max(r_max))
            }
            PlanNodeKind::TableGroupJoinTree(tree) => tree
                .tables()
                .into_iter()
                .filter_map(|t| self.table(t).map(|table| table.ordinal()))
                .fold((u32::MAX, 0), |(min, max), o| (min.min(o), max.max(o))),
            _ => (u32::MAX, 0),
        }
    }
}

/// A grouping-join column pair being matched for one child table
struct ColumnTarget<'c> {
    column: &'c JoinColumn,
    child: NodeId,
    parent_table: TableId,
}

fn conditions(graph: &PlanGraph, holder: GroupJoinOrigin) -> QueryResult<&Vec<Expression>> {
    match holder {
        GroupJoinOrigin::Where(select) => match graph.kind(select) {
            PlanNodeKind::Select { conditions, .. } => Ok(conditions),
            other => Err(QueryError::Internal(format!("{} {} has no WHERE list", other.name(), select))),
        },
        GroupJoinOrigin::Join(join) => Ok(&graph.join(join)?.conditions),
    }
}

fn conditions_mut(graph: &mut PlanGraph, holder: GroupJoinOrigin) -> QueryResult<&mut Vec<Expression>> {
    match holder {
        GroupJoinOrigin::Where(select) => match graph.kind_mut(select) {
            PlanNodeKind::Select { conditions, .. } => Ok(conditions),
            other => Err(QueryError::Internal(format!("{} {} has no WHERE list", other.name(), select))),
        },
        GroupJoinOrigin::Join(join) => Ok(&mut graph.join_mut(join)?.conditions),
    }
}

fn reverse_comparison(condition: Expression) -> Expression {
    match condition.kind {
        ExpressionKind::Comparison { op, left, right } => {
            Expression { kind: ExpressionKind::Comparison { op: op.reverse(), left: right, right: left }, ..condition }
        }
        kind => Expression { kind, ..condition },
    }
}

fn right_column_source(condition: &Expression) -> Option<NodeId> {
    match &condition.kind {
        ExpressionKind::Comparison { right, .. } => right.as_column().map(|c| c.source),
        _ => None,
    }
}

fn reversed(join_type: JoinType) -> JoinType {
    match join_type {
        JoinType::Left => JoinType::Right,
        JoinType::Right => JoinType::Left,
        other => other,
    }
}

/// IN and EXISTS conditions stay where they are for the subquery rules
fn is_subquery_condition(condition: &Expression) -> bool {
    match &condition.kind {
        ExpressionKind::Any(_) | ExpressionKind::Exists(_) => true,
        ExpressionKind::Not(inner) => matches!(inner.kind, ExpressionKind::Any(_) | ExpressionKind::Exists(_)),
        _ => false,
    }
}
