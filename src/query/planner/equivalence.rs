// Column Equivalences
//
// Tracks which columns are known equal through `col = col` predicates, per
// query scope. A second relation holds only equalities along declared
// foreign keys.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use linked_hash_map::LinkedHashMap;

use super::plan::expression::{ColumnExpression, ComparisonOp, Expression, ExpressionKind};
use super::plan::node::PlanNodeKind;
use super::plan::{NodeId, PlanGraph};

/// A symmetric relation; equivalence is its transitive closure
#[derive(Debug, Clone)]
pub struct EquivalenceFinder<T: Eq + Hash + Clone> {
    direct: LinkedHashMap<T, Vec<T>>,
}

impl<T: Eq + Hash + Clone> Default for EquivalenceFinder<T> {
    fn default() -> Self {
        EquivalenceFinder { direct: LinkedHashMap::new() }
    }
}

impl<T: Eq + Hash + Clone> EquivalenceFinder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_equivalent(&mut self, a: T, b: T) {
        if a == b {
            return;
        }
        self.add_edge(a.clone(), b.clone());
        self.add_edge(b, a);
    }

    fn add_edge(&mut self, from: T, to: T) {
        let entry = self.direct.entry(from).or_insert_with(Vec::new);
        if !entry.contains(&to) {
            entry.push(to);
        }
    }

    /// Everything known equal to `element`, excluding itself, nearest first
    pub fn find_equivalents(&self, element: &T) -> Equivalents<'_, T> {
        let mut seen = HashSet::new();
        seen.insert(element.clone());
        let mut queue = VecDeque::new();
        queue.push_back(element.clone());
        Equivalents { finder: self, seen, queue, pending: VecDeque::new() }
    }

    pub fn are_equivalent(&self, a: &T, b: &T) -> bool {
        a == b || self.find_equivalents(a).any(|e| &e == b)
    }

    pub fn is_empty(&self) -> bool {
        self.direct.is_empty()
    }
}

/// Breadth-first walk of an equivalence class. Consumed once.
pub struct Equivalents<'a, T: Eq + Hash + Clone> {
    finder: &'a EquivalenceFinder<T>,
    seen: HashSet<T>,
    queue: VecDeque<T>,
    pending: VecDeque<T>,
}

impl<T: Eq + Hash + Clone> Iterator for Equivalents<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if let Some(found) = self.pending.pop_front() {
                return Some(found);
            }
            let current = self.queue.pop_front()?;
            if let Some(neighbours) = self.finder.direct.get(&current) {
                for neighbour in neighbours {
                    if self.seen.insert(neighbour.clone()) {
                        self.queue.push_back(neighbour.clone());
                        self.pending.push_back(neighbour.clone());
                    }
                }
            }
        }
    }
}

/// Column equivalences of one query scope
#[derive(Debug, Clone, Default)]
pub struct ColumnEquivalences {
    pub columns: EquivalenceFinder<ColumnExpression>,
    /// Equalities that follow a declared foreign key
    pub foreign_keys: EquivalenceFinder<ColumnExpression>,
}

impl ColumnEquivalences {
    /// Collect the equivalences of the query rooted at `root`: equalities in
    /// WHERE lists and inner join conditions. Nested subqueries are separate
    /// scopes and are not entered.
    pub fn for_scope(graph: &PlanGraph, root: NodeId) -> Self {
        let mut equivalences = ColumnEquivalences::default();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let kind = graph.kind(id);
            match kind {
                PlanNodeKind::Select { conditions, .. } => equivalences.add_conditions(graph, conditions),
                PlanNodeKind::Join(join) if join.join_type.is_inner() => {
                    equivalences.add_conditions(graph, &join.conditions)
                }
                PlanNodeKind::TableGroupJoinTree(tree) => {
                    for node in &tree.nodes {
                        if node.parent_join_type.is_inner() {
                            equivalences.add_conditions(graph, &node.join_conditions);
                        }
                    }
                }
                _ => {}
            }
            if !matches!(kind, PlanNodeKind::Subquery { .. }) || id == root {
                stack.extend(kind.inputs());
            }
        }
        equivalences
    }

    fn add_conditions(&mut self, graph: &PlanGraph, conditions: &[Expression]) {
        for condition in conditions {
            let ExpressionKind::Comparison { op: ComparisonOp::Eq, left, right } = &condition.kind else {
                continue;
            };
            if let (Some(l), Some(r)) = (left.as_column(), right.as_column()) {
                self.columns.mark_equivalent(l.clone(), r.clone());
                if is_foreign_key_pair(graph, l, r) || is_foreign_key_pair(graph, r, l) {
                    self.foreign_keys.mark_equivalent(l.clone(), r.clone());
                }
            }
        }
    }

    pub fn are_equivalent(&self, a: &ColumnExpression, b: &ColumnExpression) -> bool {
        self.columns.are_equivalent(a, b)
    }
}

/// Whether `child` = `parent` matches one column pair of a foreign key from
/// the child's table to the parent's
fn is_foreign_key_pair(graph: &PlanGraph, child: &ColumnExpression, parent: &ColumnExpression) -> bool {
    let (Ok(child_source), Ok(parent_source)) = (graph.table_source(child.source), graph.table_source(parent.source))
    else {
        return false;
    };
    child_source.table.foreign_keys().iter().any(|fk| {
        fk.referenced_table == parent_source.table.id()
            && fk.columns.iter().any(|c| c.child == child.position && c.parent == parent.position)
    })
}
