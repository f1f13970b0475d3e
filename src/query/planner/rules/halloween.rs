// Halloween Recognizer
//
// A data-modifying statement must not see its own writes while reading.
// That can happen when an update changes a row's hierarchical key, when a
// scanned index contains a changed column, or when the target table is read
// more often than the one scan driving the change. A buffer then
// materializes the input before any writes happen.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use crate::catalog::{Index, Table};
use crate::query::executor::result::{QueryError, QueryResult};
use crate::query::planner::context::PlanContext;
use crate::query::planner::optimizer::Rule;
use crate::query::planner::plan::expression::{ComparisonOp, Expression, ExpressionKind};
use crate::query::planner::plan::node::{PlanNodeKind, UpdateColumn};
use crate::query::planner::plan::{NodeId, PlanGraph};

pub struct HalloweenRecognizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Statement {
    Insert,
    Update,
    Delete,
}

impl Rule for HalloweenRecognizer {
    fn name(&self) -> &'static str {
        "HalloweenRecognizer"
    }

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        let graph = &mut context.plan;
        let dml = graph.root()?;
        let (statement, input, table, update_columns) = match graph.kind(dml) {
            PlanNodeKind::Insert { input, table, .. } => (Statement::Insert, *input, table.clone(), None),
            PlanNodeKind::Update { input, table, update_columns, .. } => {
                let columns: BTreeSet<usize> = update_columns.iter().map(|c| c.column).collect();
                (Statement::Update, *input, table.clone(), Some(columns))
            }
            PlanNodeKind::Delete { input, table, .. } => (Statement::Delete, *input, table.clone(), None),
            _ => return Ok(()),
        };

        let mut buffer_required = false;
        let mut index_was_unique = false;
        if let Some(update_columns) = &update_columns {
            let vulnerable = hkey_columns(&table);
            if update_columns.iter().any(|c| vulnerable.contains(c)) {
                // Exact predicates on every key column pin the row
                buffer_required = !all_have_equality(graph, input, &table, &vulnerable);
                index_was_unique = buffer_required;
            }
        }
        if !buffer_required {
            let max_uses = if statement == Statement::Insert { 0 } else { 1 };
            let mut checker = Checker::new(&table, max_uses, update_columns.as_ref());
            checker.check(graph, input);
            buffer_required = checker.buffer_required;
            index_was_unique = checker.index_was_unique();
            if index_was_unique && statement == Statement::Update {
                let key_columns: BTreeSet<usize> = checker
                    .index
                    .iter()
                    .flat_map(|index| index.columns.iter())
                    .filter(|c| c.table == table.id())
                    .map(|c| c.position)
                    .collect();
                buffer_required = !all_have_equality(graph, input, &table, &key_columns);
                index_was_unique = buffer_required;
            }
        }

        if !buffer_required {
            return Ok(());
        }
        if statement == Statement::Update && index_was_unique {
            if table.is_referenced() {
                return Err(QueryError::UnsupportedSql(format!(
                    "Halloween vulnerable query on referenced table {}",
                    table.name()
                )));
            }
            debug!("Update of {} may move rows; rewriting as delete and insert", table.name());
            transform_update(graph, dml)
        } else {
            debug!("Buffering input of {:?} on {}", statement, table.name());
            inject_buffer(graph, input)
        }
    }
}

/// Primary key columns plus the columns joining the table to its parent
fn hkey_columns(table: &Table) -> BTreeSet<usize> {
    let mut columns: BTreeSet<usize> = table.primary_key_columns().iter().copied().collect();
    if let Some(join) = table.parent_join() {
        columns.extend(join.columns.iter().map(|c| c.child));
    }
    columns
}

/// Whether the input chain carries an `=` against a constant or parameter
/// for each of `columns`, in one Select or one index scan
fn all_have_equality(graph: &PlanGraph, input: NodeId, table: &Table, columns: &BTreeSet<usize>) -> bool {
    let chain = input_chain(graph, input);
    let covered = |conditions: &[Expression]| {
        columns.iter().all(|&position| {
            conditions.iter().any(|condition| is_exact_equality(graph, condition, table, position))
        })
    };
    let select = chain.iter().find_map(|&id| match graph.kind(id) {
        PlanNodeKind::Select { conditions, .. } => Some(conditions),
        _ => None,
    });
    if select.is_some_and(|conditions| covered(conditions)) {
        return true;
    }
    let scan = chain.iter().find_map(|&id| match graph.kind(id) {
        PlanNodeKind::IndexScan(scan) => Some(scan),
        _ => None,
    });
    scan.is_some_and(|scan| {
        columns.iter().all(|&position| {
            scan.index.columns.iter().zip(&scan.equality).any(|(column, value)| {
                column.table == table.id() && column.position == position && is_fixed_value(value)
            })
        })
    })
}

/// `input` and its single inputs below it
fn input_chain(graph: &PlanGraph, input: NodeId) -> Vec<NodeId> {
    let mut chain = vec![input];
    let mut current = input;
    while let Some(next) = graph.kind(current).single_input() {
        chain.push(next);
        current = next;
    }
    chain
}

fn is_exact_equality(graph: &PlanGraph, condition: &Expression, table: &Table, position: usize) -> bool {
    let ExpressionKind::Comparison { op: ComparisonOp::Eq, left, right } = &condition.kind else {
        return false;
    };
    let (column, other) = match (left.as_column(), right.as_column()) {
        (Some(column), _) => (column, right),
        (None, Some(column)) => (column, left),
        (None, None) => return false,
    };
    let of_table = match graph.kind(column.source) {
        PlanNodeKind::TableSource(source) => source.table.id() == table.id(),
        _ => false,
    };
    of_table && column.position == position && is_fixed_value(other)
}

fn is_fixed_value(expression: &Expression) -> bool {
    matches!(expression.kind, ExpressionKind::Constant(_) | ExpressionKind::Parameter(_))
}

/// Counts reads of the target table and looks for scanned indexes that
/// contain updated columns
struct Checker<'a> {
    table: &'a Table,
    update_columns: Option<&'a BTreeSet<usize>>,
    max_uses: i32,
    buffer_required: bool,
    index: Option<Arc<Index>>,
}

impl<'a> Checker<'a> {
    fn new(table: &'a Table, max_uses: i32, update_columns: Option<&'a BTreeSet<usize>>) -> Self {
        Checker { table, update_columns, max_uses, buffer_required: false, index: None }
    }

    fn index_was_unique(&self) -> bool {
        self.index.as_ref().is_some_and(|index| index.unique)
    }

    fn check(&mut self, graph: &PlanGraph, root: NodeId) {
        for id in graph.reachable(root) {
            match graph.kind(id) {
                PlanNodeKind::IndexScan(scan) => {
                    let mut tripped = false;
                    if scan.covering && self.uses_target(graph, &scan.tables) {
                        tripped |= self.count_use();
                    }
                    if let Some(update_columns) = self.update_columns {
                        tripped |= scan
                            .index
                            .columns
                            .iter()
                            .any(|c| c.table == self.table.id() && update_columns.contains(&c.position));
                    }
                    if tripped {
                        self.buffer_required = true;
                        // An intersection is unique when either side is
                        if !self.index_was_unique() {
                            self.index = Some(scan.index.clone());
                        }
                    }
                }
                PlanNodeKind::AncestorLookup { ancestors: tables, .. }
                | PlanNodeKind::BranchLookup { tables, .. }
                | PlanNodeKind::GroupScan { tables, .. } => {
                    let uses = tables.iter().filter(|t| self.is_target(graph, **t)).count();
                    for _ in 0..uses {
                        if self.count_use() {
                            self.buffer_required = true;
                        }
                    }
                }
                PlanNodeKind::GroupLoopScan { inside, .. } => {
                    if self.is_target(graph, *inside) && self.count_use() {
                        self.buffer_required = true;
                    }
                }
                _ => {}
            }
            if self.buffer_required && self.index_was_unique() {
                break;
            }
        }
    }

    /// Record one read of the target; true once over budget
    fn count_use(&mut self) -> bool {
        self.max_uses -= 1;
        self.max_uses < 0
    }

    fn uses_target(&self, graph: &PlanGraph, tables: &[NodeId]) -> bool {
        tables.iter().any(|t| self.is_target(graph, *t))
    }

    fn is_target(&self, graph: &PlanGraph, source: NodeId) -> bool {
        matches!(graph.kind(source), PlanNodeKind::TableSource(s) if s.table.id() == self.table.id())
    }
}

/// `Update(input)` becomes `Insert(Project(new row), Buffer(Delete(input)))`
fn transform_update(graph: &mut PlanGraph, update: NodeId) -> QueryResult<()> {
    let PlanNodeKind::Update { input, table, target, update_columns } = graph.kind(update).clone() else {
        return Err(QueryError::Internal(format!("{} is not an update", update)));
    };
    let name = graph.table_source(target)?.name.clone();
    let mut fields: Vec<Expression> = table
        .columns()
        .iter()
        .enumerate()
        .map(|(position, column)| {
            Expression::column(target, position, format!("{}.{}", name, column.name()))
                .with_type(column.data_type().clone())
        })
        .collect();
    for UpdateColumn { column, expression } in update_columns {
        if let Some(field) = fields.get_mut(column) {
            *field = expression;
        }
    }
    let target_columns = (0..fields.len()).collect();

    let delete = graph.add(PlanNodeKind::Delete { input, table: table.clone(), target });
    let buffer = graph.add(PlanNodeKind::Buffer { input: delete });
    let project = graph.add(PlanNodeKind::Project { input: buffer, fields });
    let insert = graph.add(PlanNodeKind::Insert { input: project, table, target_columns });
    graph.replace_node(update, insert)
}

/// Put a buffer under the statement, below any projections on the scan
fn inject_buffer(graph: &mut PlanGraph, input: NodeId) -> QueryResult<()> {
    let mut node = input;
    while let PlanNodeKind::Project { input, .. } = graph.kind(node) {
        node = *input;
    }
    graph.wrap(node, |input| PlanNodeKind::Buffer { input })?;
    Ok(())
}
