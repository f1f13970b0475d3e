// Constant Folder
//
// Repeatedly simplifies expressions whose value is known when the statement
// is compiled and removes plan branches that cannot produce rows. Columns of
// removed sources fold to constants; aggregates over NULL are dropped from
// their source once folding settles.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::debug;

use crate::query::executor::result::{DataValue, QueryError, QueryResult};
use crate::query::planner::context::PlanContext;
use crate::query::planner::optimizer::Rule;
use crate::query::planner::plan::expression::{ComparisonOp, Expression, ExpressionKind};
use crate::query::planner::plan::node::{DistinctState, JoinType, PlanNodeKind};
use crate::query::planner::plan::visitor::{rewrite_expression, rewrite_plan, PlanRewriter};
use crate::query::planner::plan::{NodeId, PlanGraph};
use crate::query::types::registry::TypesRegistry;
use crate::query::types::TypeInstance;

/// Passes over a single expression before giving up on reaching a fixpoint
const PIECEMEAL_PASSES: usize = 16;

pub struct ConstantFolder;

impl Rule for ConstantFolder {
    fn name(&self) -> &'static str {
        "ConstantFolder"
    }

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        let mut folder = Folder::new(context.types, true);
        let mut passes = 0;
        loop {
            if passes >= context.config.max_fold_iterations {
                return Err(QueryError::Internal(format!(
                    "constant folding did not settle after {} passes",
                    passes
                )));
            }
            passes += 1;
            if !folder.fold_plan(&mut context.plan)? {
                break;
            }
        }
        debug!("Constant folding settled after {} passes", passes);
        folder.finish_aggregates(&mut context.plan)
    }
}

/// Fold one expression in place, leaving the plan around it alone
pub fn fold_expression(
    graph: &mut PlanGraph,
    types: &dyn TypesRegistry,
    expression: Expression,
) -> QueryResult<Expression> {
    let mut folder = Folder::new(types, false);
    let mut expression = expression;
    for _ in 0..PIECEMEAL_PASSES {
        folder.changed = false;
        expression = rewrite_expression(graph, expression, &mut folder)?;
        if !folder.changed {
            break;
        }
    }
    Ok(expression)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Constantness {
    Variable,
    Constant,
    Null,
}

fn constantness(expression: &Expression) -> Constantness {
    match &expression.kind {
        ExpressionKind::Constant(DataValue::Null) => Constantness::Null,
        ExpressionKind::Constant(_) => Constantness::Constant,
        _ => Constantness::Variable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emptiness {
    Unknown,
    Empty,
    NonEmpty,
}

/// Whether a nested query obviously produces no rows, or at least one
fn subquery_emptiness(graph: &PlanGraph, subquery: NodeId) -> Emptiness {
    let mut node = match graph.kind(subquery) {
        PlanNodeKind::Subquery { input } => *input,
        _ => subquery,
    };
    if let PlanNodeKind::ResultSet { input, .. } = graph.kind(node) {
        node = *input;
    }
    if let PlanNodeKind::Project { input, .. } = graph.kind(node) {
        node = *input;
    }
    if let PlanNodeKind::Select { input, conditions } = graph.kind(node) {
        if conditions.is_empty() {
            node = *input;
        }
    }
    match graph.kind(node) {
        PlanNodeKind::NullSource => Emptiness::Empty,
        PlanNodeKind::ExpressionsSource { rows, .. } if rows.is_empty() => Emptiness::Empty,
        PlanNodeKind::ExpressionsSource { .. } => Emptiness::NonEmpty,
        _ => Emptiness::Unknown,
    }
}

/// The single projected field of a nested query, if it has an obvious one
fn subquery_column(graph: &PlanGraph, subquery: NodeId) -> Option<&Expression> {
    let mut node = match graph.kind(subquery) {
        PlanNodeKind::Subquery { input } => *input,
        _ => subquery,
    };
    if let PlanNodeKind::ResultSet { input, .. } = graph.kind(node) {
        node = *input;
    }
    match graph.kind(node) {
        PlanNodeKind::Project { fields, .. } if fields.len() == 1 => fields.first(),
        _ => None,
    }
}

fn is_aggregate_of_null(aggregate: &Expression) -> bool {
    match &aggregate.kind {
        ExpressionKind::Aggregate(call) => call.operand.as_ref().is_some_and(|o| o.is_null_constant()),
        _ => false,
    }
}

fn aggregate_function(aggregate: &Expression) -> &str {
    match &aggregate.kind {
        ExpressionKind::Aggregate(call) => call.function.as_str(),
        _ => "",
    }
}

fn is_parameter(expression: &Expression) -> bool {
    match &expression.kind {
        ExpressionKind::Parameter(_) => true,
        ExpressionKind::Cast { operand, .. } => is_parameter(operand),
        _ => false,
    }
}

fn compare_rows(a: &[Expression], b: &[Expression]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ordering = match (x.constant_value(), y.constant_value()) {
            (Some(x), Some(y)) => x.comparable_key().cmp(&y.comparable_key()),
            _ => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

/// `left IN (VALUES ...)` in the shape the plan builder produces: an ANY
/// over a projection of equalities against the columns of a row list
struct InList {
    values: NodeId,
    comparisons: Vec<Expression>,
}

impl InList {
    fn of(graph: &PlanGraph, subquery: NodeId) -> Option<InList> {
        let PlanNodeKind::Subquery { input } = graph.kind(subquery) else {
            return None;
        };
        let PlanNodeKind::Project { input: values, fields } = graph.kind(*input) else {
            return None;
        };
        if fields.len() != 1 {
            return None;
        }
        let PlanNodeKind::ExpressionsSource { rows, .. } = graph.kind(*values) else {
            return None;
        };
        let mut comparisons = Vec::new();
        if !Self::collect(&fields[0], *values, &mut comparisons) {
            return None;
        }
        if rows.first().is_some_and(|row| row.len() != comparisons.len()) {
            return None;
        }
        Some(InList { values: *values, comparisons })
    }

    fn collect(condition: &Expression, values: NodeId, comparisons: &mut Vec<Expression>) -> bool {
        match &condition.kind {
            ExpressionKind::Comparison { op: ComparisonOp::Eq, right, .. } => match right.as_column() {
                Some(column) if column.source == values && column.position == comparisons.len() => {
                    comparisons.push(condition.clone());
                    true
                }
                _ => false,
            },
            ExpressionKind::And(left, right) => {
                Self::collect(left, values, comparisons) && Self::collect(right, values, comparisons)
            }
            _ => false,
        }
    }

    fn left(&self, index: usize) -> Option<&Expression> {
        match &self.comparisons[index].kind {
            ExpressionKind::Comparison { left, .. } => Some(left.as_ref()),
            _ => None,
        }
    }

    /// The comparisons against one literal row, as a conjunction
    fn build_condition(&self, row: &[Expression]) -> Expression {
        let mut result: Option<Expression> = None;
        for (comparison, value) in self.comparisons.iter().zip(row) {
            let mut comparison = comparison.clone();
            if let ExpressionKind::Comparison { right, .. } = &mut comparison.kind {
                **right = value.clone();
            }
            result = Some(match result {
                None => comparison,
                Some(previous) => {
                    let nullable = previous.is_nullable() || comparison.is_nullable();
                    Expression::and(previous, comparison).with_type(TypeInstance::boolean(nullable))
                }
            });
        }
        result.unwrap_or_else(|| Expression::boolean(true))
    }
}

struct Folder<'a> {
    types: &'a dyn TypesRegistry,
    /// Whether plan nodes are folded too, or only the expression at hand
    plan_level: bool,
    changed: bool,
    eliminated: HashSet<NodeId>,
    changed_aggregates: BTreeSet<NodeId>,
    /// Subqueries of ANY conditions that are direct WHERE conditions
    top_level: HashSet<NodeId>,
}

impl<'a> Folder<'a> {
    fn new(types: &'a dyn TypesRegistry, plan_level: bool) -> Self {
        Folder {
            types,
            plan_level,
            changed: false,
            eliminated: HashSet::new(),
            changed_aggregates: BTreeSet::new(),
            top_level: HashSet::new(),
        }
    }

    /// One pass over the whole plan. Returns whether another is needed.
    fn fold_plan(&mut self, graph: &mut PlanGraph) -> QueryResult<bool> {
        self.changed = false;
        self.top_level.clear();
        let root = graph.root()?;
        rewrite_plan(graph, root, self)?;
        Ok(self.changed)
    }

    /// Drop aggregates of NULL that were replaced by constants, shifting the
    /// columns that reference later aggregate positions
    fn finish_aggregates(&mut self, graph: &mut PlanGraph) -> QueryResult<()> {
        let mut dropped: BTreeMap<NodeId, (usize, Vec<usize>)> = BTreeMap::new();
        for &source in &self.changed_aggregates {
            if self.eliminated.contains(&source) {
                continue;
            }
            if let PlanNodeKind::AggregateSource { group_by, aggregates, .. } = graph.kind(source) {
                let positions: Vec<usize> = aggregates
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| is_aggregate_of_null(a))
                    .map(|(i, _)| i)
                    .collect();
                dropped.insert(source, (group_by.len(), positions));
            }
        }
        if dropped.is_empty() {
            return Ok(());
        }
        let root = graph.root()?;
        rewrite_plan(graph, root, &mut AggregateShift { dropped: &dropped })?;
        for (source, (_, positions)) in &dropped {
            if let PlanNodeKind::AggregateSource { aggregates, .. } = graph.kind_mut(*source) {
                let mut index = 0;
                aggregates.retain(|_| {
                    let keep = !positions.contains(&index);
                    index += 1;
                    keep
                });
            }
            debug!("Removed {} aggregates of NULL from {}", positions.len(), source);
        }
        Ok(())
    }

    fn new_constant(&self, value: DataValue, source: &Expression) -> Expression {
        let ty = match (&source.ty, &value) {
            (Some(ty), value) => Some(ty.with_nullable(value.is_null())),
            (None, value) => TypeInstance::for_literal(value),
        };
        Expression { ty, ..source.replaced_by(ExpressionKind::Constant(value)) }
    }

    fn new_boolean(&self, value: Option<bool>, source: &Expression) -> Expression {
        let constant = match value {
            Some(b) => DataValue::Boolean(b),
            None => DataValue::Null,
        };
        Expression {
            ty: Some(TypeInstance::boolean(value.is_none())),
            ..source.replaced_by(ExpressionKind::Constant(constant))
        }
    }

    fn evaluated(&self, result: QueryResult<DataValue>, expression: &Expression) -> Option<Expression> {
        match result {
            Ok(value) => Some(self.new_constant(value, expression)),
            Err(e) => {
                debug!("Error evaluating {} as constant: {}", expression, e);
                None
            }
        }
    }

    fn fold(&mut self, graph: &mut PlanGraph, expression: &Expression) -> QueryResult<Option<Expression>> {
        Ok(match &expression.kind {
            ExpressionKind::Comparison { .. } => self.fold_comparison(expression),
            ExpressionKind::Cast { .. } => self.fold_cast(expression),
            ExpressionKind::Function { .. } => self.fold_function(graph, expression),
            ExpressionKind::And(..) | ExpressionKind::Or(..) | ExpressionKind::Not(_) => {
                self.fold_logical(expression)
            }
            ExpressionKind::IfElse { .. } => self.fold_if_else(graph, expression),
            ExpressionKind::Column(_) => self.fold_column(graph, expression),
            ExpressionKind::Routine { .. } => self.fold_routine(expression),
            ExpressionKind::SubqueryValue(subquery) => self.fold_subquery_value(graph, *subquery, expression),
            ExpressionKind::Exists(subquery) => match subquery_emptiness(graph, *subquery) {
                Emptiness::Empty => Some(self.new_boolean(Some(false), expression)),
                _ => None,
            },
            ExpressionKind::Any(subquery) => self.fold_any(graph, *subquery, expression)?,
            _ => None,
        })
    }

    fn fold_comparison(&self, expression: &Expression) -> Option<Expression> {
        let ExpressionKind::Comparison { op, left, right } = &expression.kind else {
            return None;
        };
        let (lc, rc) = (constantness(left), constantness(right));
        if lc == Constantness::Null || rc == Constantness::Null {
            return Some(self.new_boolean(None, expression));
        }
        if lc != Constantness::Variable && rc != Constantness::Variable {
            let (l, r) = (left.constant_value()?, right.constant_value()?);
            return match l.compare(r) {
                Ok(ordering) => Some(self.new_boolean(Some(op.matches(ordering)), expression)),
                Err(e) => {
                    debug!("Error evaluating {} as constant: {}", expression, e);
                    None
                }
            };
        }
        if self.is_idempotent_equality(*op, left, right) && left.ty.as_ref().is_some_and(|t| !t.nullable) {
            return Some(self.new_boolean(Some(true), expression));
        }
        None
    }

    fn is_idempotent_equality(&self, op: ComparisonOp, left: &Expression, right: &Expression) -> bool {
        op == ComparisonOp::Eq && left == right && self.is_idempotent(left)
    }

    /// Whether evaluating twice is sure to give the same value
    fn is_idempotent(&self, expression: &Expression) -> bool {
        let types = self.types;
        !expression.any_node(&|e| match &e.kind {
            ExpressionKind::Function { name, .. } => !types.is_deterministic(name),
            ExpressionKind::Routine { deterministic, .. } => !deterministic,
            ExpressionKind::Exists(_) | ExpressionKind::Any(_) | ExpressionKind::SubqueryValue(_) => true,
            _ => false,
        })
    }

    fn fold_cast(&self, expression: &Expression) -> Option<Expression> {
        let ExpressionKind::Cast { operand, target } = &expression.kind else {
            return None;
        };
        let value = operand.constant_value()?;
        let typed = Expression { ty: Some(target.clone()), ..expression.clone() };
        if value.is_null() {
            return Some(self.new_constant(DataValue::Null, &typed));
        }
        self.evaluated(self.types.evaluate_cast(value, target), &typed)
    }

    fn fold_function(&self, graph: &PlanGraph, expression: &Expression) -> Option<Expression> {
        let ExpressionKind::Function { name, operands } = &expression.kind else {
            return None;
        };
        match name.as_str() {
            "isNull" | "isUnknown" => {
                let operand = operands.first()?;
                if constantness(operand) != Constantness::Variable {
                    return self.evaluate_function(name, operands, expression);
                }
                // pkey IS NULL, for instance
                if operand.ty.as_ref().is_some_and(|t| !t.nullable) {
                    return Some(self.new_boolean(Some(false), expression));
                }
                None
            }
            "isTrue" => {
                let operand = operands.first()?;
                if constantness(operand) != Constantness::Variable {
                    self.evaluate_function(name, operands, expression)
                } else if self.is_false_or_unknown(graph, operand) {
                    Some(self.new_boolean(Some(false), expression))
                } else {
                    None
                }
            }
            "isFalse" => {
                let operand = operands.first()?;
                if constantness(operand) != Constantness::Variable {
                    self.evaluate_function(name, operands, expression)
                } else if self.is_true_or_unknown(operand) {
                    Some(self.new_boolean(Some(false), expression))
                } else {
                    None
                }
            }
            "coalesce" | "ifnull" => self.fold_coalesce(name, operands, expression),
            "if" => match operands.as_slice() {
                [test, then, otherwise] if constantness(test) != Constantness::Variable => {
                    Some(if test.is_true() { then.clone() } else { otherwise.clone() })
                }
                _ => None,
            },
            _ => {
                if self.types.is_strict(name) && operands.iter().any(|o| o.is_null_constant()) {
                    return Some(self.new_constant(DataValue::Null, expression));
                }
                if self.types.is_deterministic(name) && operands.iter().all(|o| o.is_constant()) {
                    return self.evaluate_function(name, operands, expression);
                }
                None
            }
        }
    }

    fn evaluate_function(&self, name: &str, operands: &[Expression], expression: &Expression) -> Option<Expression> {
        let values: Option<Vec<DataValue>> = operands.iter().map(|o| o.constant_value().cloned()).collect();
        self.evaluated(self.types.evaluate(name, &values?), expression)
    }

    fn fold_coalesce(&self, name: &str, operands: &[Expression], expression: &Expression) -> Option<Expression> {
        let mut remaining: Vec<Expression> = Vec::with_capacity(operands.len());
        for operand in operands {
            match constantness(operand) {
                Constantness::Null => continue,
                // A leading non-null constant is the answer
                Constantness::Constant if remaining.is_empty() => return Some(operand.clone()),
                _ => remaining.push(operand.clone()),
            }
        }
        // Nothing after a value that is never NULL is reached
        if let Some(position) = remaining.iter().position(|o| !o.is_nullable()) {
            remaining.truncate(position + 1);
        }
        match remaining.len() {
            0 => Some(self.new_constant(DataValue::Null, expression)),
            1 if remaining.len() < operands.len() => remaining.pop(),
            n if n < operands.len() => Some(expression.replaced_by(ExpressionKind::Function {
                name: name.to_string(),
                operands: remaining,
            })),
            _ => None,
        }
    }

    fn fold_logical(&self, expression: &Expression) -> Option<Expression> {
        match &expression.kind {
            ExpressionKind::And(left, right) => {
                if constantness(left) == Constantness::Constant {
                    // TRUE AND X -> X, FALSE AND X -> FALSE
                    return Some(if left.is_true() { (**right).clone() } else { (**left).clone() });
                }
                if constantness(right) == Constantness::Constant {
                    return Some(if right.is_true() { (**left).clone() } else { (**right).clone() });
                }
                None
            }
            ExpressionKind::Or(left, right) => {
                if constantness(left) == Constantness::Constant {
                    // TRUE OR X -> TRUE, FALSE OR X -> X
                    return Some(if left.is_true() { (**left).clone() } else { (**right).clone() });
                }
                if constantness(right) == Constantness::Constant {
                    return Some(if right.is_true() { (**right).clone() } else { (**left).clone() });
                }
                None
            }
            ExpressionKind::Not(operand) => match constantness(operand) {
                Constantness::Null => Some(self.new_boolean(None, expression)),
                Constantness::Constant => Some(self.new_boolean(Some(!operand.is_true()), expression)),
                Constantness::Variable => None,
            },
            _ => None,
        }
    }

    fn fold_if_else(&self, graph: &PlanGraph, expression: &Expression) -> Option<Expression> {
        let ExpressionKind::IfElse { test, then, otherwise } = &expression.kind else {
            return None;
        };
        if test.is_true() {
            Some((**then).clone())
        } else if test.is_constant() || self.is_false_or_unknown(graph, test) {
            Some((**otherwise).clone())
        } else {
            None
        }
    }

    fn fold_column(&mut self, graph: &PlanGraph, expression: &Expression) -> Option<Expression> {
        let column = expression.as_column()?;
        let source = column.source;
        let eliminated = self.eliminated.contains(&source);
        if let PlanNodeKind::AggregateSource { group_by, aggregates, .. } = graph.kind(source) {
            let aggregate = column.position.checked_sub(group_by.len()).and_then(|p| aggregates.get(p));
            if let Some(aggregate) = aggregate {
                if self.plan_level && !eliminated && is_aggregate_of_null(aggregate) {
                    self.changed_aggregates.insert(source);
                } else if !eliminated {
                    return None;
                }
                // Aggregate of NULL, or over no rows at all
                let value = self.types.aggregate_empty_value(aggregate_function(aggregate));
                return Some(self.new_constant(value, expression));
            }
        }
        if self.plan_level && eliminated {
            return Some(self.new_constant(DataValue::Null, expression));
        }
        None
    }

    fn fold_routine(&self, expression: &Expression) -> Option<Expression> {
        let ExpressionKind::Routine { name, operands, deterministic, called_on_null_input } = &expression.kind
        else {
            return None;
        };
        if *deterministic && operands.iter().all(|o| o.is_constant()) {
            let values: Vec<DataValue> = operands.iter().filter_map(|o| o.constant_value().cloned()).collect();
            if let Some(folded) = self.evaluated(self.types.evaluate(name, &values), expression) {
                return Some(folded);
            }
        }
        if !*called_on_null_input && operands.iter().any(|o| o.is_null_constant()) {
            return Some(self.new_constant(DataValue::Null, expression));
        }
        None
    }

    fn fold_subquery_value(&self, graph: &PlanGraph, subquery: NodeId, expression: &Expression) -> Option<Expression> {
        let emptiness = subquery_emptiness(graph, subquery);
        if emptiness == Emptiness::Empty {
            return Some(self.new_constant(DataValue::Null, expression));
        }
        let inner = subquery_column(graph, subquery)?;
        match constantness(inner) {
            // NULL whether or not there is a row
            Constantness::Null => Some(self.new_constant(DataValue::Null, expression)),
            Constantness::Constant if emptiness == Emptiness::NonEmpty => Some(inner.clone()),
            _ => None,
        }
    }

    fn fold_any(
        &mut self,
        graph: &mut PlanGraph,
        subquery: NodeId,
        expression: &Expression,
    ) -> QueryResult<Option<Expression>> {
        let emptiness = subquery_emptiness(graph, subquery);
        if emptiness == Emptiness::Empty {
            return Ok(Some(self.new_boolean(Some(false), expression)));
        }
        if let Some(inner) = subquery_column(graph, subquery) {
            // Constant false is false either way; constant true needs a row
            if constantness(inner) == Constantness::Constant && (emptiness == Emptiness::NonEmpty || !inner.is_true()) {
                return Ok(Some(inner.clone()));
            }
        }
        let Some(in_list) = InList::of(graph, subquery) else {
            return Ok(None);
        };
        let top_level = self.top_level.contains(&subquery);
        self.dedup_in_list(graph, in_list.values, top_level)?;
        self.compare_in_list(graph, &in_list, expression)
    }

    /// Sort and deduplicate the constant rows of an IN list. Rows with
    /// parameters or other expressions follow them in their original order.
    fn dedup_in_list(&self, graph: &mut PlanGraph, values: NodeId, top_level: bool) -> QueryResult<()> {
        let PlanNodeKind::ExpressionsSource { rows, distinct_state, .. } = graph.kind_mut(values) else {
            return Err(QueryError::Internal(format!("{} is not a row list", values)));
        };
        let mut constants = Vec::new();
        let mut parameters = Vec::new();
        let mut others = Vec::new();
        let mut any_null = false;
        for row in rows.drain(..) {
            let (mut all_constant, mut all_fixed, mut has_null) = (true, true, false);
            for column in &row {
                match &column.kind {
                    ExpressionKind::Constant(value) => {
                        if value.is_null() {
                            has_null = true;
                            any_null = true;
                        }
                    }
                    _ => {
                        all_constant = false;
                        if !is_parameter(column) {
                            all_fixed = false;
                        }
                    }
                }
            }
            // Where unknown and false mean the same, NULL rows never match
            if has_null && top_level {
                continue;
            }
            if all_constant {
                constants.push(row);
            } else if all_fixed {
                parameters.push(row);
            } else {
                others.push(row);
            }
        }
        constants.sort_by(|a, b| compare_rows(a, b));
        constants.dedup_by(|a, b| compare_rows(a, b) == Ordering::Equal);
        if self.plan_level {
            *distinct_state = if !others.is_empty() {
                DistinctState::HasExpressions
            } else if !parameters.is_empty() {
                DistinctState::HasParameters
            } else if any_null {
                DistinctState::DistinctWithNull
            } else {
                DistinctState::Distinct
            };
        }
        rows.extend(constants);
        rows.extend(parameters);
        rows.extend(others);
        Ok(())
    }

    /// Compare constant left operands against constant row values: drop the
    /// rows that can never match, and answer outright when a row always does
    fn compare_in_list(
        &mut self,
        graph: &mut PlanGraph,
        in_list: &InList,
        expression: &Expression,
    ) -> QueryResult<Option<Expression>> {
        let rows = match graph.kind(in_list.values) {
            PlanNodeKind::ExpressionsSource { rows, .. } => rows.clone(),
            _ => return Ok(None),
        };
        let mut matching = vec![true; rows.len()];
        let mut removed = vec![false; rows.len()];
        for index in 0..in_list.comparisons.len() {
            let Some(left) = in_list.left(index) else {
                return Ok(None);
            };
            match constantness(left) {
                Constantness::Null => return Ok(Some(self.new_boolean(None, expression))),
                Constantness::Constant => {
                    for (j, row) in rows.iter().enumerate() {
                        if removed[j] {
                            continue;
                        }
                        let right = &row[index];
                        let definitely = match (left.constant_value(), right.constant_value()) {
                            (Some(l), Some(r)) if !r.is_null() => l.compare(r).ok(),
                            _ => None,
                        };
                        match definitely {
                            Some(Ordering::Equal) => {}
                            Some(_) => {
                                removed[j] = true;
                                matching[j] = false;
                            }
                            None => matching[j] = false,
                        }
                    }
                }
                Constantness::Variable => matching.iter_mut().for_each(|m| *m = false),
            }
        }
        if matching.iter().any(|m| *m) {
            return Ok(Some(self.new_boolean(Some(true), expression)));
        }
        let kept: Vec<Vec<Expression>> =
            rows.into_iter().zip(&removed).filter(|(_, removed)| !**removed).map(|(row, _)| row).collect();
        if kept.len() < removed.len() {
            if let PlanNodeKind::ExpressionsSource { rows, .. } = graph.kind_mut(in_list.values) {
                *rows = kept.clone();
            }
            self.changed = true;
        }
        Ok(match kept.as_slice() {
            [] => Some(self.new_boolean(Some(false), expression)),
            [row] => Some(in_list.build_condition(row)),
            _ => None,
        })
    }

    /// Whether the condition can only be false or unknown
    fn is_false_or_unknown(&self, graph: &PlanGraph, condition: &Expression) -> bool {
        match &condition.kind {
            ExpressionKind::Constant(value) => value.is_null() || condition.is_false(),
            ExpressionKind::And(left, right) => {
                self.is_false_or_unknown(graph, left) || self.is_false_or_unknown(graph, right)
            }
            ExpressionKind::Or(left, right) => {
                self.is_false_or_unknown(graph, left) && self.is_false_or_unknown(graph, right)
            }
            ExpressionKind::Not(operand) => self.is_true_or_unknown(operand),
            // NULL IN (SELECT ...), for instance
            ExpressionKind::Any(subquery) => {
                subquery_column(graph, *subquery).is_some_and(|inner| self.is_false_or_unknown(graph, inner))
            }
            _ => false,
        }
    }

    /// Whether the condition can only be true or unknown
    fn is_true_or_unknown(&self, condition: &Expression) -> bool {
        match &condition.kind {
            ExpressionKind::Constant(value) => value.is_null() || condition.is_true(),
            ExpressionKind::And(left, right) => self.is_true_or_unknown(left) && self.is_true_or_unknown(right),
            ExpressionKind::Or(left, right) => self.is_true_or_unknown(left) || self.is_true_or_unknown(right),
            ExpressionKind::Comparison { op, left, right } => self.is_idempotent_equality(*op, left, right),
            _ => false,
        }
    }

    /// Drop conditions that are always true and split conjunctions.
    /// Returns false if the list can never be satisfied.
    fn check_conditions(&self, graph: &PlanGraph, conditions: &mut Vec<Expression>) -> bool {
        let mut i = 0;
        while i < conditions.len() {
            let condition = &conditions[i];
            if condition.is_constant() {
                if condition.is_true() {
                    conditions.remove(i);
                    continue;
                }
                return false;
            }
            if self.is_false_or_unknown(graph, condition) {
                return false;
            }
            if matches!(condition.kind, ExpressionKind::And(..)) {
                let terms = conditions.remove(i).split_and();
                conditions.splice(i..i, terms);
                continue;
            }
            i += 1;
        }
        true
    }

    fn select_node(&mut self, graph: &mut PlanGraph, select: NodeId) -> QueryResult<()> {
        let (input, mut conditions) = match graph.kind_mut(select) {
            PlanNodeKind::Select { input, conditions } => (*input, std::mem::take(conditions)),
            _ => return Ok(()),
        };
        let mut keep = self.check_conditions(graph, &mut conditions);
        if let PlanNodeKind::Select { conditions: slot, .. } = graph.kind_mut(select) {
            *slot = conditions;
        }
        if keep && graph.kind(input).is_joinable() {
            match self.check_outer_joins(graph, input)? {
                None => keep = false,
                Some(replacement) if replacement != input => graph.replace_input(select, input, replacement)?,
                Some(_) => {}
            }
        }
        if !keep {
            self.replace_unsatisfiable(graph, select, input)?;
        }
        Ok(())
    }

    /// Remove join branches whose conditions can never hold. Returns the
    /// joinable that replaces `joinable`, or `None` if no rows remain.
    fn check_outer_joins(&mut self, graph: &mut PlanGraph, joinable: NodeId) -> QueryResult<Option<NodeId>> {
        if self.eliminated.contains(&joinable) {
            return Ok(None);
        }
        let (left, right, join_type) = match graph.kind(joinable) {
            PlanNodeKind::Join(join) => (join.left, join.right, join.join_type),
            _ => return Ok(Some(joinable)),
        };
        let new_left = self.check_outer_joins(graph, left)?;
        let new_right = self.check_outer_joins(graph, right)?;
        let mut conditions = std::mem::take(&mut graph.join_mut(joinable)?.conditions);
        let satisfiable = self.check_conditions(graph, &mut conditions);
        graph.join_mut(joinable)?.conditions = conditions;
        if !satisfiable {
            match join_type {
                JoinType::Inner | JoinType::Semi => return Ok(None),
                JoinType::Left | JoinType::Anti => {
                    self.eliminate_sources(graph, right);
                    return Ok(new_left);
                }
                JoinType::Right => {
                    self.eliminate_sources(graph, left);
                    return Ok(new_right);
                }
                _ => {}
            }
        }
        match (new_left, new_right) {
            (None, remaining) | (remaining, None) => Ok(remaining),
            (Some(l), Some(r)) => {
                if l != left {
                    graph.replace_input(joinable, left, l)?;
                }
                if r != right {
                    graph.replace_input(joinable, right, r)?;
                }
                Ok(Some(joinable))
            }
        }
    }

    /// Replace a Select that passes no rows. A Sort directly above goes
    /// with it, and an aggregate without grouping becomes its single row.
    fn replace_unsatisfiable(&mut self, graph: &mut PlanGraph, select: NodeId, input: NodeId) -> QueryResult<()> {
        self.eliminate_sources(graph, input);
        let mut to_replace = select;
        let mut parent = graph.output(to_replace);
        if let Some(sort) = parent.filter(|p| matches!(graph.kind(*p), PlanNodeKind::Sort { .. })) {
            to_replace = sort;
            parent = graph.output(sort);
        }
        let mut empty_row = false;
        if let Some(aggregate) = parent {
            if let PlanNodeKind::AggregateSource { group_by, .. } = graph.kind(aggregate) {
                empty_row = group_by.is_empty();
                to_replace = aggregate;
                self.eliminate_source(aggregate);
            }
        }
        let replacement = if empty_row {
            graph.add(PlanNodeKind::ExpressionsSource {
                rows: vec![Vec::new()],
                distinct_state: DistinctState::Distinct,
                field_types: Vec::new(),
            })
        } else {
            graph.add(PlanNodeKind::NullSource)
        };
        debug!(
            "Replacing unsatisfiable {} {} with {}",
            graph.kind(to_replace).name(),
            to_replace,
            graph.kind(replacement).name()
        );
        graph.replace_node(to_replace, replacement)?;
        self.changed = true;
        Ok(())
    }

    fn eliminate_sources(&mut self, graph: &PlanGraph, node: NodeId) {
        let kind = graph.kind(node);
        if kind.is_column_source() {
            self.eliminate_source(node);
        }
        for input in kind.inputs() {
            self.eliminate_sources(graph, input);
        }
    }

    fn eliminate_source(&mut self, source: NodeId) {
        // References to it are found on another pass
        if self.eliminated.insert(source) {
            self.changed = true;
        }
    }

    /// COUNT of something never NULL counts rows
    fn count_rows(&self, graph: &mut PlanGraph, source: NodeId) {
        let PlanNodeKind::AggregateSource { aggregates, .. } = graph.kind_mut(source) else {
            return;
        };
        for aggregate in aggregates.iter_mut() {
            if let ExpressionKind::Aggregate(call) = &mut aggregate.kind {
                let never_null = call.operand.as_ref().is_some_and(|operand| {
                    constantness(operand) == Constantness::Constant || operand.ty.as_ref().is_some_and(|t| !t.nullable)
                });
                if call.function == "COUNT" && !call.distinct && never_null {
                    call.operand = None;
                }
            }
        }
    }
}

impl PlanRewriter for Folder<'_> {
    fn enter(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<bool> {
        if !self.plan_level {
            return Ok(false);
        }
        if let PlanNodeKind::Select { conditions, .. } = graph.kind(node) {
            for condition in conditions {
                if let ExpressionKind::Any(subquery) = condition.kind {
                    self.top_level.insert(subquery);
                }
            }
        }
        Ok(true)
    }

    fn leave(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<()> {
        if !self.plan_level {
            return Ok(());
        }
        match graph.kind(node) {
            PlanNodeKind::Select { .. } => self.select_node(graph, node)?,
            PlanNodeKind::SubquerySource { input, .. } => {
                if subquery_emptiness(graph, *input) == Emptiness::Empty {
                    self.eliminate_source(node);
                }
            }
            PlanNodeKind::AggregateSource { .. } => self.count_rows(graph, node),
            _ => {}
        }
        Ok(())
    }

    fn rewrite(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        match self.fold(graph, &expression)? {
            Some(folded) => {
                self.changed = true;
                Ok(folded)
            }
            None => Ok(expression),
        }
    }
}

/// Renumbers references to aggregate outputs after aggregates of NULL are
/// removed from their source
struct AggregateShift<'a> {
    dropped: &'a BTreeMap<NodeId, (usize, Vec<usize>)>,
}

impl PlanRewriter for AggregateShift<'_> {
    fn rewrite(&mut self, _graph: &mut PlanGraph, mut expression: Expression) -> QueryResult<Expression> {
        if let ExpressionKind::Column(column) = &mut expression.kind {
            if let Some((keys, positions)) = self.dropped.get(&column.source) {
                if let Some(aggregate) = column.position.checked_sub(*keys) {
                    let delta = positions.iter().filter(|p| **p < aggregate).count();
                    column.position -= delta;
                }
            }
        }
        Ok(expression)
    }
}
