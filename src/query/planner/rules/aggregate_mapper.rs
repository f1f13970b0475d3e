// Aggregate Mapper
//
// Resolves GROUP BY keys and aggregate calls in the nodes fed by each
// aggregate source into positional references to the aggregate's output
// row: grouping keys first, then aggregate results.

use std::collections::BTreeSet;

use log::debug;

use super::nodes_below;
use crate::catalog::{Catalog, IndexKind};
use crate::common::config::ImplicitAggregate;
use crate::query::executor::result::{QueryError, QueryResult};
use crate::query::planner::context::PlanContext;
use crate::query::planner::optimizer::Rule;
use crate::query::planner::plan::expression::{Expression, ExpressionKind};
use crate::query::planner::plan::node::PlanNodeKind;
use crate::query::planner::plan::visitor::{rewrite_expression, PlanRewriter};
use crate::query::planner::plan::{NodeId, PlanGraph};

pub struct AggregateMapper;

impl Rule for AggregateMapper {
    fn name(&self) -> &'static str {
        "AggregateMapper"
    }

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        let root = context.plan.root()?;
        let sources: Vec<NodeId> = context
            .plan
            .reachable(root)
            .into_iter()
            .filter(|id| matches!(context.plan.kind(*id), PlanNodeKind::AggregateSource { .. }))
            .collect();
        for source in sources.into_iter().rev() {
            let mut mapper = Mapper::new(&context.plan, context.catalog, context.config.implicit_aggregate, source)?;
            mapper.remap(&mut context.plan)?;
        }
        reject_stray_aggregates(&context.plan, root)
    }
}

struct Mapper<'a> {
    catalog: &'a Catalog,
    policy: ImplicitAggregate,
    source: NodeId,
    /// Column sources feeding the aggregate
    aggregated: BTreeSet<NodeId>,
    map: Vec<(Expression, Expression)>,
    /// Nesting of subqueries entered while rewriting
    depth: usize,
}

impl<'a> Mapper<'a> {
    fn new(graph: &PlanGraph, catalog: &'a Catalog, policy: ImplicitAggregate, source: NodeId) -> QueryResult<Self> {
        let PlanNodeKind::AggregateSource { input, group_by, .. } = graph.kind(source) else {
            return Err(QueryError::Internal(format!("{} is not an aggregate source", source)));
        };
        // GROUP BY x+1 allows x+1 above the aggregate but not x+2
        let map = group_by
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let mut column = Expression::column(source, i, key.to_string());
                column.ty = key.ty.clone();
                column.sql = key.sql.clone();
                (key.clone(), column)
            })
            .collect();
        Ok(Mapper { catalog, policy, source, aggregated: nodes_below(graph, *input), map, depth: 0 })
    }

    /// Rewrite the nodes the aggregate feeds, as long as they are understood
    fn remap(&mut self, graph: &mut PlanGraph) -> QueryResult<()> {
        let mut node = self.source;
        while let Some(output) = graph.output(node) {
            match graph.kind(output) {
                PlanNodeKind::Select { .. }
                | PlanNodeKind::Sort { .. }
                | PlanNodeKind::Project { .. }
                | PlanNodeKind::Limit { .. }
                | PlanNodeKind::Distinct { .. } => {}
                _ => break,
            }
            let expressions = graph.take_expressions(output);
            let mut rewritten = Vec::with_capacity(expressions.len());
            for expression in expressions {
                rewritten.push(rewrite_expression(graph, expression, self)?);
            }
            graph.restore_expressions(output, rewritten)?;
            node = output;
        }
        Ok(())
    }

    fn lookup(&self, expression: &Expression) -> Option<Expression> {
        self.map.iter().find(|(from, _)| from == expression).map(|(_, to)| to.clone())
    }

    fn map_aggregate(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        let ExpressionKind::Aggregate(call) = &expression.kind else {
            return Ok(expression);
        };
        if call.operand.as_ref().is_some_and(|o| o.contains_aggregate()) {
            return Err(QueryError::NestedAggregate(expression.to_string()));
        }
        let function = call.function.as_str();
        match function {
            "AVG" | "VAR_POP" | "VAR_SAMP" | "STDDEV_POP" | "STDDEV_SAMP" => {
                let operand = call
                    .operand
                    .as_deref()
                    .cloned()
                    .ok_or_else(|| QueryError::UnsupportedSql(format!("{}(*)", function)))?;
                let distinct = call.distinct;
                let count = Expression::aggregate("COUNT", Some(operand.clone()), distinct);
                let (name, operands) = if function == "AVG" {
                    ("divide".to_string(), vec![Expression::aggregate("SUM", Some(operand), distinct), count])
                } else {
                    let sum_of_squares = Expression::aggregate("_VAR_SUM_2", Some(operand.clone()), distinct);
                    let sum = Expression::aggregate("_VAR_SUM", Some(operand), distinct);
                    (format!("_{}", function), vec![sum_of_squares, sum, count])
                };
                debug!("Expanding {} over its algebraic parts", expression);
                Ok(expression.replaced_by(ExpressionKind::Function { name, operands }))
            }
            _ => self.add_aggregate(graph, expression),
        }
    }

    fn add_aggregate(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        let PlanNodeKind::AggregateSource { group_by, aggregates, .. } = graph.kind_mut(self.source) else {
            return Err(QueryError::Internal(format!("{} is not an aggregate source", self.source)));
        };
        let position = match aggregates.iter().position(|a| a == &expression) {
            Some(existing) => existing,
            None => {
                aggregates.push(expression.clone());
                aggregates.len() - 1
            }
        };
        let column = Expression::column(self.source, group_by.len() + position, expression.to_string());
        self.map.push((expression, column.clone()));
        Ok(column)
    }

    fn add_key(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        let PlanNodeKind::AggregateSource { group_by, .. } = graph.kind_mut(self.source) else {
            return Err(QueryError::Internal(format!("{} is not an aggregate source", self.source)));
        };
        group_by.push(expression.clone());
        let mut column = Expression::column(self.source, group_by.len() - 1, expression.to_string());
        column.ty = expression.ty.clone();
        self.map.push((expression, column.clone()));
        Ok(column)
    }

    /// A column that is neither grouped nor aggregated
    fn non_aggregate(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        let Some(column) = expression.as_column() else {
            return Ok(expression);
        };
        let unique = self.is_unique_grouped_table(graph, column.source);
        match self.policy {
            ImplicitAggregate::Error => return Err(QueryError::NoAggregateWithGroupBy(expression.to_string())),
            ImplicitAggregate::FirstIfUnique if !unique => {
                return Err(QueryError::NoAggregateWithGroupBy(expression.to_string()))
            }
            _ => {}
        }
        let no_aggregates = matches!(
            graph.kind(self.source),
            PlanNodeKind::AggregateSource { aggregates, .. } if aggregates.is_empty()
        );
        if unique && no_aggregates {
            // Another key keeps the grouping a plain DISTINCT
            return self.add_key(graph, expression);
        }
        let first = Expression::aggregate("FIRST", Some(expression.clone()), false);
        let mapped = self.add_aggregate(graph, first)?;
        self.map.push((expression, mapped.clone()));
        Ok(mapped)
    }

    /// Whether a unique index of the column's table has all its columns
    /// among the grouping keys
    fn is_unique_grouped_table(&self, graph: &PlanGraph, source: NodeId) -> bool {
        let Ok(table_source) = graph.table_source(source) else {
            return false;
        };
        let PlanNodeKind::AggregateSource { group_by, .. } = graph.kind(self.source) else {
            return false;
        };
        let grouped: BTreeSet<usize> = group_by
            .iter()
            .filter_map(|key| key.as_column())
            .filter(|c| c.source == source)
            .map(|c| c.position)
            .collect();
        if grouped.is_empty() {
            return false;
        }
        self.catalog.table_indexes(table_source.table.id()).any(|index| {
            index.unique
                && matches!(index.kind, IndexKind::Table)
                && index.columns.iter().all(|c| grouped.contains(&c.position))
        })
    }
}

impl PlanRewriter for Mapper<'_> {
    fn enter(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<bool> {
        if matches!(graph.kind(node), PlanNodeKind::Subquery { .. }) {
            self.depth += 1;
        }
        Ok(true)
    }

    fn leave(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<()> {
        if matches!(graph.kind(node), PlanNodeKind::Subquery { .. }) {
            self.depth -= 1;
        }
        Ok(())
    }

    fn visit_children_first(&self, _expression: &Expression) -> bool {
        false
    }

    fn rewrite(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        if let Some(mapped) = self.lookup(&expression) {
            return Ok(mapped);
        }
        match &expression.kind {
            // Aggregates of a subquery belong to its own aggregate source
            ExpressionKind::Aggregate(_) if self.depth == 0 => self.map_aggregate(graph, expression),
            ExpressionKind::Column(column) if self.aggregated.contains(&column.source) => {
                self.non_aggregate(graph, expression)
            }
            _ => Ok(expression),
        }
    }
}

/// Aggregate calls left anywhere but an aggregate source have no
/// aggregation to belong to
fn reject_stray_aggregates(graph: &PlanGraph, root: NodeId) -> QueryResult<()> {
    for id in graph.reachable(root) {
        let kind = graph.kind(id);
        if matches!(kind, PlanNodeKind::AggregateSource { .. }) {
            continue;
        }
        if let Some(expression) = kind.expressions().into_iter().find(|e| e.contains_aggregate()) {
            return Err(QueryError::AggregateInWhere(expression.to_string()));
        }
    }
    Ok(())
}
