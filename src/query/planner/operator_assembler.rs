// Operator Assembler
//
// Terminal stage: walks the optimized plan once and asks an
// `OperatorFactory` for the operators implementing each node. Column
// references become positions in the row of the stream they are evaluated
// against, or in a row bound by an enclosing nested loop.

use std::collections::BTreeSet;

use log::trace;

use crate::common::config::OptimizerConfig;
use crate::common::types::TableId;
use crate::query::executor::operators::{
    AggregateSpec, BindingPosition, IndexBound, IndexKeyRange, OperatorFactory, PhysicalExpression, SortKey,
    SubqueryKind,
};
use crate::query::executor::result::{DataValue, QueryError, QueryResult};
use crate::query::planner::context::PlanContext;
use crate::query::planner::plan::expression::{Expression, ExpressionKind};
use crate::query::planner::plan::node::{DistinctState, IndexScan, JoinType, PlanNodeKind, ResultField};
use crate::query::planner::plan::{NodeId, PlanGraph};
use crate::query::types::TypeInstance;

/// The operator tree of a statement and what a caller needs to run it
#[derive(Debug)]
pub struct AssembledPlan<O> {
    pub operator: O,
    /// Empty for DML statements
    pub result_columns: Vec<ResultField>,
    /// SQL type of each positional parameter
    pub parameter_types: Vec<Option<TypeInstance>>,
    /// Tables the plan reads or writes
    pub affected_tables: BTreeSet<TableId>,
}

/// Which field of which column source sits at each position of a row
#[derive(Debug, Clone, Default)]
struct RowLayout {
    fields: Vec<(NodeId, usize)>,
}

impl RowLayout {
    fn of_source(source: NodeId, width: usize) -> Self {
        RowLayout { fields: (0..width).map(|position| (source, position)).collect() }
    }

    fn len(&self) -> usize {
        self.fields.len()
    }

    fn position(&self, source: NodeId, position: usize) -> Option<usize> {
        self.fields.iter().position(|field| *field == (source, position))
    }

    fn contains_source(&self, source: NodeId) -> bool {
        self.fields.iter().any(|(s, _)| *s == source)
    }

    fn extend(&mut self, other: &RowLayout) {
        self.fields.extend(other.fields.iter().copied());
    }
}

/// What an executing plan finds at a binding position
#[derive(Debug)]
enum Binding {
    Row(RowLayout),
    BloomFilter(u32),
    /// A loaded hash table and the layout of the rows it holds
    HashTable(u32, RowLayout),
}

struct Stream<O> {
    operator: O,
    layout: RowLayout,
}

pub struct OperatorAssembler<'c, F: OperatorFactory> {
    context: &'c PlanContext<'c>,
    graph: &'c PlanGraph,
    config: &'c OptimizerConfig,
    factory: &'c F,
    bindings: Vec<Binding>,
    affected_tables: BTreeSet<TableId>,
}

impl<'c, F: OperatorFactory> OperatorAssembler<'c, F> {
    pub fn new(context: &'c PlanContext<'c>, factory: &'c F) -> Self {
        OperatorAssembler {
            context,
            graph: &context.plan,
            config: context.config,
            factory,
            bindings: Vec::new(),
            affected_tables: BTreeSet::new(),
        }
    }

    pub fn assemble(mut self) -> QueryResult<AssembledPlan<F::Operator>> {
        let root = self.graph.root()?;
        let result_columns = match self.graph.kind(root) {
            PlanNodeKind::ResultSet { fields, .. } => fields.clone(),
            _ => Vec::new(),
        };
        let stream = self.assemble_stream(root)?;
        if !self.bindings.is_empty() {
            return Err(QueryError::Internal(format!("{} bindings left after assembly", self.bindings.len())));
        }
        Ok(AssembledPlan {
            operator: stream.operator,
            result_columns,
            parameter_types: self.context.parameters.sql_types(),
            affected_tables: self.affected_tables,
        })
    }

    fn assemble_stream(&mut self, node: NodeId) -> QueryResult<Stream<F::Operator>> {
        let graph = self.graph;
        let factory = self.factory;
        let kind = graph.kind(node);
        trace!("Assembling {} {}", kind.name(), node);
        match kind {
            PlanNodeKind::ResultSet { input, .. } | PlanNodeKind::Subquery { input } => self.assemble_stream(*input),

            PlanNodeKind::Insert { input, table, target_columns } => {
                let stream = self.assemble_stream(*input)?;
                let row = table
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(position, column)| match target_columns.iter().position(|c| *c == position) {
                        Some(field) => {
                            PhysicalExpression::Field { position: field, ty: Some(column.data_type().clone()) }
                        }
                        None => PhysicalExpression::Literal(DataValue::Null),
                    })
                    .collect();
                self.affected_tables.insert(table.id());
                Ok(Stream { operator: factory.insert(stream.operator, table.id(), row), layout: stream.layout })
            }
            PlanNodeKind::Update { input, table, update_columns, .. } => {
                let stream = self.assemble_stream(*input)?;
                let mut columns = Vec::with_capacity(update_columns.len());
                for update in update_columns {
                    columns.push((update.column, self.expression(&update.expression, &stream.layout)?));
                }
                self.affected_tables.insert(table.id());
                Ok(Stream { operator: factory.update(stream.operator, table.id(), columns), layout: stream.layout })
            }
            PlanNodeKind::Delete { input, table, .. } => {
                let stream = self.assemble_stream(*input)?;
                self.affected_tables.insert(table.id());
                Ok(Stream { operator: factory.delete(stream.operator, table.id()), layout: stream.layout })
            }

            PlanNodeKind::Select { input, conditions } => {
                let stream = self.assemble_stream(*input)?;
                if conditions.is_empty() {
                    return Ok(stream);
                }
                let conditions = self.expressions(conditions, &stream.layout)?;
                let condition = conjunction(conditions)?;
                Ok(Stream { operator: factory.select(stream.operator, condition), layout: stream.layout })
            }
            PlanNodeKind::Project { input, fields } => {
                let stream = self.assemble_stream(*input)?;
                let fields = self.expressions(fields, &stream.layout)?;
                let layout = RowLayout::of_source(node, fields.len());
                Ok(Stream { operator: factory.project(stream.operator, fields), layout })
            }
            PlanNodeKind::Sort { input, orderings } => {
                let stream = self.assemble_stream(*input)?;
                let mut keys = Vec::with_capacity(orderings.len());
                for ordering in orderings {
                    let expression = self.expression(&ordering.expression, &stream.layout)?;
                    keys.push(SortKey { expression, ascending: ordering.ascending });
                }
                Ok(Stream { operator: factory.sort(stream.operator, keys), layout: stream.layout })
            }
            PlanNodeKind::Limit { input, offset, limit } => {
                let stream = self.assemble_stream(*input)?;
                Ok(Stream { operator: factory.limit(stream.operator, *offset, *limit), layout: stream.layout })
            }
            PlanNodeKind::Distinct { input } => {
                let stream = self.assemble_stream(*input)?;
                Ok(Stream { operator: factory.distinct(stream.operator), layout: stream.layout })
            }
            PlanNodeKind::Buffer { input } => {
                let stream = self.assemble_stream(*input)?;
                Ok(Stream { operator: factory.buffer(stream.operator), layout: stream.layout })
            }
            PlanNodeKind::AggregateSource { input, group_by, aggregates } => {
                let stream = self.assemble_stream(*input)?;
                let keys = self.expressions(group_by, &stream.layout)?;
                let mut specs = Vec::with_capacity(aggregates.len());
                for aggregate in aggregates {
                    let ExpressionKind::Aggregate(call) = &aggregate.kind else {
                        return Err(QueryError::Internal(format!("{} is not an aggregate", aggregate)));
                    };
                    let operand = match &call.operand {
                        Some(operand) => Some(self.expression(operand, &stream.layout)?),
                        None => None,
                    };
                    specs.push(AggregateSpec {
                        function: call.function.clone(),
                        operand,
                        distinct: call.distinct,
                        ty: aggregate.ty.clone(),
                    });
                }
                let layout = RowLayout::of_source(node, keys.len() + specs.len());
                Ok(Stream { operator: factory.aggregate(stream.operator, keys, specs), layout })
            }
            PlanNodeKind::SetOperation { left, right, operation, all } => {
                let left = self.assemble_stream(*left)?;
                let right = self.assemble_stream(*right)?;
                let layout = RowLayout::of_source(node, left.layout.len());
                Ok(Stream { operator: factory.set_operation(left.operator, right.operator, *operation, *all), layout })
            }

            PlanNodeKind::MapJoin { outer, inner, join_type } => {
                let outer = self.assemble_stream(*outer)?;
                let binding = self.push(Binding::Row(outer.layout.clone()));
                let inner = self.assemble_stream(*inner)?;
                self.pop(binding)?;
                let mut layout = outer.layout;
                if !join_type.is_semi() && *join_type != JoinType::Anti {
                    layout.extend(&inner.layout);
                }
                let operator =
                    factory.map_join(outer.operator, inner.operator, binding, *join_type, self.config.map_enabled);
                Ok(Stream { operator, layout })
            }
            PlanNodeKind::OnlyIfEmpty { input } => {
                let stream = self.assemble_stream(*input)?;
                Ok(Stream { operator: factory.only_if_empty(stream.operator), layout: RowLayout::default() })
            }
            PlanNodeKind::NullIfEmpty { input } => {
                let stream = self.assemble_stream(*input)?;
                let width = stream.layout.len();
                Ok(Stream { operator: factory.null_if_empty(stream.operator, width), layout: stream.layout })
            }
            PlanNodeKind::UsingBloomFilter { loader, input, filter, loader_keys, estimated_size } => {
                let loader = self.assemble_stream(*loader)?;
                let keys = self.expressions(loader_keys, &loader.layout)?;
                let binding = self.push(Binding::BloomFilter(*filter));
                let stream = self.assemble_stream(*input)?;
                self.pop(binding)?;
                let operator =
                    factory.using_bloom_filter(loader.operator, stream.operator, keys, *estimated_size, binding);
                Ok(Stream { operator, layout: stream.layout })
            }
            PlanNodeKind::BloomFilterFilter { input, filter, lookup } => {
                let binding = self.bloom_filter_binding(*filter)?;
                let stream = self.assemble_stream(*input)?;
                let lookup = self.expressions(lookup, &stream.layout)?;
                Ok(Stream { operator: factory.bloom_filter_filter(stream.operator, lookup, binding), layout: stream.layout })
            }
            PlanNodeKind::UsingHashTable { loader, input, hash_table, keys } => {
                let loader = self.assemble_stream(*loader)?;
                let keys = self.expressions(keys, &loader.layout)?;
                let binding = self.push(Binding::HashTable(*hash_table, loader.layout.clone()));
                let stream = self.assemble_stream(*input)?;
                self.pop(binding)?;
                let operator = factory.using_hash_table(loader.operator, stream.operator, keys, binding);
                Ok(Stream { operator, layout: stream.layout })
            }
            PlanNodeKind::HashTableLookup { hash_table, lookup, .. } => {
                let (binding, layout) = self.hash_table_binding(*hash_table)?;
                let lookup = self.expressions(lookup, &RowLayout::default())?;
                Ok(Stream { operator: factory.hash_table_lookup(lookup, binding), layout })
            }

            PlanNodeKind::ExpressionsSource { rows, distinct_state, field_types } => {
                let empty = RowLayout::default();
                let mut values = Vec::with_capacity(rows.len());
                for row in rows {
                    values.push(self.expressions(row, &empty)?);
                }
                let width = field_types.len().max(rows.first().map(|r| r.len()).unwrap_or(0));
                let mut operator = factory.values(values);
                if *distinct_state == DistinctState::NeedDistinct {
                    operator = factory.distinct(operator);
                }
                Ok(Stream { operator, layout: RowLayout::of_source(node, width) })
            }
            PlanNodeKind::NullSource => Ok(Stream { operator: factory.values(Vec::new()), layout: RowLayout::default() }),
            PlanNodeKind::SubquerySource { input, .. } => {
                let stream = self.assemble_stream(*input)?;
                let layout = RowLayout::of_source(node, stream.layout.len());
                Ok(Stream { operator: stream.operator, layout })
            }

            PlanNodeKind::IndexScan(scan) => {
                for table in &scan.tables {
                    self.touch(*table)?;
                }
                let range = self.index_range(scan)?;
                let layout = self.index_layout(scan)?;
                Ok(Stream { operator: factory.index_scan(&scan.index, range, scan.ascending), layout })
            }
            PlanNodeKind::IndexIntersection { output_scan, selector_scan, comparison_fields, estimated_rows } => {
                let output = self.assemble_stream(*output_scan)?;
                let selector = self.assemble_stream(*selector_scan)?;
                let skip_scan = *estimated_rows >= self.config.skip_scan_min_count;
                trace!("Intersection of {} rows, skip scan {}", estimated_rows, skip_scan);
                let operator = factory.intersect(output.operator, selector.operator, *comparison_fields, skip_scan);
                Ok(Stream { operator, layout: output.layout })
            }
            PlanNodeKind::GroupScan { group, tables } => {
                let layout = self.tables_layout(tables)?;
                let tables = self.table_ids(tables)?;
                Ok(Stream { operator: factory.group_scan(*group, tables), layout })
            }
            PlanNodeKind::FullTextScan { index, table, query, limit } => {
                self.touch(*table)?;
                let query = self.expression(query, &RowLayout::default())?;
                Ok(Stream { operator: factory.full_text_scan(index, query, *limit), layout: RowLayout::default() })
            }

            PlanNodeKind::AncestorLookup { input, descendant, ancestors } => {
                let (input, binding, keep_input, mut layout) = self.lookup_input(*input)?;
                layout.extend(&self.tables_layout(ancestors)?);
                let descendant = self.table_id(*descendant)?;
                let ancestors = self.table_ids(ancestors)?;
                let lookahead = self.config.group_lookup_lookahead_quantum;
                let operator = factory.ancestor_lookup(input, descendant, ancestors, binding, keep_input, lookahead);
                Ok(Stream { operator, layout })
            }
            PlanNodeKind::BranchLookup { input, source, branch, tables } => {
                let (input, binding, keep_input, mut layout) = match input {
                    Some(input) => self.lookup_input(*input)?,
                    None => (None, Some(self.row_binding(*source)?), false, RowLayout::default()),
                };
                layout.extend(&self.tables_layout(tables)?);
                let (source, branch) = (self.table_id(*source)?, self.table_id(*branch)?);
                let tables = self.table_ids(tables)?;
                let lookahead = self.config.group_lookup_lookahead_quantum;
                let operator = factory.branch_lookup(input, source, branch, tables, binding, keep_input, lookahead);
                Ok(Stream { operator, layout })
            }
            PlanNodeKind::Flatten { input, tables, join_types } => {
                let stream = self.assemble_stream(*input)?;
                let layout = self.tables_layout(tables)?;
                let tables = self.table_ids(tables)?;
                Ok(Stream { operator: factory.flatten(stream.operator, tables, join_types.clone()), layout })
            }
            PlanNodeKind::Product { ancestor, subplans } => {
                let (first, rest) = subplans
                    .split_first()
                    .ok_or_else(|| QueryError::Internal(format!("product {} without subplans", node)))?;
                let first = self.assemble_stream(*first)?;
                let mut layout = first.layout.clone();
                let binding = self.push(Binding::Row(first.layout));
                let mut branches = Vec::with_capacity(rest.len());
                for subplan in rest {
                    let branch = self.assemble_stream(*subplan)?;
                    layout.extend(&branch.layout);
                    branches.push(branch.operator);
                }
                self.pop(binding)?;
                let ancestor = match ancestor {
                    Some(ancestor) => Some(self.table_id(*ancestor)?),
                    None => None,
                };
                Ok(Stream { operator: factory.product(first.operator, branches, ancestor, binding), layout })
            }

            PlanNodeKind::Join(_)
            | PlanNodeKind::TableSource(_)
            | PlanNodeKind::TableGroupJoinTree(_)
            | PlanNodeKind::GroupLoopScan { .. } => Err(QueryError::UnsupportedSql(format!(
                "no operator for {} {}: {}",
                kind.name(),
                node,
                graph.summary(node)
            ))),
        }
    }

    /// The stream a lookup starts from. A group loop scan has no stream of
    /// its own: the lookup starts from the bound outer row.
    #[allow(clippy::type_complexity)]
    fn lookup_input(
        &mut self,
        input: NodeId,
    ) -> QueryResult<(Option<F::Operator>, Option<BindingPosition>, bool, RowLayout)> {
        let graph = self.graph;
        match graph.kind(input) {
            PlanNodeKind::GroupLoopScan { outside, .. } => {
                let binding = self.row_binding(*outside)?;
                Ok((None, Some(binding), false, RowLayout::default()))
            }
            kind => {
                let keep_input = !matches!(
                    kind,
                    PlanNodeKind::IndexScan(_) | PlanNodeKind::IndexIntersection { .. } | PlanNodeKind::FullTextScan { .. }
                );
                let stream = self.assemble_stream(input)?;
                let layout = if keep_input { stream.layout } else { RowLayout::default() };
                Ok((Some(stream.operator), None, keep_input, layout))
            }
        }
    }

    fn index_range(&mut self, scan: &IndexScan) -> QueryResult<IndexKeyRange<F::Operator>> {
        let empty = RowLayout::default();
        if let Some(spatial) = &scan.spatial {
            let mut low = self.expressions(&scan.equality, &empty)?;
            let mut high = self.expressions(&scan.equality, &empty)?;
            for center in &spatial.center {
                match &spatial.radius {
                    Some(radius) => {
                        low.push(self.offset("minus", center, radius)?);
                        high.push(self.offset("plus", center, radius)?);
                    }
                    None => {
                        low.push(self.expression(center, &empty)?);
                        high.push(self.expression(center, &empty)?);
                    }
                }
            }
            return Ok(IndexKeyRange {
                low: Some(IndexBound { columns: low, inclusive: true }),
                high: Some(IndexBound { columns: high, inclusive: true }),
                spatial: true,
            });
        }

        let low = match &scan.low {
            Some(bound) => {
                let mut columns = self.expressions(&scan.equality, &empty)?;
                columns.push(self.expression(&bound.value, &empty)?);
                Some(IndexBound { columns, inclusive: bound.inclusive })
            }
            None if !scan.equality.is_empty() => {
                Some(IndexBound { columns: self.expressions(&scan.equality, &empty)?, inclusive: true })
            }
            None => None,
        };
        let high = match &scan.high {
            Some(bound) => {
                let mut columns = self.expressions(&scan.equality, &empty)?;
                columns.push(self.expression(&bound.value, &empty)?);
                Some(IndexBound { columns, inclusive: bound.inclusive })
            }
            None if !scan.equality.is_empty() => {
                Some(IndexBound { columns: self.expressions(&scan.equality, &empty)?, inclusive: true })
            }
            None => None,
        };
        Ok(IndexKeyRange { low, high, spatial: false })
    }

    /// One corner coordinate of a spatial bounding box
    fn offset(
        &mut self,
        function: &str,
        center: &Expression,
        radius: &Expression,
    ) -> QueryResult<PhysicalExpression<F::Operator>> {
        let empty = RowLayout::default();
        let operands = vec![self.expression(center, &empty)?, self.expression(radius, &empty)?];
        Ok(PhysicalExpression::Function { name: function.to_string(), operands, ty: center.ty.clone() })
    }

    /// Index rows hold the key columns, attributed to the table sources
    /// they belong to
    fn index_layout(&self, scan: &IndexScan) -> QueryResult<RowLayout> {
        let mut layout = RowLayout::default();
        for column in &scan.index.columns {
            let mut source = None;
            for table in &scan.tables {
                if self.graph.table_source(*table)?.table.id() == column.table {
                    source = Some(*table);
                    break;
                }
            }
            let source = source.ok_or_else(|| {
                QueryError::Internal(format!("index {} column of table {} has no source", scan.index.name, column.table))
            })?;
            layout.fields.push((source, column.position));
        }
        Ok(layout)
    }

    fn tables_layout(&mut self, tables: &[NodeId]) -> QueryResult<RowLayout> {
        let mut layout = RowLayout::default();
        for table in tables {
            self.touch(*table)?;
            let width = self.graph.table_source(*table)?.table.columns().len();
            layout.extend(&RowLayout::of_source(*table, width));
        }
        Ok(layout)
    }

    fn table_id(&self, source: NodeId) -> QueryResult<TableId> {
        Ok(self.graph.table_source(source)?.table.id())
    }

    fn table_ids(&self, sources: &[NodeId]) -> QueryResult<Vec<TableId>> {
        sources.iter().map(|s| self.table_id(*s)).collect()
    }

    fn touch(&mut self, source: NodeId) -> QueryResult<()> {
        let table = self.table_id(source)?;
        self.affected_tables.insert(table);
        Ok(())
    }

    fn push(&mut self, binding: Binding) -> BindingPosition {
        self.bindings.push(binding);
        self.bindings.len() - 1
    }

    fn pop(&mut self, expected: BindingPosition) -> QueryResult<()> {
        if self.bindings.len() != expected + 1 {
            return Err(QueryError::Internal(format!(
                "binding {} popped with {} bindings in place",
                expected,
                self.bindings.len()
            )));
        }
        self.bindings.pop();
        Ok(())
    }

    /// The innermost bound row holding fields of `source`
    fn row_binding(&self, source: NodeId) -> QueryResult<BindingPosition> {
        self.bindings
            .iter()
            .enumerate()
            .rev()
            .find_map(|(position, binding)| match binding {
                Binding::Row(layout) if layout.contains_source(source) => Some(position),
                _ => None,
            })
            .ok_or_else(|| QueryError::Internal(format!("no bound row of {}", self.graph.summary(source))))
    }

    fn bloom_filter_binding(&self, filter: u32) -> QueryResult<BindingPosition> {
        self.bindings
            .iter()
            .position(|binding| matches!(binding, Binding::BloomFilter(f) if *f == filter))
            .ok_or_else(|| QueryError::Internal(format!("bloom filter {} is not loaded", filter)))
    }

    fn hash_table_binding(&self, hash_table: u32) -> QueryResult<(BindingPosition, RowLayout)> {
        self.bindings
            .iter()
            .enumerate()
            .find_map(|(position, binding)| match binding {
                Binding::HashTable(h, layout) if *h == hash_table => Some((position, layout.clone())),
                _ => None,
            })
            .ok_or_else(|| QueryError::Internal(format!("hash table {} is not loaded", hash_table)))
    }

    fn expressions(
        &mut self,
        expressions: &[Expression],
        layout: &RowLayout,
    ) -> QueryResult<Vec<PhysicalExpression<F::Operator>>> {
        expressions.iter().map(|e| self.expression(e, layout)).collect()
    }

    fn expression(&mut self, expression: &Expression, layout: &RowLayout) -> QueryResult<PhysicalExpression<F::Operator>> {
        let ty = expression.ty.clone();
        let boxed = |e: PhysicalExpression<F::Operator>| Box::new(e);
        Ok(match &expression.kind {
            ExpressionKind::Column(column) => {
                if let Some(position) = layout.position(column.source, column.position) {
                    return Ok(PhysicalExpression::Field { position, ty });
                }
                let bound = self.bindings.iter().enumerate().rev().find_map(|(binding, b)| match b {
                    Binding::Row(row) => row.position(column.source, column.position).map(|p| (binding, p)),
                    _ => None,
                });
                match bound {
                    Some((binding, position)) => PhysicalExpression::BoundField { binding, position, ty },
                    None => {
                        return Err(QueryError::Internal(format!(
                            "column {} of {} is not visible",
                            column.name,
                            self.graph.summary(column.source)
                        )));
                    }
                }
            }
            ExpressionKind::Constant(value) => PhysicalExpression::Literal(value.clone()),
            ExpressionKind::Parameter(position) => {
                let ty = self.context.parameters.get(*position).cloned().or(ty);
                PhysicalExpression::Parameter { position: *position, ty }
            }
            ExpressionKind::Cast { operand, target } => {
                PhysicalExpression::Cast { operand: boxed(self.expression(operand, layout)?), target: target.clone() }
            }
            ExpressionKind::Function { name, operands } => {
                PhysicalExpression::Function { name: name.clone(), operands: self.expressions(operands, layout)?, ty }
            }
            ExpressionKind::Comparison { op, left, right } => PhysicalExpression::Comparison {
                op: *op,
                left: boxed(self.expression(left, layout)?),
                right: boxed(self.expression(right, layout)?),
            },
            ExpressionKind::And(left, right) => {
                PhysicalExpression::And(boxed(self.expression(left, layout)?), boxed(self.expression(right, layout)?))
            }
            ExpressionKind::Or(left, right) => {
                PhysicalExpression::Or(boxed(self.expression(left, layout)?), boxed(self.expression(right, layout)?))
            }
            ExpressionKind::Not(operand) => PhysicalExpression::Not(boxed(self.expression(operand, layout)?)),
            ExpressionKind::IfElse { test, then, otherwise } => PhysicalExpression::IfElse {
                test: boxed(self.expression(test, layout)?),
                then: boxed(self.expression(then, layout)?),
                otherwise: boxed(self.expression(otherwise, layout)?),
            },
            ExpressionKind::Routine { name, operands, .. } => {
                PhysicalExpression::Routine { name: name.clone(), operands: self.expressions(operands, layout)?, ty }
            }
            ExpressionKind::Aggregate(_) => {
                return Err(QueryError::Internal(format!("aggregate {} outside of an aggregation", expression)));
            }
            ExpressionKind::Exists(subquery) => self.subquery(SubqueryKind::Exists, *subquery, layout)?,
            ExpressionKind::Any(subquery) => self.subquery(SubqueryKind::Any, *subquery, layout)?,
            ExpressionKind::SubqueryValue(subquery) => self.subquery(SubqueryKind::Value, *subquery, layout)?,
        })
    }

    /// Run the subquery with the current row bound
    fn subquery(
        &mut self,
        kind: SubqueryKind,
        subquery: NodeId,
        layout: &RowLayout,
    ) -> QueryResult<PhysicalExpression<F::Operator>> {
        let binding = self.push(Binding::Row(layout.clone()));
        let stream = self.assemble_stream(subquery)?;
        self.pop(binding)?;
        Ok(PhysicalExpression::Subquery { kind, operator: Box::new(stream.operator), binding })
    }
}

fn conjunction<O>(conditions: Vec<PhysicalExpression<O>>) -> QueryResult<PhysicalExpression<O>> {
    conditions
        .into_iter()
        .reduce(|left, right| PhysicalExpression::And(Box::new(left), Box::new(right)))
        .ok_or_else(|| QueryError::Internal("empty condition list".to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;
    use crate::catalog::Catalog;
    use crate::query::executor::operators::{PhysicalOperator, PlanOperatorFactory};
    use crate::query::planner::cost_model::DefaultCostEstimator;
    use crate::query::planner::plan::node::{JoinNode, RangeBound};
    use crate::query::planner::plan::PlanBuilder;
    use crate::query::planner::rules::fixtures::coi_catalog;
    use crate::query::types::registry::StandardTypesRegistry;

    fn assemble(catalog: &Catalog, graph: PlanGraph) -> QueryResult<AssembledPlan<PhysicalOperator>> {
        assemble_with(catalog, graph, &OptimizerConfig::default())
    }

    fn assemble_with(
        catalog: &Catalog,
        graph: PlanGraph,
        config: &OptimizerConfig,
    ) -> QueryResult<AssembledPlan<PhysicalOperator>> {
        let types = StandardTypesRegistry::new();
        let estimator = DefaultCostEstimator::new();
        let context = PlanContext::new(graph, catalog, &types, config, &estimator);
        let factory = PlanOperatorFactory::new(catalog);
        OperatorAssembler::new(&context, &factory).assemble()
    }

    fn group_scan(b: &mut PlanBuilder<'_>, tables: Vec<NodeId>) -> QueryResult<NodeId> {
        let group = b.graph().table_source(tables[0])?.table.group();
        Ok(b.graph_mut().add(PlanNodeKind::GroupScan { group, tables }))
    }

    /// Display form, which leaves out types
    fn untyped(expression: &PhysicalExpression<PhysicalOperator>) -> String {
        expression.to_string()
    }

    #[test]
    fn test_flattened_columns_resolve_to_offsets() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let o = b.table("orders", "o")?;
        let scan = group_scan(&mut b, vec![c, o])?;
        let flatten = b.graph_mut().add(PlanNodeKind::Flatten {
            input: scan,
            tables: vec![c, o],
            join_types: vec![JoinType::Inner],
        });
        let project = b.project(flatten, vec![b.column(c, "name")?, b.column(o, "odate")?]);
        b.result_set(project, &["name", "odate"]);
        let plan = assemble(&catalog, b.build()?)?;

        assert_eq!(plan.operator.operator_names(), vec!["Project", "Flatten", "GroupScan"]);
        let PhysicalOperator::Project { fields, .. } = &plan.operator else {
            panic!("expected a project");
        };
        assert_eq!(fields.iter().map(untyped).collect::<Vec<_>>(), vec!["Field(1)", "Field(4)"]);
        let names: Vec<&str> = plan.result_columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["name", "odate"]);
        let expected: BTreeSet<TableId> = ["customers", "orders"]
            .iter()
            .filter_map(|n| catalog.table_by_name(n).map(|t| t.id()))
            .collect();
        assert_eq!(plan.affected_tables, expected);
        Ok(())
    }

    #[test]
    fn test_map_join_binds_outer_row() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t1 = b.table("t", "t1")?;
        let t2 = b.table("t", "t2")?;
        let outer = group_scan(&mut b, vec![t1])?;
        let inner_scan = group_scan(&mut b, vec![t2])?;
        let inner = b.select(inner_scan, vec![Expression::equals(b.column(t2, "x")?, b.column(t1, "x")?)]);
        let join = b.graph_mut().add(PlanNodeKind::MapJoin { outer, inner, join_type: JoinType::Inner });
        let project = b.project(join, vec![b.column(t1, "id")?, b.column(t2, "id")?]);
        b.result_set(project, &["a", "b"]);
        let plan = assemble(&catalog, b.build()?)?;

        let PhysicalOperator::Project { input, fields } = &plan.operator else {
            panic!("expected a project");
        };
        assert_eq!(fields, &vec![
            PhysicalExpression::Field { position: 0, ty: Some(TypeInstance::integer(false)) },
            PhysicalExpression::Field { position: 4, ty: Some(TypeInstance::integer(false)) },
        ]);
        let PhysicalOperator::MapJoin { inner, binding, pipelined, .. } = input.as_ref() else {
            panic!("expected a map join");
        };
        assert_eq!(*binding, 0);
        assert!(!pipelined);
        let PhysicalOperator::Select { condition, .. } = inner.as_ref() else {
            panic!("expected a select");
        };
        assert_eq!(untyped(condition), "Field(1) == Bound(0, 1)");
        Ok(())
    }

    #[test]
    fn test_exists_subquery_gets_binding() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t1 = b.table("t", "t1")?;
        let t2 = b.table("t", "t2")?;
        let outer = group_scan(&mut b, vec![t1])?;
        let inner_scan = group_scan(&mut b, vec![t2])?;
        let inner = b.select(inner_scan, vec![Expression::equals(b.column(t2, "y")?, b.column(t1, "y")?)]);
        let exists = b.exists(inner);
        let select = b.select(outer, vec![exists]);
        b.result_set(select, &[]);
        let plan = assemble(&catalog, b.build()?)?;

        let PhysicalOperator::Select { condition, .. } = &plan.operator else {
            panic!("expected a select");
        };
        let PhysicalExpression::Subquery { kind, operator, binding } = condition else {
            panic!("expected a subquery");
        };
        assert_eq!((*kind, *binding), (SubqueryKind::Exists, 0));
        let PhysicalOperator::Select { condition, .. } = operator.as_ref() else {
            panic!("expected the subquery's select");
        };
        assert_eq!(untyped(condition), "Field(2) == Bound(0, 2)");
        Ok(())
    }

    fn index_scan(b: &mut PlanBuilder<'_>, catalog: &Catalog, source: NodeId, estimated_rows: u64) -> QueryResult<NodeId> {
        let index = catalog
            .index_by_name("t_y")
            .cloned()
            .ok_or_else(|| QueryError::Internal("t_y".to_string()))?;
        Ok(b.graph_mut().add(PlanNodeKind::IndexScan(IndexScan {
            index: Arc::clone(&index),
            leaf: source,
            root_table: source,
            tables: vec![source],
            equality: Vec::new(),
            low: Some(RangeBound { value: Expression::integer(3), inclusive: false }),
            high: None,
            spatial: None,
            ascending: true,
            covering: true,
            estimated_rows,
            required_tables: None,
        })))
    }

    #[test]
    fn test_intersection_skip_scan_threshold() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        for (rows, expected) in [(5000, true), (10, false)] {
            let mut b = PlanBuilder::new(&catalog);
            let t = b.table("t", "t")?;
            let output_scan = index_scan(&mut b, &catalog, t, rows)?;
            let selector_scan = index_scan(&mut b, &catalog, t, rows)?;
            let intersection = b.graph_mut().add(PlanNodeKind::IndexIntersection {
                output_scan,
                selector_scan,
                comparison_fields: 1,
                estimated_rows: rows,
            });
            let project = b.project(intersection, vec![b.column(t, "y")?]);
            b.result_set(project, &["y"]);
            let plan = assemble(&catalog, b.build()?)?;

            let PhysicalOperator::Project { input, fields } = &plan.operator else {
                panic!("expected a project");
            };
            assert_eq!(untyped(&fields[0]), "Field(0)");
            let PhysicalOperator::Intersect { output, skip_scan, .. } = input.as_ref() else {
                panic!("expected an intersection");
            };
            assert_eq!(*skip_scan, expected);
            let PhysicalOperator::IndexScan { range, .. } = output.as_ref() else {
                panic!("expected an index scan");
            };
            let low = range.low.as_ref().map(|l| (l.columns.len(), l.inclusive));
            assert_eq!(low, Some((1, false)));
            assert!(range.high.is_none());
        }
        Ok(())
    }

    #[test]
    fn test_hash_table_lookup_uses_loader_layout() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t1 = b.table("t", "t1")?;
        let t2 = b.table("t", "t2")?;
        let loader = group_scan(&mut b, vec![t2])?;
        let outer = group_scan(&mut b, vec![t1])?;
        let hash_table = b.graph_mut().allocate_marker();
        let lookup_keys = vec![b.column(t1, "x")?];
        let lookup = b.graph_mut().add(PlanNodeKind::HashTableLookup { hash_table, loader, lookup: lookup_keys });
        let join = b.graph_mut().add(PlanNodeKind::MapJoin { outer, inner: lookup, join_type: JoinType::Inner });
        let keys = vec![b.column(t2, "x")?];
        let using = b.graph_mut().add(PlanNodeKind::UsingHashTable { loader, input: join, hash_table, keys });
        let project = b.project(using, vec![b.column(t2, "z")?]);
        b.result_set(project, &["z"]);
        let plan = assemble(&catalog, b.build()?)?;

        let PhysicalOperator::Project { input, fields } = &plan.operator else {
            panic!("expected a project");
        };
        assert_eq!(untyped(&fields[0]), "Field(7)");
        let PhysicalOperator::UsingHashTable { input, keys, binding, .. } = input.as_ref() else {
            panic!("expected a hash table");
        };
        assert_eq!((keys.len(), *binding), (1, 0));
        let PhysicalOperator::MapJoin { inner, binding, .. } = input.as_ref() else {
            panic!("expected a map join");
        };
        assert_eq!(*binding, 1);
        let PhysicalOperator::HashTableLookup { lookup, binding } = inner.as_ref() else {
            panic!("expected a lookup");
        };
        assert_eq!(*binding, 0);
        assert_eq!(untyped(&lookup[0]), "Bound(1, 1)");
        Ok(())
    }

    #[test]
    fn test_insert_fills_missing_columns_with_null() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let values = b.values(vec![vec![Expression::integer(1), Expression::integer(2)]]);
        b.insert(values, "t", &["id", "x"])?;
        let plan = assemble(&catalog, b.build()?)?;

        let PhysicalOperator::Insert { input, table, row } = &plan.operator else {
            panic!("expected an insert");
        };
        assert_eq!(table, "t");
        assert_eq!(row.iter().map(untyped).collect::<Vec<_>>(), vec!["Field(0)", "Field(1)", "NULL", "NULL"]);
        assert!(matches!(input.as_ref(), PhysicalOperator::Values { rows } if rows.len() == 1));
        assert!(plan.result_columns.is_empty());
        assert_eq!(plan.affected_tables.len(), 1);
        Ok(())
    }

    #[test]
    fn test_invisible_column_is_internal_error() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let t = b.table("t", "t")?;
        let scan = group_scan(&mut b, vec![t])?;
        let project = b.project(scan, vec![b.column(c, "name")?]);
        b.result_set(project, &["name"]);
        let result = assemble(&catalog, b.build()?);
        assert!(matches!(result, Err(QueryError::Internal(message)) if message.contains("not visible")));
        Ok(())
    }

    #[test]
    fn test_logical_join_is_unsupported() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t1 = b.table("t", "t1")?;
        let t2 = b.table("t", "t2")?;
        let join = b.graph_mut().add(PlanNodeKind::Join(JoinNode::new(t1, t2, JoinType::Inner)));
        b.result_set(join, &[]);
        let result = assemble(&catalog, b.build()?);
        assert!(matches!(result, Err(QueryError::UnsupportedSql(_))));
        Ok(())
    }

    #[test]
    fn test_pipelined_map_join_follows_config() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t1 = b.table("t", "t1")?;
        let t2 = b.table("t", "t2")?;
        let outer = group_scan(&mut b, vec![t1])?;
        let inner = group_scan(&mut b, vec![t2])?;
        let join = b.graph_mut().add(PlanNodeKind::MapJoin { outer, inner, join_type: JoinType::Semi });
        b.result_set(join, &[]);
        let config = OptimizerConfig { map_enabled: true, ..OptimizerConfig::default() };
        let plan = assemble_with(&catalog, b.build()?, &config)?;
        assert!(matches!(plan.operator, PhysicalOperator::MapJoin { pipelined: true, join_type: JoinType::Semi, .. }));
        Ok(())
    }
}
