// Type Resolver
//
// Gives every expression a type, bottom-up: inputs before the nodes that
// consume them, operands before the expressions that use them. Implicit
// casts are inserted where a consumer needs another type, literal row lists
// and set operations are unified column by column, and every use of a
// positional parameter widens its shared type cell.

use log::{debug, warn};

use super::constant_folder::fold_expression;
use crate::query::executor::result::{QueryError, QueryResult};
use crate::query::planner::context::{ParametersSync, PlanContext};
use crate::query::planner::optimizer::Rule;
use crate::query::planner::plan::expression::{ConditionImplementation, Expression, ExpressionKind};
use crate::query::planner::plan::node::PlanNodeKind;
use crate::query::planner::plan::visitor::{rewrite_plan, PlanRewriter};
use crate::query::planner::plan::{NodeId, PlanGraph};
use crate::query::types::registry::TypesRegistry;
use crate::query::types::{TypeClass, TypeInstance};

/// Length given to string columns that hold parameters, so bound values
/// are never truncated
const WIDE_STRING_LENGTH: u32 = i32::MAX as u32;

pub struct TypeResolver;

impl Rule for TypeResolver {
    fn name(&self) -> &'static str {
        "TypeResolver"
    }

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        let root = context.plan.root()?;
        let mut resolver = Resolver { types: context.types, parameters: &mut context.parameters };
        rewrite_plan(&mut context.plan, root, &mut resolver)?;

        let mut inliner = ParameterCastInliner { parameters: &context.parameters };
        rewrite_plan(&mut context.plan, root, &mut inliner)?;
        context.types_resolved = true;
        debug!("Resolved types, {} parameters", context.parameters.len());
        Ok(())
    }
}

/// Types of the fields a node produces, looking through nodes that pass
/// their input's rows along
fn typed_fields(graph: &PlanGraph, node: NodeId) -> Option<Vec<Option<TypeInstance>>> {
    let mut node = node;
    loop {
        match graph.kind(node) {
            PlanNodeKind::Project { fields, .. } => return Some(fields.iter().map(|f| f.ty.clone()).collect()),
            PlanNodeKind::ExpressionsSource { rows, field_types, .. } => {
                return Some(match rows.as_slice() {
                    [row] => row.iter().map(|e| e.ty.clone()).collect(),
                    _ => field_types.clone(),
                });
            }
            PlanNodeKind::AggregateSource { group_by, aggregates, .. } => {
                return Some(group_by.iter().chain(aggregates).map(|e| e.ty.clone()).collect());
            }
            PlanNodeKind::SetOperation { left, .. } => node = *left,
            PlanNodeKind::ResultSet { input, .. }
            | PlanNodeKind::Insert { input, .. }
            | PlanNodeKind::Update { input, .. }
            | PlanNodeKind::Delete { input, .. }
            | PlanNodeKind::Select { input, .. }
            | PlanNodeKind::Sort { input, .. }
            | PlanNodeKind::Limit { input, .. }
            | PlanNodeKind::Distinct { input }
            | PlanNodeKind::Buffer { input }
            | PlanNodeKind::Subquery { input } => node = *input,
            _ => return None,
        }
    }
}

/// Whether rows of `source` may be NULL-extended by an enclosing outer join
fn on_optional_side(graph: &PlanGraph, source: NodeId) -> bool {
    let mut child = source;
    while let Some(parent) = graph.output(child) {
        match graph.kind(parent) {
            PlanNodeKind::Join(join) => {
                if (join.left == child && join.join_type.left_optional())
                    || (join.right == child && join.join_type.right_optional())
                {
                    return true;
                }
            }
            _ => return false,
        }
        child = parent;
    }
    false
}

fn column_type(graph: &PlanGraph, source: NodeId, position: usize) -> Option<TypeInstance> {
    let ty = match graph.kind(source) {
        PlanNodeKind::TableSource(table) => table.table.column_at(position).map(|c| c.data_type().clone()),
        PlanNodeKind::SubquerySource { input, .. } => {
            typed_fields(graph, *input).and_then(|fields| fields.get(position).cloned().flatten())
        }
        PlanNodeKind::Project { .. }
        | PlanNodeKind::AggregateSource { .. }
        | PlanNodeKind::ExpressionsSource { .. } => {
            typed_fields(graph, source).and_then(|fields| fields.get(position).cloned().flatten())
        }
        _ => None,
    }?;
    if on_optional_side(graph, source) {
        Some(ty.with_nullable(true))
    } else {
        Some(ty)
    }
}

/// Whether a value of type `source` can stand where `target` is expected
/// without a cast
fn equal_for_cast(target: &TypeInstance, source: Option<&TypeInstance>) -> bool {
    match source {
        None => false,
        Some(source) if source.class != target.class => false,
        Some(source) if matches!(target.class, TypeClass::Varchar | TypeClass::Varbinary) => {
            source.length == target.length
        }
        Some(source) => source.same_type(target),
    }
}

fn cast_expression(operand: Expression, target: TypeInstance) -> Expression {
    let sql = operand.sql.clone();
    Expression { sql, ..Expression::cast(operand, target.clone()).with_type(target) }
}

struct Resolver<'a, 'p> {
    types: &'a dyn TypesRegistry,
    parameters: &'p mut ParametersSync,
}

impl Resolver<'_, '_> {
    fn resolve(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        match &expression.kind {
            ExpressionKind::Column(column) => match column_type(graph, column.source, column.position) {
                Some(ty) => Ok(expression.with_type(ty)),
                None => Ok(expression),
            },
            ExpressionKind::Constant(value) => {
                if expression.ty.is_some() {
                    return Ok(expression);
                }
                match TypeInstance::for_literal(value) {
                    Some(ty) => Ok(expression.with_type(ty)),
                    None => Ok(expression),
                }
            }
            ExpressionKind::Parameter(position) => {
                let position = *position;
                self.parameters.touch(position);
                match self.parameters.get(position) {
                    Some(ty) => Ok(expression.with_type(ty.clone())),
                    None => Ok(expression),
                }
            }
            ExpressionKind::Cast { .. } => self.resolve_cast(graph, expression),
            ExpressionKind::Function { .. } => self.resolve_function(graph, expression),
            ExpressionKind::Comparison { .. } => self.resolve_comparison(graph, expression),
            ExpressionKind::And(..) | ExpressionKind::Or(..) | ExpressionKind::Not(_) => {
                let nullable = expression.children().iter().any(|c| c.is_nullable());
                Ok(expression.with_type(TypeInstance::boolean(nullable)))
            }
            ExpressionKind::IfElse { .. } => self.resolve_if_else(graph, expression),
            ExpressionKind::Aggregate(call) => {
                let operand = call.operand.as_ref().and_then(|o| o.ty.as_ref());
                let ty = self.types.aggregate_type(&call.function, operand)?;
                Ok(expression.with_type(ty))
            }
            ExpressionKind::Exists(_) | ExpressionKind::Any(_) => {
                Ok(expression.with_type(TypeInstance::boolean(true)))
            }
            ExpressionKind::SubqueryValue(subquery) => {
                let ty = typed_fields(graph, *subquery).and_then(|fields| fields.first().cloned().flatten());
                match ty {
                    Some(ty) => Ok(expression.with_type(ty.with_nullable(true))),
                    None => Ok(expression),
                }
            }
            // Routines carry the return type they were declared with
            ExpressionKind::Routine { .. } => Ok(expression),
        }
    }

    fn resolve_cast(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        let (operand, target) = match expression.kind {
            ExpressionKind::Cast { operand, target } => (*operand, target),
            kind => return Ok(Expression { kind, ..expression }),
        };
        if let ExpressionKind::Parameter(position) = operand.kind {
            let unified = self.parameters.unify(position, &target, self.types)?;
            let operand = operand.with_type(unified);
            return Ok(Expression { sql: expression.sql, ..cast_expression(operand, target.with_nullable(true)) });
        }
        // A NULL needs no cast function, only a type
        if operand.is_null_constant() {
            return Ok(operand.with_type(target.with_nullable(true)));
        }
        if let Some(from) = &operand.ty {
            if self.types.cast_function(from.class, target.class).is_none() {
                return Err(QueryError::NoSuchCast { from: from.to_string(), to: target.to_string() });
            }
        }
        let target = target.with_nullable(operand.is_nullable());
        let cast = Expression {
            kind: ExpressionKind::Cast { operand: Box::new(operand), target: target.clone() },
            ty: Some(target),
            sql: expression.sql,
            implementation: expression.implementation,
        };
        self.finish_cast(graph, cast)
    }

    /// `CAST(VALUES[n] AS T)` becomes `VALUES[n]` with each row's field
    /// `n` cast to `T` instead
    fn finish_cast(&mut self, graph: &mut PlanGraph, cast: Expression) -> QueryResult<Expression> {
        let pushed = match &cast.kind {
            ExpressionKind::Cast { operand, target } => match operand.as_column() {
                Some(column) if matches!(graph.kind(column.source), PlanNodeKind::ExpressionsSource { .. }) => {
                    Some((column.source, column.position, target.clone()))
                }
                _ => None,
            },
            _ => None,
        };
        let Some((source, position, target)) = pushed else {
            return Ok(cast);
        };

        let mut rows = match graph.kind_mut(source) {
            PlanNodeKind::ExpressionsSource { rows, .. } => std::mem::take(rows),
            _ => Vec::new(),
        };
        for row in rows.iter_mut() {
            if let Some(cell) = row.get_mut(position) {
                let value = std::mem::replace(cell, Expression::null());
                *cell = self.cast_to(graph, value, &target)?;
            }
        }
        if let PlanNodeKind::ExpressionsSource { rows: slot, field_types, .. } = graph.kind_mut(source) {
            *slot = rows;
            if let Some(field_type) = field_types.get_mut(position) {
                *field_type = Some(target.clone());
            }
        }
        match cast.kind {
            ExpressionKind::Cast { operand, .. } => Ok(operand.with_type(target)),
            kind => Ok(Expression { kind, ..cast }),
        }
    }

    /// `expression` as a value of type `target`, cast if it isn't one
    /// already. Parameters take the type; NULLs are typed in place.
    fn cast_to(&mut self, graph: &mut PlanGraph, expression: Expression, target: &TypeInstance) -> QueryResult<Expression> {
        if let ExpressionKind::Parameter(position) = expression.kind {
            let target = target.with_nullable(true);
            let unified = self.parameters.unify(position, &target, self.types)?;
            return Ok(cast_expression(expression.with_type(unified), target));
        }
        if expression.is_null_constant() {
            return Ok(expression.with_type(target.with_nullable(true)));
        }
        if equal_for_cast(target, expression.ty.as_ref()) {
            return Ok(expression);
        }
        if let Some(from) = &expression.ty {
            if self.types.cast_function(from.class, target.class).is_none() {
                return Err(QueryError::NoSuchCast { from: from.to_string(), to: target.to_string() });
            }
        }
        let target = target.with_nullable(expression.is_nullable());
        let cast = self.finish_cast(graph, cast_expression(expression, target))?;
        fold_expression(graph, self.types, cast)
    }

    fn resolve_function(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        let (name, operands) = match expression.kind {
            ExpressionKind::Function { name, operands } => (name, operands),
            kind => return Ok(Expression { kind, ..expression }),
        };
        let operand_types: Vec<Option<TypeInstance>> = operands.iter().map(|o| o.ty.clone()).collect();
        let resolved = self.types.resolve_overload(&name, &operand_types)?;
        let mut cast_operands = Vec::with_capacity(operands.len());
        for (operand, cast) in operands.into_iter().zip(resolved.operand_casts) {
            cast_operands.push(match cast {
                Some(target) => self.cast_to(graph, operand, &target)?,
                None => operand,
            });
        }
        Ok(Expression {
            kind: ExpressionKind::Function { name: resolved.name, operands: cast_operands },
            ty: Some(resolved.result_type),
            sql: expression.sql,
            implementation: expression.implementation,
        })
    }

    fn resolve_comparison(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        let (op, left, right) = match expression.kind {
            ExpressionKind::Comparison { op, left, right } => (op, *left, *right),
            kind => return Ok(Expression { kind, ..expression }),
        };
        let nullable = left.is_nullable() || right.is_nullable();
        let comparable = match (&left.ty, &right.ty) {
            (Some(l), Some(r)) => l.class == r.class || self.types.key_comparable(l.class, r.class),
            _ => false,
        };

        let (left, right) = if comparable {
            (left, right)
        } else if let Some(constant) = self.constant_for_column(&left, &right) {
            (left, constant)
        } else if let Some(constant) = self.constant_for_column(&right, &left) {
            (constant, right)
        } else {
            let common = match (&left.ty, &right.ty) {
                (Some(l), Some(r)) => self.types.common_type(l, r)?,
                (Some(t), None) | (None, Some(t)) => t.clone(),
                (None, None) => TypeInstance::varchar(WIDE_STRING_LENGTH, true),
            };
            let left = self.cast_to(graph, left, &common)?;
            let right = self.cast_to(graph, right, &common)?;
            (left, right)
        };
        Ok(Expression {
            kind: ExpressionKind::Comparison { op, left: Box::new(left), right: Box::new(right) },
            ty: Some(TypeInstance::boolean(nullable)),
            sql: expression.sql,
            implementation: expression.implementation,
        })
    }

    /// `constant` converted to the type of `column`, so the column can
    /// still serve an index lookup. Only when the value survives the cast
    /// there and back unchanged.
    fn constant_for_column(&self, column: &Expression, constant: &Expression) -> Option<Expression> {
        column.as_column()?;
        let value = constant.constant_value().filter(|v| !v.is_null())?;
        let (column_type, constant_type) = (column.ty.as_ref()?, constant.ty.as_ref()?);
        self.types.cast_function(constant_type.class, column_type.class)?;
        self.types.cast_function(column_type.class, constant_type.class)?;
        let as_column = self.types.evaluate_cast(value, column_type).ok()?;
        let back = self.types.evaluate_cast(&as_column, constant_type).ok()?;
        if back != *value {
            return None;
        }
        Some(Expression {
            kind: ExpressionKind::Constant(as_column),
            ty: Some(column_type.with_nullable(false)),
            sql: constant.sql.clone(),
            implementation: ConditionImplementation::Normal,
        })
    }

    fn resolve_if_else(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        let (test, then, otherwise) = match expression.kind {
            ExpressionKind::IfElse { test, then, otherwise } => (*test, *then, *otherwise),
            kind => return Ok(Expression { kind, ..expression }),
        };
        let test = match test.kind {
            ExpressionKind::Parameter(_) => self.cast_to(graph, test, &TypeInstance::boolean(true))?,
            _ => test,
        };
        let common = match (&then.ty, &otherwise.ty) {
            (Some(a), Some(b)) => self.types.common_type(a, b)?.with_nullable(a.nullable || b.nullable),
            (Some(t), None) | (None, Some(t)) => t.with_nullable(true),
            (None, None) => return Ok(Expression::null()),
        };
        let then = self.cast_to(graph, then, &common)?;
        let otherwise = self.cast_to(graph, otherwise, &common)?;
        Ok(Expression {
            kind: ExpressionKind::IfElse { test: Box::new(test), then: Box::new(then), otherwise: Box::new(otherwise) },
            ty: Some(common),
            sql: expression.sql,
            implementation: expression.implementation,
        })
    }

    /// Unify a literal row list column by column, casting the cells that
    /// are not of their column's common type
    fn unify_rows(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<()> {
        let PlanNodeKind::ExpressionsSource { rows, .. } = graph.kind(node) else {
            return Ok(());
        };
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut instances: Vec<Option<TypeInstance>> = vec![None; width];
        let mut need_casts = vec![false; width];
        let mut widened = vec![false; width];
        for (index, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(QueryError::Internal(format!(
                    "row {} of {} has {} fields, expected {}",
                    index,
                    node,
                    row.len(),
                    width
                )));
            }
            for (field, cell) in row.iter().enumerate() {
                let Some(bottom) = &cell.ty else {
                    // Parameters and NULLs take whatever the column becomes
                    need_casts[field] = true;
                    if matches!(cell.kind, ExpressionKind::Parameter(_)) {
                        widened[field] = true;
                    }
                    continue;
                };
                instances[field] = Some(match &instances[field] {
                    None => bottom.clone(),
                    Some(top) if top.same_type(bottom) => top.with_nullable(top.nullable || bottom.nullable),
                    Some(top) => {
                        need_casts[field] = true;
                        self.types.common_type(top, bottom)?.with_nullable(top.nullable || bottom.nullable)
                    }
                });
            }
        }
        for (instance, widened) in instances.iter_mut().zip(&widened) {
            if let Some(instance) = instance.as_mut().filter(|_| *widened) {
                if matches!(instance.class, TypeClass::Varchar | TypeClass::Varbinary) {
                    instance.length = Some(WIDE_STRING_LENGTH);
                }
            }
        }

        let mut rows = match graph.kind_mut(node) {
            PlanNodeKind::ExpressionsSource { rows, .. } => std::mem::take(rows),
            _ => Vec::new(),
        };
        for row in rows.iter_mut() {
            for (field, cell) in row.iter_mut().enumerate() {
                if let (true, Some(target)) = (need_casts[field], &instances[field]) {
                    let value = std::mem::replace(cell, Expression::null());
                    *cell = self.cast_to(graph, value, target)?;
                }
            }
        }
        if let PlanNodeKind::ExpressionsSource { rows: slot, field_types, .. } = graph.kind_mut(node) {
            *slot = rows;
            *field_types = instances;
        }
        Ok(())
    }

    /// Give both branches of a set operation the common type of each column
    fn unify_set_operation(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<()> {
        let PlanNodeKind::SetOperation { left, right, .. } = graph.kind(node) else {
            return Ok(());
        };
        let (left, right) = (*left, *right);
        let left_projects = branch_projects(graph, left);
        let right_projects = branch_projects(graph, right);
        let (Some(left_types), Some(right_types)) = (typed_fields(graph, left), typed_fields(graph, right)) else {
            return Ok(());
        };
        if left_projects.is_empty() || right_projects.is_empty() {
            return Ok(());
        }
        if left_types.len() != right_types.len() {
            return Err(QueryError::UnsupportedSql(format!(
                "set operation branches have {} and {} columns",
                left_types.len(),
                right_types.len()
            )));
        }
        let mut common = Vec::with_capacity(left_types.len());
        for (l, r) in left_types.iter().zip(&right_types) {
            common.push(match (l, r) {
                (Some(l), Some(r)) => self.types.common_type(l, r)?.with_nullable(l.nullable || r.nullable),
                (Some(t), None) | (None, Some(t)) => t.with_nullable(true),
                (None, None) => TypeInstance::varchar(WIDE_STRING_LENGTH, true),
            });
        }
        for project in left_projects.into_iter().chain(right_projects) {
            let fields = graph.take_expressions(project);
            let mut cast_fields = Vec::with_capacity(fields.len());
            for (field, target) in fields.into_iter().zip(&common) {
                cast_fields.push(self.cast_to(graph, field, target)?);
            }
            graph.restore_expressions(project, cast_fields)?;
        }
        Ok(())
    }

    fn update_result_fields(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<()> {
        let PlanNodeKind::ResultSet { input, fields } = graph.kind(node) else {
            return Ok(());
        };
        let Some(types) = typed_fields(graph, *input) else {
            warn!("No typed input found for result fields of {}", graph.summary(node));
            return Ok(());
        };
        if types.len() != fields.len() {
            return Err(QueryError::Internal(format!(
                "{} result fields over {} typed fields at {}",
                fields.len(),
                types.len(),
                node
            )));
        }
        if let PlanNodeKind::ResultSet { fields, .. } = graph.kind_mut(node) {
            for (field, ty) in fields.iter_mut().zip(types) {
                field.ty = ty;
            }
        }
        Ok(())
    }

    /// Cast the rows an INSERT writes to the types of the target columns
    fn cast_insert(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<()> {
        let PlanNodeKind::Insert { input, table, target_columns } = graph.kind(node) else {
            return Ok(());
        };
        let targets: Vec<Option<TypeInstance>> =
            target_columns.iter().map(|c| table.column_at(*c).map(|c| c.data_type().clone())).collect();
        let mut source = *input;
        loop {
            match graph.kind(source) {
                PlanNodeKind::Project { .. } | PlanNodeKind::ExpressionsSource { .. } => break,
                PlanNodeKind::Select { input, .. }
                | PlanNodeKind::Sort { input, .. }
                | PlanNodeKind::Limit { input, .. }
                | PlanNodeKind::Distinct { input }
                | PlanNodeKind::Buffer { input } => source = *input,
                _ => return Ok(()),
            }
        }

        let width = match graph.kind(source) {
            PlanNodeKind::ExpressionsSource { rows, .. } => rows.first().map(|r| r.len()).unwrap_or(0),
            _ => 0,
        };
        let expressions = graph.take_expressions(source);
        let mut cast = Vec::with_capacity(expressions.len());
        for (index, expression) in expressions.into_iter().enumerate() {
            let column = if width > 0 { index % width } else { index };
            cast.push(match targets.get(column) {
                Some(Some(target)) => self.cast_to(graph, expression, target)?,
                _ => expression,
            });
        }
        graph.restore_expressions(source, cast)?;
        if let PlanNodeKind::ExpressionsSource { field_types, .. } = graph.kind_mut(source) {
            for (field_type, target) in field_types.iter_mut().zip(&targets) {
                if target.is_some() {
                    *field_type = target.clone();
                }
            }
        }
        Ok(())
    }

    /// Cast the new values of an UPDATE to the types of their columns
    fn cast_update(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<()> {
        let PlanNodeKind::Update { table, update_columns, .. } = graph.kind(node) else {
            return Ok(());
        };
        let targets: Vec<Option<TypeInstance>> =
            update_columns.iter().map(|u| table.column_at(u.column).map(|c| c.data_type().clone())).collect();
        let expressions = graph.take_expressions(node);
        let mut cast = Vec::with_capacity(expressions.len());
        for (expression, target) in expressions.into_iter().zip(&targets) {
            cast.push(match target {
                Some(target) => self.cast_to(graph, expression, target)?,
                None => expression,
            });
        }
        graph.restore_expressions(node, cast)
    }
}

/// The projections producing the rows of one set operation branch
fn branch_projects(graph: &PlanGraph, node: NodeId) -> Vec<NodeId> {
    match graph.kind(node) {
        PlanNodeKind::Project { .. } => vec![node],
        PlanNodeKind::SetOperation { left, right, .. } => {
            let mut projects = branch_projects(graph, *left);
            projects.extend(branch_projects(graph, *right));
            projects
        }
        PlanNodeKind::ResultSet { input, .. }
        | PlanNodeKind::Select { input, .. }
        | PlanNodeKind::Sort { input, .. }
        | PlanNodeKind::Limit { input, .. }
        | PlanNodeKind::Distinct { input }
        | PlanNodeKind::Subquery { input } => branch_projects(graph, *input),
        _ => Vec::new(),
    }
}

impl PlanRewriter for Resolver<'_, '_> {
    fn leave(&mut self, graph: &mut PlanGraph, node: NodeId) -> QueryResult<()> {
        match graph.kind(node) {
            PlanNodeKind::ExpressionsSource { .. } => self.unify_rows(graph, node),
            PlanNodeKind::SetOperation { .. } => self.unify_set_operation(graph, node),
            PlanNodeKind::ResultSet { .. } => self.update_result_fields(graph, node),
            PlanNodeKind::Insert { .. } => self.cast_insert(graph, node),
            PlanNodeKind::Update { .. } => self.cast_update(graph, node),
            _ => Ok(()),
        }
    }

    fn rewrite(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        let resolved = self.resolve(graph, expression)?;
        fold_expression(graph, self.types, resolved)
    }
}

/// Give every parameter its final type and drop casts of a parameter to
/// the type it already has
struct ParameterCastInliner<'a> {
    parameters: &'a ParametersSync,
}

impl PlanRewriter for ParameterCastInliner<'_> {
    fn rewrite(&mut self, _graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
        match expression.kind {
            ExpressionKind::Parameter(position) => match self.parameters.get(position) {
                Some(ty) => Ok(expression.with_type(ty.clone())),
                None => Ok(expression),
            },
            ExpressionKind::Cast { operand, target }
                if matches!(operand.kind, ExpressionKind::Parameter(_))
                    && operand.ty.as_ref().is_some_and(|t| t.same_type(&target)) =>
            {
                Ok(*operand)
            }
            kind => Ok(Expression { kind, ..expression }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::common::config::OptimizerConfig;
    use crate::query::executor::result::DataValue;
    use crate::query::planner::cost_model::DefaultCostEstimator;
    use crate::query::planner::optimizer::Optimizer;
    use crate::query::planner::plan::{ComparisonOp, JoinType, PlanBuilder};
    use crate::query::planner::rules::fixtures::{apply_rules, coi_catalog};
    use crate::query::planner::rules::AggregateMapper;
    use crate::query::types::registry::StandardTypesRegistry;

    /// Resolve `graph`, returning it with the parameter types
    fn resolve(catalog: &Catalog, graph: PlanGraph) -> QueryResult<(PlanGraph, Vec<Option<TypeInstance>>)> {
        let types = StandardTypesRegistry::new();
        let costs = DefaultCostEstimator::new();
        let config = OptimizerConfig::default();
        let mut context = PlanContext::new(graph, catalog, &types, &config, &costs);
        Optimizer::with_rules(vec![Box::new(TypeResolver)]).optimize(&mut context)?;
        assert!(context.types_resolved);
        let parameters = context.parameters.sql_types();
        Ok((context.plan, parameters))
    }

    fn fields(graph: &PlanGraph, project: NodeId) -> Vec<Expression> {
        match graph.kind(project) {
            PlanNodeKind::Project { fields, .. } => fields.clone(),
            other => panic!("expected Project, got {}", other.name()),
        }
    }

    fn conditions(graph: &PlanGraph, select: NodeId) -> Vec<Expression> {
        match graph.kind(select) {
            PlanNodeKind::Select { conditions, .. } => conditions.clone(),
            other => panic!("expected Select, got {}", other.name()),
        }
    }

    fn comparison_sides(condition: &Expression) -> (&Expression, &Expression) {
        match &condition.kind {
            ExpressionKind::Comparison { left, right, .. } => (left, right),
            _ => panic!("expected comparison, got {}", condition),
        }
    }

    fn result_types(graph: &PlanGraph) -> Vec<Option<TypeInstance>> {
        match graph.kind(graph.root().expect("root")) {
            PlanNodeKind::ResultSet { fields, .. } => fields.iter().map(|f| f.ty.clone()).collect(),
            other => panic!("expected ResultSet, got {}", other.name()),
        }
    }

    #[test]
    fn test_values_unified_per_column() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let values = b.values(vec![
            vec![Expression::integer(1), Expression::text("a")],
            vec![Expression::constant(DataValue::Float(2.5)), Expression::text("bb")],
        ]);
        let (c0, c1) = (b.field(values, 0, "c0"), b.field(values, 1, "c1"));
        let project = b.project(values, vec![c0, c1]);
        b.result_set(project, &["c0", "c1"]);
        let (graph, _) = resolve(&catalog, b.build()?)?;

        match graph.kind(values) {
            PlanNodeKind::ExpressionsSource { rows, field_types, .. } => {
                let numeric = field_types[0].as_ref().expect("numeric column type");
                assert_eq!(numeric.class, TypeClass::Decimal);
                let text = field_types[1].as_ref().expect("text column type");
                assert_eq!((text.class, text.length), (TypeClass::Varchar, Some(2)));
                assert_eq!(rows[0][0].constant_value(), Some(&DataValue::Float(1.0)));
                assert_eq!(rows[0][0].ty.as_ref().map(|t| t.class), Some(TypeClass::Decimal));
                assert_eq!(rows[0][1].ty.as_ref().and_then(|t| t.length), Some(2));
            }
            other => panic!("expected ExpressionsSource, got {}", other.name()),
        }
        let result = result_types(&graph);
        assert_eq!(result[0].as_ref().map(|t| t.class), Some(TypeClass::Decimal));
        Ok(())
    }

    #[test]
    fn test_constant_takes_column_type_when_lossless() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t = b.table("t", "t")?;
        let (x, z) = (b.column(t, "x")?, b.column(t, "z")?);
        let select = b.select(
            t,
            vec![
                Expression::equals(z.clone(), Expression::integer(5)),
                Expression::equals(x.clone(), Expression::constant(DataValue::Float(2.5))),
            ],
        );
        let project = b.project(select, vec![x]);
        b.result_set(project, &["x"]);
        let (graph, _) = resolve(&catalog, b.build()?)?;

        let conditions = conditions(&graph, select);
        let (left, right) = comparison_sides(&conditions[0]);
        assert_eq!(left, &z);
        assert_eq!(right.constant_value(), Some(&DataValue::Text("5".to_string())));

        // 2.5 does not survive a trip through INTEGER, so the column is cast
        let (left, right) = comparison_sides(&conditions[1]);
        assert!(matches!(left.kind, ExpressionKind::Cast { .. }));
        assert_eq!(right.ty.as_ref().map(|t| t.class), Some(TypeClass::Decimal));
        Ok(())
    }

    #[test]
    fn test_parameters_unify_across_uses() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t = b.table("t", "t")?;
        let (x, y) = (b.column(t, "x")?, b.column(t, "y")?);
        let select = b.select(t, vec![Expression::equals(x, Expression::parameter(0))]);
        let project = b.project(
            select,
            vec![
                Expression::function("plus", vec![Expression::parameter(1), y]),
                Expression::cast(Expression::parameter(0), TypeInstance::integer(true)),
            ],
        );
        b.result_set(project, &["sum", "p"]);
        let (graph, parameters) = resolve(&catalog, b.build()?)?;

        assert_eq!(parameters.len(), 2);
        for parameter in &parameters {
            let ty = parameter.as_ref().expect("parameter type");
            assert_eq!(ty.class, TypeClass::Integer);
            assert!(ty.nullable);
        }
        let conditions = conditions(&graph, select);
        let (_, right) = comparison_sides(&conditions[0]);
        assert!(matches!(right.kind, ExpressionKind::Parameter(0)));
        let fields = fields(&graph, project);
        match &fields[0].kind {
            ExpressionKind::Function { operands, .. } => {
                assert!(matches!(operands[0].kind, ExpressionKind::Parameter(1)));
            }
            _ => panic!("expected function, got {}", fields[0]),
        }
        // CAST($1 AS INTEGER) is redundant once $1 is an INTEGER
        assert!(matches!(fields[1].kind, ExpressionKind::Parameter(0)));
        Ok(())
    }

    #[test]
    fn test_outer_join_makes_columns_nullable() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let o = b.table("orders", "o")?;
        let (ccid, ocid, oid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
        let join = b.join(c, o, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
        let project = b.project(join, vec![oid, ccid]);
        b.result_set(project, &["oid", "cid"]);
        let (graph, _) = resolve(&catalog, b.build()?)?;

        let fields = fields(&graph, project);
        assert_eq!(fields[0].ty.as_ref().map(|t| t.nullable), Some(true));
        assert_eq!(fields[1].ty.as_ref().map(|t| t.nullable), Some(false));
        Ok(())
    }

    #[test]
    fn test_aggregate_output_types() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t = b.table("t", "t")?;
        let x = b.column(t, "x")?;
        let agg = b.aggregate(t, vec![]);
        let project = b.project(
            agg,
            vec![Expression::aggregate("COUNT", None, false), Expression::aggregate("MAX", Some(x), false)],
        );
        b.result_set(project, &["c", "m"]);
        let graph =
            apply_rules(&catalog, b.build()?, vec![Box::new(AggregateMapper), Box::new(TypeResolver)])?;

        let result = result_types(&graph);
        assert_eq!(result[0], Some(TypeInstance::big_int(false)));
        let max = result[1].as_ref().expect("MAX type");
        assert_eq!(max.class, TypeClass::Integer);
        assert!(max.nullable);
        Ok(())
    }

    #[test]
    fn test_missing_cast_is_rejected() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let o = b.table("orders", "o")?;
        let odate = b.column(o, "odate")?;
        let project = b.project(o, vec![Expression::cast(odate, TypeInstance::boolean(true))]);
        b.result_set(project, &["b"]);
        let result = resolve(&catalog, b.build()?);
        assert!(matches!(result, Err(QueryError::NoSuchCast { .. })));
        Ok(())
    }

    #[test]
    fn test_unknown_function_is_rejected() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t = b.table("t", "t")?;
        let x = b.column(t, "x")?;
        let project = b.project(t, vec![Expression::function("frobnicate", vec![x])]);
        b.result_set(project, &["f"]);
        let result = resolve(&catalog, b.build()?);
        assert!(matches!(result, Err(QueryError::NoSuchFunction { .. })));
        Ok(())
    }

    #[test]
    fn test_insert_values_cast_to_columns() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let values = b.values(vec![vec![Expression::integer(1), Expression::integer(2)]]);
        b.insert(values, "t", &["x", "z"])?;
        let (graph, _) = resolve(&catalog, b.build()?)?;

        match graph.kind(values) {
            PlanNodeKind::ExpressionsSource { rows, field_types, .. } => {
                assert_eq!(rows[0][0].constant_value(), Some(&DataValue::Integer(1)));
                assert_eq!(rows[0][1].constant_value(), Some(&DataValue::Text("2".to_string())));
                assert_eq!(field_types[1].as_ref().map(|t| t.class), Some(TypeClass::Varchar));
            }
            other => panic!("expected ExpressionsSource, got {}", other.name()),
        }
        Ok(())
    }

    #[test]
    fn test_union_branches_share_column_types() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t = b.table("t", "t")?;
        let x = b.column(t, "x")?;
        let left = b.project(t, vec![x]);
        let one_row = b.values(vec![vec![]]);
        let right = b.project(one_row, vec![Expression::constant(DataValue::Float(2.5))]);
        let union = b.union(left, right, true);
        b.result_set(union, &["v"]);
        let (graph, _) = resolve(&catalog, b.build()?)?;

        assert!(matches!(fields(&graph, left)[0].kind, ExpressionKind::Cast { .. }));
        let right_field = &fields(&graph, right)[0];
        assert_eq!(right_field.constant_value(), Some(&DataValue::Float(2.5)));
        let left_type = fields(&graph, left)[0].ty.clone();
        assert_eq!(left_type.as_ref().map(|t| t.class), Some(TypeClass::Decimal));
        assert!(left_type.as_ref().is_some_and(|t| t.same_type(right_field.ty.as_ref().expect("typed"))));
        assert_eq!(result_types(&graph)[0].as_ref().map(|t| t.class), Some(TypeClass::Decimal));
        Ok(())
    }

    #[test]
    fn test_comparison_with_null_folds_to_unknown() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t = b.table("t", "t")?;
        let y = b.column(t, "y")?;
        let project = b.project(t, vec![Expression::compare(ComparisonOp::Lt, y, Expression::null())]);
        b.result_set(project, &["u"]);
        let (graph, _) = resolve(&catalog, b.build()?)?;

        let fields = fields(&graph, project);
        assert!(fields[0].is_null_constant());
        assert_eq!(fields[0].ty, Some(TypeInstance::boolean(true)));
        Ok(())
    }
}
