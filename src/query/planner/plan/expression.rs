// Plan Expressions
//
// Scalar and boolean expressions attached to plan nodes. Column references
// point at their source node by id; subquery expressions point at a detached
// `Subquery` node in the same graph.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::NodeId;
use crate::query::executor::result::DataValue;
use crate::query::types::TypeInstance;

/// Reference to one field of a column source
#[derive(Debug, Clone)]
pub struct ColumnExpression {
    pub source: NodeId,
    pub position: usize,
    /// Name for messages; not part of identity
    pub name: String,
}

impl ColumnExpression {
    pub fn new(source: NodeId, position: usize, name: impl Into<String>) -> Self {
        ColumnExpression { source, position, name: name.into() }
    }
}

impl PartialEq for ColumnExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.position == other.position
    }
}

impl Eq for ColumnExpression {}

impl Hash for ColumnExpression {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.position.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOp {
    /// The operator that gives the same result with operands swapped
    pub fn reverse(self) -> Self {
        match self {
            ComparisonOp::Eq => ComparisonOp::Eq,
            ComparisonOp::Ne => ComparisonOp::Ne,
            ComparisonOp::Lt => ComparisonOp::Gt,
            ComparisonOp::Le => ComparisonOp::Ge,
            ComparisonOp::Gt => ComparisonOp::Lt,
            ComparisonOp::Ge => ComparisonOp::Le,
        }
    }

    /// Whether an ordering satisfies this comparison
    pub fn matches(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            ComparisonOp::Eq => ordering == Equal,
            ComparisonOp::Ne => ordering != Equal,
            ComparisonOp::Lt => ordering == Less,
            ComparisonOp::Le => ordering != Greater,
            ComparisonOp::Gt => ordering == Greater,
            ComparisonOp::Ge => ordering != Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            ComparisonOp::Eq => "==",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
        }
    }
}

/// An aggregate function call as it appears before aggregate mapping
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCall {
    pub function: String,
    /// `None` for `COUNT(*)`
    pub operand: Option<Box<Expression>>,
    pub distinct: bool,
}

/// How a condition is enforced once the plan is physical
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionImplementation {
    #[default]
    Normal,
    /// Implied by the hierarchical key of a table group join
    GroupJoin,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionKind {
    Column(ColumnExpression),
    Constant(DataValue),
    Parameter(usize),
    Cast { operand: Box<Expression>, target: TypeInstance },
    Function { name: String, operands: Vec<Expression> },
    Comparison { op: ComparisonOp, left: Box<Expression>, right: Box<Expression> },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    IfElse { test: Box<Expression>, then: Box<Expression>, otherwise: Box<Expression> },
    Aggregate(AggregateCall),
    /// A user routine call
    Routine { name: String, operands: Vec<Expression>, deterministic: bool, called_on_null_input: bool },
    Exists(NodeId),
    /// `ANY` over a subquery whose single projected field is the per-row test
    Any(NodeId),
    /// Scalar subquery
    SubqueryValue(NodeId),
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub kind: ExpressionKind,
    /// Set by type resolution
    pub ty: Option<TypeInstance>,
    /// Original SQL text, for messages
    pub sql: Option<String>,
    pub implementation: ConditionImplementation,
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Expression {
    pub fn new(kind: ExpressionKind) -> Self {
        Expression { kind, ty: None, sql: None, implementation: ConditionImplementation::Normal }
    }

    pub fn column(source: NodeId, position: usize, name: impl Into<String>) -> Self {
        Self::new(ExpressionKind::Column(ColumnExpression::new(source, position, name)))
    }

    pub fn constant(value: DataValue) -> Self {
        Self::new(ExpressionKind::Constant(value))
    }

    pub fn null() -> Self {
        Self::constant(DataValue::Null)
    }

    pub fn boolean(value: bool) -> Self {
        Self::constant(DataValue::Boolean(value)).with_type(TypeInstance::boolean(false))
    }

    pub fn integer(value: i64) -> Self {
        Self::constant(DataValue::Integer(value))
    }

    pub fn text(value: &str) -> Self {
        Self::constant(DataValue::Text(value.to_string()))
    }

    pub fn parameter(position: usize) -> Self {
        Self::new(ExpressionKind::Parameter(position))
    }

    pub fn cast(operand: Expression, target: TypeInstance) -> Self {
        Self::new(ExpressionKind::Cast { operand: Box::new(operand), target })
    }

    pub fn function(name: &str, operands: Vec<Expression>) -> Self {
        Self::new(ExpressionKind::Function { name: name.to_string(), operands })
    }

    pub fn compare(op: ComparisonOp, left: Expression, right: Expression) -> Self {
        Self::new(ExpressionKind::Comparison { op, left: Box::new(left), right: Box::new(right) })
    }

    pub fn equals(left: Expression, right: Expression) -> Self {
        Self::compare(ComparisonOp::Eq, left, right)
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Self::new(ExpressionKind::And(Box::new(left), Box::new(right)))
    }

    pub fn or(left: Expression, right: Expression) -> Self {
        Self::new(ExpressionKind::Or(Box::new(left), Box::new(right)))
    }

    pub fn not(operand: Expression) -> Self {
        Self::new(ExpressionKind::Not(Box::new(operand)))
    }

    pub fn if_else(test: Expression, then: Expression, otherwise: Expression) -> Self {
        Self::new(ExpressionKind::IfElse {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    pub fn aggregate(function: &str, operand: Option<Expression>, distinct: bool) -> Self {
        Self::new(ExpressionKind::Aggregate(AggregateCall {
            function: function.to_uppercase(),
            operand: operand.map(Box::new),
            distinct,
        }))
    }

    pub fn routine(name: &str, operands: Vec<Expression>, deterministic: bool, called_on_null_input: bool) -> Self {
        Self::new(ExpressionKind::Routine {
            name: name.to_string(),
            operands,
            deterministic,
            called_on_null_input,
        })
    }

    pub fn exists(subquery: NodeId) -> Self {
        Self::new(ExpressionKind::Exists(subquery))
    }

    pub fn any(subquery: NodeId) -> Self {
        Self::new(ExpressionKind::Any(subquery))
    }

    pub fn subquery_value(subquery: NodeId) -> Self {
        Self::new(ExpressionKind::SubqueryValue(subquery))
    }

    pub fn with_type(mut self, ty: TypeInstance) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn with_sql(mut self, sql: &str) -> Self {
        self.sql = Some(sql.to_string());
        self
    }

    /// Keep type and SQL text of `self` on a replacement expression
    pub fn replaced_by(&self, kind: ExpressionKind) -> Expression {
        Expression { kind, ty: self.ty.clone(), sql: self.sql.clone(), implementation: self.implementation }
    }

    pub fn as_column(&self) -> Option<&ColumnExpression> {
        match &self.kind {
            ExpressionKind::Column(column) => Some(column),
            _ => None,
        }
    }

    pub fn constant_value(&self) -> Option<&DataValue> {
        match &self.kind {
            ExpressionKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ExpressionKind::Constant(_))
    }

    pub fn is_null_constant(&self) -> bool {
        matches!(self.kind, ExpressionKind::Constant(DataValue::Null))
    }

    pub fn is_true(&self) -> bool {
        matches!(self.kind, ExpressionKind::Constant(DataValue::Boolean(true)))
    }

    pub fn is_false(&self) -> bool {
        matches!(self.kind, ExpressionKind::Constant(DataValue::Boolean(false)))
    }

    /// Constant or parameter: fixed for one execution
    pub fn is_fixed(&self) -> bool {
        matches!(self.kind, ExpressionKind::Constant(_) | ExpressionKind::Parameter(_))
    }

    pub fn is_group_join(&self) -> bool {
        self.implementation == ConditionImplementation::GroupJoin
    }

    /// Whether NULL is a possible value. Untyped expressions are assumed
    /// nullable unless they are non-null constants.
    pub fn is_nullable(&self) -> bool {
        match (&self.kind, &self.ty) {
            (ExpressionKind::Constant(value), _) => value.is_null(),
            (_, Some(ty)) => ty.nullable,
            (_, None) => true,
        }
    }

    pub fn children(&self) -> Vec<&Expression> {
        match &self.kind {
            ExpressionKind::Column(_)
            | ExpressionKind::Constant(_)
            | ExpressionKind::Parameter(_)
            | ExpressionKind::Exists(_)
            | ExpressionKind::Any(_)
            | ExpressionKind::SubqueryValue(_) => Vec::new(),
            ExpressionKind::Cast { operand, .. } | ExpressionKind::Not(operand) => vec![&**operand],
            ExpressionKind::Function { operands, .. } | ExpressionKind::Routine { operands, .. } => {
                operands.iter().collect()
            }
            ExpressionKind::Comparison { left, right, .. }
            | ExpressionKind::And(left, right)
            | ExpressionKind::Or(left, right) => vec![&**left, &**right],
            ExpressionKind::IfElse { test, then, otherwise } => vec![&**test, &**then, &**otherwise],
            ExpressionKind::Aggregate(call) => call.operand.iter().map(|o| o.as_ref()).collect(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Expression> {
        match &mut self.kind {
            ExpressionKind::Column(_)
            | ExpressionKind::Constant(_)
            | ExpressionKind::Parameter(_)
            | ExpressionKind::Exists(_)
            | ExpressionKind::Any(_)
            | ExpressionKind::SubqueryValue(_) => Vec::new(),
            ExpressionKind::Cast { operand, .. } | ExpressionKind::Not(operand) => vec![&mut **operand],
            ExpressionKind::Function { operands, .. } | ExpressionKind::Routine { operands, .. } => {
                operands.iter_mut().collect()
            }
            ExpressionKind::Comparison { left, right, .. }
            | ExpressionKind::And(left, right)
            | ExpressionKind::Or(left, right) => vec![&mut **left, &mut **right],
            ExpressionKind::IfElse { test, then, otherwise } => vec![&mut **test, &mut **then, &mut **otherwise],
            ExpressionKind::Aggregate(call) => call.operand.iter_mut().map(|o| o.as_mut()).collect(),
        }
    }

    /// Pre-order walk over this expression and its children. Subquery plans
    /// are not entered.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expression)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    pub fn any_node(&self, predicate: &dyn Fn(&Expression) -> bool) -> bool {
        if predicate(self) {
            return true;
        }
        self.children().into_iter().any(|child| child.any_node(predicate))
    }

    /// Column references directly in this expression
    pub fn columns(&self) -> Vec<&ColumnExpression> {
        let mut columns = Vec::new();
        self.walk(&mut |e| {
            if let ExpressionKind::Column(column) = &e.kind {
                columns.push(column);
            }
        });
        columns
    }

    /// Sources of the columns directly in this expression
    pub fn column_sources(&self) -> BTreeSet<NodeId> {
        self.columns().into_iter().map(|c| c.source).collect()
    }

    /// Subquery nodes referenced by this expression
    pub fn subqueries(&self) -> Vec<NodeId> {
        let mut subqueries = Vec::new();
        self.walk(&mut |e| match &e.kind {
            ExpressionKind::Exists(id) | ExpressionKind::Any(id) | ExpressionKind::SubqueryValue(id) => {
                subqueries.push(*id)
            }
            _ => {}
        });
        subqueries
    }

    pub fn contains_aggregate(&self) -> bool {
        self.any_node(&|e| matches!(e.kind, ExpressionKind::Aggregate(_)))
    }

    pub fn contains_subquery(&self) -> bool {
        self.any_node(&|e| {
            matches!(e.kind, ExpressionKind::Exists(_) | ExpressionKind::Any(_) | ExpressionKind::SubqueryValue(_))
        })
    }

    /// Split a conjunction into its terms
    pub fn split_and(self) -> Vec<Expression> {
        match self.kind {
            ExpressionKind::And(left, right) => {
                let mut terms = left.split_and();
                terms.extend(right.split_and());
                terms
            }
            _ => vec![self],
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            return write!(f, "{}", sql);
        }
        match &self.kind {
            ExpressionKind::Column(column) => write!(f, "{}", column.name),
            ExpressionKind::Constant(value) => write!(f, "{}", value),
            ExpressionKind::Parameter(position) => write!(f, "${}", position + 1),
            ExpressionKind::Cast { operand, target } => write!(f, "CAST({} AS {})", operand, target),
            ExpressionKind::Function { name, operands } | ExpressionKind::Routine { name, operands, .. } => {
                write!(f, "{}(", name)?;
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", operand)?;
                }
                write!(f, ")")
            }
            ExpressionKind::Comparison { op, left, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            ExpressionKind::And(left, right) => write!(f, "and({}, {})", left, right),
            ExpressionKind::Or(left, right) => write!(f, "or({}, {})", left, right),
            ExpressionKind::Not(operand) => write!(f, "not({})", operand),
            ExpressionKind::IfElse { test, then, otherwise } => {
                write!(f, "IF({}, {}, {})", test, then, otherwise)
            }
            ExpressionKind::Aggregate(call) => match &call.operand {
                Some(operand) if call.distinct => write!(f, "{}(DISTINCT {})", call.function, operand),
                Some(operand) => write!(f, "{}({})", call.function, operand),
                None => write!(f, "{}(*)", call.function),
            },
            ExpressionKind::Exists(id) => write!(f, "EXISTS(subquery {})", id),
            ExpressionKind::Any(id) => write!(f, "ANY(subquery {})", id),
            ExpressionKind::SubqueryValue(id) => write!(f, "VALUE(subquery {})", id),
        }
    }
}
