// Physical Operators Module
//
// The execution engine builds its operators through `OperatorFactory`. The
// operator assembler only ever talks to this trait, so any engine can sit
// behind it. `PlanOperatorFactory` builds the descriptive `PhysicalOperator`
// tree instead of executable operators.

mod physical;

use std::fmt;
use std::sync::Arc;

use crate::catalog::Index;
use crate::common::types::{GroupId, TableId};
use crate::query::executor::result::DataValue;
use crate::query::planner::plan::node::{JoinType, SetOperationType};
use crate::query::planner::plan::ComparisonOp;
use crate::query::types::TypeInstance;

pub use self::physical::{PhysicalOperator, PlanOperatorFactory};

/// Slot in the bindings an executing plan keeps for correlated rows and
/// loaded bloom filters or hash tables
pub type BindingPosition = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubqueryKind {
    Exists,
    /// True when the subquery's single field is true for any row
    Any,
    /// Value of the single field of the single row
    Value,
}

/// An expression evaluated against the row of the stream it belongs to and
/// the rows bound by enclosing nested loops
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalExpression<O> {
    /// A field of the current row
    Field { position: usize, ty: Option<TypeInstance> },
    /// A field of a row bound by an enclosing loop
    BoundField { binding: BindingPosition, position: usize, ty: Option<TypeInstance> },
    Literal(DataValue),
    Parameter { position: usize, ty: Option<TypeInstance> },
    Cast { operand: Box<PhysicalExpression<O>>, target: TypeInstance },
    Function { name: String, operands: Vec<PhysicalExpression<O>>, ty: Option<TypeInstance> },
    Comparison { op: ComparisonOp, left: Box<PhysicalExpression<O>>, right: Box<PhysicalExpression<O>> },
    And(Box<PhysicalExpression<O>>, Box<PhysicalExpression<O>>),
    Or(Box<PhysicalExpression<O>>, Box<PhysicalExpression<O>>),
    Not(Box<PhysicalExpression<O>>),
    IfElse {
        test: Box<PhysicalExpression<O>>,
        then: Box<PhysicalExpression<O>>,
        otherwise: Box<PhysicalExpression<O>>,
    },
    Routine { name: String, operands: Vec<PhysicalExpression<O>>, ty: Option<TypeInstance> },
    /// A nested plan run with the current row bound at `binding`
    Subquery { kind: SubqueryKind, operator: Box<O>, binding: BindingPosition },
}

impl<O> fmt::Display for PhysicalExpression<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalExpression::Field { position, .. } => write!(f, "Field({})", position),
            PhysicalExpression::BoundField { binding, position, .. } => {
                write!(f, "Bound({}, {})", binding, position)
            }
            PhysicalExpression::Literal(value) => write!(f, "{}", value.to_sql_literal_for_error()),
            PhysicalExpression::Parameter { position, .. } => write!(f, "${}", position + 1),
            PhysicalExpression::Cast { operand, target } => write!(f, "CAST({} AS {})", operand, target),
            PhysicalExpression::Function { name, operands, .. }
            | PhysicalExpression::Routine { name, operands, .. } => {
                write!(f, "{}(", name)?;
                write_list(f, operands)?;
                write!(f, ")")
            }
            PhysicalExpression::Comparison { op, left, right } => {
                let symbol = match op {
                    ComparisonOp::Eq => "==",
                    ComparisonOp::Ne => "!=",
                    ComparisonOp::Lt => "<",
                    ComparisonOp::Le => "<=",
                    ComparisonOp::Gt => ">",
                    ComparisonOp::Ge => ">=",
                };
                write!(f, "{} {} {}", left, symbol, right)
            }
            PhysicalExpression::And(left, right) => write!(f, "{} AND {}", left, right),
            PhysicalExpression::Or(left, right) => write!(f, "({} OR {})", left, right),
            PhysicalExpression::Not(operand) => write!(f, "NOT {}", operand),
            PhysicalExpression::IfElse { test, then, otherwise } => {
                write!(f, "IF({}, {}, {})", test, then, otherwise)
            }
            PhysicalExpression::Subquery { kind, binding, .. } => {
                let name = match kind {
                    SubqueryKind::Exists => "EXISTS",
                    SubqueryKind::Any => "ANY",
                    SubqueryKind::Value => "VALUE",
                };
                write!(f, "{}(Subquery@{})", name, binding)
            }
        }
    }
}

fn write_list<O>(f: &mut fmt::Formatter<'_>, operands: &[PhysicalExpression<O>]) -> fmt::Result {
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", operand)?;
    }
    Ok(())
}

/// One end of an index key range: the values of a key prefix
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBound<O> {
    pub columns: Vec<PhysicalExpression<O>>,
    pub inclusive: bool,
}

/// Key range an index scan visits. No bounds scans the whole index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKeyRange<O> {
    pub low: Option<IndexBound<O>>,
    pub high: Option<IndexBound<O>>,
    /// The bounds are the corners of a box over a spatial key
    pub spatial: bool,
}

impl<O> IndexKeyRange<O> {
    pub fn unbounded() -> Self {
        IndexKeyRange { low: None, high: None, spatial: false }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey<O> {
    pub expression: PhysicalExpression<O>,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec<O> {
    pub function: String,
    /// `None` for `COUNT(*)`
    pub operand: Option<PhysicalExpression<O>>,
    pub distinct: bool,
    pub ty: Option<TypeInstance>,
}

/// Makes physical operators. Row shapes are described on each constructor:
/// "index row" is the key columns of an index, "table rows" is a stream
/// mixing rows of several tables of one group, and "flattened row" is one
/// row holding the fields of several tables side by side.
pub trait OperatorFactory {
    type Operator;

    /// Produces index rows within `range`
    fn index_scan(&self, index: &Arc<Index>, range: IndexKeyRange<Self::Operator>, ascending: bool) -> Self::Operator;

    /// Index rows of `output` whose first `comparison_fields` key fields
    /// match a row of `selector`. Produces `output`'s rows.
    fn intersect(
        &self,
        output: Self::Operator,
        selector: Self::Operator,
        comparison_fields: usize,
        skip_scan: bool,
    ) -> Self::Operator;

    /// Produces table rows of `tables`, in hierarchical order
    fn group_scan(&self, group: GroupId, tables: Vec<TableId>) -> Self::Operator;

    /// Produces rows of `table` matching a text query
    fn full_text_scan(
        &self,
        index: &Arc<Index>,
        query: PhysicalExpression<Self::Operator>,
        limit: Option<usize>,
    ) -> Self::Operator;

    /// Takes index or table rows, or with no input the row bound at
    /// `binding`, and adds the rows of the ancestors of `descendant`
    fn ancestor_lookup(
        &self,
        input: Option<Self::Operator>,
        descendant: TableId,
        ancestors: Vec<TableId>,
        binding: Option<BindingPosition>,
        keep_input: bool,
        lookahead: u32,
    ) -> Self::Operator;

    /// Takes index or table rows, or with no input the row bound at
    /// `binding`, and adds the rows of the branch of `source`'s key
    /// rooted at `branch`
    #[allow(clippy::too_many_arguments)]
    fn branch_lookup(
        &self,
        input: Option<Self::Operator>,
        source: TableId,
        branch: TableId,
        tables: Vec<TableId>,
        binding: Option<BindingPosition>,
        keep_input: bool,
        lookahead: u32,
    ) -> Self::Operator;

    /// Takes table rows and produces flattened rows of `tables`, joined
    /// pairwise with `join_types`
    fn flatten(&self, input: Self::Operator, tables: Vec<TableId>, join_types: Vec<JoinType>) -> Self::Operator;

    /// Runs each of `branches` with the current row of `first` bound at
    /// `binding` and produces their rows side by side
    fn product(
        &self,
        first: Self::Operator,
        branches: Vec<Self::Operator>,
        ancestor: Option<TableId>,
        binding: BindingPosition,
    ) -> Self::Operator;

    /// Rows of `input` for which `condition` is true
    fn select(&self, input: Self::Operator, condition: PhysicalExpression<Self::Operator>) -> Self::Operator;

    /// One row of `fields` per input row
    fn project(&self, input: Self::Operator, fields: Vec<PhysicalExpression<Self::Operator>>) -> Self::Operator;

    /// Produces rows of the grouping keys followed by the aggregate results
    fn aggregate(
        &self,
        input: Self::Operator,
        group_by: Vec<PhysicalExpression<Self::Operator>>,
        aggregates: Vec<AggregateSpec<Self::Operator>>,
    ) -> Self::Operator;

    fn distinct(&self, input: Self::Operator) -> Self::Operator;

    fn sort(&self, input: Self::Operator, keys: Vec<SortKey<Self::Operator>>) -> Self::Operator;

    fn limit(&self, input: Self::Operator, offset: usize, limit: Option<usize>) -> Self::Operator;

    /// Literal rows
    fn values(&self, rows: Vec<Vec<PhysicalExpression<Self::Operator>>>) -> Self::Operator;

    /// Runs `inner` once per `outer` row with the outer row bound at
    /// `binding`. Inner and LEFT joins produce both rows side by side;
    /// semi and anti joins produce the outer row.
    fn map_join(
        &self,
        outer: Self::Operator,
        inner: Self::Operator,
        binding: BindingPosition,
        join_type: JoinType,
        pipelined: bool,
    ) -> Self::Operator;

    /// One empty row when the input is empty, otherwise none
    fn only_if_empty(&self, input: Self::Operator) -> Self::Operator;

    /// The input rows, or one row of `width` NULLs when there are none
    fn null_if_empty(&self, input: Self::Operator, width: usize) -> Self::Operator;

    /// Loads a bloom filter at `binding` from the `keys` of each `loader`
    /// row, then produces the rows of `input`
    fn using_bloom_filter(
        &self,
        loader: Self::Operator,
        input: Self::Operator,
        keys: Vec<PhysicalExpression<Self::Operator>>,
        estimated_size: u64,
        binding: BindingPosition,
    ) -> Self::Operator;

    /// Rows of `input` whose `lookup` values may be in the filter at
    /// `binding`
    fn bloom_filter_filter(
        &self,
        input: Self::Operator,
        lookup: Vec<PhysicalExpression<Self::Operator>>,
        binding: BindingPosition,
    ) -> Self::Operator;

    /// Loads the `loader` rows into a hash table at `binding` keyed by
    /// `keys`, then produces the rows of `input`
    fn using_hash_table(
        &self,
        loader: Self::Operator,
        input: Self::Operator,
        keys: Vec<PhysicalExpression<Self::Operator>>,
        binding: BindingPosition,
    ) -> Self::Operator;

    /// The loader rows in the hash table at `binding` matching `lookup`
    fn hash_table_lookup(
        &self,
        lookup: Vec<PhysicalExpression<Self::Operator>>,
        binding: BindingPosition,
    ) -> Self::Operator;

    /// Reads all of the input before producing any row
    fn buffer(&self, input: Self::Operator) -> Self::Operator;

    /// Inserts one row per input row built from `row`, one expression per
    /// table column. Produces the inserted rows.
    fn insert(
        &self,
        input: Self::Operator,
        table: TableId,
        row: Vec<PhysicalExpression<Self::Operator>>,
    ) -> Self::Operator;

    /// Changes the input rows of `table`, setting each column position to
    /// its expression. Produces the changed rows.
    fn update(
        &self,
        input: Self::Operator,
        table: TableId,
        columns: Vec<(usize, PhysicalExpression<Self::Operator>)>,
    ) -> Self::Operator;

    /// Deletes the input rows of `table`. Produces the deleted rows.
    fn delete(&self, input: Self::Operator, table: TableId) -> Self::Operator;

    fn set_operation(
        &self,
        left: Self::Operator,
        right: Self::Operator,
        operation: SetOperationType,
        all: bool,
    ) -> Self::Operator;
}
