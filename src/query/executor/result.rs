// Query Result Implementation
//
// This module defines the value and error types shared by the planner,
// the type registry and the operator factory boundary.

use std::cmp::{Eq, Ordering};
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

/// Possible compile-time values of constant expressions
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum DataValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Date(String),
    Timestamp(String),
    Blob(Vec<u8>),
}

impl Eq for DataValue {}

impl Hash for DataValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            DataValue::Null => 0u8.hash(state),
            DataValue::Integer(i) => { 1u8.hash(state); i.hash(state); }
            DataValue::Float(f) => { 2u8.hash(state); f.to_bits().hash(state); }
            DataValue::Text(s) => { 3u8.hash(state); s.hash(state); }
            DataValue::Boolean(b) => { 4u8.hash(state); b.hash(state); }
            DataValue::Date(s) => { 5u8.hash(state); s.hash(state); }
            DataValue::Timestamp(s) => { 6u8.hash(state); s.hash(state); }
            DataValue::Blob(b) => { 7u8.hash(state); b.hash(state); }
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Null => write!(f, "NULL"),
            DataValue::Integer(i) => write!(f, "{}", i),
            DataValue::Float(fl) => write!(f, "{}", fl),
            DataValue::Text(s) => write!(f, "'{}'", s),
            DataValue::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            DataValue::Date(s) => write!(f, "DATE '{}'", s),
            DataValue::Timestamp(s) => write!(f, "TIMESTAMP '{}'", s),
            DataValue::Blob(b) => write!(f, "X'{}'", hex::encode(b)),
        }
    }
}

impl PartialOrd for DataValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (DataValue::Null, DataValue::Null) => Some(Ordering::Equal),
            (DataValue::Null, _) => Some(Ordering::Less),
            (_, DataValue::Null) => Some(Ordering::Greater),

            (DataValue::Integer(a), DataValue::Integer(b)) => a.partial_cmp(b),
            (DataValue::Float(a), DataValue::Float(b)) => a.partial_cmp(b),
            (DataValue::Integer(a), DataValue::Float(b)) => (*a as f64).partial_cmp(b),
            (DataValue::Float(a), DataValue::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (DataValue::Text(a), DataValue::Text(b)) => Some(a.cmp(b)),
            (DataValue::Boolean(a), DataValue::Boolean(b)) => a.partial_cmp(b),
            (DataValue::Date(a), DataValue::Date(b)) => Some(a.cmp(b)),
            (DataValue::Timestamp(a), DataValue::Timestamp(b)) => Some(a.cmp(b)),
            (DataValue::Blob(a), DataValue::Blob(b)) => Some(a.cmp(b)),

            (DataValue::Text(a), DataValue::Date(b)) => Some(a.cmp(b)),
            (DataValue::Date(a), DataValue::Text(b)) => Some(a.cmp(b)),
            (DataValue::Text(a), DataValue::Timestamp(b)) => Some(a.cmp(b)),
            (DataValue::Timestamp(a), DataValue::Text(b)) => Some(a.cmp(b)),

            (DataValue::Date(a), DataValue::Timestamp(b)) => {
                Some(a.as_str().cmp(b.split(' ').next().unwrap_or("")))
            }
            (DataValue::Timestamp(a), DataValue::Date(b)) => {
                Some(a.split(' ').next().unwrap_or("").cmp(b.as_str()))
            }

            _ => None,
        }
    }
}

impl DataValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }

    /// Compare two values, NULLs first.
    pub fn compare(&self, other: &Self) -> QueryResult<Ordering> {
        match (self, other) {
            (DataValue::Null, DataValue::Null) => Ok(Ordering::Equal),
            (DataValue::Null, _) => Ok(Ordering::Less),
            (_, DataValue::Null) => Ok(Ordering::Greater),
            (a, b) => a.partial_cmp(b).ok_or_else(|| {
                QueryError::TypeError(format!("Cannot compare incompatible values {} and {}", a, b))
            }),
        }
    }

    /// Value used when sorting and deduplicating literal lists. Integers
    /// of any width compare as i64. Keys of different variants order by
    /// variant, so the values compared must already share one type.
    pub fn comparable_key(&self) -> ComparableValue<'_> {
        match self {
            DataValue::Integer(i) => ComparableValue::Long(*i),
            DataValue::Float(f) => ComparableValue::Double(ordered_bits(*f)),
            DataValue::Boolean(b) => ComparableValue::Long(i64::from(*b)),
            other => ComparableValue::Other(other),
        }
    }

    pub fn to_sql_literal_for_error(&self) -> String {
        match self {
            DataValue::Null => "NULL".to_string(),
            DataValue::Integer(i) => i.to_string(),
            DataValue::Float(f) => f.to_string(),
            DataValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            DataValue::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            DataValue::Date(s) => format!("'{}'", s),
            DataValue::Timestamp(s) => format!("'{}'", s),
            DataValue::Blob(b) => format!("X'{}'", hex::encode(b)),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataValue::Integer(i) => Some(*i),
            DataValue::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Integer(i) => Some(*i as f64),
            DataValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Hashable, totally ordered view of a value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComparableValue<'a> {
    Long(i64),
    Double(u64),
    Other(&'a DataValue),
}

impl Ord for DataValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other).unwrap_or_else(|| discriminant_rank(self).cmp(&discriminant_rank(other)))
    }
}

// Bits of a double, remapped so unsigned order is numeric order
fn ordered_bits(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits >> 63 == 1 { !bits } else { bits | 1 << 63 }
}

fn discriminant_rank(value: &DataValue) -> u8 {
    match value {
        DataValue::Null => 0,
        DataValue::Boolean(_) => 1,
        DataValue::Integer(_) | DataValue::Float(_) => 2,
        DataValue::Text(_) => 3,
        DataValue::Date(_) => 4,
        DataValue::Timestamp(_) => 5,
        DataValue::Blob(_) => 6,
    }
}

/// Errors raised while compiling a statement
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// A recognized construct that cannot be turned into a plan
    #[error("Unsupported SQL: {0}")]
    UnsupportedSql(String),
    /// An invariant an earlier rule should have established does not hold
    #[error("Internal planner error: {0}")]
    Internal(String),
    /// Inconsistent or missing schema metadata
    #[error("Catalog error: {0}")]
    CatalogError(String),
    /// Error in data type inference or conversion
    #[error("Type error: {0}")]
    TypeError(String),
    /// No cast between two types
    #[error("No cast from {from} to {to}")]
    NoSuchCast { from: String, to: String },
    /// No function overload for the operand types
    #[error("No function {name}({operands})")]
    NoSuchFunction { name: String, operands: String },
    /// A column outside GROUP BY used without an aggregate
    #[error("Column cannot be used outside aggregate function or GROUP BY: {0}")]
    NoAggregateWithGroupBy(String),
    /// An aggregate function where no aggregation takes place
    #[error("Aggregate function not allowed here: {0}")]
    AggregateInWhere(String),
    /// An aggregate nested inside another aggregate
    #[error("Aggregate function calls cannot be nested: {0}")]
    NestedAggregate(String),
    /// A configuration property with an unusable value
    #[error("Invalid optimizer property {name}: {value}")]
    InvalidOptimizerProperty { name: String, value: String },
    /// Error evaluating a constant expression
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    /// Numeric overflow
    #[error("Numeric overflow")]
    NumericOverflow,
    /// Division by zero
    #[error("Division by zero")]
    DivisionByZero,
}

impl QueryError {
    /// Errors that only mean a constant could not be computed now.
    pub fn is_evaluation_failure(&self) -> bool {
        matches!(
            self,
            QueryError::Evaluation(_)
                | QueryError::DivisionByZero
                | QueryError::NumericOverflow
                | QueryError::NoSuchCast { .. }
        )
    }
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;
