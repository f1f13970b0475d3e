// Built-in Functions
//
// Scalar functions, aggregate functions and casts known to the standard
// registry, with their constant evaluators.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::registry::ResultTypeRule;
use super::{TypeClass, TypeInstance};
use crate::query::executor::result::{DataValue, QueryError, QueryResult};

pub type EvalFn = fn(&[DataValue]) -> QueryResult<DataValue>;
pub type CastFn = fn(&DataValue, &TypeInstance) -> QueryResult<DataValue>;

/// How a function's operands are typed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperandRule {
    /// Exactly n operands cast to their common numeric type
    CommonNumeric(usize),
    /// Any number of operands (at least one) cast to their common type
    CommonVariadic,
    /// n operands of any type, left alone
    Any(usize),
    /// First operand boolean, the remaining two cast to their common type
    Conditional,
    /// Any number of operands cast to VARCHAR
    Strings,
    /// Exactly n operands cast to DOUBLE
    Doubles(usize),
}

#[derive(Debug)]
pub struct ScalarFunction {
    pub name: &'static str,
    pub operands: OperandRule,
    pub result: ResultTypeRule,
    pub deterministic: bool,
    /// A NULL operand makes the result NULL without evaluation
    pub strict: bool,
    pub eval: EvalFn,
}

/// Result typing of an aggregate function
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateResult {
    /// BIGINT NOT NULL
    Count,
    /// Operand type, nullable
    SameAsOperand,
    /// Widened operand type, nullable
    Sum,
    /// DOUBLE, nullable
    Double,
}

#[derive(Debug)]
pub struct AggregateFunction {
    pub name: &'static str,
    pub result: AggregateResult,
    /// Value produced over zero input rows
    pub empty_value: DataValue,
}

fn scalar(
    name: &'static str,
    operands: OperandRule,
    result: ResultTypeRule,
    strict: bool,
    eval: EvalFn,
) -> ScalarFunction {
    ScalarFunction { name, operands, result, deterministic: true, strict, eval }
}

fn volatile(name: &'static str, result: TypeInstance) -> ScalarFunction {
    ScalarFunction {
        name,
        operands: OperandRule::Any(0),
        result: ResultTypeRule::Fixed(result),
        deterministic: false,
        strict: false,
        eval: not_constant,
    }
}

pub static SCALAR_FUNCTIONS: Lazy<HashMap<&'static str, ScalarFunction>> = Lazy::new(|| {
    let functions = vec![
        scalar("plus", OperandRule::CommonNumeric(2), ResultTypeRule::PickOperands, true, eval_plus),
        scalar("minus", OperandRule::CommonNumeric(2), ResultTypeRule::PickOperands, true, eval_minus),
        scalar("times", OperandRule::CommonNumeric(2), ResultTypeRule::PickOperands, true, eval_times),
        scalar("divide", OperandRule::CommonNumeric(2), ResultTypeRule::PickOperands, true, eval_divide),
        scalar("abs", OperandRule::CommonNumeric(1), ResultTypeRule::PickOperands, true, eval_abs),
        scalar("concat", OperandRule::Strings, ResultTypeRule::Custom(concat_type), true, eval_concat),
        scalar("isNull", OperandRule::Any(1), ResultTypeRule::Fixed(TypeInstance::boolean(false)), false, eval_is_null),
        scalar("isTrue", OperandRule::Any(1), ResultTypeRule::Fixed(TypeInstance::boolean(false)), false, eval_is_true),
        scalar("isFalse", OperandRule::Any(1), ResultTypeRule::Fixed(TypeInstance::boolean(false)), false, eval_is_false),
        scalar("isUnknown", OperandRule::Any(1), ResultTypeRule::Fixed(TypeInstance::boolean(false)), false, eval_is_null),
        scalar("coalesce", OperandRule::CommonVariadic, ResultTypeRule::Custom(coalesce_type), false, eval_coalesce),
        scalar("ifnull", OperandRule::CommonVariadic, ResultTypeRule::Custom(coalesce_type), false, eval_coalesce),
        scalar("if", OperandRule::Conditional, ResultTypeRule::Custom(conditional_type), false, eval_if),
        scalar("_VAR_POP", OperandRule::Doubles(3), ResultTypeRule::Fixed(TypeInstance::double(true)), true, eval_var_pop),
        scalar("_VAR_SAMP", OperandRule::Doubles(3), ResultTypeRule::Fixed(TypeInstance::double(true)), true, eval_var_samp),
        scalar("_STDDEV_POP", OperandRule::Doubles(3), ResultTypeRule::Fixed(TypeInstance::double(true)), true, eval_stddev_pop),
        scalar("_STDDEV_SAMP", OperandRule::Doubles(3), ResultTypeRule::Fixed(TypeInstance::double(true)), true, eval_stddev_samp),
        volatile("currentDate", TypeInstance::date(false)),
        volatile("currentTime", TypeInstance::timestamp(false)),
        volatile("currentTimestamp", TypeInstance::timestamp(false)),
        volatile("rand", TypeInstance::double(false)),
    ];
    functions.into_iter().map(|f| (f.name, f)).collect()
});

pub static AGGREGATE_FUNCTIONS: Lazy<HashMap<&'static str, AggregateFunction>> = Lazy::new(|| {
    let functions = vec![
        AggregateFunction { name: "COUNT", result: AggregateResult::Count, empty_value: DataValue::Integer(0) },
        AggregateFunction { name: "SUM", result: AggregateResult::Sum, empty_value: DataValue::Null },
        AggregateFunction { name: "MIN", result: AggregateResult::SameAsOperand, empty_value: DataValue::Null },
        AggregateFunction { name: "MAX", result: AggregateResult::SameAsOperand, empty_value: DataValue::Null },
        AggregateFunction { name: "FIRST", result: AggregateResult::SameAsOperand, empty_value: DataValue::Null },
        AggregateFunction { name: "_VAR_SUM", result: AggregateResult::Double, empty_value: DataValue::Null },
        AggregateFunction { name: "_VAR_SUM_2", result: AggregateResult::Double, empty_value: DataValue::Null },
    ];
    functions.into_iter().map(|f| (f.name, f)).collect()
});

fn not_constant(_args: &[DataValue]) -> QueryResult<DataValue> {
    Err(QueryError::Evaluation("function has no constant value".to_string()))
}

fn concat_type(operands: &[TypeInstance]) -> TypeInstance {
    let length = operands.iter().map(|t| t.length.unwrap_or(0)).sum();
    TypeInstance::varchar(length, operands.iter().any(|t| t.nullable))
}

fn coalesce_type(operands: &[TypeInstance]) -> TypeInstance {
    let nullable = operands.iter().all(|t| t.nullable);
    operands
        .first()
        .map(|t| t.with_nullable(nullable))
        .unwrap_or_else(|| TypeInstance::varchar(0, true))
}

fn conditional_type(operands: &[TypeInstance]) -> TypeInstance {
    match operands {
        [_, then, otherwise] => then.with_nullable(then.nullable || otherwise.nullable),
        _ => TypeInstance::varchar(0, true),
    }
}

fn binary_args(args: &[DataValue]) -> QueryResult<(&DataValue, &DataValue)> {
    match args {
        [l, r] => Ok((l, r)),
        _ => Err(QueryError::Evaluation(format!("expected 2 operands, got {}", args.len()))),
    }
}

fn eval_plus(args: &[DataValue]) -> QueryResult<DataValue> {
    match binary_args(args)? {
        (DataValue::Integer(l), DataValue::Integer(r)) => {
            Ok(DataValue::Integer(l.checked_add(*r).ok_or(QueryError::NumericOverflow)?))
        }
        (l, r) => float_op(l, r, |a, b| Ok(a + b), "+"),
    }
}

fn eval_minus(args: &[DataValue]) -> QueryResult<DataValue> {
    match binary_args(args)? {
        (DataValue::Integer(l), DataValue::Integer(r)) => {
            Ok(DataValue::Integer(l.checked_sub(*r).ok_or(QueryError::NumericOverflow)?))
        }
        (l, r) => float_op(l, r, |a, b| Ok(a - b), "-"),
    }
}

fn eval_times(args: &[DataValue]) -> QueryResult<DataValue> {
    match binary_args(args)? {
        (DataValue::Integer(l), DataValue::Integer(r)) => {
            Ok(DataValue::Integer(l.checked_mul(*r).ok_or(QueryError::NumericOverflow)?))
        }
        (l, r) => float_op(l, r, |a, b| Ok(a * b), "*"),
    }
}

fn eval_divide(args: &[DataValue]) -> QueryResult<DataValue> {
    match binary_args(args)? {
        (DataValue::Integer(_), DataValue::Integer(0)) => Err(QueryError::DivisionByZero),
        (DataValue::Integer(l), DataValue::Integer(r)) => Ok(DataValue::Integer(l / r)),
        (l, r) => float_op(
            l,
            r,
            |a, b| if b == 0.0 { Err(QueryError::DivisionByZero) } else { Ok(a / b) },
            "/",
        ),
    }
}

fn float_op(
    l: &DataValue,
    r: &DataValue,
    op: impl Fn(f64, f64) -> QueryResult<f64>,
    symbol: &str,
) -> QueryResult<DataValue> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok(DataValue::Float(op(a, b)?)),
        _ => Err(QueryError::Evaluation(format!("Unsupported types for {} operator", symbol))),
    }
}

fn eval_abs(args: &[DataValue]) -> QueryResult<DataValue> {
    match args {
        [DataValue::Integer(i)] => Ok(DataValue::Integer(i.checked_abs().ok_or(QueryError::NumericOverflow)?)),
        [DataValue::Float(f)] => Ok(DataValue::Float(f.abs())),
        _ => Err(QueryError::Evaluation("abs requires one numeric operand".to_string())),
    }
}

fn eval_concat(args: &[DataValue]) -> QueryResult<DataValue> {
    let mut result = String::new();
    for arg in args {
        match arg {
            DataValue::Text(s) => result.push_str(s),
            other => result.push_str(&other.to_sql_literal_for_error()),
        }
    }
    Ok(DataValue::Text(result))
}

fn eval_is_null(args: &[DataValue]) -> QueryResult<DataValue> {
    match args {
        [v] => Ok(DataValue::Boolean(v.is_null())),
        _ => Err(QueryError::Evaluation("isNull requires one operand".to_string())),
    }
}

fn eval_is_true(args: &[DataValue]) -> QueryResult<DataValue> {
    match args {
        [v] => Ok(DataValue::Boolean(v.as_bool() == Some(true))),
        _ => Err(QueryError::Evaluation("isTrue requires one operand".to_string())),
    }
}

fn eval_is_false(args: &[DataValue]) -> QueryResult<DataValue> {
    match args {
        [v] => Ok(DataValue::Boolean(v.as_bool() == Some(false))),
        _ => Err(QueryError::Evaluation("isFalse requires one operand".to_string())),
    }
}

fn eval_coalesce(args: &[DataValue]) -> QueryResult<DataValue> {
    Ok(args.iter().find(|v| !v.is_null()).cloned().unwrap_or(DataValue::Null))
}

fn eval_if(args: &[DataValue]) -> QueryResult<DataValue> {
    match args {
        [test, then, otherwise] => Ok(if test.as_bool() == Some(true) { then.clone() } else { otherwise.clone() }),
        _ => Err(QueryError::Evaluation("if requires three operands".to_string())),
    }
}

fn variance_parts(args: &[DataValue]) -> QueryResult<(f64, f64, f64)> {
    match args {
        [sum2, sum, count] => match (sum2.as_f64(), sum.as_f64(), count.as_f64()) {
            (Some(s2), Some(s), Some(n)) => Ok((s2, s, n)),
            _ => Err(QueryError::Evaluation("variance requires numeric partials".to_string())),
        },
        _ => Err(QueryError::Evaluation("variance requires three partials".to_string())),
    }
}

fn variance(args: &[DataValue], sample: bool) -> QueryResult<Option<f64>> {
    let (sum2, sum, count) = variance_parts(args)?;
    let divisor = if sample { count - 1.0 } else { count };
    if divisor <= 0.0 {
        return Ok(None);
    }
    Ok(Some((sum2 - sum * sum / count) / divisor))
}

fn eval_var_pop(args: &[DataValue]) -> QueryResult<DataValue> {
    Ok(variance(args, false)?.map(DataValue::Float).unwrap_or(DataValue::Null))
}

fn eval_var_samp(args: &[DataValue]) -> QueryResult<DataValue> {
    Ok(variance(args, true)?.map(DataValue::Float).unwrap_or(DataValue::Null))
}

fn eval_stddev_pop(args: &[DataValue]) -> QueryResult<DataValue> {
    Ok(variance(args, false)?.map(|v| DataValue::Float(v.sqrt())).unwrap_or(DataValue::Null))
}

fn eval_stddev_samp(args: &[DataValue]) -> QueryResult<DataValue> {
    Ok(variance(args, true)?.map(|v| DataValue::Float(v.sqrt())).unwrap_or(DataValue::Null))
}

/// Cast evaluator between two classes, if one exists.
pub fn cast_between(from: TypeClass, to: TypeClass) -> Option<CastFn> {
    use TypeClass::*;
    match (from, to) {
        (a, b) if a == b => Some(cast_value),
        (a, b) if a.is_numeric() && b.is_numeric() => Some(cast_value),
        (_, Varchar) => Some(cast_value),
        (Varchar, _) => Some(cast_value),
        (Boolean, b) if b.is_integral() => Some(cast_value),
        (a, Boolean) if a.is_integral() => Some(cast_value),
        (Date, Timestamp) | (Timestamp, Date) => Some(cast_value),
        _ => None,
    }
}

/// Convert a value to the given type.
pub fn cast_value(value: &DataValue, target: &TypeInstance) -> QueryResult<DataValue> {
    if value.is_null() {
        return Ok(DataValue::Null);
    }
    let fail = || QueryError::Evaluation(format!("Cannot cast {} to {}", value, target));
    match target.class {
        TypeClass::Boolean => match value {
            DataValue::Boolean(b) => Ok(DataValue::Boolean(*b)),
            DataValue::Integer(i) => Ok(DataValue::Boolean(*i != 0)),
            DataValue::Text(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(DataValue::Boolean(true)),
                "false" | "f" | "0" => Ok(DataValue::Boolean(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        TypeClass::SmallInt | TypeClass::Integer | TypeClass::BigInt => {
            let i = match value {
                DataValue::Integer(i) => *i,
                DataValue::Float(f) => f.trunc() as i64,
                DataValue::Boolean(b) => i64::from(*b),
                DataValue::Text(s) => s.trim().parse::<i64>().map_err(|_| fail())?,
                _ => return Err(fail()),
            };
            let fits = match target.class {
                TypeClass::SmallInt => i16::try_from(i).is_ok(),
                TypeClass::Integer => i32::try_from(i).is_ok(),
                _ => true,
            };
            if fits { Ok(DataValue::Integer(i)) } else { Err(QueryError::NumericOverflow) }
        }
        TypeClass::Decimal | TypeClass::Double => {
            let f = match value {
                DataValue::Integer(i) => *i as f64,
                DataValue::Float(f) => *f,
                DataValue::Text(s) => s.trim().parse::<f64>().map_err(|_| fail())?,
                _ => return Err(fail()),
            };
            match (target.class, target.scale) {
                (TypeClass::Decimal, Some(scale)) => {
                    let factor = 10f64.powi(scale as i32);
                    Ok(DataValue::Float((f * factor).round() / factor))
                }
                _ => Ok(DataValue::Float(f)),
            }
        }
        TypeClass::Varchar => {
            let s = match value {
                DataValue::Text(s) => s.clone(),
                DataValue::Integer(i) => i.to_string(),
                DataValue::Float(f) => f.to_string(),
                DataValue::Boolean(b) => b.to_string(),
                DataValue::Date(s) | DataValue::Timestamp(s) => s.clone(),
                DataValue::Blob(b) => hex::encode(b),
                DataValue::Null => return Ok(DataValue::Null),
            };
            match target.length {
                Some(len) if s.chars().count() > len as usize => Err(QueryError::Evaluation(format!(
                    "String '{}' too long for {}",
                    s, target
                ))),
                _ => Ok(DataValue::Text(s)),
            }
        }
        TypeClass::Varbinary => match value {
            DataValue::Blob(b) => Ok(DataValue::Blob(b.clone())),
            DataValue::Text(s) => hex::decode(s).map(DataValue::Blob).map_err(|_| fail()),
            _ => Err(fail()),
        },
        TypeClass::Date => match value {
            DataValue::Date(s) => Ok(DataValue::Date(s.clone())),
            DataValue::Timestamp(s) => Ok(DataValue::Date(s.split(' ').next().unwrap_or("").to_string())),
            DataValue::Text(s) if s.len() == 10 && s.chars().nth(4) == Some('-') && s.chars().nth(7) == Some('-') => {
                Ok(DataValue::Date(s.clone()))
            }
            _ => Err(fail()),
        },
        TypeClass::Timestamp => match value {
            DataValue::Timestamp(s) => Ok(DataValue::Timestamp(s.clone())),
            DataValue::Date(s) => Ok(DataValue::Timestamp(format!("{} 00:00:00", s))),
            DataValue::Text(s) if s.len() >= 19 => Ok(DataValue::Timestamp(s.clone())),
            _ => Err(fail()),
        },
    }
}
