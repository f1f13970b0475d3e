// Types Registry
//
// The type/cast resolver consumed by the planner. `StandardTypesRegistry`
// serves the built-in function and cast tables.

use super::functions::{
    self, AggregateResult, CastFn, OperandRule, AGGREGATE_FUNCTIONS, SCALAR_FUNCTIONS,
};
use super::{TypeClass, TypeInstance};
use crate::query::executor::result::{DataValue, QueryError, QueryResult};

/// How the result type of a resolved overload is derived
#[derive(Debug, Clone)]
pub enum ResultTypeRule {
    /// Always this type
    Fixed(TypeInstance),
    /// The common type of the (cast) operands
    PickOperands,
    /// Computed from the (cast) operand types
    Custom(fn(&[TypeInstance]) -> TypeInstance),
}

/// Outcome of overload resolution
#[derive(Debug, Clone)]
pub struct ResolvedOverload {
    pub name: String,
    /// Target type per operand where an implicit cast is needed
    pub operand_casts: Vec<Option<TypeInstance>>,
    pub result_type: TypeInstance,
}

pub trait TypesRegistry {
    /// Common class of two classes, if they can be unified at all
    fn common_class(&self, a: TypeClass, b: TypeClass) -> Option<TypeClass>;

    /// Instance of `class` wide enough for values of both `a` and `b`
    fn pick_instance(&self, class: TypeClass, a: &TypeInstance, b: &TypeInstance) -> TypeInstance;

    fn resolve_overload(&self, name: &str, operands: &[Option<TypeInstance>]) -> QueryResult<ResolvedOverload>;

    fn aggregate_type(&self, name: &str, operand: Option<&TypeInstance>) -> QueryResult<TypeInstance>;

    /// Value an aggregate produces over zero rows
    fn aggregate_empty_value(&self, name: &str) -> DataValue;

    fn cast_function(&self, from: TypeClass, to: TypeClass) -> Option<CastFn>;

    /// Whether values of the two classes can be compared as index keys
    /// without a cast
    fn key_comparable(&self, a: TypeClass, b: TypeClass) -> bool;

    /// Whether repeated calls with the same operands give the same value
    fn is_deterministic(&self, name: &str) -> bool;

    /// Whether a NULL operand always yields NULL
    fn is_strict(&self, name: &str) -> bool;

    fn evaluate(&self, name: &str, args: &[DataValue]) -> QueryResult<DataValue>;

    fn evaluate_cast(&self, value: &DataValue, target: &TypeInstance) -> QueryResult<DataValue>;

    /// Common type of two instances, or a type error
    fn common_type(&self, a: &TypeInstance, b: &TypeInstance) -> QueryResult<TypeInstance> {
        match self.common_class(a.class, b.class) {
            Some(class) => Ok(self.pick_instance(class, a, b)),
            None => Err(QueryError::TypeError(format!("No common type for {} and {}", a, b))),
        }
    }
}

/// Registry over the built-in functions and casts
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardTypesRegistry;

impl StandardTypesRegistry {
    pub fn new() -> Self {
        StandardTypesRegistry
    }

    fn common_of(&self, operands: &[Option<TypeInstance>]) -> QueryResult<Option<TypeInstance>> {
        let mut common: Option<TypeInstance> = None;
        for operand in operands.iter().flatten() {
            common = Some(match common {
                None => operand.clone(),
                Some(c) => self.common_type(&c, operand)?,
            });
        }
        Ok(common)
    }

    fn cast_targets(operands: &[Option<TypeInstance>], target: &TypeInstance) -> Vec<Option<TypeInstance>> {
        operands
            .iter()
            .map(|operand| match operand {
                Some(t) if t.same_type(target) => None,
                Some(t) => Some(target.with_nullable(t.nullable)),
                None => Some(target.with_nullable(true)),
            })
            .collect()
    }
}

fn display_width(t: &TypeInstance) -> u32 {
    match t.class {
        TypeClass::Varchar | TypeClass::Varbinary => t.length.unwrap_or(0),
        TypeClass::Boolean => 5,
        TypeClass::SmallInt => 6,
        TypeClass::Integer => 11,
        TypeClass::BigInt => 20,
        TypeClass::Decimal => t.precision.unwrap_or(0) + 2,
        TypeClass::Double => 22,
        TypeClass::Date => 10,
        TypeClass::Timestamp => 19,
    }
}

fn no_such_function(name: &str, operands: &[Option<TypeInstance>]) -> QueryError {
    let operands = operands
        .iter()
        .map(|o| o.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "NULL".to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    QueryError::NoSuchFunction { name: name.to_string(), operands }
}

impl TypesRegistry for StandardTypesRegistry {
    fn common_class(&self, a: TypeClass, b: TypeClass) -> Option<TypeClass> {
        use TypeClass::*;
        if a == b {
            return Some(a);
        }
        if let (Some(ra), Some(rb)) = (a.numeric_rank(), b.numeric_rank()) {
            return Some(if ra >= rb { a } else { b });
        }
        match (a, b) {
            (Date, Timestamp) | (Timestamp, Date) => Some(Timestamp),
            (Varchar, Date) | (Date, Varchar) => Some(Date),
            (Varchar, Timestamp) | (Timestamp, Varchar) => Some(Timestamp),
            _ => None,
        }
    }

    fn pick_instance(&self, class: TypeClass, a: &TypeInstance, b: &TypeInstance) -> TypeInstance {
        let nullable = a.nullable || b.nullable;
        match class {
            TypeClass::Varchar => TypeInstance::varchar(display_width(a).max(display_width(b)), nullable),
            TypeClass::Varbinary => TypeInstance::varbinary(a.length.unwrap_or(0).max(b.length.unwrap_or(0)), nullable),
            TypeClass::Decimal => {
                let integer_digits = a.decimal_integer_digits().max(b.decimal_integer_digits());
                let scale = a.decimal_scale().max(b.decimal_scale());
                TypeInstance::decimal(integer_digits + scale, scale, nullable)
            }
            other => TypeInstance::new(other, nullable),
        }
    }

    fn resolve_overload(&self, name: &str, operands: &[Option<TypeInstance>]) -> QueryResult<ResolvedOverload> {
        let function = SCALAR_FUNCTIONS.get(name).ok_or_else(|| no_such_function(name, operands))?;
        let operand_casts = match function.operands {
            OperandRule::CommonNumeric(n) => {
                if operands.len() != n {
                    return Err(no_such_function(name, operands));
                }
                let common = self.common_of(operands)?.unwrap_or_else(|| TypeInstance::big_int(true));
                if !common.class.is_numeric() {
                    return Err(no_such_function(name, operands));
                }
                Self::cast_targets(operands, &common)
            }
            OperandRule::CommonVariadic => {
                if operands.is_empty() {
                    return Err(no_such_function(name, operands));
                }
                match self.common_of(operands)? {
                    Some(common) => Self::cast_targets(operands, &common),
                    None => vec![None; operands.len()],
                }
            }
            OperandRule::Any(n) => {
                if operands.len() != n {
                    return Err(no_such_function(name, operands));
                }
                vec![None; n]
            }
            OperandRule::Conditional => {
                if operands.len() != 3 {
                    return Err(no_such_function(name, operands));
                }
                let mut casts = Self::cast_targets(&operands[..1], &TypeInstance::boolean(true));
                match self.common_of(&operands[1..])? {
                    Some(common) => casts.extend(Self::cast_targets(&operands[1..], &common)),
                    None => casts.extend([None, None]),
                }
                casts
            }
            OperandRule::Strings => operands
                .iter()
                .map(|operand| match operand {
                    Some(t) if t.class == TypeClass::Varchar => None,
                    Some(t) => Some(TypeInstance::varchar(display_width(t), t.nullable)),
                    None => Some(TypeInstance::varchar(0, true)),
                })
                .collect(),
            OperandRule::Doubles(n) => {
                if operands.len() != n {
                    return Err(no_such_function(name, operands));
                }
                Self::cast_targets(operands, &TypeInstance::double(true))
            }
        };

        let typed: Vec<TypeInstance> = operands
            .iter()
            .zip(&operand_casts)
            .map(|(operand, cast)| {
                cast.clone()
                    .or_else(|| operand.clone())
                    .unwrap_or_else(|| TypeInstance::varchar(0, true))
            })
            .collect();
        let any_nullable = typed.iter().any(|t| t.nullable);
        let result_type = match &function.result {
            ResultTypeRule::Fixed(t) => t.clone(),
            ResultTypeRule::PickOperands => {
                let mut result = typed.first().cloned().unwrap_or_else(|| TypeInstance::big_int(true));
                for t in typed.iter().skip(1) {
                    result = self.common_type(&result, t)?;
                }
                result.with_nullable(function.strict && any_nullable)
            }
            ResultTypeRule::Custom(rule) => rule(&typed),
        };

        Ok(ResolvedOverload { name: function.name.to_string(), operand_casts, result_type })
    }

    fn aggregate_type(&self, name: &str, operand: Option<&TypeInstance>) -> QueryResult<TypeInstance> {
        let function = AGGREGATE_FUNCTIONS.get(name.to_uppercase().as_str()).ok_or_else(|| {
            QueryError::NoSuchFunction {
                name: name.to_string(),
                operands: operand.map(|t| t.to_string()).unwrap_or_default(),
            }
        })?;
        Ok(match (function.result, operand) {
            (AggregateResult::Count, _) => TypeInstance::big_int(false),
            (AggregateResult::Double, _) => TypeInstance::double(true),
            (AggregateResult::SameAsOperand, Some(t)) => t.with_nullable(true),
            (AggregateResult::Sum, Some(t)) if t.class.is_integral() => TypeInstance::big_int(true),
            (AggregateResult::Sum, Some(t)) => t.with_nullable(true),
            (_, None) => TypeInstance::big_int(true),
        })
    }

    fn aggregate_empty_value(&self, name: &str) -> DataValue {
        AGGREGATE_FUNCTIONS
            .get(name.to_uppercase().as_str())
            .map(|f| f.empty_value.clone())
            .unwrap_or(DataValue::Null)
    }

    fn cast_function(&self, from: TypeClass, to: TypeClass) -> Option<CastFn> {
        functions::cast_between(from, to)
    }

    fn key_comparable(&self, a: TypeClass, b: TypeClass) -> bool {
        a == b || (a.is_integral() && b.is_integral())
    }

    fn is_deterministic(&self, name: &str) -> bool {
        SCALAR_FUNCTIONS.get(name).map(|f| f.deterministic).unwrap_or(false)
    }

    fn is_strict(&self, name: &str) -> bool {
        SCALAR_FUNCTIONS.get(name).map(|f| f.strict).unwrap_or(false)
    }

    fn evaluate(&self, name: &str, args: &[DataValue]) -> QueryResult<DataValue> {
        let function = SCALAR_FUNCTIONS.get(name).ok_or_else(|| {
            QueryError::NoSuchFunction { name: name.to_string(), operands: format!("{} operands", args.len()) }
        })?;
        if function.strict && args.iter().any(|a| a.is_null()) {
            return Ok(DataValue::Null);
        }
        (function.eval)(args)
    }

    fn evaluate_cast(&self, value: &DataValue, target: &TypeInstance) -> QueryResult<DataValue> {
        let from = match TypeInstance::for_literal(value) {
            Some(t) => t.class,
            None => return Ok(DataValue::Null),
        };
        let cast = self.cast_function(from, target.class).ok_or_else(|| QueryError::NoSuchCast {
            from: from.to_string(),
            to: target.to_string(),
        })?;
        cast(value, target)
    }
}
