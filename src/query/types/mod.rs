// Type Model Module
//
// SQL type classes and concrete type instances, plus the registry that
// resolves functions, casts and common types over them.

pub mod functions;
pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::executor::result::DataValue;

/// Type families known to the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeClass {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Decimal,
    Double,
    Varchar,
    Varbinary,
    Date,
    Timestamp,
}

impl TypeClass {
    /// Convert a string representation to a TypeClass
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "BOOL" | "BOOLEAN" => Ok(TypeClass::Boolean),
            "SMALLINT" => Ok(TypeClass::SmallInt),
            "INT" | "INTEGER" => Ok(TypeClass::Integer),
            "BIGINT" => Ok(TypeClass::BigInt),
            "DECIMAL" | "NUMERIC" => Ok(TypeClass::Decimal),
            "FLOAT" | "REAL" | "DOUBLE" => Ok(TypeClass::Double),
            "TEXT" | "VARCHAR" | "CHAR" | "STRING" => Ok(TypeClass::Varchar),
            "BLOB" | "BINARY" | "VARBINARY" => Ok(TypeClass::Varbinary),
            "DATE" => Ok(TypeClass::Date),
            "TIMESTAMP" | "DATETIME" => Ok(TypeClass::Timestamp),
            _ => Err(format!("Unknown data type: {}", s)),
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.numeric_rank().is_some()
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, TypeClass::SmallInt | TypeClass::Integer | TypeClass::BigInt)
    }

    /// Position in the numeric widening order
    pub fn numeric_rank(&self) -> Option<u8> {
        match self {
            TypeClass::SmallInt => Some(1),
            TypeClass::Integer => Some(2),
            TypeClass::BigInt => Some(3),
            TypeClass::Decimal => Some(4),
            TypeClass::Double => Some(5),
            _ => None,
        }
    }

    /// Decimal digits needed to hold any value of an integral class
    pub fn integral_digits(&self) -> Option<u32> {
        match self {
            TypeClass::SmallInt => Some(5),
            TypeClass::Integer => Some(10),
            TypeClass::BigInt => Some(19),
            _ => None,
        }
    }
}

impl fmt::Display for TypeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeClass::Boolean => "BOOLEAN",
            TypeClass::SmallInt => "SMALLINT",
            TypeClass::Integer => "INTEGER",
            TypeClass::BigInt => "BIGINT",
            TypeClass::Decimal => "DECIMAL",
            TypeClass::Double => "DOUBLE",
            TypeClass::Varchar => "VARCHAR",
            TypeClass::Varbinary => "VARBINARY",
            TypeClass::Date => "DATE",
            TypeClass::Timestamp => "TIMESTAMP",
        };
        write!(f, "{}", name)
    }
}

/// A concrete type: class plus attributes and nullability
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeInstance {
    pub class: TypeClass,
    pub nullable: bool,
    /// Maximum length for VARCHAR / VARBINARY
    pub length: Option<u32>,
    /// Total digits for DECIMAL
    pub precision: Option<u32>,
    /// Fractional digits for DECIMAL
    pub scale: Option<u32>,
}

impl TypeInstance {
    pub fn new(class: TypeClass, nullable: bool) -> Self {
        TypeInstance { class, nullable, length: None, precision: None, scale: None }
    }

    pub fn boolean(nullable: bool) -> Self {
        Self::new(TypeClass::Boolean, nullable)
    }

    pub fn small_int(nullable: bool) -> Self {
        Self::new(TypeClass::SmallInt, nullable)
    }

    pub fn integer(nullable: bool) -> Self {
        Self::new(TypeClass::Integer, nullable)
    }

    pub fn big_int(nullable: bool) -> Self {
        Self::new(TypeClass::BigInt, nullable)
    }

    pub fn double(nullable: bool) -> Self {
        Self::new(TypeClass::Double, nullable)
    }

    pub fn date(nullable: bool) -> Self {
        Self::new(TypeClass::Date, nullable)
    }

    pub fn timestamp(nullable: bool) -> Self {
        Self::new(TypeClass::Timestamp, nullable)
    }

    pub fn decimal(precision: u32, scale: u32, nullable: bool) -> Self {
        TypeInstance {
            precision: Some(precision),
            scale: Some(scale),
            ..Self::new(TypeClass::Decimal, nullable)
        }
    }

    pub fn varchar(length: u32, nullable: bool) -> Self {
        TypeInstance { length: Some(length), ..Self::new(TypeClass::Varchar, nullable) }
    }

    pub fn varbinary(length: u32, nullable: bool) -> Self {
        TypeInstance { length: Some(length), ..Self::new(TypeClass::Varbinary, nullable) }
    }

    pub fn with_nullable(&self, nullable: bool) -> Self {
        TypeInstance { nullable, ..self.clone() }
    }

    /// Same type ignoring nullability
    pub fn same_type(&self, other: &TypeInstance) -> bool {
        self.class == other.class
            && self.length == other.length
            && self.precision == other.precision
            && self.scale == other.scale
    }

    /// Type of a literal value; NULL has no type of its own.
    pub fn for_literal(value: &DataValue) -> Option<TypeInstance> {
        match value {
            DataValue::Null => None,
            DataValue::Boolean(_) => Some(TypeInstance::boolean(false)),
            DataValue::Integer(i) => {
                if i32::try_from(*i).is_ok() {
                    Some(TypeInstance::integer(false))
                } else {
                    Some(TypeInstance::big_int(false))
                }
            }
            DataValue::Float(f) => {
                let text = format!("{}", f.abs());
                let (int_part, frac_part) = match text.split_once('.') {
                    Some((i, d)) => (i.len() as u32, d.len() as u32),
                    None => (text.len() as u32, 0),
                };
                Some(TypeInstance::decimal(int_part + frac_part, frac_part, false))
            }
            DataValue::Text(s) => Some(TypeInstance::varchar(s.chars().count() as u32, false)),
            DataValue::Blob(b) => Some(TypeInstance::varbinary(b.len() as u32, false)),
            DataValue::Date(_) => Some(TypeInstance::date(false)),
            DataValue::Timestamp(_) => Some(TypeInstance::timestamp(false)),
        }
    }

    /// Integer digits of a numeric instance when viewed as a decimal
    pub fn decimal_integer_digits(&self) -> u32 {
        match self.class {
            TypeClass::Decimal => {
                self.precision.unwrap_or(0).saturating_sub(self.scale.unwrap_or(0))
            }
            other => other.integral_digits().unwrap_or(0),
        }
    }

    pub fn decimal_scale(&self) -> u32 {
        match self.class {
            TypeClass::Decimal => self.scale.unwrap_or(0),
            _ => 0,
        }
    }
}

impl fmt::Display for TypeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.class, self.length, self.precision, self.scale) {
            (TypeClass::Varchar | TypeClass::Varbinary, Some(len), _, _) => {
                write!(f, "{}({})", self.class, len)?
            }
            (TypeClass::Decimal, _, Some(p), Some(s)) => write!(f, "DECIMAL({}, {})", p, s)?,
            _ => write!(f, "{}", self.class)?,
        }
        if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        Ok(())
    }
}
