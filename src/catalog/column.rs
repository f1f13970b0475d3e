// Column Management Module
//
// This module defines the Column type that represents a database column schema.

use serde::{Deserialize, Serialize};

use crate::query::types::TypeInstance;

/// Represents a column in a database table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    name: String,
    /// Column type, including nullability
    data_type: TypeInstance,
    /// Position within the table row
    position: usize,
}

impl Column {
    /// Create a new column
    pub fn new(name: impl Into<String>, data_type: TypeInstance, position: usize) -> Self {
        Column { name: name.into(), data_type, position }
    }

    /// Get the column name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the column data type
    pub fn data_type(&self) -> &TypeInstance {
        &self.data_type
    }

    /// Check if the column can contain NULL values
    pub fn is_nullable(&self) -> bool {
        self.data_type.nullable
    }

    pub fn position(&self) -> usize {
        self.position
    }
}
