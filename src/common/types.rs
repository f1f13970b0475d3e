/// Table ID type
pub type TableId = u32;

/// Index ID type
pub type IndexId = u32;

/// Storage group ID type
pub type GroupId = u32;

/// Position of a column within its table or row
pub type ColumnPosition = usize;

/// Positional parameter number (0-based)
pub type ParameterPosition = usize;
