// Physical Operator Tree
//
// A descriptive rendition of the operators an engine would build. Used to
// inspect what the assembler produced.

use std::fmt;
use std::sync::Arc;

use super::{
    AggregateSpec, BindingPosition, IndexBound, IndexKeyRange, OperatorFactory, PhysicalExpression, SortKey,
};
use crate::catalog::{Catalog, Index};
use crate::common::types::{GroupId, TableId};
use crate::query::planner::plan::node::{JoinType, SetOperationType};

type Expr = PhysicalExpression<PhysicalOperator>;

/// Represents a node in the physical operator tree
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalOperator {
    /// Index scan over a key range
    IndexScan {
        /// Index name
        index: String,
        range: IndexKeyRange<PhysicalOperator>,
        ascending: bool,
    },
    /// Intersection of two index scans
    Intersect {
        output: Box<PhysicalOperator>,
        selector: Box<PhysicalOperator>,
        comparison_fields: usize,
        skip_scan: bool,
    },
    /// Scan of a whole group
    GroupScan {
        group: GroupId,
        /// Table names
        tables: Vec<String>,
    },
    FullTextScan {
        index: String,
        query: Expr,
        limit: Option<usize>,
    },
    AncestorLookup {
        input: Option<Box<PhysicalOperator>>,
        descendant: String,
        ancestors: Vec<String>,
        binding: Option<BindingPosition>,
        keep_input: bool,
        lookahead: u32,
    },
    BranchLookup {
        input: Option<Box<PhysicalOperator>>,
        source: String,
        branch: String,
        tables: Vec<String>,
        binding: Option<BindingPosition>,
        keep_input: bool,
        lookahead: u32,
    },
    Flatten {
        input: Box<PhysicalOperator>,
        tables: Vec<String>,
        join_types: Vec<JoinType>,
    },
    Product {
        first: Box<PhysicalOperator>,
        branches: Vec<PhysicalOperator>,
        ancestor: Option<String>,
        binding: BindingPosition,
    },
    /// Filter operator (selection)
    Select {
        input: Box<PhysicalOperator>,
        condition: Expr,
    },
    /// Projection operator
    Project {
        input: Box<PhysicalOperator>,
        fields: Vec<Expr>,
    },
    Aggregate {
        input: Box<PhysicalOperator>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggregateSpec<PhysicalOperator>>,
    },
    Distinct {
        input: Box<PhysicalOperator>,
    },
    Sort {
        input: Box<PhysicalOperator>,
        keys: Vec<SortKey<PhysicalOperator>>,
    },
    Limit {
        input: Box<PhysicalOperator>,
        offset: usize,
        limit: Option<usize>,
    },
    /// Literal rows
    Values {
        rows: Vec<Vec<Expr>>,
    },
    /// Nested loop with the outer row bound for the inner side
    MapJoin {
        outer: Box<PhysicalOperator>,
        inner: Box<PhysicalOperator>,
        binding: BindingPosition,
        join_type: JoinType,
        pipelined: bool,
    },
    OnlyIfEmpty {
        input: Box<PhysicalOperator>,
    },
    NullIfEmpty {
        input: Box<PhysicalOperator>,
        width: usize,
    },
    UsingBloomFilter {
        loader: Box<PhysicalOperator>,
        input: Box<PhysicalOperator>,
        keys: Vec<Expr>,
        estimated_size: u64,
        binding: BindingPosition,
    },
    BloomFilterFilter {
        input: Box<PhysicalOperator>,
        lookup: Vec<Expr>,
        binding: BindingPosition,
    },
    UsingHashTable {
        loader: Box<PhysicalOperator>,
        input: Box<PhysicalOperator>,
        keys: Vec<Expr>,
        binding: BindingPosition,
    },
    HashTableLookup {
        lookup: Vec<Expr>,
        binding: BindingPosition,
    },
    /// Material operator (reads all input rows up front)
    Buffer {
        input: Box<PhysicalOperator>,
    },
    Insert {
        input: Box<PhysicalOperator>,
        table: String,
        row: Vec<Expr>,
    },
    Update {
        input: Box<PhysicalOperator>,
        table: String,
        columns: Vec<(usize, Expr)>,
    },
    Delete {
        input: Box<PhysicalOperator>,
        table: String,
    },
    SetOperation {
        left: Box<PhysicalOperator>,
        right: Box<PhysicalOperator>,
        operation: SetOperationType,
        all: bool,
    },
}

impl PhysicalOperator {
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOperator::IndexScan { .. } => "IndexScan",
            PhysicalOperator::Intersect { .. } => "Intersect",
            PhysicalOperator::GroupScan { .. } => "GroupScan",
            PhysicalOperator::FullTextScan { .. } => "FullTextScan",
            PhysicalOperator::AncestorLookup { .. } => "AncestorLookup",
            PhysicalOperator::BranchLookup { .. } => "BranchLookup",
            PhysicalOperator::Flatten { .. } => "Flatten",
            PhysicalOperator::Product { .. } => "Product",
            PhysicalOperator::Select { .. } => "Select",
            PhysicalOperator::Project { .. } => "Project",
            PhysicalOperator::Aggregate { .. } => "Aggregate",
            PhysicalOperator::Distinct { .. } => "Distinct",
            PhysicalOperator::Sort { .. } => "Sort",
            PhysicalOperator::Limit { .. } => "Limit",
            PhysicalOperator::Values { .. } => "Values",
            PhysicalOperator::MapJoin { .. } => "MapJoin",
            PhysicalOperator::OnlyIfEmpty { .. } => "OnlyIfEmpty",
            PhysicalOperator::NullIfEmpty { .. } => "NullIfEmpty",
            PhysicalOperator::UsingBloomFilter { .. } => "UsingBloomFilter",
            PhysicalOperator::BloomFilterFilter { .. } => "BloomFilterFilter",
            PhysicalOperator::UsingHashTable { .. } => "UsingHashTable",
            PhysicalOperator::HashTableLookup { .. } => "HashTableLookup",
            PhysicalOperator::Buffer { .. } => "Buffer",
            PhysicalOperator::Insert { .. } => "Insert",
            PhysicalOperator::Update { .. } => "Update",
            PhysicalOperator::Delete { .. } => "Delete",
            PhysicalOperator::SetOperation { .. } => "SetOperation",
        }
    }

    /// Child operators, in display order. Subqueries inside expressions are
    /// not included.
    pub fn children(&self) -> Vec<&PhysicalOperator> {
        match self {
            PhysicalOperator::IndexScan { .. }
            | PhysicalOperator::GroupScan { .. }
            | PhysicalOperator::FullTextScan { .. }
            | PhysicalOperator::Values { .. }
            | PhysicalOperator::HashTableLookup { .. } => Vec::new(),
            PhysicalOperator::Intersect { output, selector, .. } => vec![&**output, &**selector],
            PhysicalOperator::AncestorLookup { input, .. } | PhysicalOperator::BranchLookup { input, .. } => {
                input.iter().map(|i| &**i).collect()
            }
            PhysicalOperator::Product { first, branches, .. } => {
                let mut children = vec![&**first];
                children.extend(branches.iter());
                children
            }
            PhysicalOperator::MapJoin { outer, inner, .. } => vec![&**outer, &**inner],
            PhysicalOperator::UsingBloomFilter { loader, input, .. }
            | PhysicalOperator::UsingHashTable { loader, input, .. } => vec![&**loader, &**input],
            PhysicalOperator::SetOperation { left, right, .. } => vec![&**left, &**right],
            PhysicalOperator::Flatten { input, .. }
            | PhysicalOperator::Select { input, .. }
            | PhysicalOperator::Project { input, .. }
            | PhysicalOperator::Aggregate { input, .. }
            | PhysicalOperator::Distinct { input }
            | PhysicalOperator::Sort { input, .. }
            | PhysicalOperator::Limit { input, .. }
            | PhysicalOperator::OnlyIfEmpty { input }
            | PhysicalOperator::NullIfEmpty { input, .. }
            | PhysicalOperator::BloomFilterFilter { input, .. }
            | PhysicalOperator::Buffer { input }
            | PhysicalOperator::Insert { input, .. }
            | PhysicalOperator::Update { input, .. }
            | PhysicalOperator::Delete { input, .. } => vec![&**input],
        }
    }

    /// Names of the operators in the tree, preorder
    pub fn operator_names(&self) -> Vec<&'static str> {
        let mut names = vec![self.name()];
        for child in self.children() {
            names.extend(child.operator_names());
        }
        names
    }

    fn details(&self) -> String {
        match self {
            PhysicalOperator::IndexScan { index, range, ascending } => {
                let direction = if *ascending { "ASC" } else { "DESC" };
                format!("{}, {}, {}", index, format_range(range), direction)
            }
            PhysicalOperator::Intersect { comparison_fields, skip_scan, .. } => {
                if *skip_scan {
                    format!("compare {}, skip scan", comparison_fields)
                } else {
                    format!("compare {}", comparison_fields)
                }
            }
            PhysicalOperator::GroupScan { group, tables } => format!("group {}: {}", group, tables.join(", ")),
            PhysicalOperator::FullTextScan { index, query, limit } => match limit {
                Some(limit) => format!("{}, {}, LIMIT {}", index, query, limit),
                None => format!("{}, {}", index, query),
            },
            PhysicalOperator::AncestorLookup { descendant, ancestors, binding, .. } => {
                let mut details = format!("{} -> {}", descendant, ancestors.join(", "));
                if let Some(binding) = binding {
                    details.push_str(&format!(", bound {}", binding));
                }
                details
            }
            PhysicalOperator::BranchLookup { source, branch, tables, binding, .. } => {
                let mut details = format!("{} -> {}: {}", source, branch, tables.join(", "));
                if let Some(binding) = binding {
                    details.push_str(&format!(", bound {}", binding));
                }
                details
            }
            PhysicalOperator::Flatten { tables, join_types, .. } => {
                let mut details = tables.first().cloned().unwrap_or_default();
                for (table, join_type) in tables.iter().skip(1).zip(join_types) {
                    details.push_str(&format!(" {:?} {}", join_type, table));
                }
                details
            }
            PhysicalOperator::Product { ancestor, binding, .. } => match ancestor {
                Some(ancestor) => format!("{}, bound {}", ancestor, binding),
                None => format!("bound {}", binding),
            },
            PhysicalOperator::Select { condition, .. } => condition.to_string(),
            PhysicalOperator::Project { fields, .. } => join(fields),
            PhysicalOperator::Aggregate { group_by, aggregates, .. } => {
                let aggregates: Vec<String> = aggregates
                    .iter()
                    .map(|a| match &a.operand {
                        Some(operand) if a.distinct => format!("{}(DISTINCT {})", a.function, operand),
                        Some(operand) => format!("{}({})", a.function, operand),
                        None => format!("{}(*)", a.function),
                    })
                    .collect();
                if group_by.is_empty() {
                    aggregates.join(", ")
                } else {
                    format!("GROUP BY [{}]: {}", join(group_by), aggregates.join(", "))
                }
            }
            PhysicalOperator::Sort { keys, .. } => keys
                .iter()
                .map(|k| format!("{} {}", k.expression, if k.ascending { "ASC" } else { "DESC" }))
                .collect::<Vec<_>>()
                .join(", "),
            PhysicalOperator::Limit { offset, limit, .. } => match limit {
                Some(limit) => format!("OFFSET {} LIMIT {}", offset, limit),
                None => format!("OFFSET {}", offset),
            },
            PhysicalOperator::Values { rows } => {
                rows.iter().map(|r| format!("[{}]", join(r))).collect::<Vec<_>>().join(", ")
            }
            PhysicalOperator::MapJoin { binding, join_type, pipelined, .. } => {
                if *pipelined {
                    format!("{:?}, bound {}, pipelined", join_type, binding)
                } else {
                    format!("{:?}, bound {}", join_type, binding)
                }
            }
            PhysicalOperator::NullIfEmpty { width, .. } => format!("width {}", width),
            PhysicalOperator::UsingBloomFilter { keys, estimated_size, binding, .. } => {
                format!("[{}], size {}, bound {}", join(keys), estimated_size, binding)
            }
            PhysicalOperator::BloomFilterFilter { lookup, binding, .. }
            | PhysicalOperator::HashTableLookup { lookup, binding } => format!("[{}], bound {}", join(lookup), binding),
            PhysicalOperator::UsingHashTable { keys, binding, .. } => format!("[{}], bound {}", join(keys), binding),
            PhysicalOperator::Insert { table, row, .. } => format!("{} [{}]", table, join(row)),
            PhysicalOperator::Update { table, columns, .. } => {
                let sets: Vec<String> = columns.iter().map(|(c, e)| format!("{} = {}", c, e)).collect();
                format!("{} SET {}", table, sets.join(", "))
            }
            PhysicalOperator::Delete { table, .. } => table.clone(),
            PhysicalOperator::SetOperation { operation, all, .. } => {
                if *all {
                    format!("{:?} ALL", operation)
                } else {
                    format!("{:?}", operation)
                }
            }
            PhysicalOperator::Distinct { .. }
            | PhysicalOperator::OnlyIfEmpty { .. }
            | PhysicalOperator::Buffer { .. } => String::new(),
        }
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let details = self.details();
        if details.is_empty() {
            writeln!(f, "{:indent$}{}", "", self.name(), indent = depth * 2)?;
        } else {
            writeln!(f, "{:indent$}{}({})", "", self.name(), details, indent = depth * 2)?;
        }
        for child in self.children() {
            child.write_tree(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for PhysicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_tree(f, 0)
    }
}

fn join(expressions: &[Expr]) -> String {
    expressions.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
}

fn format_bound(bound: &Option<IndexBound<PhysicalOperator>>, open: &str, closed: &str) -> String {
    match bound {
        Some(bound) => format!("{}{}", if bound.inclusive { closed } else { open }, join(&bound.columns)),
        None => "UNBOUNDED".to_string(),
    }
}

fn format_range(range: &IndexKeyRange<PhysicalOperator>) -> String {
    if range.low.is_none() && range.high.is_none() {
        return "FULL".to_string();
    }
    let low = format_bound(&range.low, "(", "[");
    let high = match &range.high {
        Some(bound) => format!("{}{}", join(&bound.columns), if bound.inclusive { "]" } else { ")" }),
        None => "UNBOUNDED".to_string(),
    };
    if range.spatial {
        format!("BOX {}, {}", low, high)
    } else {
        format!("{}, {}", low, high)
    }
}

/// Builds `PhysicalOperator` trees, naming tables through the catalog
pub struct PlanOperatorFactory<'a> {
    catalog: &'a Catalog,
}

impl<'a> PlanOperatorFactory<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        PlanOperatorFactory { catalog }
    }

    fn table_name(&self, table: TableId) -> String {
        match self.catalog.table(table) {
            Ok(table) => table.name().to_string(),
            Err(_) => format!("table {}", table),
        }
    }

    fn table_names(&self, tables: &[TableId]) -> Vec<String> {
        tables.iter().map(|t| self.table_name(*t)).collect()
    }
}

impl OperatorFactory for PlanOperatorFactory<'_> {
    type Operator = PhysicalOperator;

    fn index_scan(&self, index: &Arc<Index>, range: IndexKeyRange<PhysicalOperator>, ascending: bool) -> PhysicalOperator {
        PhysicalOperator::IndexScan { index: index.name.clone(), range, ascending }
    }

    fn intersect(
        &self,
        output: PhysicalOperator,
        selector: PhysicalOperator,
        comparison_fields: usize,
        skip_scan: bool,
    ) -> PhysicalOperator {
        PhysicalOperator::Intersect {
            output: Box::new(output),
            selector: Box::new(selector),
            comparison_fields,
            skip_scan,
        }
    }

    fn group_scan(&self, group: GroupId, tables: Vec<TableId>) -> PhysicalOperator {
        PhysicalOperator::GroupScan { group, tables: self.table_names(&tables) }
    }

    fn full_text_scan(&self, index: &Arc<Index>, query: Expr, limit: Option<usize>) -> PhysicalOperator {
        PhysicalOperator::FullTextScan { index: index.name.clone(), query, limit }
    }

    fn ancestor_lookup(
        &self,
        input: Option<PhysicalOperator>,
        descendant: TableId,
        ancestors: Vec<TableId>,
        binding: Option<BindingPosition>,
        keep_input: bool,
        lookahead: u32,
    ) -> PhysicalOperator {
        PhysicalOperator::AncestorLookup {
            input: input.map(Box::new),
            descendant: self.table_name(descendant),
            ancestors: self.table_names(&ancestors),
            binding,
            keep_input,
            lookahead,
        }
    }

    fn branch_lookup(
        &self,
        input: Option<PhysicalOperator>,
        source: TableId,
        branch: TableId,
        tables: Vec<TableId>,
        binding: Option<BindingPosition>,
        keep_input: bool,
        lookahead: u32,
    ) -> PhysicalOperator {
        PhysicalOperator::BranchLookup {
            input: input.map(Box::new),
            source: self.table_name(source),
            branch: self.table_name(branch),
            tables: self.table_names(&tables),
            binding,
            keep_input,
            lookahead,
        }
    }

    fn flatten(&self, input: PhysicalOperator, tables: Vec<TableId>, join_types: Vec<JoinType>) -> PhysicalOperator {
        PhysicalOperator::Flatten { input: Box::new(input), tables: self.table_names(&tables), join_types }
    }

    fn product(
        &self,
        first: PhysicalOperator,
        branches: Vec<PhysicalOperator>,
        ancestor: Option<TableId>,
        binding: BindingPosition,
    ) -> PhysicalOperator {
        PhysicalOperator::Product {
            first: Box::new(first),
            branches,
            ancestor: ancestor.map(|t| self.table_name(t)),
            binding,
        }
    }

    fn select(&self, input: PhysicalOperator, condition: Expr) -> PhysicalOperator {
        PhysicalOperator::Select { input: Box::new(input), condition }
    }

    fn project(&self, input: PhysicalOperator, fields: Vec<Expr>) -> PhysicalOperator {
        PhysicalOperator::Project { input: Box::new(input), fields }
    }

    fn aggregate(
        &self,
        input: PhysicalOperator,
        group_by: Vec<Expr>,
        aggregates: Vec<AggregateSpec<PhysicalOperator>>,
    ) -> PhysicalOperator {
        PhysicalOperator::Aggregate { input: Box::new(input), group_by, aggregates }
    }

    fn distinct(&self, input: PhysicalOperator) -> PhysicalOperator {
        PhysicalOperator::Distinct { input: Box::new(input) }
    }

    fn sort(&self, input: PhysicalOperator, keys: Vec<SortKey<PhysicalOperator>>) -> PhysicalOperator {
        PhysicalOperator::Sort { input: Box::new(input), keys }
    }

    fn limit(&self, input: PhysicalOperator, offset: usize, limit: Option<usize>) -> PhysicalOperator {
        PhysicalOperator::Limit { input: Box::new(input), offset, limit }
    }

    fn values(&self, rows: Vec<Vec<Expr>>) -> PhysicalOperator {
        PhysicalOperator::Values { rows }
    }

    fn map_join(
        &self,
        outer: PhysicalOperator,
        inner: PhysicalOperator,
        binding: BindingPosition,
        join_type: JoinType,
        pipelined: bool,
    ) -> PhysicalOperator {
        PhysicalOperator::MapJoin { outer: Box::new(outer), inner: Box::new(inner), binding, join_type, pipelined }
    }

    fn only_if_empty(&self, input: PhysicalOperator) -> PhysicalOperator {
        PhysicalOperator::OnlyIfEmpty { input: Box::new(input) }
    }

    fn null_if_empty(&self, input: PhysicalOperator, width: usize) -> PhysicalOperator {
        PhysicalOperator::NullIfEmpty { input: Box::new(input), width }
    }

    fn using_bloom_filter(
        &self,
        loader: PhysicalOperator,
        input: PhysicalOperator,
        keys: Vec<Expr>,
        estimated_size: u64,
        binding: BindingPosition,
    ) -> PhysicalOperator {
        PhysicalOperator::UsingBloomFilter {
            loader: Box::new(loader),
            input: Box::new(input),
            keys,
            estimated_size,
            binding,
        }
    }

    fn bloom_filter_filter(&self, input: PhysicalOperator, lookup: Vec<Expr>, binding: BindingPosition) -> PhysicalOperator {
        PhysicalOperator::BloomFilterFilter { input: Box::new(input), lookup, binding }
    }

    fn using_hash_table(
        &self,
        loader: PhysicalOperator,
        input: PhysicalOperator,
        keys: Vec<Expr>,
        binding: BindingPosition,
    ) -> PhysicalOperator {
        PhysicalOperator::UsingHashTable { loader: Box::new(loader), input: Box::new(input), keys, binding }
    }

    fn hash_table_lookup(&self, lookup: Vec<Expr>, binding: BindingPosition) -> PhysicalOperator {
        PhysicalOperator::HashTableLookup { lookup, binding }
    }

    fn buffer(&self, input: PhysicalOperator) -> PhysicalOperator {
        PhysicalOperator::Buffer { input: Box::new(input) }
    }

    fn insert(&self, input: PhysicalOperator, table: TableId, row: Vec<Expr>) -> PhysicalOperator {
        PhysicalOperator::Insert { input: Box::new(input), table: self.table_name(table), row }
    }

    fn update(&self, input: PhysicalOperator, table: TableId, columns: Vec<(usize, Expr)>) -> PhysicalOperator {
        PhysicalOperator::Update { input: Box::new(input), table: self.table_name(table), columns }
    }

    fn delete(&self, input: PhysicalOperator, table: TableId) -> PhysicalOperator {
        PhysicalOperator::Delete { input: Box::new(input), table: self.table_name(table) }
    }

    fn set_operation(
        &self,
        left: PhysicalOperator,
        right: PhysicalOperator,
        operation: SetOperationType,
        all: bool,
    ) -> PhysicalOperator {
        PhysicalOperator::SetOperation { left: Box::new(left), right: Box::new(right), operation, all }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::executor::result::DataValue;
    use crate::query::planner::plan::ComparisonOp;

    #[test]
    fn test_display_nests_children() {
        let scan = PhysicalOperator::GroupScan { group: 1, tables: vec!["customers".to_string()] };
        let select = PhysicalOperator::Select {
            input: Box::new(scan),
            condition: PhysicalExpression::Comparison {
                op: ComparisonOp::Eq,
                left: Box::new(PhysicalExpression::Field { position: 0, ty: None }),
                right: Box::new(PhysicalExpression::Literal(DataValue::Integer(5))),
            },
        };
        let limit = PhysicalOperator::Limit { input: Box::new(select), offset: 0, limit: Some(1) };

        assert_eq!(
            limit.to_string(),
            "Limit(OFFSET 0 LIMIT 1)\n  Select(Field(0) == 5)\n    GroupScan(group 1: customers)\n"
        );
        assert_eq!(limit.operator_names(), vec!["Limit", "Select", "GroupScan"]);
    }

    #[test]
    fn test_display_index_range() {
        let scan = PhysicalOperator::IndexScan {
            index: "name_idx".to_string(),
            range: IndexKeyRange {
                low: Some(IndexBound { columns: vec![PhysicalExpression::Parameter { position: 0, ty: None }], inclusive: true }),
                high: None,
                spatial: false,
            },
            ascending: true,
        };
        assert_eq!(scan.to_string(), "IndexScan(name_idx, [$1, UNBOUNDED, ASC)\n");

        let full = PhysicalOperator::IndexScan {
            index: "name_idx".to_string(),
            range: IndexKeyRange::unbounded(),
            ascending: false,
        };
        assert_eq!(full.to_string(), "IndexScan(name_idx, FULL, DESC)\n");
    }
}
