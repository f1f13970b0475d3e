// Plan Builder
//
// Lowers a logical description of a statement into a `PlanGraph`: the shape
// the SQL front end hands to the optimizer. Used by tests, benchmarks and
// embedders that construct plans directly.

use super::expression::{ComparisonOp, Expression, ExpressionKind};
use super::node::{
    DistinctState, JoinNode, JoinType, Ordering, PlanNodeKind, ResultField, TableSource, UpdateColumn,
};
use super::{NodeId, PlanGraph};
use crate::catalog::Catalog;
use crate::query::executor::result::{QueryError, QueryResult};

pub struct PlanBuilder<'a> {
    graph: PlanGraph,
    catalog: &'a Catalog,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        PlanBuilder { graph: PlanGraph::new(), catalog }
    }

    pub fn graph(&self) -> &PlanGraph {
        &self.graph
    }

    /// For adding physical nodes the builder has no shorthand for
    pub fn graph_mut(&mut self) -> &mut PlanGraph {
        &mut self.graph
    }

    /// A reference to a catalog table under a correlation name
    pub fn table(&mut self, table: &str, alias: &str) -> QueryResult<NodeId> {
        let table = self
            .catalog
            .table_by_name(table)
            .ok_or_else(|| QueryError::CatalogError(format!("Table '{}' not found", table)))?
            .clone();
        Ok(self.graph.add(PlanNodeKind::TableSource(TableSource::new(table, alias))))
    }

    /// A typed reference to a column of a table source
    pub fn column(&self, source: NodeId, column: &str) -> QueryResult<Expression> {
        let table_source = self.graph.table_source(source)?;
        let position = table_source.table.get_column_index(column).ok_or_else(|| {
            QueryError::CatalogError(format!("Column '{}.{}' not found", table_source.name, column))
        })?;
        let ty = table_source.table.columns()[position].data_type().clone();
        Ok(Expression::column(source, position, format!("{}.{}", table_source.name, column)).with_type(ty))
    }

    /// A reference to the `position`th field of a projection, aggregate
    /// output or derived table
    pub fn field(&self, source: NodeId, position: usize, name: &str) -> Expression {
        let ty = match self.graph.kind(source) {
            PlanNodeKind::Project { fields, .. } => fields.get(position).and_then(|f| f.ty.clone()),
            _ => None,
        };
        let column = Expression::column(source, position, name);
        match ty {
            Some(ty) => column.with_type(ty),
            None => column,
        }
    }

    pub fn join(&mut self, left: NodeId, right: NodeId, join_type: JoinType, conditions: Vec<Expression>) -> NodeId {
        self.graph.add(PlanNodeKind::Join(JoinNode::new(left, right, join_type).with_conditions(conditions)))
    }

    pub fn select(&mut self, input: NodeId, conditions: Vec<Expression>) -> NodeId {
        self.graph.add(PlanNodeKind::Select { input, conditions })
    }

    pub fn project(&mut self, input: NodeId, fields: Vec<Expression>) -> NodeId {
        self.graph.add(PlanNodeKind::Project { input, fields })
    }

    /// An aggregation over `input`; its aggregate list is filled in by
    /// aggregate mapping
    pub fn aggregate(&mut self, input: NodeId, group_by: Vec<Expression>) -> NodeId {
        self.graph.add(PlanNodeKind::AggregateSource { input, group_by, aggregates: Vec::new() })
    }

    pub fn sort(&mut self, input: NodeId, orderings: Vec<(Expression, bool)>) -> NodeId {
        let orderings = orderings
            .into_iter()
            .map(|(expression, ascending)| Ordering { expression, ascending })
            .collect();
        self.graph.add(PlanNodeKind::Sort { input, orderings })
    }

    pub fn limit(&mut self, input: NodeId, offset: usize, limit: Option<usize>) -> NodeId {
        self.graph.add(PlanNodeKind::Limit { input, offset, limit })
    }

    pub fn distinct(&mut self, input: NodeId) -> NodeId {
        self.graph.add(PlanNodeKind::Distinct { input })
    }

    pub fn union(&mut self, left: NodeId, right: NodeId, all: bool) -> NodeId {
        self.graph.add(PlanNodeKind::SetOperation {
            left,
            right,
            operation: super::node::SetOperationType::Union,
            all,
        })
    }

    /// A literal row list (`VALUES`)
    pub fn values(&mut self, rows: Vec<Vec<Expression>>) -> NodeId {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let distinct_state = if rows.iter().flatten().all(|e| e.is_fixed()) {
            DistinctState::HasParameters
        } else {
            DistinctState::HasExpressions
        };
        self.graph.add(PlanNodeKind::ExpressionsSource { rows, distinct_state, field_types: vec![None; width] })
    }

    pub fn null_source(&mut self) -> NodeId {
        self.graph.add(PlanNodeKind::NullSource)
    }

    /// A nested query, referenced from expressions rather than consumed as
    /// an input
    pub fn subquery(&mut self, input: NodeId) -> NodeId {
        let subquery = self.graph.add(PlanNodeKind::Subquery { input });
        self.graph.set_output(subquery, None);
        subquery
    }

    /// A nested query used as a derived table
    pub fn subquery_source(&mut self, input: NodeId, name: &str) -> NodeId {
        let subquery = self.graph.add(PlanNodeKind::Subquery { input });
        self.graph.add(PlanNodeKind::SubquerySource { input: subquery, name: name.to_string() })
    }

    /// `left IN (values...)`
    pub fn in_list(&mut self, left: Expression, values: Vec<Expression>) -> Expression {
        let rows = values.into_iter().map(|v| vec![v]).collect();
        let source = self.values(rows);
        let field = Expression::column(source, 0, "VALUES[0]");
        let test = Expression::compare(ComparisonOp::Eq, left, field);
        let project = self.project(source, vec![test]);
        let subquery = self.subquery(project);
        Expression::any(subquery)
    }

    /// `left IN (SELECT right FROM input)`
    pub fn in_subquery(&mut self, left: Expression, input: NodeId, right: Expression) -> Expression {
        let test = Expression::compare(ComparisonOp::Eq, left, right);
        let project = self.project(input, vec![test]);
        let subquery = self.subquery(project);
        Expression::any(subquery)
    }

    /// `EXISTS (SELECT ... FROM input)`
    pub fn exists(&mut self, input: NodeId) -> Expression {
        let subquery = self.subquery(input);
        Expression::exists(subquery)
    }

    /// A scalar subquery; `input` should project one field
    pub fn scalar_subquery(&mut self, input: NodeId) -> Expression {
        let subquery = self.subquery(input);
        Expression::new(ExpressionKind::SubqueryValue(subquery))
    }

    /// Finish a query with its result columns and make it the root
    pub fn result_set(&mut self, input: NodeId, names: &[&str]) -> NodeId {
        let fields = names.iter().map(|n| ResultField { name: n.to_string(), ty: None }).collect();
        let root = self.graph.add(PlanNodeKind::ResultSet { input, fields });
        self.graph.set_root(root);
        root
    }

    /// `INSERT INTO table (columns) <input>`
    pub fn insert(&mut self, input: NodeId, table: &str, columns: &[&str]) -> QueryResult<NodeId> {
        let table = self
            .catalog
            .table_by_name(table)
            .ok_or_else(|| QueryError::CatalogError(format!("Table '{}' not found", table)))?
            .clone();
        let mut target_columns = Vec::with_capacity(columns.len());
        for name in columns {
            target_columns.push(table.get_column_index(name).ok_or_else(|| {
                QueryError::CatalogError(format!("Column '{}.{}' not found", table.name(), name))
            })?);
        }
        let root = self.graph.add(PlanNodeKind::Insert { input, table, target_columns });
        self.graph.set_root(root);
        Ok(root)
    }

    /// `UPDATE target SET ... <input>`; `target` is the table source the
    /// input reads the rows to change from
    pub fn update(&mut self, input: NodeId, target: NodeId, sets: Vec<(&str, Expression)>) -> QueryResult<NodeId> {
        let table = self.graph.table_source(target)?.table.clone();
        let mut update_columns = Vec::with_capacity(sets.len());
        for (name, expression) in sets {
            let column = table.get_column_index(name).ok_or_else(|| {
                QueryError::CatalogError(format!("Column '{}.{}' not found", table.name(), name))
            })?;
            update_columns.push(UpdateColumn { column, expression });
        }
        let root = self.graph.add(PlanNodeKind::Update { input, table, target, update_columns });
        self.graph.set_root(root);
        Ok(root)
    }

    pub fn delete(&mut self, input: NodeId, target: NodeId) -> QueryResult<NodeId> {
        let table = self.graph.table_source(target)?.table.clone();
        let root = self.graph.add(PlanNodeKind::Delete { input, table, target });
        self.graph.set_root(root);
        Ok(root)
    }

    pub fn build(self) -> QueryResult<PlanGraph> {
        self.graph.root()?;
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogBuilder;
    use crate::query::types::TypeInstance;

    fn catalog() -> QueryResult<Catalog> {
        let mut builder = CatalogBuilder::new();
        builder.create_table(
            "t",
            &[("id", TypeInstance::integer(false)), ("name", TypeInstance::varchar(20, true))],
            &["id"],
        )?;
        Ok(builder.build())
    }

    #[test]
    fn test_build_simple_query() -> QueryResult<()> {
        let catalog = catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t = b.table("t", "t")?;
        let id = b.column(t, "id")?;
        assert_eq!(id.ty, Some(TypeInstance::integer(false)));
        let select = b.select(t, vec![Expression::equals(id.clone(), Expression::integer(1))]);
        let project = b.project(select, vec![b.column(t, "name")?]);
        let root = b.result_set(project, &["name"]);
        let graph = b.build()?;
        assert_eq!(graph.root()?, root);
        assert_eq!(graph.output(t), Some(select));
        assert_eq!(
            graph.describe(root),
            "ResultSet\n  Project[t.name]\n    Select[t.id == 1]\n      TableSource(t)\n"
        );
        Ok(())
    }

    #[test]
    fn test_in_list_shape() -> QueryResult<()> {
        let catalog = catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let t = b.table("t", "t")?;
        let id = b.column(t, "id")?;
        let any = b.in_list(id, vec![Expression::integer(1), Expression::integer(2)]);
        let subquery = match any.kind {
            ExpressionKind::Any(subquery) => subquery,
            _ => unreachable!(),
        };
        let graph = b.graph();
        assert_eq!(graph.output(subquery), None);
        let project = graph.inputs(subquery)[0];
        assert!(matches!(graph.kind(project), PlanNodeKind::Project { fields, .. } if fields.len() == 1));
        assert!(matches!(
            graph.kind(graph.inputs(project)[0]),
            PlanNodeKind::ExpressionsSource { rows, distinct_state: DistinctState::HasParameters, .. } if rows.len() == 2
        ));
        assert!(matches!(b.table("missing", "m"), Err(QueryError::CatalogError(_))));
        Ok(())
    }
}
