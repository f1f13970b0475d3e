use anyhow::Result;
use bayundb_optimizer::query::executor::operators::PhysicalOperator;
use bayundb_optimizer::query::planner::plan::expression::Expression;
use bayundb_optimizer::query::planner::plan::node::{DistinctState, PlanNodeKind};
use bayundb_optimizer::query::planner::plan::PlanBuilder;
use bayundb_optimizer::query::planner::rules::{AggregateMapper, ConstantFolder};
use bayundb_optimizer::DataValue;

#[path = "../common/mod.rs"]
mod common;

#[test]
fn test_false_where_compiles_to_no_rows() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let x = b.column(t, "x")?;
    let select = b.select(t, vec![Expression::equals(Expression::integer(1), Expression::integer(2))]);
    let project = b.project(select, vec![x]);
    b.result_set(project, &["x"]);

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.operator.operator_names(), vec!["Project", "Values"]);
    let PhysicalOperator::Project { input, fields } = &plan.operator else {
        panic!("expected a project");
    };
    assert_eq!(fields[0].to_string(), "NULL");
    assert!(matches!(input.as_ref(), PhysicalOperator::Values { rows } if rows.is_empty()));
    assert!(plan.affected_tables.is_empty());
    Ok(())
}

#[test]
fn test_count_over_no_rows_is_zero() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let select = b.select(t, vec![Expression::boolean(false)]);
    let agg = b.aggregate(select, vec![]);
    let project = b.project(agg, vec![Expression::aggregate("COUNT", None, false)]);
    b.result_set(project, &["c"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(AggregateMapper), Box::new(ConstantFolder)])?;

    let fields = common::project_fields(&graph, project)?;
    assert_eq!(fields[0].constant_value(), Some(&DataValue::Integer(0)));
    match graph.kind(common::input_of(&graph, project)?) {
        PlanNodeKind::ExpressionsSource { rows, .. } => assert_eq!(rows.len(), 1),
        other => panic!("expected a one-row source, got {}", other.name()),
    }
    Ok(())
}

#[test]
fn test_in_list_values_sorted_without_duplicates() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let x = b.column(t, "x")?;
    let values = [5, 3, 5, 4].into_iter().map(Expression::integer).collect();
    let in_list = b.in_list(x.clone(), values);
    let select = b.select(t, vec![in_list]);
    let project = b.project(select, vec![x]);
    b.result_set(project, &["x"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(ConstantFolder)])?;

    let source = graph
        .reachable(graph.root()?)
        .into_iter()
        .find(|id| matches!(graph.kind(*id), PlanNodeKind::ExpressionsSource { .. }))
        .expect("value list");
    let PlanNodeKind::ExpressionsSource { rows, distinct_state, .. } = graph.kind(source) else {
        unreachable!();
    };
    let values: Vec<_> = rows.iter().map(|r| r[0].constant_value().cloned()).collect();
    assert_eq!(
        values,
        vec![Some(DataValue::Integer(3)), Some(DataValue::Integer(4)), Some(DataValue::Integer(5))]
    );
    assert_eq!(*distinct_state, DistinctState::Distinct);
    Ok(())
}

#[test]
fn test_in_list_of_one_value_is_equality() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let x = b.column(t, "x")?;
    let in_list = b.in_list(x.clone(), vec![Expression::integer(7)]);
    let select = b.select(t, vec![in_list]);
    let project = b.project(select, vec![x.clone()]);
    b.result_set(project, &["x"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(ConstantFolder)])?;

    match graph.kind(select) {
        PlanNodeKind::Select { conditions, .. } => {
            assert_eq!(conditions, &vec![Expression::equals(x, Expression::integer(7))]);
        }
        other => panic!("expected a select, got {}", other.name()),
    }
    Ok(())
}

#[test]
fn test_boolean_and_function_folding() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let (x, y) = (b.column(t, "x")?, b.column(t, "y")?);
    let test = Expression::equals(y.clone(), Expression::integer(1));
    let project = b.project(
        t,
        vec![
            Expression::and(test.clone(), Expression::boolean(true)),
            Expression::or(Expression::boolean(true), test.clone()),
            Expression::function("isNull", vec![x]),
            Expression::function("plus", vec![Expression::integer(40), Expression::integer(2)]),
            Expression::function("coalesce", vec![Expression::null(), y]),
        ],
    );
    b.result_set(project, &["a", "b", "c", "d", "e"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(ConstantFolder)])?;

    let fields = common::project_fields(&graph, project)?;
    assert_eq!(fields[0], test);
    assert!(fields[1].is_true());
    // x is declared NOT NULL
    assert!(fields[2].is_false());
    assert_eq!(fields[3].constant_value(), Some(&DataValue::Integer(42)));
    assert!(!fields[4].is_constant());
    Ok(())
}

#[test]
fn test_division_by_zero_stays_for_execution() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let divide = Expression::function("divide", vec![Expression::integer(7), Expression::integer(0)]);
    let project = b.project(t, vec![divide.clone()]);
    b.result_set(project, &["d"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(ConstantFolder)])?;

    assert_eq!(common::project_fields(&graph, project)?[0], divide);
    Ok(())
}
