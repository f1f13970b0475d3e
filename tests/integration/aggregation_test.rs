use anyhow::Result;
use bayundb_optimizer::query::executor::operators::PhysicalOperator;
use bayundb_optimizer::query::planner::plan::expression::Expression;
use bayundb_optimizer::query::planner::plan::node::PlanNodeKind;
use bayundb_optimizer::query::planner::plan::{ComparisonOp, ExpressionKind, PlanBuilder};
use bayundb_optimizer::query::planner::rules::AggregateMapper;
use bayundb_optimizer::{ImplicitAggregate, OptimizerConfig, QueryError};

#[path = "../common/mod.rs"]
mod common;

fn aggregate_functions(operator: &PhysicalOperator) -> Vec<String> {
    match common::find_operator(operator, "Aggregate") {
        Some(PhysicalOperator::Aggregate { aggregates, .. }) => {
            aggregates.iter().map(|a| a.function.clone()).collect()
        }
        _ => Vec::new(),
    }
}

#[test]
fn test_grouped_average_compiles_to_sum_and_count() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let (x, y) = (b.column(t, "x")?, b.column(t, "y")?);
    let agg = b.aggregate(t, vec![y.clone()]);
    let project = b.project(agg, vec![y, Expression::aggregate("AVG", Some(x), false)]);
    b.result_set(project, &["y", "avg"]);

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.operator.operator_names(), vec!["Project", "Aggregate", "Flatten", "GroupScan"]);
    assert_eq!(aggregate_functions(&plan.operator), vec!["SUM", "COUNT"]);
    let PhysicalOperator::Project { fields, .. } = &plan.operator else {
        panic!("expected a project");
    };
    assert_eq!(fields[0].to_string(), "Field(0)");
    assert!(fields[1].to_string().starts_with("divide("), "{}", fields[1]);
    let Some(PhysicalOperator::Aggregate { group_by, .. }) = common::find_operator(&plan.operator, "Aggregate") else {
        panic!("expected an aggregate");
    };
    assert_eq!(group_by.len(), 1);
    assert_eq!(group_by[0].to_string(), "Field(2)");
    Ok(())
}

#[test]
fn test_having_shares_aggregate_with_select_list() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let x = b.column(t, "x")?;
    let agg = b.aggregate(t, vec![]);
    let count = Expression::aggregate("COUNT", None, false);
    let having = b.select(agg, vec![Expression::compare(ComparisonOp::Gt, count.clone(), Expression::integer(1))]);
    let project = b.project(having, vec![count, Expression::aggregate("MAX", Some(x), false)]);
    b.result_set(project, &["c", "m"]);

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(aggregate_functions(&plan.operator), vec!["COUNT", "MAX"]);
    let PhysicalOperator::Project { fields, .. } = &plan.operator else {
        panic!("expected a project");
    };
    assert_eq!(fields[0].to_string(), "Field(0)");
    assert_eq!(fields[1].to_string(), "Field(1)");
    assert!(common::find_operator(&plan.operator, "Select").is_some());
    Ok(())
}

#[test]
fn test_variance_uses_internal_aggregates() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let x = b.column(t, "x")?;
    let agg = b.aggregate(t, vec![]);
    let project = b.project(agg, vec![Expression::aggregate("VAR_POP", Some(x), false)]);
    b.result_set(project, &["v"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(AggregateMapper)])?;

    let PlanNodeKind::AggregateSource { aggregates, .. } = graph.kind(agg) else {
        panic!("expected an aggregate source");
    };
    let functions: Vec<String> = aggregates
        .iter()
        .map(|a| match &a.kind {
            ExpressionKind::Aggregate(call) => call.function.clone(),
            _ => String::new(),
        })
        .collect();
    assert_eq!(functions, vec!["_VAR_SUM_2", "_VAR_SUM", "COUNT"]);
    let fields = common::project_fields(&graph, project)?;
    assert!(matches!(&fields[0].kind, ExpressionKind::Function { name, .. } if name == "_VAR_POP"));
    Ok(())
}

fn ungrouped_column_plan(catalog: &bayundb_optimizer::Catalog) -> Result<bayundb_optimizer::PlanGraph> {
    let mut b = PlanBuilder::new(catalog);
    let t = b.table("t", "t")?;
    let (y, z) = (b.column(t, "y")?, b.column(t, "z")?);
    let agg = b.aggregate(t, vec![y.clone()]);
    let project = b.project(agg, vec![y, z]);
    b.result_set(project, &["y", "z"]);
    Ok(b.build()?)
}

#[test]
fn test_ungrouped_column_needs_policy() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let error = common::compile(&catalog, ungrouped_column_plan(&catalog)?).expect_err("ungrouped column");
    assert!(matches!(
        error.downcast_ref::<QueryError>(),
        Some(QueryError::NoAggregateWithGroupBy(name)) if name == "t.z"
    ));

    let config = OptimizerConfig::default().with_implicit_aggregate(ImplicitAggregate::First);
    let plan = common::compile_with(&catalog, &config, ungrouped_column_plan(&catalog)?)?;
    assert_eq!(aggregate_functions(&plan.operator), vec!["FIRST"]);
    Ok(())
}

#[test]
fn test_aggregate_in_where_is_rejected() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let x = b.column(t, "x")?;
    let select = b.select(
        t,
        vec![Expression::equals(Expression::aggregate("SUM", Some(x.clone()), false), Expression::integer(3))],
    );
    let project = b.project(select, vec![x]);
    b.result_set(project, &["x"]);
    let result = common::apply_rules(&catalog, b.build()?, vec![Box::new(AggregateMapper)]);

    let error = result.expect_err("aggregate in WHERE");
    assert!(matches!(error.downcast_ref::<QueryError>(), Some(QueryError::AggregateInWhere(_))));
    Ok(())
}
