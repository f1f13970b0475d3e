use anyhow::Result;
use bayundb_optimizer::catalog::Catalog;
use bayundb_optimizer::query::executor::operators::{PhysicalExpression, PhysicalOperator, SubqueryKind};
use bayundb_optimizer::query::planner::plan::expression::Expression;
use bayundb_optimizer::query::planner::plan::node::PlanNodeKind;
use bayundb_optimizer::query::planner::plan::{JoinType, NodeId, PlanBuilder, PlanGraph};
use bayundb_optimizer::query::planner::rules::InConditionReverser;
use std::collections::BTreeSet;

#[path = "../common/mod.rs"]
mod common;

// orders.cid [NOT] IN (SELECT customers.cid FROM customers)
fn in_subquery_plan(catalog: &Catalog, negated: bool) -> Result<(PlanGraph, [NodeId; 3])> {
    let mut b = PlanBuilder::new(catalog);
    let o = b.table("orders", "o")?;
    let c = b.table("customers", "c")?;
    let (ocid, ccid) = (b.column(o, "cid")?, b.column(c, "cid")?);
    let any = b.in_subquery(ocid.clone(), c, ccid);
    let condition = if negated { Expression::not(any) } else { any };
    let select = b.select(o, vec![condition]);
    let project = b.project(select, vec![ocid]);
    b.result_set(project, &["cid"]);
    Ok((b.build()?, [o, c, select]))
}

#[test]
fn test_in_subquery_becomes_semi_join_with_derived_table() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let (graph, [o, _, select]) = in_subquery_plan(&catalog, false)?;
    let graph = common::apply_rules(&catalog, graph, vec![Box::new(InConditionReverser)])?;

    let join = graph.join(common::input_of(&graph, select)?)?;
    assert_eq!(join.join_type, JoinType::Semi);
    assert_eq!(join.left, o);
    let PlanNodeKind::SubquerySource { name, .. } = graph.kind(join.right) else {
        panic!("expected a derived table");
    };
    assert_eq!(name, "ANY");
    assert_eq!(join.conditions.len(), 1);
    Ok(())
}

#[test]
fn test_not_in_becomes_anti_join() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let (graph, [o, c, select]) = in_subquery_plan(&catalog, true)?;
    let graph = common::apply_rules(&catalog, graph, vec![Box::new(InConditionReverser)])?;

    let join = graph.join(common::input_of(&graph, select)?)?;
    assert_eq!(join.join_type, JoinType::Anti);
    assert_eq!((join.left, join.right), (o, c));
    assert_eq!(join.conditions[0].column_sources(), BTreeSet::from([o, c]));
    Ok(())
}

#[test]
fn test_correlated_exists_becomes_semi_join() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let c = b.table("customers", "c")?;
    let o = b.table("orders", "o")?;
    let (ccid, ocid) = (b.column(c, "cid")?, b.column(o, "cid")?);
    let inner = b.select(o, vec![Expression::equals(ocid, ccid.clone())]);
    let exists = b.exists(inner);
    let select = b.select(c, vec![exists]);
    let project = b.project(select, vec![ccid]);
    b.result_set(project, &["cid"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(InConditionReverser)])?;

    let join = graph.join(common::input_of(&graph, select)?)?;
    assert_eq!(join.join_type, JoinType::Semi);
    assert_eq!((join.left, join.right), (c, o));
    Ok(())
}

#[test]
fn test_limited_subquery_runs_per_row() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let o = b.table("orders", "o")?;
    let c = b.table("customers", "c")?;
    let (ocid, ccid) = (b.column(o, "cid")?, b.column(c, "cid")?);
    let limited = b.limit(c, 0, Some(3));
    let any = b.in_subquery(ocid.clone(), limited, ccid);
    let select = b.select(o, vec![any]);
    let project = b.project(select, vec![ocid]);
    b.result_set(project, &["cid"]);

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.operator.operator_names(), vec!["Project", "Select", "Flatten", "GroupScan"]);
    let Some(PhysicalOperator::Select { condition, .. }) = common::find_operator(&plan.operator, "Select") else {
        panic!("expected a select");
    };
    let PhysicalExpression::Subquery { kind, operator, binding } = condition else {
        panic!("expected a subquery condition, got {}", condition);
    };
    assert_eq!((*kind, *binding), (SubqueryKind::Any, 0));
    assert_eq!(operator.operator_names(), vec!["Project", "Limit", "Flatten", "GroupScan"]);
    // orders.cid comes from the row the subquery is run for
    let PhysicalOperator::Project { fields, .. } = operator.as_ref() else {
        panic!("expected a project inside the subquery");
    };
    assert_eq!(fields[0].to_string(), "Bound(0, 1) == Field(0)");
    Ok(())
}
