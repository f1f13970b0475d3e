use anyhow::Result;
use bayundb_optimizer::catalog::Catalog;
use bayundb_optimizer::query::executor::operators::PhysicalOperator;
use bayundb_optimizer::query::planner::plan::expression::Expression;
use bayundb_optimizer::query::planner::plan::{ComparisonOp, JoinType, PlanBuilder, PlanGraph};
use bayundb_optimizer::query::planner::rules::OuterJoinPromoter;

#[path = "../common/mod.rs"]
mod common;

// customers LEFT JOIN orders with `filter` over orders.oid and orders.odate
// in WHERE
fn left_join_plan(catalog: &Catalog, filter: impl FnOnce(Expression, Expression) -> Expression) -> Result<PlanGraph> {
    let mut b = PlanBuilder::new(catalog);
    let c = b.table("customers", "c")?;
    let o = b.table("orders", "o")?;
    let (ccid, ocid, oid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
    let odate = b.column(o, "odate")?;
    let join = b.join(c, o, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
    let select = b.select(join, vec![filter(oid, odate)]);
    let project = b.project(select, vec![ccid]);
    b.result_set(project, &["cid"]);
    Ok(b.build()?)
}

fn greater(left: Expression, value: i64) -> Expression {
    Expression::compare(ComparisonOp::Gt, left, Expression::integer(value))
}

fn flatten_join_types(operator: &PhysicalOperator) -> Vec<JoinType> {
    match common::find_operator(operator, "Flatten") {
        Some(PhysicalOperator::Flatten { join_types, .. }) => join_types.clone(),
        _ => Vec::new(),
    }
}

#[test]
fn test_null_rejecting_where_makes_join_inner() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let plan = common::compile(&catalog, left_join_plan(&catalog, |oid, _| greater(oid, 5))?)?;
    assert_eq!(flatten_join_types(&plan.operator), vec![JoinType::Inner]);
    Ok(())
}

#[test]
fn test_is_null_check_keeps_join_outer() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let graph = left_join_plan(&catalog, |oid, odate| {
        Expression::or(greater(oid, 5), Expression::function("isNull", vec![odate]))
    })?;
    let plan = common::compile(&catalog, graph)?;
    assert_eq!(flatten_join_types(&plan.operator), vec![JoinType::Left]);
    Ok(())
}

#[test]
fn test_cross_group_left_join_pads_inner_side() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let c = b.table("customers", "c")?;
    let t = b.table("t", "t")?;
    let (ccid, tx, tz) = (b.column(c, "cid")?, b.column(t, "x")?, b.column(t, "z")?);
    let join = b.join(c, t, JoinType::Left, vec![Expression::equals(ccid.clone(), tx)]);
    let project = b.project(join, vec![ccid, tz]);
    b.result_set(project, &["cid", "z"]);

    let plan = common::compile(&catalog, b.build()?)?;
    let Some(PhysicalOperator::MapJoin { inner, join_type, .. }) = common::find_operator(&plan.operator, "MapJoin") else {
        panic!("expected a map join");
    };
    assert_eq!(*join_type, JoinType::Left);
    let PhysicalOperator::NullIfEmpty { input, width } = inner.as_ref() else {
        panic!("expected null padding on the inner side, got {}", inner.name());
    };
    assert_eq!(*width, 4);
    assert!(matches!(input.as_ref(), PhysicalOperator::Select { .. }));

    // customers.cid then t.z after the two customers columns
    let PhysicalOperator::Project { fields, .. } = &plan.operator else {
        panic!("expected a project");
    };
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    assert_eq!(fields, vec!["Field(0)", "Field(5)"]);
    let nullable = plan.result_columns[1].ty.as_ref().map(|t| t.nullable);
    assert_eq!(nullable, Some(true));
    Ok(())
}

#[test]
fn test_full_join_loses_optional_side() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let c = b.table("customers", "c")?;
    let o = b.table("orders", "o")?;
    let (ccid, ocid, odate) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "odate")?);
    let join = b.join(c, o, JoinType::Full, vec![Expression::equals(ccid.clone(), ocid)]);
    let not_null = Expression::not(Expression::function("isNull", vec![odate]));
    let select = b.select(join, vec![not_null]);
    let project = b.project(select, vec![ccid]);
    b.result_set(project, &["cid"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(OuterJoinPromoter)])?;

    assert_eq!(graph.join(join)?.join_type, JoinType::Right);
    Ok(())
}

#[test]
fn test_nested_left_joins_promote_together() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let c = b.table("customers", "c")?;
    let o = b.table("orders", "o")?;
    let i = b.table("items", "i")?;
    let (ccid, ocid, ooid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
    let (ioid, quan) = (b.column(i, "oid")?, b.column(i, "quan")?);
    let inner = b.join(o, i, JoinType::Left, vec![Expression::equals(ooid, ioid)]);
    let outer = b.join(c, inner, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
    let select = b.select(outer, vec![greater(quan, 1)]);
    let project = b.project(select, vec![ccid]);
    b.result_set(project, &["cid"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(OuterJoinPromoter)])?;

    assert_eq!(graph.join(outer)?.join_type, JoinType::Inner);
    assert_eq!(graph.join(inner)?.join_type, JoinType::Inner);
    Ok(())
}
