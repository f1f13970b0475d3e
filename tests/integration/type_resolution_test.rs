use anyhow::Result;
use bayundb_optimizer::query::planner::plan::expression::Expression;
use bayundb_optimizer::query::planner::plan::node::PlanNodeKind;
use bayundb_optimizer::query::planner::plan::{ExpressionKind, JoinType, PlanBuilder};
use bayundb_optimizer::query::planner::rules::TypeResolver;
use bayundb_optimizer::{DataValue, QueryError, TypeClass, TypeInstance};

#[path = "../common/mod.rs"]
mod common;

#[test]
fn test_result_columns_carry_outer_join_nullability() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let c = b.table("customers", "c")?;
    let o = b.table("orders", "o")?;
    let (ccid, ocid, oid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
    let join = b.join(c, o, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
    let project = b.project(join, vec![oid, ccid]);
    b.result_set(project, &["oid", "cid"]);

    let plan = common::compile(&catalog, b.build()?)?;
    let types: Vec<Option<(TypeClass, bool)>> = plan
        .result_columns
        .iter()
        .map(|f| f.ty.as_ref().map(|t| (t.class, t.nullable)))
        .collect();
    assert_eq!(types, vec![Some((TypeClass::Integer, true)), Some((TypeClass::Integer, false))]);
    Ok(())
}

#[test]
fn test_literal_takes_column_type() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let (x, z) = (b.column(t, "x")?, b.column(t, "z")?);
    let select = b.select(t, vec![Expression::equals(z.clone(), Expression::integer(5))]);
    let project = b.project(select, vec![x]);
    b.result_set(project, &["x"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(TypeResolver)])?;

    let PlanNodeKind::Select { conditions, .. } = graph.kind(select) else {
        panic!("expected a select");
    };
    let ExpressionKind::Comparison { left, right, .. } = &conditions[0].kind else {
        panic!("expected a comparison, got {}", conditions[0]);
    };
    assert_eq!(left.as_ref(), &z);
    assert_eq!(right.constant_value(), Some(&DataValue::Text("5".to_string())));
    Ok(())
}

#[test]
fn test_parameters_unify_across_uses() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let (x, y) = (b.column(t, "x")?, b.column(t, "y")?);
    let select = b.select(t, vec![Expression::equals(x, Expression::parameter(0))]);
    let project = b.project(select, vec![Expression::function("plus", vec![Expression::parameter(1), y])]);
    b.result_set(project, &["sum"]);

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.parameter_types.len(), 2);
    for parameter in &plan.parameter_types {
        let ty = parameter.as_ref().expect("parameter type");
        assert_eq!(ty.class, TypeClass::Integer);
    }
    Ok(())
}

#[test]
fn test_impossible_cast_is_rejected() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let o = b.table("orders", "o")?;
    let odate = b.column(o, "odate")?;
    let project = b.project(o, vec![Expression::cast(odate, TypeInstance::boolean(true))]);
    b.result_set(project, &["b"]);

    let error = common::compile(&catalog, b.build()?).expect_err("no cast from date");
    assert!(matches!(error.downcast_ref::<QueryError>(), Some(QueryError::NoSuchCast { .. })));
    Ok(())
}

#[test]
fn test_unknown_function_is_rejected() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let x = b.column(t, "x")?;
    let project = b.project(t, vec![Expression::function("frobnicate", vec![x])]);
    b.result_set(project, &["f"]);

    let error = common::compile(&catalog, b.build()?).expect_err("unknown function");
    assert!(matches!(error.downcast_ref::<QueryError>(), Some(QueryError::NoSuchFunction { .. })));
    Ok(())
}

#[test]
fn test_insert_values_cast_to_column_types() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let values = b.values(vec![vec![Expression::integer(1), Expression::integer(2)]]);
    b.insert(values, "t", &["x", "z"])?;
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(TypeResolver)])?;

    let PlanNodeKind::ExpressionsSource { rows, field_types, .. } = graph.kind(values) else {
        panic!("expected a value list");
    };
    assert_eq!(rows[0][0].constant_value(), Some(&DataValue::Integer(1)));
    assert_eq!(rows[0][1].constant_value(), Some(&DataValue::Text("2".to_string())));
    assert_eq!(field_types[1].as_ref().map(|t| t.class), Some(TypeClass::Varchar));
    Ok(())
}
