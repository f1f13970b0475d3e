use anyhow::Result;
use bayundb_optimizer::query::executor::operators::PhysicalOperator;
use bayundb_optimizer::query::planner::plan::expression::Expression;
use bayundb_optimizer::query::planner::plan::{JoinType, PlanBuilder};
use bayundb_optimizer::{OptimizerConfig, TypeClass};
use std::collections::BTreeSet;

#[path = "../common/mod.rs"]
mod common;

#[test]
fn test_same_group_join_reads_one_group_scan() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let c = b.table("customers", "c")?;
    let o = b.table("orders", "o")?;
    let (ccid, ocid) = (b.column(c, "cid")?, b.column(o, "cid")?);
    let (name, oid) = (b.column(c, "name")?, b.column(o, "oid")?);
    let join = b.join(c, o, JoinType::Inner, vec![Expression::equals(ccid, ocid)]);
    let project = b.project(join, vec![name, oid]);
    b.result_set(project, &["name", "oid"]);

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.operator.operator_names(), vec!["Project", "Flatten", "GroupScan"]);

    let PhysicalOperator::Project { input, fields } = &plan.operator else {
        panic!("expected a project at the top, got {}", plan.operator.name());
    };
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    assert_eq!(fields, vec!["Field(1)", "Field(2)"]);
    let PhysicalOperator::Flatten { tables, join_types, .. } = input.as_ref() else {
        panic!("expected a flatten under the project");
    };
    assert_eq!(tables, &vec!["customers".to_string(), "orders".to_string()]);
    assert_eq!(join_types, &vec![JoinType::Inner]);

    let names: Vec<&str> = plan.result_columns.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["name", "oid"]);
    let expected = BTreeSet::from([common::table_id(&catalog, "customers")?, common::table_id(&catalog, "orders")?]);
    assert_eq!(plan.affected_tables, expected);
    Ok(())
}

#[test]
fn test_cross_group_join_becomes_map_join() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let c = b.table("customers", "c")?;
    let t = b.table("t", "t")?;
    let (ccid, tx) = (b.column(c, "cid")?, b.column(t, "x")?);
    let join = b.join(c, t, JoinType::Inner, vec![]);
    let select = b.select(join, vec![Expression::equals(ccid.clone(), tx)]);
    let project = b.project(select, vec![ccid]);
    b.result_set(project, &["cid"]);

    let plan = common::compile(&catalog, b.build()?)?;
    let names = plan.operator.operator_names();
    assert_eq!(names[0], "Project");
    assert_eq!(names[1], "MapJoin");
    assert_eq!(names.iter().filter(|n| **n == "GroupScan").count(), 2);

    let map_join = common::find_operator(&plan.operator, "MapJoin").expect("map join");
    let PhysicalOperator::MapJoin { inner, binding, join_type, pipelined, .. } = map_join else {
        unreachable!();
    };
    assert_eq!((*binding, *join_type, *pipelined), (0, JoinType::Inner, false));
    let PhysicalOperator::Select { condition, .. } = inner.as_ref() else {
        panic!("expected the join condition on the inner side, got {}", inner.name());
    };
    // customers.cid comes from the bound outer row, t.x from the inner one
    let condition = condition.to_string();
    assert!(condition.contains("Bound(0, 0)"), "{}", condition);
    assert!(condition.contains("Field(1)"), "{}", condition);
    Ok(())
}

#[test]
fn test_pipelined_map_join_when_enabled() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let c = b.table("customers", "c")?;
    let t = b.table("t", "t")?;
    let (ccid, tx) = (b.column(c, "cid")?, b.column(t, "x")?);
    let join = b.join(c, t, JoinType::Inner, vec![]);
    let select = b.select(join, vec![Expression::equals(ccid.clone(), tx)]);
    let project = b.project(select, vec![ccid]);
    b.result_set(project, &["cid"]);

    let config = OptimizerConfig::default().with_map_enabled(true);
    let plan = common::compile_with(&catalog, &config, b.build()?)?;
    let map_join = common::find_operator(&plan.operator, "MapJoin").expect("map join");
    assert!(matches!(map_join, PhysicalOperator::MapJoin { pipelined: true, .. }));
    Ok(())
}

#[test]
fn test_sort_and_limit_keep_their_place() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let x = b.column(t, "x")?;
    let sort = b.sort(t, vec![(x.clone(), false)]);
    let limit = b.limit(sort, 5, Some(10));
    let project = b.project(limit, vec![x]);
    b.result_set(project, &["x"]);

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.operator.operator_names(), vec!["Project", "Limit", "Sort", "Flatten", "GroupScan"]);
    let sort = common::find_operator(&plan.operator, "Sort").expect("sort");
    let PhysicalOperator::Sort { keys, .. } = sort else {
        unreachable!();
    };
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].expression.to_string(), "Field(1)");
    assert!(!keys[0].ascending);
    let limit = common::find_operator(&plan.operator, "Limit").expect("limit");
    assert!(matches!(limit, PhysicalOperator::Limit { offset: 5, limit: Some(10), .. }));
    Ok(())
}

#[test]
fn test_parameter_types_are_reported() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let (x, z) = (b.column(t, "x")?, b.column(t, "z")?);
    let select = b.select(t, vec![Expression::equals(x, Expression::parameter(0))]);
    let project = b.project(select, vec![z]);
    b.result_set(project, &["z"]);

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.parameter_types.len(), 1);
    let ty = plan.parameter_types[0].as_ref().expect("parameter type");
    assert_eq!(ty.class, TypeClass::Integer);

    let select = common::find_operator(&plan.operator, "Select").expect("select");
    let PhysicalOperator::Select { condition, .. } = select else {
        unreachable!();
    };
    assert_eq!(condition.to_string(), "Field(1) == $1");
    let result = plan.result_columns[0].ty.as_ref().expect("result type");
    assert_eq!(result.class, TypeClass::Varchar);
    Ok(())
}

#[test]
fn test_unknown_table_is_a_catalog_error() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let error = b.table("nowhere", "n").expect_err("no such table");
    assert!(error.to_string().contains("nowhere"));
    Ok(())
}
