use anyhow::Result;
use bayundb_optimizer::catalog::Catalog;
use bayundb_optimizer::query::executor::operators::PhysicalOperator;
use bayundb_optimizer::query::planner::plan::expression::Expression;
use bayundb_optimizer::query::planner::plan::{JoinType, NodeId, PlanBuilder, PlanGraph};
use bayundb_optimizer::query::planner::rules::GroupJoinFinder;
use bayundb_optimizer::QueryError;

#[path = "../common/mod.rs"]
mod common;

// items, customers and orders listed out of order, joined in WHERE
fn coi_where_plan(catalog: &Catalog) -> Result<(PlanGraph, NodeId)> {
    let mut b = PlanBuilder::new(catalog);
    let i = b.table("items", "i")?;
    let c = b.table("customers", "c")?;
    let o = b.table("orders", "o")?;
    let (ccid, ocid) = (b.column(c, "cid")?, b.column(o, "cid")?);
    let (ooid, ioid) = (b.column(o, "oid")?, b.column(i, "oid")?);
    let sku = b.column(i, "sku")?;
    let inner = b.join(i, c, JoinType::Inner, vec![]);
    let join = b.join(inner, o, JoinType::Inner, vec![]);
    let select = b.select(join, vec![Expression::equals(ccid.clone(), ocid), Expression::equals(ioid, ooid)]);
    let project = b.project(select, vec![ccid, sku]);
    b.result_set(project, &["cid", "sku"]);
    Ok((b.build()?, project))
}

#[test]
fn test_where_joins_flatten_whole_hierarchy() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let (graph, _) = coi_where_plan(&catalog)?;
    let plan = common::compile(&catalog, graph)?;

    assert_eq!(plan.operator.operator_names(), vec!["Project", "Flatten", "GroupScan"]);
    let PhysicalOperator::Project { input, fields } = &plan.operator else {
        panic!("expected a project");
    };
    // customers (2 columns) and orders (3 columns) come before items
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    assert_eq!(fields, vec!["Field(0)", "Field(7)"]);
    let PhysicalOperator::Flatten { tables, join_types, .. } = input.as_ref() else {
        panic!("expected a flatten");
    };
    assert_eq!(tables, &vec!["customers".to_string(), "orders".to_string(), "items".to_string()]);
    assert_eq!(join_types, &vec![JoinType::Inner, JoinType::Inner]);
    assert_eq!(plan.affected_tables.len(), 3);
    Ok(())
}

#[test]
fn test_left_join_inside_group_keeps_join_type() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let c = b.table("customers", "c")?;
    let o = b.table("orders", "o")?;
    let (ccid, ocid, oid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
    let join = b.join(c, o, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
    let project = b.project(join, vec![ccid, oid]);
    b.result_set(project, &["cid", "oid"]);

    let plan = common::compile(&catalog, b.build()?)?;
    let flatten = common::find_operator(&plan.operator, "Flatten").expect("flatten");
    let PhysicalOperator::Flatten { tables, join_types, .. } = flatten else {
        unreachable!();
    };
    assert_eq!(tables.len(), 2);
    assert_eq!(join_types, &vec![JoinType::Left]);
    assert!(common::find_operator(&plan.operator, "MapJoin").is_none());
    Ok(())
}

#[test]
fn test_groups_ordered_by_name() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    let o = b.table("orders", "o")?;
    let c = b.table("customers", "c")?;
    let (ccid, ocid) = (b.column(c, "cid")?, b.column(o, "cid")?);
    let inner = b.join(t, o, JoinType::Inner, vec![]);
    let join = b.join(inner, c, JoinType::Inner, vec![]);
    let select = b.select(join, vec![Expression::equals(ocid, ccid.clone())]);
    let project = b.project(select, vec![ccid]);
    b.result_set(project, &["cid"]);
    let graph = common::apply_rules(&catalog, b.build()?, vec![Box::new(GroupJoinFinder)])?;

    let top = graph.join(common::input_of(&graph, project)?)?;
    assert_eq!(graph.tree(top.left)?.tables(), vec![c, o]);
    assert_eq!(graph.tree(top.right)?.tables(), vec![t]);
    Ok(())
}

#[test]
fn test_finding_groups_twice_is_stable() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let (graph, _) = coi_where_plan(&catalog)?;
    let once = common::apply_rules(&catalog, graph, vec![Box::new(GroupJoinFinder)])?;
    let root = once.root()?;
    let before = once.describe(root);
    let twice = common::apply_rules(&catalog, once, vec![Box::new(GroupJoinFinder)])?;
    assert_eq!(twice.describe(root), before);
    Ok(())
}

#[test]
fn test_ambiguous_parent_is_unsupported() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let o = b.table("orders", "o")?;
    let c1 = b.table("customers", "c1")?;
    let c2 = b.table("customers", "c2")?;
    let ocid = b.column(o, "cid")?;
    let (c1cid, c2cid) = (b.column(c1, "cid")?, b.column(c2, "cid")?);
    let inner = b.join(o, c1, JoinType::Inner, vec![]);
    let join = b.join(inner, c2, JoinType::Inner, vec![]);
    let select = b.select(join, vec![Expression::equals(ocid.clone(), c1cid), Expression::equals(ocid.clone(), c2cid)]);
    let project = b.project(select, vec![ocid]);
    b.result_set(project, &["cid"]);

    let error = common::compile(&catalog, b.build()?).expect_err("two parents");
    assert!(matches!(error.downcast_ref::<QueryError>(), Some(QueryError::UnsupportedSql(_))));
    Ok(())
}
