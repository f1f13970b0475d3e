use anyhow::Result;
use bayundb_optimizer::catalog::CatalogBuilder;
use bayundb_optimizer::query::executor::operators::PhysicalOperator;
use bayundb_optimizer::query::planner::plan::expression::Expression;
use bayundb_optimizer::query::planner::plan::PlanBuilder;
use bayundb_optimizer::TypeInstance;
use std::collections::BTreeSet;

#[path = "../common/mod.rs"]
mod common;

#[test]
fn test_update_of_plain_column_writes_in_place() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    b.update(t, t, vec![("z", Expression::text("a"))])?;

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.operator.operator_names(), vec!["Update", "Flatten", "GroupScan"]);
    let PhysicalOperator::Update { table, columns, .. } = &plan.operator else {
        panic!("expected an update");
    };
    assert_eq!(table, "t");
    assert_eq!(columns.len(), 1);
    assert_eq!(columns[0].0, 3);
    assert!(plan.result_columns.is_empty());
    assert_eq!(plan.affected_tables, BTreeSet::from([common::table_id(&catalog, "t")?]));
    Ok(())
}

#[test]
fn test_primary_key_update_is_delete_then_insert() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    b.update(t, t, vec![("id", Expression::integer(7))])?;

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(
        plan.operator.operator_names(),
        vec!["Insert", "Project", "Buffer", "Delete", "Flatten", "GroupScan"]
    );
    let PhysicalOperator::Insert { table, row, .. } = &plan.operator else {
        panic!("expected an insert");
    };
    assert_eq!(table, "t");
    let row: Vec<String> = row.iter().map(|e| e.to_string()).collect();
    assert_eq!(row, vec!["Field(0)", "Field(1)", "Field(2)", "Field(3)"]);
    let Some(PhysicalOperator::Project { fields, .. }) = common::find_operator(&plan.operator, "Project") else {
        panic!("expected a project");
    };
    // The new key replaces the old one; the rest is copied from the deleted row
    assert_eq!(fields[0].to_string(), "7");
    assert_eq!(fields[1].to_string(), "Field(1)");
    Ok(())
}

#[test]
fn test_delete_needs_no_buffer() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let t = b.table("t", "t")?;
    b.delete(t, t)?;

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.operator.operator_names(), vec!["Delete", "Flatten", "GroupScan"]);
    Ok(())
}

#[test]
fn test_insert_from_values_fills_missing_columns() -> Result<()> {
    let catalog = common::coi_catalog()?;
    let mut b = PlanBuilder::new(&catalog);
    let values = b.values(vec![vec![Expression::integer(1), Expression::integer(2)]]);
    b.insert(values, "t", &["id", "x"])?;

    let plan = common::compile(&catalog, b.build()?)?;
    assert_eq!(plan.operator.operator_names(), vec!["Insert", "Values"]);
    let PhysicalOperator::Insert { row, .. } = &plan.operator else {
        panic!("expected an insert");
    };
    let row: Vec<String> = row.iter().map(|e| e.to_string()).collect();
    assert_eq!(row, vec!["Field(0)", "Field(1)", "NULL", "NULL"]);
    Ok(())
}

#[test]
fn test_key_update_on_referenced_table_is_unsupported() -> Result<()> {
    let mut builder = CatalogBuilder::new();
    builder.create_table("u", &[("id", TypeInstance::integer(false)), ("a", TypeInstance::integer(true))], &["id"])?;
    builder.create_table(
        "v",
        &[("id", TypeInstance::integer(false)), ("uid", TypeInstance::integer(true))],
        &["id"],
    )?;
    builder.add_foreign_key("v_u", "v", "u", &[("id", "uid")])?;
    let catalog = builder.build();

    let mut b = PlanBuilder::new(&catalog);
    let u = b.table("u", "u")?;
    b.update(u, u, vec![("id", Expression::integer(2))])?;
    let error = common::compile(&catalog, b.build()?).expect_err("referenced table");
    assert!(error.to_string().contains("referenced table u"), "{}", error);
    Ok(())
}
