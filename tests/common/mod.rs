#![allow(dead_code)]

use anyhow::Result;
use bayundb_optimizer::catalog::{Catalog, CatalogBuilder};
use bayundb_optimizer::common::types::TableId;
use bayundb_optimizer::query::executor::operators::{PhysicalOperator, PlanOperatorFactory};
use bayundb_optimizer::query::planner::cost_model::DefaultCostEstimator;
use bayundb_optimizer::query::planner::plan::expression::Expression;
use bayundb_optimizer::query::planner::plan::node::PlanNodeKind;
use bayundb_optimizer::query::planner::{Optimizer, Rule};
use bayundb_optimizer::{AssembledPlan, NodeId, OptimizerConfig, PlanContext, PlanGraph, StandardTypesRegistry, TypeInstance};

// customers -> orders -> items and customers -> addresses share one group;
// `t` stands alone
pub fn coi_catalog() -> Result<Catalog> {
    let mut builder = CatalogBuilder::new();
    builder.create_table(
        "customers",
        &[("cid", TypeInstance::integer(false)), ("name", TypeInstance::varchar(32, true))],
        &["cid"],
    )?;
    builder.create_child_table(
        "orders",
        &[
            ("oid", TypeInstance::integer(false)),
            ("cid", TypeInstance::integer(false)),
            ("odate", TypeInstance::date(true)),
        ],
        &["oid"],
        "customers",
        &[("cid", "cid")],
    )?;
    builder.create_child_table(
        "items",
        &[
            ("iid", TypeInstance::integer(false)),
            ("oid", TypeInstance::integer(false)),
            ("sku", TypeInstance::varchar(16, true)),
            ("quan", TypeInstance::integer(true)),
        ],
        &["iid"],
        "orders",
        &[("oid", "oid")],
    )?;
    builder.create_child_table(
        "addresses",
        &[
            ("aid", TypeInstance::integer(false)),
            ("cid", TypeInstance::integer(false)),
            ("state", TypeInstance::varchar(2, true)),
        ],
        &["aid"],
        "customers",
        &[("cid", "cid")],
    )?;
    builder.create_table(
        "t",
        &[
            ("id", TypeInstance::integer(false)),
            ("x", TypeInstance::integer(false)),
            ("y", TypeInstance::integer(true)),
            ("z", TypeInstance::varchar(10, true)),
        ],
        &["id"],
    )?;
    builder.create_index("name_idx", "customers", &["name"], false)?;
    builder.create_index("t_y", "t", &["y"], false)?;
    Ok(builder.build())
}

// Run selected rules with default settings
pub fn apply_rules(catalog: &Catalog, graph: PlanGraph, rules: Vec<Box<dyn Rule>>) -> Result<PlanGraph> {
    let types = StandardTypesRegistry::new();
    let costs = DefaultCostEstimator::new();
    let config = OptimizerConfig::default();
    let mut context = PlanContext::new(graph, catalog, &types, &config, &costs);
    Optimizer::with_rules(rules).optimize(&mut context)?;
    Ok(context.plan)
}

// Run the standard pipeline without assembling
pub fn optimize(catalog: &Catalog, graph: PlanGraph) -> Result<PlanGraph> {
    let types = StandardTypesRegistry::new();
    let costs = DefaultCostEstimator::new();
    let config = OptimizerConfig::default();
    let mut context = PlanContext::new(graph, catalog, &types, &config, &costs);
    Optimizer::new().optimize(&mut context)?;
    Ok(context.plan)
}

pub fn compile(catalog: &Catalog, graph: PlanGraph) -> Result<AssembledPlan<PhysicalOperator>> {
    compile_with(catalog, &OptimizerConfig::default(), graph)
}

pub fn compile_with(
    catalog: &Catalog,
    config: &OptimizerConfig,
    graph: PlanGraph,
) -> Result<AssembledPlan<PhysicalOperator>> {
    let types = StandardTypesRegistry::new();
    let costs = DefaultCostEstimator::new();
    let mut context = PlanContext::new(graph, catalog, &types, config, &costs);
    let factory = PlanOperatorFactory::new(catalog);
    Ok(Optimizer::new().compile(&mut context, &factory)?)
}

// Single input of a node, for walking down a plan
pub fn input_of(graph: &PlanGraph, node: NodeId) -> Result<NodeId> {
    graph
        .kind(node)
        .single_input()
        .ok_or_else(|| anyhow::anyhow!("{} {} has no single input", graph.kind(node).name(), node))
}

pub fn project_fields(graph: &PlanGraph, project: NodeId) -> Result<Vec<Expression>> {
    match graph.kind(project) {
        PlanNodeKind::Project { fields, .. } => Ok(fields.clone()),
        other => Err(anyhow::anyhow!("expected Project, got {}", other.name())),
    }
}

// First operator named `name`, preorder
pub fn find_operator<'a>(operator: &'a PhysicalOperator, name: &str) -> Option<&'a PhysicalOperator> {
    if operator.name() == name {
        return Some(operator);
    }
    operator.children().into_iter().find_map(|child| find_operator(child, name))
}

pub fn table_id(catalog: &Catalog, name: &str) -> Result<TableId> {
    catalog
        .table_by_name(name)
        .map(|table| table.id())
        .ok_or_else(|| anyhow::anyhow!("no table {}", name))
}
