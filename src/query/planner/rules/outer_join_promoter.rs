// Outer Join Promoter
//
// An outer join whose optional side must produce real rows for the
// statement's conditions to hold is equivalent to an inner join. The
// promoter finds such joins from the conditions above them and turns them
// into inner joins, which later rules can reorder and group.

use std::collections::BTreeSet;

use log::debug;

use super::find_nodes;
use crate::query::executor::result::QueryResult;
use crate::query::planner::context::PlanContext;
use crate::query::planner::optimizer::Rule;
use crate::query::planner::plan::expression::{Expression, ExpressionKind};
use crate::query::planner::plan::node::PlanNodeKind;
use crate::query::planner::plan::{JoinType, NodeId, PlanGraph};
use crate::query::types::registry::TypesRegistry;

/// Functions that can turn a NULL operand into a non-NULL result
const NULL_LAUNDERING: &[&str] = &["isNull", "isUnknown", "isTrue", "isFalse", "coalesce", "ifnull", "if"];

pub struct OuterJoinPromoter;

impl Rule for OuterJoinPromoter {
    fn name(&self) -> &'static str {
        "OuterJoinPromoter"
    }

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        let root = context.plan.root()?;
        let mut promoted = 0;
        // Promoting a join can only make more sources required, so this
        // settles within one pass per join
        loop {
            let mut pass = 0;
            let graph = &context.plan;
            let tops = find_nodes(graph, root, |kind| matches!(kind, PlanNodeKind::Join(_)))
                .into_iter()
                .filter(|&join| !matches!(graph.output(join).map(|o| graph.kind(o)), Some(PlanNodeKind::Join(_))))
                .collect::<Vec<_>>();
            for top in tops {
                let mut required = BTreeSet::new();
                if let Some(PlanNodeKind::Select { conditions, .. }) = context.plan.output(top).map(|o| context.plan.kind(o)) {
                    for condition in conditions {
                        required_sources(context.types, condition, &mut required);
                    }
                }
                pass += promote(&mut context.plan, context.types, top, required)?;
            }
            if pass == 0 {
                break;
            }
            promoted += pass;
        }
        if promoted > 0 {
            debug!("Promoted {} outer joins", promoted);
        }
        Ok(())
    }
}

/// Promote joins at and below `node` whose optional side is in `required`.
/// Returns how many were promoted.
fn promote(
    graph: &mut PlanGraph,
    types: &dyn TypesRegistry,
    node: NodeId,
    mut required: BTreeSet<NodeId>,
) -> QueryResult<usize> {
    let PlanNodeKind::Join(join) = graph.kind(node) else {
        return Ok(0);
    };
    let (left, right) = (join.left, join.right);
    let left_sources = join_sources(graph, left);
    let right_sources = join_sources(graph, right);
    let mut promoted = 0;
    loop {
        let join = graph.join(node)?;
        let left_required = !left_sources.is_disjoint(&required);
        let right_required = !right_sources.is_disjoint(&required);
        let join_type = match join.join_type {
            JoinType::Left if right_required => JoinType::Inner,
            JoinType::Right if left_required => JoinType::Inner,
            JoinType::Full if left_required && right_required => JoinType::Inner,
            JoinType::Full if left_required => JoinType::Left,
            JoinType::Full if right_required => JoinType::Right,
            other => other,
        };
        let changed = join_type != join.join_type;
        if changed {
            debug!("{:?} join {} is now {:?}", join.join_type, node, join_type);
            promoted += 1;
        }
        // Conditions of an inner or semi join filter its rows outright
        let before = required.len();
        if join_type.is_inner() || join_type.is_semi() {
            for condition in &join.conditions {
                required_sources(types, condition, &mut required);
            }
        }
        graph.join_mut(node)?.join_type = join_type;
        if !changed && required.len() == before {
            break;
        }
    }
    promoted += promote(graph, types, left, required.clone())?;
    promoted += promote(graph, types, right, required)?;
    Ok(promoted)
}

/// Column sources whose rows come out of a join operand
fn join_sources(graph: &PlanGraph, node: NodeId) -> BTreeSet<NodeId> {
    let mut sources = BTreeSet::new();
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        match graph.kind(id) {
            PlanNodeKind::Join(join) => stack.extend([join.left, join.right]),
            PlanNodeKind::TableGroupJoinTree(tree) => sources.extend(tree.tables()),
            _ => {
                sources.insert(id);
            }
        }
    }
    sources
}

/// Sources that must supply a non-NULL row for `condition` to be TRUE
fn required_sources(types: &dyn TypesRegistry, condition: &Expression, required: &mut BTreeSet<NodeId>) {
    match &condition.kind {
        ExpressionKind::And(left, right) => {
            required_sources(types, left, required);
            required_sources(types, right, required);
        }
        ExpressionKind::Or(left, right) => {
            let (mut left_required, mut right_required) = (BTreeSet::new(), BTreeSet::new());
            required_sources(types, left, &mut left_required);
            required_sources(types, right, &mut right_required);
            required.extend(left_required.intersection(&right_required));
        }
        ExpressionKind::Not(operand) => match &operand.kind {
            // NOT x IS NULL
            ExpressionKind::Function { name, operands } if name == "isNull" => {
                for operand in operands {
                    strict_sources(types, operand, required);
                }
            }
            ExpressionKind::Comparison { .. } => strict_sources(types, operand, required),
            _ => {}
        },
        // IS TRUE and IS FALSE are never TRUE for NULL
        ExpressionKind::Function { name, operands } if name == "isTrue" || name == "isFalse" => {
            for operand in operands {
                strict_sources(types, operand, required);
            }
        }
        _ => strict_sources(types, condition, required),
    }
}

/// Sources whose NULL row makes `expression` NULL
fn strict_sources(types: &dyn TypesRegistry, expression: &Expression, required: &mut BTreeSet<NodeId>) {
    match &expression.kind {
        ExpressionKind::Column(column) => {
            required.insert(column.source);
        }
        ExpressionKind::Cast { operand, .. } => strict_sources(types, operand, required),
        ExpressionKind::Comparison { left, right, .. } => {
            strict_sources(types, left, required);
            strict_sources(types, right, required);
        }
        ExpressionKind::Function { name, operands } => {
            if !NULL_LAUNDERING.contains(&name.as_str()) && types.is_strict(name) {
                for operand in operands {
                    strict_sources(types, operand, required);
                }
            }
        }
        ExpressionKind::Routine { operands, called_on_null_input: false, .. } => {
            for operand in operands {
                strict_sources(types, operand, required);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::executor::result::DataValue;
    use crate::query::planner::plan::{ComparisonOp, PlanBuilder};
    use crate::query::planner::rules::fixtures::{apply_rules, coi_catalog};

    fn greater(left: Expression, value: i64) -> Expression {
        Expression::compare(ComparisonOp::Gt, left, Expression::integer(value))
    }

    fn join_type(graph: &PlanGraph, join: NodeId) -> JoinType {
        graph.join(join).expect("join").join_type
    }

    #[test]
    fn test_where_on_optional_side_promotes() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let o = b.table("orders", "o")?;
        let (ccid, ocid, oid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
        let join = b.join(c, o, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
        let select = b.select(join, vec![greater(oid, 5)]);
        let project = b.project(select, vec![ccid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, vec![Box::new(OuterJoinPromoter)])?;
        assert_eq!(join_type(&graph, join), JoinType::Inner);
        Ok(())
    }

    #[test]
    fn test_or_is_null_blocks_promotion() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let o = b.table("orders", "o")?;
        let (ccid, ocid, oid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
        let join = b.join(c, o, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
        let condition = Expression::or(greater(oid.clone(), 5), Expression::function("isNull", vec![oid]));
        let select = b.select(join, vec![condition]);
        let project = b.project(select, vec![ccid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, vec![Box::new(OuterJoinPromoter)])?;
        assert_eq!(join_type(&graph, join), JoinType::Left);
        Ok(())
    }

    #[test]
    fn test_or_on_both_branches_promotes() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let o = b.table("orders", "o")?;
        let (ccid, ocid, oid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
        let join = b.join(c, o, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
        let condition = Expression::or(greater(oid.clone(), 5), Expression::equals(oid, Expression::integer(1)));
        let select = b.select(join, vec![condition]);
        let project = b.project(select, vec![ccid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, vec![Box::new(OuterJoinPromoter)])?;
        assert_eq!(join_type(&graph, join), JoinType::Inner);
        Ok(())
    }

    #[test]
    fn test_laundered_and_preserved_side_conditions_do_not_promote() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let o = b.table("orders", "o")?;
        let (ccid, ocid, oid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
        let name = b.column(c, "name")?;
        let join = b.join(c, o, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
        let coalesced = Expression::function("coalesce", vec![oid, Expression::integer(0)]);
        let select = b.select(
            join,
            vec![
                Expression::equals(coalesced, Expression::integer(0)),
                Expression::equals(name, Expression::text("smith")),
            ],
        );
        let project = b.project(select, vec![ccid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, vec![Box::new(OuterJoinPromoter)])?;
        assert_eq!(join_type(&graph, join), JoinType::Left);
        Ok(())
    }

    #[test]
    fn test_promotion_reaches_nested_joins() -> QueryResult<()> {
        let catalog = coi_catalog()?;
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
        let graph = apply_rules(&catalog, b.build()?, vec![Box::new(OuterJoinPromoter)])?;
        assert_eq!(join_type(&graph, outer), JoinType::Inner);
        assert_eq!(join_type(&graph, inner), JoinType::Inner);
        Ok(())
    }

    #[test]
    fn test_inner_join_conditions_promote_below() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let o = b.table("orders", "o")?;
        let i = b.table("items", "i")?;
        let (ccid, ocid, ooid) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "oid")?);
        let ioid = b.column(i, "oid")?;
        let left = b.join(c, o, JoinType::Left, vec![Expression::equals(ccid.clone(), ocid)]);
        let top = b.join(left, i, JoinType::Inner, vec![Expression::equals(ioid, ooid)]);
        let project = b.project(top, vec![ccid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, vec![Box::new(OuterJoinPromoter)])?;
        assert_eq!(join_type(&graph, left), JoinType::Inner);
        Ok(())
    }

    #[test]
    fn test_full_join_loses_required_side_optionality() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let o = b.table("orders", "o")?;
        let (ccid, ocid, odate) = (b.column(c, "cid")?, b.column(o, "cid")?, b.column(o, "odate")?);
        let join = b.join(c, o, JoinType::Full, vec![Expression::equals(ccid.clone(), ocid)]);
        let not_null = Expression::not(Expression::function("isNull", vec![odate]));
        let select = b.select(join, vec![not_null]);
        let project = b.project(select, vec![ccid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, vec![Box::new(OuterJoinPromoter)])?;
        assert_eq!(join_type(&graph, join), JoinType::Right);
        Ok(())
    }

    #[test]
    fn test_required_sources_of_conditions() {
        let types = crate::query::types::registry::StandardTypesRegistry::new();
        let a = Expression::column(NodeId(1), 0, "a");
        let b = Expression::column(NodeId(2), 0, "b");
        let mut required = BTreeSet::new();
        let sum = Expression::function("plus", vec![a.clone(), b.clone()]);
        required_sources(&types, &greater(sum, 3), &mut required);
        assert_eq!(required, BTreeSet::from([NodeId(1), NodeId(2)]));

        let mut required = BTreeSet::new();
        let test = Expression::function("isTrue", vec![Expression::equals(a, Expression::constant(DataValue::Null))]);
        required_sources(&types, &test, &mut required);
        assert_eq!(required, BTreeSet::from([NodeId(1)]));

        let mut required = BTreeSet::new();
        required_sources(&types, &Expression::function("isNull", vec![b]), &mut required);
        assert!(required.is_empty());
    }
}
