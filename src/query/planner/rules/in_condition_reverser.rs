// In Condition Reverser
//
// Turns top-level IN / ANY / EXISTS conditions of a WHERE list into semi
// and anti joins. Where the right-hand side is a literal row list or an
// uncorrelated subquery, the semi join is typed so that a later stage may
// still reverse it into an inner join driven from that side.

use std::collections::BTreeSet;

use log::{debug, trace};

use super::find_nodes;
use crate::query::executor::result::{QueryError, QueryResult};
use crate::query::planner::context::PlanContext;
use crate::query::planner::optimizer::Rule;
use crate::query::planner::plan::expression::{Expression, ExpressionKind};
use crate::query::planner::plan::node::{DistinctState, JoinNode, PlanNodeKind};
use crate::query::planner::plan::{JoinType, NodeId, PlanGraph};

pub struct InConditionReverser;

/// One subquery condition found directly in a WHERE list
struct TopLevelCondition {
    select: NodeId,
    element: Expression,
    subquery: NodeId,
    exists: bool,
    negated: bool,
}

impl Rule for InConditionReverser {
    fn name(&self) -> &'static str {
        "InConditionReverser"
    }

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        let graph = &mut context.plan;
        let root = graph.root()?;
        let mut found = top_level_conditions(graph, root);
        // Innermost queries first
        found.reverse();
        let total = found.len();
        let mut converted = 0;
        for condition in found {
            let done = if condition.exists {
                convert_exists(graph, &condition)?
            } else {
                convert_any(graph, &condition)?
            };
            if done {
                converted += 1;
            }
        }
        debug!("Converted {} of {} subquery conditions to joins", converted, total);
        Ok(())
    }
}

fn top_level_conditions(graph: &PlanGraph, root: NodeId) -> Vec<TopLevelCondition> {
    let mut found = Vec::new();
    for select in find_nodes(graph, root, |kind| matches!(kind, PlanNodeKind::Select { .. })) {
        let PlanNodeKind::Select { conditions, .. } = graph.kind(select) else {
            continue;
        };
        for condition in conditions {
            let (target, negated) = match &condition.kind {
                ExpressionKind::Not(inner) => (inner.as_ref(), true),
                _ => (condition, false),
            };
            let (subquery, exists) = match target.kind {
                ExpressionKind::Any(subquery) => (subquery, false),
                ExpressionKind::Exists(subquery) => (subquery, true),
                _ => continue,
            };
            found.push(TopLevelCondition { select, element: condition.clone(), subquery, exists, negated });
        }
    }
    found
}

fn subquery_input(graph: &PlanGraph, subquery: NodeId) -> QueryResult<NodeId> {
    match graph.kind(subquery) {
        PlanNodeKind::Subquery { input } => Ok(*input),
        other => Err(QueryError::Internal(format!("{} {} is not a subquery", other.name(), subquery))),
    }
}

/// Convert `IN` / `ANY` into a semi join whose conditions are the per-row
/// test of the subquery
fn convert_any(graph: &mut PlanGraph, condition: &TopLevelCondition) -> QueryResult<bool> {
    let Some(select_input) = graph.kind(condition.select).single_input() else {
        return Ok(false);
    };
    if !graph.kind(select_input).is_joinable() {
        return Ok(false);
    }
    let mut input = subquery_input(graph, condition.subquery)?;
    // DISTINCT makes no difference to ANY beyond allowing reversal
    let mut has_distinct = false;
    if let PlanNodeKind::Distinct { input: below } = graph.kind(input) {
        input = *below;
        has_distinct = true;
    }
    let PlanNodeKind::Project { input: below, fields } = graph.kind(input) else {
        return Ok(false);
    };
    if fields.len() != 1 {
        return Ok(false);
    }
    let project = input;
    let mut join_conditions = fields[0].clone().split_and();
    input = *below;

    if !condition.negated {
        if let PlanNodeKind::ExpressionsSource { distinct_state, .. } = graph.kind(input) {
            let semi_type = match distinct_state {
                DistinctState::Distinct | DistinctState::DistinctWithNull => JoinType::SemiInnerAlreadyDistinct,
                DistinctState::HasParameters => JoinType::SemiInnerIfDistinct,
                _ => JoinType::Semi,
            };
            convert_to_semi_join(graph, condition, select_input, input, join_conditions, semi_type)?;
            return Ok(true);
        }
        if convert_to_subquery_source(graph, condition, select_input, input, project, &join_conditions, has_distinct)? {
            return Ok(true);
        }
    }

    if let PlanNodeKind::Select { input: below, conditions } = graph.kind(input) {
        join_conditions.extend(conditions.iter().cloned());
        input = *below;
    }
    if !graph.kind(input).is_joinable() {
        return Ok(false);
    }
    let join_type = if condition.negated { JoinType::Anti } else { JoinType::Semi };
    convert_to_semi_join(graph, condition, select_input, input, join_conditions, join_type)?;
    Ok(true)
}

/// Make an uncorrelated subquery whose tests split cleanly into outer and
/// inner halves a derived table projecting the inner halves
fn convert_to_subquery_source(
    graph: &mut PlanGraph,
    condition: &TopLevelCondition,
    select_input: NodeId,
    input: NodeId,
    project: NodeId,
    join_conditions: &[Expression],
    has_distinct: bool,
) -> QueryResult<bool> {
    if matches!(graph.kind(input), PlanNodeKind::Limit { .. }) {
        return Ok(false);
    }
    let inside = inside_sources(graph, input);
    let mut rights = Vec::with_capacity(join_conditions.len());
    for join_condition in join_conditions {
        let ExpressionKind::Comparison { left, right, .. } = &join_condition.kind else {
            return Ok(false);
        };
        let free = left.column_sources().is_disjoint(&inside);
        let only = right.column_sources().is_subset(&inside);
        if !(free && only) {
            return Ok(false);
        }
        rights.push(right.as_ref().clone());
    }
    if is_correlated(graph, input) {
        return Ok(false);
    }

    let current = subquery_input(graph, condition.subquery)?;
    if current != project {
        graph.replace_input(condition.subquery, current, project)?;
    }
    let source =
        graph.add(PlanNodeKind::SubquerySource { input: condition.subquery, name: "ANY".to_string() });
    let mut rewritten = Vec::with_capacity(join_conditions.len());
    for (position, (join_condition, right)) in join_conditions.iter().zip(&rights).enumerate() {
        let mut join_condition = join_condition.clone();
        if let ExpressionKind::Comparison { right: slot, .. } = &mut join_condition.kind {
            let name = right.sql.clone().unwrap_or_else(|| format!("ANY[{}]", position));
            let mut column = Expression::column(source, position, name);
            column.ty = right.ty.clone();
            column.sql = right.sql.clone();
            **slot = column;
        }
        rewritten.push(join_condition);
    }
    if let PlanNodeKind::Project { fields, .. } = graph.kind_mut(project) {
        *fields = rights;
    }
    let join_type = if has_distinct { JoinType::SemiInnerIfDistinct } else { JoinType::Semi };
    convert_to_semi_join(graph, condition, select_input, source, rewritten, join_type)?;
    Ok(true)
}

fn convert_to_semi_join(
    graph: &mut PlanGraph,
    condition: &TopLevelCondition,
    select_input: NodeId,
    semi_input: NodeId,
    join_conditions: Vec<Expression>,
    join_type: JoinType,
) -> QueryResult<()> {
    let join = graph.add(PlanNodeKind::Join(
        JoinNode::new(select_input, semi_input, join_type).with_conditions(join_conditions),
    ));
    if let PlanNodeKind::Select { conditions, .. } = graph.kind_mut(condition.select) {
        if let Some(position) = conditions.iter().position(|c| *c == condition.element) {
            conditions.remove(position);
        }
    }
    graph.replace_input(condition.select, select_input, join)?;
    trace!("Subquery {} became {:?} join {}", condition.subquery, join_type, join);
    Ok(())
}

/// Convert `EXISTS`: uncorrelated subqueries become a derived table that
/// yields at most one row, correlated ones a semi or anti join
fn convert_exists(graph: &mut PlanGraph, condition: &TopLevelCondition) -> QueryResult<bool> {
    let Some(select_input) = graph.kind(condition.select).single_input() else {
        return Ok(false);
    };
    let query_input = subquery_input(graph, condition.subquery)?;
    let (input, inner_conditions) = match graph.kind(query_input) {
        PlanNodeKind::Select { input, conditions } => (*input, conditions.clone()),
        _ => (query_input, Vec::new()),
    };
    if !(graph.kind(select_input).is_joinable() && graph.kind(input).is_joinable()) {
        return Ok(false);
    }
    let join = if is_correlated(graph, condition.subquery) {
        let join_type = if condition.negated { JoinType::Anti } else { JoinType::Semi };
        JoinNode::new(select_input, input, join_type).with_conditions(inner_conditions)
    } else {
        let wrapper = if condition.negated {
            PlanNodeKind::OnlyIfEmpty { input: query_input }
        } else {
            PlanNodeKind::Limit { input: query_input, offset: 0, limit: Some(1) }
        };
        let wrapper = graph.add(wrapper);
        graph.replace_input(condition.subquery, query_input, wrapper)?;
        let name = if condition.negated { "NOT EXISTS" } else { "EXISTS" };
        let source = graph.add(PlanNodeKind::SubquerySource { input: condition.subquery, name: name.to_string() });
        JoinNode::new(select_input, source, JoinType::Inner)
    };
    let join = graph.add(PlanNodeKind::Join(join));
    if let PlanNodeKind::Select { conditions, .. } = graph.kind_mut(condition.select) {
        if let Some(position) = conditions.iter().position(|c| *c == condition.element) {
            conditions.remove(position);
        }
    }
    graph.replace_input(condition.select, select_input, join)?;
    trace!("EXISTS subquery {} became join {}", condition.subquery, join);
    Ok(true)
}

/// Column sources produced within `node`, nested subqueries included
fn inside_sources(graph: &PlanGraph, node: NodeId) -> BTreeSet<NodeId> {
    graph
        .reachable(node)
        .into_iter()
        .filter(|id| graph.kind(*id).is_column_source())
        .collect()
}

/// Whether anything under `node` references a column produced outside it
fn is_correlated(graph: &PlanGraph, node: NodeId) -> bool {
    let inside = inside_sources(graph, node);
    graph.reachable(node).into_iter().any(|id| {
        graph
            .kind(id)
            .expressions()
            .iter()
            .any(|e| e.columns().iter().any(|c| !inside.contains(&c.source)))
    })
}

/// Prepare a semi join that will be run as an inner join driven from its
/// right side. The right side is made distinct where it is not already.
pub fn before_reverse_semi_join(graph: &mut PlanGraph, join: NodeId) -> QueryResult<()> {
    let (join_type, right) = {
        let join = graph.join(join)?;
        (join.join_type, join.right)
    };
    match join_type {
        JoinType::SemiInnerIfDistinct => match graph.kind_mut(right) {
            PlanNodeKind::ExpressionsSource { distinct_state, .. } => *distinct_state = DistinctState::NeedDistinct,
            PlanNodeKind::SubquerySource { input: subquery, .. } => {
                let subquery = *subquery;
                let input = subquery_input(graph, subquery)?;
                graph.wrap(input, |input| PlanNodeKind::Distinct { input })?;
            }
            other => {
                return Err(QueryError::Internal(format!("Could not make distinct {} {}", other.name(), right)));
            }
        },
        JoinType::SemiInnerAlreadyDistinct => {}
        other => {
            return Err(QueryError::Internal(format!("{:?} join {} cannot be reversed", other, join)));
        }
    }
    graph.join_mut(join)?.join_type = JoinType::Inner;
    Ok(())
}

/// Settle a reversible semi join as a plain semi join, folding a derived
/// table back into the join where its shape allows
pub fn did_not_reverse_semi_join(graph: &mut PlanGraph, join: NodeId) -> QueryResult<()> {
    let (join_type, right) = {
        let join = graph.join(join)?;
        (join.join_type, join.right)
    };
    if !join_type.is_semi() {
        return Err(QueryError::Internal(format!("{:?} join {} is not a semi join", join_type, join)));
    }
    clean_up_semi_join(graph, join, right)?;
    graph.join_mut(join)?.join_type = JoinType::Semi;
    Ok(())
}

/// Splice a derived table out of a semi join: the project's expressions
/// replace the references to it and any Select under the project joins
/// the join conditions
fn clean_up_semi_join(graph: &mut PlanGraph, join: NodeId, right: NodeId) -> QueryResult<()> {
    let PlanNodeKind::SubquerySource { input: subquery, .. } = graph.kind(right) else {
        return Ok(());
    };
    let project = subquery_input(graph, *subquery)?;
    let PlanNodeKind::Project { input, fields } = graph.kind(project) else {
        return Ok(());
    };
    let fields = fields.clone();
    let (input, inner_conditions) = match graph.kind(*input) {
        PlanNodeKind::Select { input, conditions } => (*input, conditions.clone()),
        _ => (*input, Vec::new()),
    };
    if !graph.kind(input).is_joinable() {
        return Ok(());
    }
    let mut conditions = graph.join(join)?.conditions.clone();
    for condition in conditions.iter_mut() {
        let ExpressionKind::Comparison { right: slot, .. } = &mut condition.kind else {
            return Ok(());
        };
        let Some(field) = slot.as_column().filter(|c| c.source == right).and_then(|c| fields.get(c.position)) else {
            return Ok(());
        };
        **slot = field.clone();
    }
    conditions.extend(inner_conditions);
    graph.join_mut(join)?.conditions = conditions;
    graph.replace_input(join, right, input)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::planner::plan::{ComparisonOp, PlanBuilder};
    use crate::query::planner::rules::fixtures::{apply_rules, coi_catalog};

    fn reverser() -> Vec<Box<dyn Rule>> {
        vec![Box::new(InConditionReverser)]
    }

    fn select_join(graph: &PlanGraph, select: NodeId) -> NodeId {
        graph.kind(select).single_input().expect("select input")
    }

    fn remaining_conditions(graph: &PlanGraph, select: NodeId) -> usize {
        match graph.kind(select) {
            PlanNodeKind::Select { conditions, .. } => conditions.len(),
            _ => panic!("not a select"),
        }
    }

    /// `o.cid IN (SELECT c.cid FROM customers c)`, optionally negated
    fn in_subquery_plan(negated: bool) -> QueryResult<(crate::catalog::Catalog, PlanGraph, [NodeId; 3])> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let o = b.table("orders", "o")?;
        let c = b.table("customers", "c")?;
        let (ocid, ccid) = (b.column(o, "cid")?, b.column(c, "cid")?);
        let any = b.in_subquery(ocid.clone(), c, ccid);
        let condition = if negated { Expression::not(any) } else { any };
        let select = b.select(o, vec![condition]);
        let project = b.project(select, vec![ocid]);
        b.result_set(project, &["cid"]);
        let graph = b.build()?;
        Ok((catalog, graph, [o, c, select]))
    }

    #[test]
    fn test_in_list_becomes_reversible_semi_join() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let ccid = b.column(c, "cid")?;
        let any = b.in_list(ccid.clone(), vec![Expression::integer(1), Expression::integer(2)]);
        let select = b.select(c, vec![any]);
        let project = b.project(select, vec![ccid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, reverser())?;

        let join = graph.join(select_join(&graph, select))?;
        assert_eq!(join.join_type, JoinType::SemiInnerIfDistinct);
        assert_eq!(join.left, c);
        assert!(matches!(graph.kind(join.right), PlanNodeKind::ExpressionsSource { .. }));
        assert_eq!(join.conditions.len(), 1);
        assert_eq!(remaining_conditions(&graph, select), 0);
        Ok(())
    }

    #[test]
    fn test_uncorrelated_in_becomes_derived_table() -> QueryResult<()> {
        let (catalog, graph, [o, c, select]) = in_subquery_plan(false)?;
        let graph = apply_rules(&catalog, graph, reverser())?;

        let join = graph.join(select_join(&graph, select))?;
        assert_eq!(join.join_type, JoinType::Semi);
        assert_eq!(join.left, o);
        let PlanNodeKind::SubquerySource { input: subquery, name } = graph.kind(join.right) else {
            panic!("expected a derived table");
        };
        assert_eq!(name, "ANY");
        let ExpressionKind::Comparison { op: ComparisonOp::Eq, right, .. } = &join.conditions[0].kind else {
            panic!("expected a comparison");
        };
        assert_eq!(right.as_column().map(|col| col.source), Some(join.right));
        let project = subquery_input(&graph, *subquery)?;
        let PlanNodeKind::Project { input, fields } = graph.kind(project) else {
            panic!("expected a project");
        };
        assert_eq!(*input, c);
        assert_eq!(fields[0].as_column().map(|col| col.source), Some(c));
        Ok(())
    }

    #[test]
    fn test_not_in_becomes_anti_join() -> QueryResult<()> {
        let (catalog, graph, [o, c, select]) = in_subquery_plan(true)?;
        let graph = apply_rules(&catalog, graph, reverser())?;

        let join = graph.join(select_join(&graph, select))?;
        assert_eq!(join.join_type, JoinType::Anti);
        assert_eq!((join.left, join.right), (o, c));
        assert_eq!(join.conditions[0].column_sources(), BTreeSet::from([o, c]));
        Ok(())
    }

    #[test]
    fn test_correlated_exists_becomes_semi_join() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let o = b.table("orders", "o")?;
        let (ccid, ocid) = (b.column(c, "cid")?, b.column(o, "cid")?);
        let inner = b.select(o, vec![Expression::equals(ocid, ccid.clone())]);
        let exists = b.exists(inner);
        let select = b.select(c, vec![exists]);
        let project = b.project(select, vec![ccid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, reverser())?;

        let join = graph.join(select_join(&graph, select))?;
        assert_eq!(join.join_type, JoinType::Semi);
        assert_eq!((join.left, join.right), (c, o));
        assert_eq!(join.conditions.len(), 1);
        Ok(())
    }

    #[test]
    fn test_uncorrelated_not_exists_is_guarded_derived_table() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let t = b.table("t", "t")?;
        let ccid = b.column(c, "cid")?;
        let exists = b.exists(t);
        let select = b.select(c, vec![Expression::not(exists)]);
        let project = b.project(select, vec![ccid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, reverser())?;

        let join = graph.join(select_join(&graph, select))?;
        assert_eq!(join.join_type, JoinType::Inner);
        let PlanNodeKind::SubquerySource { input: subquery, name } = graph.kind(join.right) else {
            panic!("expected a derived table");
        };
        assert_eq!(name, "NOT EXISTS");
        let guard = subquery_input(&graph, *subquery)?;
        assert!(matches!(graph.kind(guard), PlanNodeKind::OnlyIfEmpty { input } if *input == t));
        Ok(())
    }

    #[test]
    fn test_limit_in_subquery_keeps_condition() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let o = b.table("orders", "o")?;
        let c = b.table("customers", "c")?;
        let (ocid, ccid) = (b.column(o, "cid")?, b.column(c, "cid")?);
        let limited = b.limit(c, 0, Some(3));
        let any = b.in_subquery(ocid.clone(), limited, ccid);
        let select = b.select(o, vec![any]);
        let project = b.project(select, vec![ocid]);
        b.result_set(project, &["cid"]);
        let graph = apply_rules(&catalog, b.build()?, reverser())?;

        assert_eq!(select_join(&graph, select), o);
        assert_eq!(remaining_conditions(&graph, select), 1);
        Ok(())
    }

    #[test]
    fn test_reverse_values_needs_distinct() -> QueryResult<()> {
        let catalog = coi_catalog()?;
        let mut b = PlanBuilder::new(&catalog);
        let c = b.table("customers", "c")?;
        let ccid = b.column(c, "cid")?;
        let any = b.in_list(ccid.clone(), vec![Expression::parameter(0), Expression::integer(2)]);
        let select = b.select(c, vec![any]);
        let project = b.project(select, vec![ccid]);
        b.result_set(project, &["cid"]);
        let mut graph = apply_rules(&catalog, b.build()?, reverser())?;

        let join = select_join(&graph, select);
        before_reverse_semi_join(&mut graph, join)?;
        let join = graph.join(join)?;
        assert_eq!(join.join_type, JoinType::Inner);
        assert!(matches!(
            graph.kind(join.right),
            PlanNodeKind::ExpressionsSource { distinct_state: DistinctState::NeedDistinct, .. }
        ));
        Ok(())
    }

    #[test]
    fn test_did_not_reverse_restores_inline_semi_join() -> QueryResult<()> {
        let (catalog, graph, [o, c, select]) = in_subquery_plan(false)?;
        let mut graph = apply_rules(&catalog, graph, reverser())?;

        let join = select_join(&graph, select);
        did_not_reverse_semi_join(&mut graph, join)?;
        let join = graph.join(join)?;
        assert_eq!(join.join_type, JoinType::Semi);
        assert_eq!(join.right, c);
        assert_eq!(join.conditions[0].column_sources(), BTreeSet::from([o, c]));
        assert_eq!(graph.output(c), Some(select_join(&graph, select)));
        Ok(())
    }
}
