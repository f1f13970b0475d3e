// Nested Loop Mapper
//
// Replaces each logical join with a map join: the inner side is run once
// per outer row with that row bound. Join conditions become a Select on
// the inner side, and the join type decides how the inner side is wrapped.

use std::collections::BTreeSet;

use log::{debug, trace};

use super::in_condition_reverser::did_not_reverse_semi_join;
use super::{find_nodes, nodes_below};
use crate::query::executor::result::{QueryError, QueryResult};
use crate::query::planner::context::PlanContext;
use crate::query::planner::optimizer::Rule;
use crate::query::planner::plan::expression::Expression;
use crate::query::planner::plan::node::{JoinImplementation, PlanNodeKind};
use crate::query::planner::plan::{JoinType, NodeId, PlanGraph};

pub struct NestedLoopMapper;

type LoaderWrapper = Box<dyn FnOnce(NodeId) -> PlanNodeKind>;

impl Rule for NestedLoopMapper {
    fn name(&self) -> &'static str {
        "NestedLoopMapper"
    }

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        let bloom_filters = context.config.bloom_filter_enabled;
        let graph = &mut context.plan;
        let root = graph.root()?;
        let joins = find_nodes(graph, root, |kind| matches!(kind, PlanNodeKind::Join(_)));
        // Innermost first, so each join's operands are already mapped
        for &join in joins.iter().rev() {
            map_join(graph, join, bloom_filters)?;
        }
        debug!("Mapped {} joins to nested loops", joins.len());
        Ok(())
    }
}

fn map_join(graph: &mut PlanGraph, id: NodeId, bloom_filters: bool) -> QueryResult<()> {
    if matches!(
        graph.join(id)?.join_type,
        JoinType::SemiInnerAlreadyDistinct | JoinType::SemiInnerIfDistinct
    ) {
        did_not_reverse_semi_join(graph, id)?;
    }
    let join = graph.join(id)?.clone();
    if matches!(join.join_type, JoinType::Right | JoinType::Full) {
        return Err(QueryError::UnsupportedSql(format!(
            "{:?} join cannot be run as nested loops",
            join.join_type
        )));
    }

    let (outer_conditions, inner_conditions): (Vec<Expression>, Vec<Expression>) = if join.join_type.is_inner() || join.join_type.is_semi() {
        let inner_sources = sources_below(graph, join.right);
        join.conditions
            .into_iter()
            .partition(|c| c.column_sources().is_disjoint(&inner_sources))
    } else {
        (Vec::new(), join.conditions)
    };

    let mut outer = join.left;
    if !outer_conditions.is_empty() {
        outer = graph.add(PlanNodeKind::Select { input: outer, conditions: outer_conditions });
    }
    // Loader wrappers go above the map join once it exists
    let (mut inner, loader): (NodeId, Option<LoaderWrapper>) = match join.implementation {
        JoinImplementation::NestedLoops => (join.right, None),
        JoinImplementation::BloomFilter { .. } if !bloom_filters => {
            trace!("Bloom filters disabled, join {} runs as plain nested loops", id);
            (join.right, None)
        }
        JoinImplementation::BloomFilter { loader, loader_keys, lookup, estimated_size } => {
            let filter = graph.allocate_marker();
            outer = graph.add(PlanNodeKind::BloomFilterFilter { input: outer, filter, lookup });
            let using: LoaderWrapper = Box::new(move |input| PlanNodeKind::UsingBloomFilter {
                loader,
                input,
                filter,
                loader_keys,
                estimated_size,
            });
            (join.right, Some(using))
        }
        JoinImplementation::HashTable { keys, lookup } => {
            let hash_table = graph.allocate_marker();
            let loader = join.right;
            let lookup_node = graph.add(PlanNodeKind::HashTableLookup { hash_table, loader, lookup });
            let using: LoaderWrapper =
                Box::new(move |input| PlanNodeKind::UsingHashTable { loader, input, hash_table, keys });
            (lookup_node, Some(using))
        }
    };
    if !inner_conditions.is_empty() {
        inner = graph.add(PlanNodeKind::Select { input: inner, conditions: inner_conditions });
    }
    inner = match join.join_type {
        JoinType::Left => graph.add(PlanNodeKind::NullIfEmpty { input: inner }),
        JoinType::Semi => graph.add(PlanNodeKind::Limit { input: inner, offset: 0, limit: Some(1) }),
        JoinType::Anti => graph.add(PlanNodeKind::OnlyIfEmpty { input: inner }),
        _ => inner,
    };
    let map = graph.add(PlanNodeKind::MapJoin { outer, inner, join_type: join.join_type });
    let result = match loader {
        Some(using) => graph.add(using(map)),
        None => map,
    };
    graph.replace_node(id, result)?;
    trace!("{:?} join {} mapped to {} {}", join.join_type, id, graph.kind(result).name(), result);
    Ok(())
}

/// Column sources produced by `node`'s subtree
fn sources_below(graph: &PlanGraph, node: NodeId) -> BTreeSet<NodeId> {
    nodes_below(graph, node)
        .into_iter()
        .filter(|id| graph.kind(*id).is_column_source())
        .collect()
}
