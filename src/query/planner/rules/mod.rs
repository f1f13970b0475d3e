// Optimizer Rules
//
// Each rule is a unit struct implementing `Rule`. The optimizer applies them
// in pipeline order; rules only communicate through the plan graph.

pub mod aggregate_mapper;
pub mod branch_joiner;
pub mod constant_folder;
pub mod group_join_finder;
pub mod halloween;
pub mod in_condition_reverser;
pub mod nested_loop_mapper;
pub mod outer_join_promoter;
pub mod type_resolver;

use std::collections::BTreeSet;

pub use self::aggregate_mapper::AggregateMapper;
pub use self::branch_joiner::BranchJoiner;
pub use self::constant_folder::ConstantFolder;
pub use self::group_join_finder::GroupJoinFinder;
pub use self::halloween::HalloweenRecognizer;
pub use self::in_condition_reverser::InConditionReverser;
pub use self::nested_loop_mapper::NestedLoopMapper;
pub use self::outer_join_promoter::OuterJoinPromoter;
pub use self::type_resolver::TypeResolver;

use super::plan::node::PlanNodeKind;
use super::plan::{NodeId, PlanGraph};

/// `node` and everything below it through inputs and referenced nodes.
/// Subquery expressions are not entered.
pub fn nodes_below(graph: &PlanGraph, node: NodeId) -> BTreeSet<NodeId> {
    let mut found = BTreeSet::new();
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        if found.insert(id) {
            let kind = graph.kind(id);
            stack.extend(kind.inputs());
            stack.extend(kind.referenced_nodes());
        }
    }
    found
}

/// Every reachable node matching `predicate`, parents first
pub fn find_nodes(graph: &PlanGraph, root: NodeId, predicate: impl Fn(&PlanNodeKind) -> bool) -> Vec<NodeId> {
    graph.reachable(root).into_iter().filter(|id| predicate(graph.kind(*id))).collect()
}
