// Query Optimizer Implementation
//
// Runs the rule pipeline over a statement's plan graph, checking the graph's
// structural invariants after every rule, and hands the result to the
// operator assembler.

use std::collections::HashSet;

use log::{debug, trace};

use crate::query::executor::operators::OperatorFactory;
use crate::query::executor::result::{QueryError, QueryResult};
use crate::query::planner::context::PlanContext;
use crate::query::planner::operator_assembler::{AssembledPlan, OperatorAssembler};
use crate::query::planner::plan::PlanGraph;
use crate::query::planner::rules::{
    AggregateMapper, BranchJoiner, ConstantFolder, GroupJoinFinder, HalloweenRecognizer, InConditionReverser,
    NestedLoopMapper, OuterJoinPromoter, TypeResolver,
};

/// One self-contained plan transformation
pub trait Rule {
    fn name(&self) -> &'static str;

    fn apply(&self, context: &mut PlanContext<'_>) -> QueryResult<()>;
}

/// The main optimizer that applies transformation rules in a fixed order
pub struct Optimizer {
    rules: Vec<Box<dyn Rule>>,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    /// Create an optimizer with the standard pipeline
    pub fn new() -> Self {
        Optimizer {
            rules: vec![
                Box::new(AggregateMapper),
                Box::new(TypeResolver),
                Box::new(ConstantFolder),
                Box::new(OuterJoinPromoter),
                Box::new(GroupJoinFinder),
                Box::new(InConditionReverser),
                Box::new(NestedLoopMapper),
                Box::new(BranchJoiner),
                Box::new(HalloweenRecognizer),
            ],
        }
    }

    /// Create an optimizer running only the given rules
    pub fn with_rules(rules: Vec<Box<dyn Rule>>) -> Self {
        Optimizer { rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Apply every rule in order
    pub fn optimize(&self, context: &mut PlanContext<'_>) -> QueryResult<()> {
        check_plan(&context.plan)?;
        for (applied, rule) in self.rules.iter().enumerate() {
            debug!("Applying rule {} ({} of {})", rule.name(), applied + 1, self.rules.len());
            rule.apply(context)?;
            check_plan(&context.plan).map_err(|e| match e {
                QueryError::Internal(message) => {
                    QueryError::Internal(format!("after {}: {}", rule.name(), message))
                }
                other => other,
            })?;
        }
        debug!("Applied {} rules", self.rules.len());
        Ok(())
    }

    /// Optimize and assemble the physical operator tree
    pub fn compile<F: OperatorFactory>(
        &self,
        context: &mut PlanContext<'_>,
        factory: &F,
    ) -> QueryResult<AssembledPlan<F::Operator>> {
        self.optimize(context)?;
        OperatorAssembler::new(context, factory).assemble()
    }
}

/// Verify that every reachable node's inputs name it as their output, that
/// outputs point back at a consumer, and that every column references a
/// reachable source
pub fn check_plan(graph: &PlanGraph) -> QueryResult<()> {
    let root = graph.root()?;
    let reachable = graph.reachable(root);
    let reachable_set: HashSet<_> = reachable.iter().copied().collect();
    trace!("Checking {} reachable plan nodes", reachable.len());

    for &id in &reachable {
        let kind = graph.kind(id);
        for input in kind.inputs() {
            if graph.output(input) != Some(id) {
                return Err(QueryError::Internal(format!(
                    "{} {} is an input of {} {} but its output is {:?}",
                    graph.kind(input).name(),
                    input,
                    kind.name(),
                    id,
                    graph.output(input)
                )));
            }
        }
        if let Some(output) = graph.output(id) {
            let consumer = graph.kind(output);
            if !consumer.inputs().contains(&id) && !consumer.referenced_nodes().contains(&id) {
                return Err(QueryError::Internal(format!(
                    "{} {} names {} {} as output, which does not use it",
                    kind.name(),
                    id,
                    consumer.name(),
                    output
                )));
            }
        }
        for expression in kind.expressions() {
            for column in expression.columns() {
                if !reachable_set.contains(&column.source) {
                    return Err(QueryError::Internal(format!(
                        "column {} of {} {} references unreachable source {}",
                        column.name,
                        kind.name(),
                        id,
                        column.source
                    )));
                }
            }
        }
    }
    Ok(())
}
