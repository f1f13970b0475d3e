// Plan Visitors
//
// Two traversal policies over the plan graph. `PlanVisitor` inspects nodes
// and expressions with enter/visit/leave callbacks; returning false from
// `enter` prunes that subtree and returning false from `leave` or `visit`
// stops the walk. `PlanRewriter` replaces expressions as it goes, either
// before or after their children.

use super::expression::{Expression, ExpressionKind};
use super::node::PlanNodeKind;
use super::{NodeId, PlanGraph};
use crate::query::executor::result::QueryResult;

pub trait PlanVisitor {
    fn visit_enter(&mut self, _graph: &PlanGraph, _node: NodeId) -> bool {
        true
    }

    fn visit_leave(&mut self, _graph: &PlanGraph, _node: NodeId) -> bool {
        true
    }

    /// Called for nodes without inputs
    fn visit(&mut self, _graph: &PlanGraph, _node: NodeId) -> bool {
        true
    }

    fn expression_enter(&mut self, _graph: &PlanGraph, _expression: &Expression) -> bool {
        true
    }

    fn expression_leave(&mut self, _graph: &PlanGraph, _expression: &Expression) -> bool {
        true
    }

    /// Called for expressions without children
    fn expression_visit(&mut self, _graph: &PlanGraph, _expression: &Expression) -> bool {
        true
    }
}

/// Walk the plan below `node`: inputs first, then the node's expressions.
/// The tables of a `TableGroupJoinTree` are visited as its inputs.
pub fn accept(graph: &PlanGraph, node: NodeId, visitor: &mut dyn PlanVisitor) -> bool {
    let kind = graph.kind(node);
    let mut children = kind.inputs();
    if let PlanNodeKind::TableGroupJoinTree(tree) = kind {
        children.extend(tree.tables());
    }
    let expressions = kind.expressions();
    if children.is_empty() && expressions.is_empty() {
        return visitor.visit(graph, node);
    }
    if visitor.visit_enter(graph, node) {
        for child in children {
            if !accept(graph, child, visitor) {
                break;
            }
        }
        for expression in expressions {
            if !accept_expression(graph, expression, visitor) {
                break;
            }
        }
    }
    visitor.visit_leave(graph, node)
}

pub fn accept_expression(graph: &PlanGraph, expression: &Expression, visitor: &mut dyn PlanVisitor) -> bool {
    let subquery = match &expression.kind {
        ExpressionKind::Exists(id) | ExpressionKind::Any(id) | ExpressionKind::SubqueryValue(id) => Some(*id),
        _ => None,
    };
    let children = expression.children();
    if children.is_empty() && subquery.is_none() {
        return visitor.expression_visit(graph, expression);
    }
    if visitor.expression_enter(graph, expression) {
        for child in children {
            if !accept_expression(graph, child, visitor) {
                break;
            }
        }
        if let Some(subquery) = subquery {
            accept(graph, subquery, visitor);
        }
    }
    visitor.expression_leave(graph, expression)
}

pub trait PlanRewriter {
    /// Returning false skips the node's inputs and expressions
    fn enter(&mut self, _graph: &mut PlanGraph, _node: NodeId) -> QueryResult<bool> {
        Ok(true)
    }

    /// Called after the node's inputs and expressions were rewritten
    fn leave(&mut self, _graph: &mut PlanGraph, _node: NodeId) -> QueryResult<()> {
        Ok(())
    }

    /// Post-order when true: children are rewritten before their parent
    fn visit_children_first(&self, _expression: &Expression) -> bool {
        true
    }

    fn rewrite(&mut self, graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression>;
}

/// Rewrite every expression in the plan below `node`, inputs first
pub fn rewrite_plan(graph: &mut PlanGraph, node: NodeId, rewriter: &mut dyn PlanRewriter) -> QueryResult<()> {
    if rewriter.enter(graph, node)? {
        for input in graph.inputs(node) {
            rewrite_plan(graph, input, rewriter)?;
        }
        let expressions = graph.take_expressions(node);
        let mut rewritten = Vec::with_capacity(expressions.len());
        for expression in expressions {
            rewritten.push(rewrite_expression(graph, expression, rewriter)?);
        }
        graph.restore_expressions(node, rewritten)?;
    }
    rewriter.leave(graph, node)
}

pub fn rewrite_expression(
    graph: &mut PlanGraph,
    expression: Expression,
    rewriter: &mut dyn PlanRewriter,
) -> QueryResult<Expression> {
    if rewriter.visit_children_first(&expression) {
        let mut expression = expression;
        rewrite_children(graph, &mut expression, rewriter)?;
        rewriter.rewrite(graph, expression)
    } else {
        let mut expression = rewriter.rewrite(graph, expression)?;
        rewrite_children(graph, &mut expression, rewriter)?;
        Ok(expression)
    }
}

fn rewrite_children(
    graph: &mut PlanGraph,
    expression: &mut Expression,
    rewriter: &mut dyn PlanRewriter,
) -> QueryResult<()> {
    if let ExpressionKind::Exists(id) | ExpressionKind::Any(id) | ExpressionKind::SubqueryValue(id) =
        expression.kind
    {
        return rewrite_plan(graph, id, rewriter);
    }
    for child in expression.children_mut() {
        let taken = std::mem::replace(child, Expression::null());
        *child = rewrite_expression(graph, taken, rewriter)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::executor::result::DataValue;

    struct CountingVisitor {
        nodes: Vec<&'static str>,
        constants: usize,
    }

    impl PlanVisitor for CountingVisitor {
        fn visit_enter(&mut self, graph: &PlanGraph, node: NodeId) -> bool {
            self.nodes.push(graph.kind(node).name());
            true
        }

        fn visit(&mut self, graph: &PlanGraph, node: NodeId) -> bool {
            self.nodes.push(graph.kind(node).name());
            true
        }

        fn expression_visit(&mut self, _graph: &PlanGraph, expression: &Expression) -> bool {
            if expression.is_constant() {
                self.constants += 1;
            }
            true
        }
    }

    /// Replaces integer constants by their successor
    struct Increment {
        children_first: bool,
        seen: Vec<String>,
    }

    impl PlanRewriter for Increment {
        fn visit_children_first(&self, _expression: &Expression) -> bool {
            self.children_first
        }

        fn rewrite(&mut self, _graph: &mut PlanGraph, expression: Expression) -> QueryResult<Expression> {
            self.seen.push(expression.to_string());
            if let Some(DataValue::Integer(i)) = expression.constant_value() {
                return Ok(Expression::integer(i + 1));
            }
            Ok(expression)
        }
    }

    fn sample() -> (PlanGraph, NodeId) {
        let mut graph = PlanGraph::new();
        let values = graph.add(PlanNodeKind::NullSource);
        let inner = graph.add(PlanNodeKind::Select { input: values, conditions: vec![Expression::integer(10)] });
        let subquery = graph.add(PlanNodeKind::Subquery { input: inner });
        graph.set_output(subquery, None);
        let source = graph.add(PlanNodeKind::NullSource);
        let select = graph.add(PlanNodeKind::Select {
            input: source,
            conditions: vec![
                Expression::equals(Expression::integer(1), Expression::integer(2)),
                Expression::exists(subquery),
            ],
        });
        graph.set_root(select);
        (graph, select)
    }

    #[test]
    fn test_visitor_descends_into_subqueries() {
        let (graph, root) = sample();
        let mut visitor = CountingVisitor { nodes: Vec::new(), constants: 0 };
        accept(&graph, root, &mut visitor);
        assert_eq!(visitor.nodes, vec!["Select", "NullSource", "Subquery", "Select", "NullSource"]);
        assert_eq!(visitor.constants, 3);
    }

    #[test]
    fn test_rewrite_order() -> QueryResult<()> {
        let (mut graph, root) = sample();
        let mut post = Increment { children_first: true, seen: Vec::new() };
        rewrite_plan(&mut graph, root, &mut post)?;
        assert_eq!(post.seen[0], "1");
        assert_eq!(post.seen[2], "2 == 3");

        let mut pre = Increment { children_first: false, seen: Vec::new() };
        rewrite_plan(&mut graph, root, &mut pre)?;
        assert_eq!(pre.seen[0], "2 == 3");
        match graph.kind(root) {
            PlanNodeKind::Select { conditions, .. } => assert_eq!(conditions[0].to_string(), "3 == 4"),
            _ => unreachable!(),
        }
        Ok(())
    }

    #[test]
    fn test_rewrite_reaches_subquery_plan() -> QueryResult<()> {
        let (mut graph, root) = sample();
        let mut rewriter = Increment { children_first: true, seen: Vec::new() };
        rewrite_plan(&mut graph, root, &mut rewriter)?;
        assert!(rewriter.seen.iter().any(|s| s == "10"));
        match graph.kind(NodeId(1)) {
            PlanNodeKind::Select { conditions, .. } => assert_eq!(conditions[0], Expression::integer(11)),
            _ => unreachable!(),
        }
        Ok(())
    }
}
