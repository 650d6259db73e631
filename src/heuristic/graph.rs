use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use petgraph::prelude::{NodeIndex, StableGraph};
use petgraph::visit::EdgeRef;
use petgraph::{Directed, Direction};

use crate::error::OptResult;
use crate::expr::ColumnRef;
use crate::heuristic::{HepOptimizer, MatchOrder};
use crate::operator::Operator;
use crate::optimizer::{OptExpr, OptExprHandle};
use crate::plan::{Plan, PlanNode, PlanNodeBuilder, PlanNodeId, PlanNodeRef};
use crate::properties::LogicalProperty;
use crate::rules::OptExprNode::{ExprHandleNode, OperatorNode};
use crate::rules::OptExpression;
use crate::stat::Statistics;

/// Edge weights are the input positions of the child.
type HepGraph = StableGraph<HepOptimizerNode, usize, Directed, PlanNodeId>;
pub type HepNodeId = NodeIndex<PlanNodeId>;

pub struct HepOptimizerNode {
    id: HepNodeId,
    operator: Operator,
    logical_prop: LogicalProperty,
}

/// Outcome of replacing one node by a rule result.
pub(super) struct Replacement {
    /// Root of the inserted sub-tree.
    pub(super) root: HepNodeId,
    /// Newly inserted nodes, in post order.
    pub(super) inserted: Vec<HepNodeId>,
    /// Nodes removed from the graph. Their ids may be reused by later insertions.
    pub(super) removed: Vec<HepNodeId>,
    /// Ancestors of the replaced node, whose derived state is stale.
    pub(super) ancestors: Vec<HepNodeId>,
}

/// A plan should be a single root tree.
pub(super) struct PlanGraph {
    pub(super) graph: HepGraph,
    root: HepNodeId,
}

impl PlanGraph {
    pub(super) fn contains(&self, node_id: HepNodeId) -> bool {
        self.graph.contains_node(node_id)
    }

    /// Children ordered by input position.
    pub(super) fn inputs_of(&self, node_id: HepNodeId) -> Vec<HepNodeId> {
        let mut edges: Vec<(usize, HepNodeId)> = self
            .graph
            .edges_directed(node_id, Direction::Outgoing)
            .map(|e| (*e.weight(), e.target()))
            .collect();
        edges.sort_by_key(|(idx, _)| *idx);
        edges.into_iter().map(|(_, id)| id).collect()
    }

    pub(super) fn parent_of(&self, node_id: HepNodeId) -> Option<HepNodeId> {
        self.graph
            .neighbors_directed(node_id, Direction::Incoming)
            .next()
    }

    pub(super) fn nodes_iter(&self, match_order: MatchOrder) -> Vec<HepNodeId> {
        self.nodes_from(self.root, match_order)
    }

    /// Nodes of the sub-tree rooted at `start`: children before parents for bottom up, parents
    /// before children for top down. Inputs are visited in input order.
    pub(super) fn nodes_from(&self, start: HepNodeId, match_order: MatchOrder) -> Vec<HepNodeId> {
        let mut ids = Vec::with_capacity(self.graph.node_count());
        let mut stack = vec![(start, false)];
        while let Some((node_id, expanded)) = stack.pop() {
            match match_order {
                MatchOrder::TopDown => {
                    ids.push(node_id);
                    stack.extend(self.inputs_of(node_id).into_iter().rev().map(|i| (i, false)));
                }
                MatchOrder::BottomUp if expanded => ids.push(node_id),
                MatchOrder::BottomUp => {
                    stack.push((node_id, true));
                    stack.extend(self.inputs_of(node_id).into_iter().rev().map(|i| (i, false)));
                }
            }
        }
        ids
    }

    /// Replace relational expression with optimizer rule result.
    ///
    /// # Return
    ///
    /// `None` when the rule result is the original node itself, i.e. the graph did not change.
    pub(super) fn replace_opt_expression(
        &mut self,
        opt_expr: OptExpression<HepOptimizer>,
        origin_node_id: HepNodeId,
    ) -> OptResult<Option<Replacement>> {
        let parent_edges: Vec<(HepNodeId, usize)> = self
            .graph
            .edges_directed(origin_node_id, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect();

        let mut inserted = vec![];
        let new_node_id = self.insert_opt_node(&opt_expr, &mut inserted)?;
        if new_node_id == origin_node_id {
            return Ok(None);
        }

        let mut ancestors = vec![];
        let mut cursor = self.parent_of(origin_node_id);
        while let Some(parent) = cursor {
            ancestors.push(parent);
            cursor = self.parent_of(parent);
        }

        // Redirect parents's child to new node
        for (parent, idx) in parent_edges {
            if let Some(edge) = self.graph.find_edge(parent, origin_node_id) {
                self.graph.remove_edge(edge);
            }
            self.graph.add_edge(parent, new_node_id, idx);
        }
        if self.root == origin_node_id {
            self.root = new_node_id;
        }

        let removed = self.prune_unreachable();
        Ok(Some(Replacement {
            root: new_node_id,
            inserted,
            removed,
            ancestors,
        }))
    }

    fn insert_opt_node(
        &mut self,
        opt_expr: &OptExpression<HepOptimizer>,
        inserted: &mut Vec<HepNodeId>,
    ) -> OptResult<HepNodeId> {
        match opt_expr.node() {
            ExprHandleNode(expr_handle) => Ok(*expr_handle),
            OperatorNode(operator) => {
                let input_hep_node_ids = opt_expr
                    .inputs()
                    .iter()
                    .map(|input_expr| self.insert_opt_node(input_expr, inserted))
                    .collect::<OptResult<Vec<HepNodeId>>>()?;

                let schema = {
                    let input_schemas: Vec<&[ColumnRef]> = input_hep_node_ids
                        .iter()
                        .map(|id| self.graph[*id].logical_prop.schema())
                        .collect();
                    operator.derive_schema(&input_schemas)?
                };

                let hep_node = HepOptimizerNode {
                    id: HepNodeId::default(),
                    operator: operator.clone(),
                    logical_prop: LogicalProperty::new(schema),
                };

                let new_node_id = self.graph.add_node(hep_node);
                // reset node id
                self.graph[new_node_id].id = new_node_id;
                for (idx, input_hep_node_id) in input_hep_node_ids.into_iter().enumerate() {
                    self.graph.add_edge(new_node_id, input_hep_node_id, idx);
                }
                inserted.push(new_node_id);
                Ok(new_node_id)
            }
        }
    }

    /// Removes nodes no longer reachable from the root.
    fn prune_unreachable(&mut self) -> Vec<HepNodeId> {
        let reachable: HashSet<HepNodeId> = self
            .nodes_from(self.root, MatchOrder::TopDown)
            .into_iter()
            .collect();
        let removed: Vec<HepNodeId> = self
            .graph
            .node_indices()
            .filter(|id| !reachable.contains(id))
            .collect();
        for id in &removed {
            self.graph.remove_node(*id);
        }
        removed
    }

    /// Converts the graph back to a plan tree, attaching the statistics `stat_of` returns.
    pub(super) fn to_plan<F>(&self, mut stat_of: F) -> OptResult<Plan>
    where
        F: FnMut(HepNodeId) -> Option<Statistics>,
    {
        let mut next_plan_node_id: PlanNodeId = 0;
        let mut hep_node_id_to_plan_node = HashMap::<HepNodeId, PlanNodeRef>::new();
        // Traverse nodes in bottom up order, when visiting a node, its children all inserted
        // into map
        for node_id in self.nodes_iter(MatchOrder::BottomUp) {
            let node = &self.graph[node_id];
            let inputs = self
                .inputs_of(node_id)
                .into_iter()
                .map(|input_id| {
                    hep_node_id_to_plan_node
                        .get(&input_id)
                        .cloned()
                        .ok_or_else(|| anyhow!("input {:?} of {:?} not converted", input_id, node_id))
                })
                .collect::<OptResult<Vec<PlanNodeRef>>>()?;

            let plan_node = PlanNodeBuilder::new(next_plan_node_id, &node.operator)
                .with_statistics(stat_of(node_id))
                .with_logical_prop(Some(node.logical_prop.clone()))
                .add_inputs(inputs)
                .build()?;
            next_plan_node_id += 1;
            hep_node_id_to_plan_node.insert(node_id, Arc::new(plan_node));
        }

        hep_node_id_to_plan_node
            .get(&self.root)
            .map(|plan_node| Plan::new(plan_node.clone()))
            .ok_or_else(|| anyhow!("plan root not converted"))
    }
}

/// Converts from raw plan to plan graph.
impl From<Plan> for PlanGraph {
    fn from(plan: Plan) -> Self {
        let mut graph = HepGraph::default();
        let mut node_id_map = HashMap::<PlanNodeId, HepNodeId>::new();
        let mut edges = vec![];

        for plan_node_ref in plan.bfs_iterator() {
            for (idx, input) in plan_node_ref.inputs().iter().enumerate() {
                edges.push((plan_node_ref.id(), input.id(), idx));
            }
            let plan_node = (&*plan_node_ref).into();
            let hep_node_id = graph.add_node(plan_node);
            graph[hep_node_id].id = hep_node_id;
            node_id_map.insert(plan_node_ref.id(), hep_node_id);
        }

        // Every id was inserted by the traversal above.
        for (node_id, input_id, idx) in edges {
            graph.add_edge(node_id_map[&node_id], node_id_map[&input_id], idx);
        }

        Self {
            graph,
            root: node_id_map[&plan.root().id()],
        }
    }
}

impl<'a> From<&'a PlanNode> for HepOptimizerNode {
    fn from(t: &'a PlanNode) -> Self {
        Self {
            id: HepNodeId::default(),
            operator: t.operator().clone(),
            logical_prop: t.logical_prop().clone(),
        }
    }
}

impl OptExpr for HepOptimizerNode {
    type InputHandle = HepNodeId;
    type O = HepOptimizer;

    fn operator(&self) -> &Operator {
        &self.operator
    }

    fn logical_prop(&self) -> &LogicalProperty {
        &self.logical_prop
    }

    fn inputs_len(&self, opt: &HepOptimizer) -> usize {
        opt.graph
            .graph
            .neighbors_directed(self.id, Direction::Outgoing)
            .count()
    }

    fn input_at(&self, idx: usize, opt: &HepOptimizer) -> HepNodeId {
        opt.graph.inputs_of(self.id)[idx]
    }
}

impl OptExprHandle for HepNodeId {
    type O = HepOptimizer;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;
    use crate::operator::{JoinKind, Source};
    use crate::plan::LogicalPlanBuilder;

    fn plan() -> Plan {
        let mut builder = LogicalPlanBuilder::new();
        let right = builder
            .source(Source::new("s2", "b", "t2", &["k"]))
            .build()
            .unwrap()
            .root();
        builder
            .source(Source::new("s1", "a", "t1", &["k"]))
            .join(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))], right)
            .build()
            .unwrap()
    }

    #[test]
    fn test_round_trip_keeps_input_order() {
        let plan = plan();
        let graph = PlanGraph::from(plan.clone());
        assert_eq!(graph.to_plan(|_| None).unwrap(), plan);
    }

    #[test]
    fn test_traversal_orders() {
        let graph = PlanGraph::from(plan());
        let names = |order| {
            graph
                .nodes_iter(order)
                .into_iter()
                .map(|id| graph.graph[id].operator.to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(
            names(MatchOrder::BottomUp),
            vec!["Source(s1: t1 AS a)", "Source(s2: t2 AS b)", "Join(INNER JOIN ON a.k = b.k)"]
        );
        assert_eq!(names(MatchOrder::TopDown)[0], "Join(INNER JOIN ON a.k = b.k)");
    }
}
