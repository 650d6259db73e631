use std::collections::VecDeque;

use anyhow::ensure;
use log::{debug, error, trace};

use crate::cost::{CostEstimate, CostEstimator};
use crate::error::{OptResult, OptimizerError};
use crate::heuristic::binding::Binding;
use crate::heuristic::graph::{HepOptimizerNode, PlanGraph, Replacement};
use crate::heuristic::HepNodeId;
use crate::optimizer::{OptExpr, Optimizer, OptimizerContext};
use crate::plan::Plan;
use crate::rules::{Rule, RuleImpl, RuleResult};

/// Number of rule names kept for the `PlanningExhausted` report.
const RULE_TRAIL_LEN: usize = 10;

/// Match order of plan tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchOrder {
    BottomUp,
    TopDown,
}

pub struct HepOptimizer {
    match_order: MatchOrder,
    /// Max number of successful rule applications.
    max_rule_applications: usize,
    rules: Vec<RuleImpl>,
    pub(super) graph: PlanGraph,
    context: OptimizerContext,
    estimator: CostEstimator<HepNodeId>,
    applications: usize,
    rule_trail: VecDeque<&'static str>,
}

impl Optimizer for HepOptimizer {
    type Expr = HepOptimizerNode;
    type ExprHandle = HepNodeId;

    fn context(&self) -> &OptimizerContext {
        &self.context
    }

    fn expr_at(&self, expr_handle: HepNodeId) -> &HepOptimizerNode {
        &self.graph.graph[expr_handle]
    }

    fn estimate(&self, expr_handle: HepNodeId) -> CostEstimate {
        self.estimator.estimate(expr_handle, self)
    }

    /// Applies rules until a full pass over the plan changes nothing.
    ///
    /// Within a pass, the nodes created by a rule application are matched next. The parent of
    /// the rewritten sub-tree keeps its place in the worklist, so with bottom up matching a node
    /// is always matched after all of its inputs settled.
    fn find_best_plan(mut self) -> OptResult<Plan> {
        loop {
            let mut fixed_point = true;
            let mut worklist: VecDeque<HepNodeId> =
                self.graph.nodes_iter(self.match_order).into();
            while let Some(node_id) = worklist.pop_front() {
                if !self.graph.contains(node_id) {
                    continue;
                }
                for rule in &*self.rules.clone() {
                    trace!(
                        "Trying to apply rule {:?} to expression {}",
                        rule,
                        self.expr_at(node_id).operator()
                    );
                    if let Some(replacement) = self.apply_rule(rule, node_id)? {
                        fixed_point = false;
                        self.record_application(rule)?;
                        self.schedule(&replacement, &mut worklist);
                        break;
                    }
                }
            }

            if fixed_point {
                break;
            }
        }

        let estimator = &self.estimator;
        let this = &self;
        self.graph
            .to_plan(|node_id| Some(estimator.statistics(node_id, this)))
    }
}

impl HepOptimizer {
    pub fn new(
        match_order: MatchOrder,
        max_rule_applications: usize,
        rules: Vec<RuleImpl>,
        plan: Plan,
        context: OptimizerContext,
    ) -> Self {
        Self {
            match_order,
            max_rule_applications,
            rules,
            graph: PlanGraph::from(plan),
            context,
            estimator: CostEstimator::new(),
            applications: 0,
            rule_trail: VecDeque::with_capacity(RULE_TRAIL_LEN),
        }
    }

    fn apply_rule(
        &mut self,
        rule: &RuleImpl,
        expr_handle: HepNodeId,
    ) -> OptResult<Option<Replacement>> {
        let original_hep_node_id = expr_handle;
        let opt_node = match Binding::new(expr_handle, rule.pattern(), self).next() {
            Some(opt_node) => opt_node,
            None => return Ok(None),
        };
        let mut results = RuleResult::new();
        rule.apply(opt_node, self, &mut results)?;

        let mut results = results.into_results();
        ensure!(
            results.len() <= 1,
            "Rewrite rule should not return no more than 1 result."
        );
        let new_expr = match results.pop() {
            Some(new_expr) => new_expr,
            // No transformation generated.
            None => return Ok(None),
        };

        let replacement = self
            .graph
            .replace_opt_expression(new_expr, original_hep_node_id)?;
        if let Some(replacement) = &replacement {
            self.estimator.invalidate(
                replacement
                    .removed
                    .iter()
                    .chain(&replacement.ancestors)
                    .copied(),
            );
            debug!(
                "Applied rule {:?}, new expression {}",
                rule,
                self.expr_at(replacement.root).operator()
            );
        }
        Ok(replacement)
    }

    fn record_application(&mut self, rule: &RuleImpl) -> OptResult<()> {
        self.applications += 1;
        if self.rule_trail.len() == RULE_TRAIL_LEN {
            self.rule_trail.pop_front();
        }
        self.rule_trail.push_back(rule.into());
        if self.applications > self.max_rule_applications {
            let rule_trail: Vec<String> = self.rule_trail.iter().map(|r| r.to_string()).collect();
            error!(
                "No fixed point after {} rule applications, last rules: {:?}",
                self.max_rule_applications, rule_trail
            );
            return Err(OptimizerError::PlanningExhausted {
                applications: self.max_rule_applications,
                rule_trail,
            }
            .into());
        }
        Ok(())
    }

    /// Puts the nodes created by a rewrite in front of the worklist, in match order.
    fn schedule(&self, replacement: &Replacement, worklist: &mut VecDeque<HepNodeId>) {
        let next: Vec<HepNodeId> = self
            .graph
            .nodes_from(replacement.root, self.match_order)
            .into_iter()
            .filter(|id| replacement.inserted.contains(id))
            .collect();
        for id in next.into_iter().rev() {
            worklist.push_front(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capability::{CapabilityRegistry, SourceCapabilities};
    use crate::command::SortKey;
    use crate::config::OptimizerConfig;
    use crate::expr::{col, conjunction, lit, Expr};
    use crate::heuristic::MatchOrder;
    use crate::operator::LogicalOperator::{LogicalJoin, LogicalLimit, LogicalSort};
    use crate::operator::{JoinKind, Operator, Source};
    use crate::plan::LogicalPlanBuilder;
    use crate::rules::{criteria_placement_rules, physical_rules, LimitSortPushdown};
    use crate::stat::NoStatistics;

    fn optimize(order: MatchOrder, rules: Vec<RuleImpl>, plan: Plan) -> Plan {
        let context = OptimizerContext::new(
            Arc::new(CapabilityRegistry::new()),
            Arc::new(NoStatistics),
            OptimizerConfig::default(),
        );
        HepOptimizer::new(order, 100, rules, plan, context)
            .find_best_plan()
            .unwrap()
    }

    fn joined(kind: JoinKind, filter: Expr) -> Plan {
        let mut builder = LogicalPlanBuilder::new();
        let right = builder
            .source(Source::new("s2", "b", "t2", &["k", "w"]))
            .build()
            .unwrap()
            .root();
        builder
            .source(Source::new("s1", "a", "t1", &["k", "v"]))
            .join(kind, vec![col("a", "k").eq(col("b", "k"))], right)
            .select(filter)
            .build()
            .unwrap()
    }

    #[test]
    fn test_criteria_move_below_inner_join() {
        let filter = conjunction([
            col("a", "v").eq(lit(1)),
            col("b", "w").eq(lit(2)),
            col("a", "k").lt(col("b", "w")),
        ])
        .unwrap();
        let plan = optimize(
            MatchOrder::TopDown,
            criteria_placement_rules(),
            joined(JoinKind::Inner, filter),
        );

        let root = plan.root();
        match root.operator() {
            Operator::Logical(LogicalJoin(join)) => assert_eq!(2, join.criteria().len()),
            other => panic!("expected a join at the root, got {}", other),
        }
        for input in root.inputs() {
            assert_eq!("Select", input.operator().name());
            assert_eq!("Source", input.inputs()[0].operator().name());
        }
    }

    #[test]
    fn test_preserved_side_criteria_stay_above_outer_join() {
        let filter = conjunction([col("a", "v").eq(lit(1)), col("b", "w").eq(lit(2))]).unwrap();
        let plan = optimize(
            MatchOrder::TopDown,
            criteria_placement_rules(),
            joined(JoinKind::LeftOuter, filter),
        );

        let root = plan.root();
        assert_eq!("Select", root.operator().name());
        assert_eq!(root.operator().to_string(), "Select(b.w = 2)");
        let join = &root.inputs()[0];
        assert_eq!("Select", join.inputs()[0].operator().name());
        assert_eq!("Source", join.inputs()[1].operator().name());
    }

    #[test]
    fn test_stacked_limits_combine() {
        let plan = LogicalPlanBuilder::new()
            .source(Source::new("s1", "a", "t1", &["k"]))
            .limit(2, Some(10))
            .limit(0, Some(5))
            .build()
            .unwrap();
        let plan = optimize(MatchOrder::BottomUp, vec![LimitSortPushdown.into()], plan);

        match plan.root().operator() {
            Operator::Logical(LogicalLimit(limit)) => {
                assert_eq!(2, limit.offset());
                assert_eq!(Some(5), limit.count());
            }
            other => panic!("expected a limit, got {}", other),
        }
        assert_eq!("Source", plan.root().inputs()[0].operator().name());
    }

    #[test]
    fn test_outer_sort_replaces_inner_sort() {
        let plan = LogicalPlanBuilder::new()
            .source(Source::new("s1", "a", "t1", &["k", "v"]))
            .sort(vec![SortKey::asc(col("a", "v"))])
            .sort(vec![SortKey::desc(col("a", "k"))])
            .build()
            .unwrap();
        let plan = optimize(MatchOrder::BottomUp, vec![LimitSortPushdown.into()], plan);

        match plan.root().operator() {
            Operator::Logical(LogicalSort(sort)) => {
                assert_eq!(vec![SortKey::desc(col("a", "k"))], sort.keys().to_vec())
            }
            other => panic!("expected a sort, got {}", other),
        }
        assert_eq!("Source", plan.root().inputs()[0].operator().name());
    }

    #[test]
    fn test_budget_is_enforced() {
        let plan = LogicalPlanBuilder::new()
            .source(Source::new("s1", "a", "t1", &["k"]))
            .limit(0, Some(3))
            .limit(0, Some(2))
            .limit(0, Some(1))
            .build()
            .unwrap();
        let context = OptimizerContext::new(
            Arc::new(CapabilityRegistry::new()),
            Arc::new(NoStatistics),
            OptimizerConfig::default(),
        );
        let err = HepOptimizer::new(
            MatchOrder::BottomUp,
            1,
            vec![LimitSortPushdown.into()],
            plan,
            context,
        )
        .find_best_plan()
        .unwrap_err();
        assert!(matches!(
            OptimizerError::of(&err),
            Some(OptimizerError::PlanningExhausted { .. })
        ));
    }

    #[test]
    fn test_binary_node_waits_for_both_inputs() {
        let mut builder = LogicalPlanBuilder::new();
        let right = builder
            .source(Source::new("s1", "b", "t2", &["k", "w"]))
            .build()
            .unwrap()
            .root();
        let plan = builder
            .source(Source::new("s1", "a", "t1", &["k", "v"]))
            .join(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))], right)
            .build()
            .unwrap();
        let context = OptimizerContext::new(
            Arc::new(CapabilityRegistry::new().register("s1", SourceCapabilities::full())),
            Arc::new(NoStatistics),
            OptimizerConfig::default(),
        );
        let plan = HepOptimizer::new(MatchOrder::BottomUp, 100, physical_rules(), plan, context)
            .find_best_plan()
            .unwrap();

        // Rewriting the left source must not expose the join while its right input is logical.
        assert_eq!("Access", plan.root().operator().name());
        assert!(plan.root().inputs().is_empty());
    }
}
