//! The rule pipeline: turns a logical plan into a validated physical plan.
//!
//! Planning runs two phases over the same plan, each to its own fixpoint:
//!
//! 1. criteria placement, matched top down, moves filters towards the sources;
//! 2. physical planning, matched bottom up, assigns accesses, merges virtual groups and unions,
//!    pushes subqueries, selects dependent joins and join strategies, pushes limits and
//!    finally implements whatever is left as in-process nodes.
//!
//! The result is checked before it is returned; no partial plan ever leaves the planner.

use std::sync::Arc;

use anyhow::bail;
use log::{debug, info};

use crate::capability::CapabilityRegistry;
use crate::config::OptimizerConfig;
use crate::error::{OptResult, OptimizerError};
use crate::exec::eval::LOCAL_FUNCTIONS;
use crate::expr::Expr;
use crate::heuristic::{HepOptimizer, MatchOrder};
use crate::operator::Operator;
use crate::optimizer::{Optimizer, OptimizerContext};
use crate::plan::Plan;
use crate::rules::{criteria_placement_rules, physical_rules, RuleImpl};
use crate::stat::CardinalityHints;

pub struct Planner {
    registry: Arc<CapabilityRegistry>,
    hints: Arc<dyn CardinalityHints>,
    config: OptimizerConfig,
}

impl Planner {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        hints: Arc<dyn CardinalityHints>,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            registry,
            hints,
            config,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn plan(&self, plan: Plan) -> OptResult<Plan> {
        let plan = self.run_phase(
            "criteria placement",
            MatchOrder::TopDown,
            criteria_placement_rules(),
            plan,
        )?;
        let plan = self.run_phase(
            "physical planning",
            MatchOrder::BottomUp,
            physical_rules(),
            plan,
        )?;
        validate(&plan)?;
        info!("Planned {} nodes", plan.bfs_iterator().count());
        Ok(plan)
    }

    fn run_phase(
        &self,
        phase: &str,
        order: MatchOrder,
        rules: Vec<RuleImpl>,
        plan: Plan,
    ) -> OptResult<Plan> {
        debug!("Starting {} phase", phase);
        let context = OptimizerContext::new(
            self.registry.clone(),
            self.hints.clone(),
            self.config.clone(),
        );
        HepOptimizer::new(order, self.config.max_rule_applications, rules, plan, context)
            .find_best_plan()
    }
}

/// Checks that `plan` is executable: physical throughout, with local expressions the engine
/// can evaluate and accesses whose patterns are bound.
pub fn validate(plan: &Plan) -> OptResult<()> {
    for node in plan.bfs_iterator() {
        let op = match node.operator() {
            Operator::Physical(op) => op,
            Operator::Logical(op) => bail!(OptimizerError::CapabilityUnsupported(format!(
                "no source or local implementation for {}",
                op
            ))),
        };
        for expr in op.local_exprs() {
            check_local(expr)?;
        }
        if let Some(access) = op.access() {
            if !access.is_satisfied() {
                bail!(OptimizerError::UnsatisfiableAccessPattern(format!(
                    "access patterns of {} are not bound",
                    access
                )));
            }
        }
    }
    Ok(())
}

fn check_local(expr: &Expr) -> OptResult<()> {
    for e in expr.walk() {
        match e {
            Expr::Function { name, .. }
                if !LOCAL_FUNCTIONS.contains(name.to_lowercase().as_str()) =>
            {
                bail!(OptimizerError::CapabilityUnsupported(format!(
                    "function {} is neither pushed nor evaluated locally",
                    name
                )))
            }
            Expr::Exists(_) | Expr::InSubquery { .. } | Expr::ScalarSubquery(_) => {
                bail!(OptimizerError::CapabilityUnsupported(format!(
                    "subquery {} cannot be evaluated locally",
                    e
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, func};

    #[test]
    fn test_local_function_check() {
        assert!(check_local(&func("UPPER", vec![col("a", "x")])).is_ok());
        let err = check_local(&func("soundex", vec![col("a", "x")]).eq(col("a", "y"))).unwrap_err();
        assert!(matches!(
            OptimizerError::of(&err),
            Some(OptimizerError::CapabilityUnsupported(_))
        ));
    }
}
