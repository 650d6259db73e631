use crate::command::SortKey;
use crate::error::OptResult;
use crate::expr::Expr;
use crate::operator::LogicalOperator::LogicalJoin;
use crate::operator::PhysicalOperator::{PhysicalAccess, PhysicalJoinStrategy};
use crate::operator::{Access, EquiCriteria, JoinAlgorithm, JoinStrategy, Operator, Side};
use crate::optimizer::{Optimizer, OptimizerContext};
use crate::rules::assign_access::access_of;
use crate::rules::{OptExpression, Pattern, Rule, RuleResult};

lazy_static! {
    static ref PATTERN: Pattern =
        Pattern::leaf(|op| matches!(op, Operator::Logical(LogicalJoin(_))));
}

/// Picks the local algorithm of a join which stays in the engine.
///
/// A merge join is chosen when every criterion is an equality between the sides and both
/// sides are accesses able to deliver their rows ordered on the keys. Everything else is a
/// nested loop join materializing the smaller side.
#[derive(Clone, Debug)]
pub struct JoinStrategyRule;

impl Rule for JoinStrategyRule {
    fn apply<O: Optimizer>(
        &self,
        input: OptExpression<O>,
        opt: &O,
        result: &mut RuleResult<O>,
    ) -> OptResult<()> {
        let join = match input.operator(opt) {
            Operator::Logical(LogicalJoin(join)) => join,
            _ => return Ok(()),
        };
        let (left, right) = match (input.input(0).handle(), input.input(1).handle()) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(()),
        };
        let equi = EquiCriteria::split(join.criteria(), opt.schema_at(left), opt.schema_at(right));

        if !equi.pairs.is_empty() && equi.residual.is_empty() {
            let (left_keys, right_keys): (Vec<_>, Vec<_>) = equi.pairs.iter().cloned().unzip();
            let sorted = match (access_of(input.input(0), opt), access_of(input.input(1), opt)) {
                (Some(l), Some(r)) => sorted_access(l, &left_keys, opt.context())
                    .zip(sorted_access(r, &right_keys, opt.context())),
                _ => None,
            };
            if let Some((l, r)) = sorted {
                let strategy = JoinStrategy::new(
                    join.kind(),
                    join.criteria().to_vec(),
                    JoinAlgorithm::Merge {
                        left_keys,
                        right_keys,
                    },
                );
                result.add(OptExpression::with_operator(
                    PhysicalJoinStrategy(strategy),
                    [
                        OptExpression::with_operator(PhysicalAccess(l), []),
                        OptExpression::with_operator(PhysicalAccess(r), []),
                    ],
                ));
                return Ok(());
            }
        }

        let (l, r) = (opt.estimate(left), opt.estimate(right));
        let materialize = match (l.cardinality(), r.cardinality()) {
            (Some(l), Some(r)) if l < r => Side::Left,
            _ => Side::Right,
        };
        let strategy = JoinStrategy::new(
            join.kind(),
            join.criteria().to_vec(),
            JoinAlgorithm::NestedLoop { materialize },
        );
        result.add(OptExpression::with_operator(
            PhysicalJoinStrategy(strategy),
            [input.input(0).reuse(), input.input(1).reuse()],
        ));
        Ok(())
    }

    fn pattern(&self) -> &Pattern {
        &PATTERN
    }
}

/// `access` with its command ordered ascending on `keys`, if the source can do it.
fn sorted_access(
    access: &Access,
    keys: &[Expr],
    ctx: &OptimizerContext,
) -> Option<Access> {
    let keys: Vec<SortKey> = keys.iter().cloned().map(SortKey::asc).collect();
    access
        .command()
        .push_sort(&keys)
        .filter(|c| ctx.registry().validate(access.source(), c).is_ok())
        .map(|c| access.with_command(c))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capability::{Capability, CapabilityRegistry, SourceCapabilities};
    use crate::command::scan_command;
    use crate::config::OptimizerConfig;
    use crate::expr::col;
    use crate::stat::NoStatistics;

    #[test]
    fn test_sorted_access_requires_order_by() {
        let access = Access::new("s1".into(), scan_command("a", "t", &["k", "v"]), vec![]);
        let context = |caps| {
            OptimizerContext::new(
                Arc::new(CapabilityRegistry::new().register("s1", caps)),
                Arc::new(NoStatistics),
                OptimizerConfig::default(),
            )
        };

        let sorted = sorted_access(&access, &[col("a", "k")], &context(SourceCapabilities::full()));
        assert_eq!(
            sorted.unwrap().command().to_string(),
            "SELECT a.k, a.v FROM t AS a ORDER BY a.k"
        );
        let ctx = context(SourceCapabilities::full().without(Capability::OrderBy));
        assert!(sorted_access(&access, &[col("a", "k")], &ctx).is_none());
    }
}
