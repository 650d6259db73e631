use log::{debug, warn};

use crate::capability::Capability;
use crate::cost::CostEstimate;
use crate::error::{OptResult, OptimizerError};
use crate::operator::LogicalOperator::LogicalJoin;
use crate::operator::PhysicalOperator::{PhysicalDependentAccess, PhysicalJoinStrategy};
use crate::operator::{
    Access, DependentAccess, DependentJoin, EquiCriteria, Join, JoinAlgorithm, JoinHint,
    JoinStrategy, Operator, Side,
};
use crate::optimizer::{Optimizer, OptimizerContext};
use crate::rules::assign_access::access_of;
use crate::rules::{OptExpression, Pattern, Rule, RuleResult};

lazy_static! {
    static ref PATTERN: Pattern =
        Pattern::leaf(|op| matches!(op, Operator::Logical(LogicalJoin(_))));
}

/// Turns a join into a dependent join: the driving side runs first and the distinct values of
/// its join key constrain the access of the dependent side.
///
/// A side becomes dependent when its access pattern is not bound otherwise, when it carries a
/// `MAKEDEP` hint, or when it is weak while the other side is strong. Only the first equality
/// pair of the join criteria feeds the value set.
#[derive(Clone, Debug)]
pub struct DependentJoinRule;

impl Rule for DependentJoinRule {
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
        let ctx = opt.context();
        let accesses = [access_of(input.input(0), opt), access_of(input.input(1), opt)];
        let equi = EquiCriteria::split(join.criteria(), opt.schema_at(left), opt.schema_at(right));

        let (dependent, reason) = match choose_side(join, &accesses, &equi, ctx, || {
            (opt.estimate(left), opt.estimate(right))
        })? {
            Some(choice) => choice,
            None => return Ok(()),
        };
        let access = match accesses[dependent.index()] {
            Some(access) => access,
            None => return Ok(()),
        };
        let (driving_key, key) = match (dependent, equi.pairs.first()) {
            (Side::Right, Some((l, r))) => (l.clone(), r.clone()),
            (Side::Left, Some((l, r))) => (r.clone(), l.clone()),
            (_, None) => return Ok(()),
        };

        let value_set = ctx.next_value_set_name();
        let command = access
            .command()
            .with_dependent_set(&key, &value_set)
            .filter(|c| ctx.registry().validate(access.source(), c).is_ok());
        let command = match (command, reason) {
            (Some(command), _) => command,
            (None, Reason::Cost) => {
                debug!(
                    "Source {} cannot take {} IN (<{}>), joining {} plainly",
                    access.source(),
                    key,
                    value_set,
                    join
                );
                return Ok(());
            }
            (None, Reason::Required) => {
                return Err(OptimizerError::UnsatisfiableAccessPattern(format!(
                    "source {} cannot take the dependent criteria {} IN (<{}>)",
                    access.source(),
                    key,
                    value_set
                ))
                .into())
            }
        };
        debug!(
            "Join {} made dependent on the {} side through {}",
            join, dependent, value_set
        );

        let driving = dependent.other();
        let strategy = JoinStrategy::new(
            join.kind(),
            join.criteria().to_vec(),
            JoinAlgorithm::NestedLoop {
                materialize: driving,
            },
        )
        .with_dependent(DependentJoin {
            value_set: value_set.clone(),
            driving,
            driving_key,
        });
        let dependent_expr = OptExpression::with_operator(
            PhysicalDependentAccess(DependentAccess::new(access.with_command(command), value_set)),
            [],
        );
        let driving_expr = input.input(driving.index()).reuse();
        let inputs = match dependent {
            Side::Left => [dependent_expr, driving_expr],
            Side::Right => [driving_expr, dependent_expr],
        };
        result.add(OptExpression::with_operator(
            PhysicalJoinStrategy(strategy),
            inputs,
        ));
        Ok(())
    }

    fn pattern(&self) -> &Pattern {
        &PATTERN
    }
}

/// What made a side dependent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reason {
    /// An unbound access pattern or a `MAKEDEP` hint. Failing to build it fails planning.
    Required,
    /// The cost model only. Failing to build it leaves a plain join.
    Cost,
}

/// Whether `side` may be made dependent at all.
fn eligible(join: &Join, side: Side, access: Option<&Access>) -> bool {
    access.is_some() && join.kind().allows_dependent(side) && join.hint(side) != JoinHint::MakeNotDep
}

fn supports_in(access: &Access, ctx: &OptimizerContext) -> bool {
    let registry = ctx.registry();
    registry.supports(access.source(), Capability::InCriteria)
        && registry.max_in_predicate_size(access.source()) != Some(0)
}

/// The side to make dependent, if any. Errors when an unbound access pattern or a hint
/// demands a dependent join which cannot be built.
///
/// An unknown cardinality counts as weak. Only when neither side has an estimate is there no
/// cost decision at all.
fn choose_side<F>(
    join: &Join,
    accesses: &[Option<&Access>; 2],
    equi: &EquiCriteria,
    ctx: &OptimizerContext,
    estimates: F,
) -> OptResult<Option<(Side, Reason)>>
where
    F: FnOnce() -> (CostEstimate, CostEstimate),
{
    let unbound: Vec<Side> = [Side::Left, Side::Right]
        .into_iter()
        .filter(|s| accesses[s.index()].map_or(false, |a| !a.is_satisfied()))
        .collect();
    let required = |side: Side, reason: &str| -> OptResult<Option<(Side, Reason)>> {
        let access = accesses[side.index()];
        let buildable = eligible(join, side, access)
            && !equi.pairs.is_empty()
            && access.map_or(false, |a| supports_in(a, ctx));
        if buildable {
            Ok(Some((side, Reason::Required)))
        } else {
            Err(OptimizerError::UnsatisfiableAccessPattern(format!(
                "{} side of join {} {}, but it cannot be made dependent",
                side, join, reason
            ))
            .into())
        }
    };

    match unbound.as_slice() {
        [side] => return required(*side, "has an unbound access pattern"),
        [_, _] => {
            return Err(OptimizerError::UnsatisfiableAccessPattern(format!(
                "both sides of join {} have unbound access patterns",
                join
            ))
            .into())
        }
        _ => {}
    }

    // With MAKEDEP on both sides the right one wins.
    if let Some(side) = [Side::Right, Side::Left]
        .into_iter()
        .find(|s| join.hint(*s) == JoinHint::MakeDep)
    {
        return required(side, "is hinted MAKEDEP");
    }

    if equi.pairs.is_empty() {
        return Ok(None);
    }
    let (left, right) = estimates();
    if !left.is_known() && !right.is_known() {
        warn!(
            "{}",
            OptimizerError::CostEstimateUnavailable(format!(
                "no cardinality for either input of join {}, planning a plain join",
                join
            ))
        );
        return Ok(None);
    }
    let side = match cost_choice(left, right) {
        Some(side) => side,
        None => return Ok(None),
    };
    let access = accesses[side.index()];
    if eligible(join, side, access) && access.map_or(false, |a| supports_in(a, ctx)) {
        Ok(Some((side, Reason::Cost)))
    } else {
        Ok(None)
    }
}

/// A weak side depends on a strong one. Two strong or two weak sides join plainly.
fn cost_choice(left: CostEstimate, right: CostEstimate) -> Option<Side> {
    match (left.is_strong(), right.is_strong()) {
        (true, false) => Some(Side::Right),
        (false, true) => Some(Side::Left),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capability::{CapabilityRegistry, SourceCapabilities};
    use crate::command::scan_command;
    use crate::config::OptimizerConfig;
    use crate::expr::{col, ColumnRef};
    use crate::operator::{AccessPattern, JoinKind};
    use crate::stat::NoStatistics;

    fn context(caps: SourceCapabilities) -> OptimizerContext {
        OptimizerContext::new(
            Arc::new(CapabilityRegistry::new().register("s1", caps)),
            Arc::new(NoStatistics),
            OptimizerConfig::default(),
        )
    }

    fn estimates(left: f64, right: f64) -> (CostEstimate, CostEstimate) {
        (
            CostEstimate::new(Some(left), 1000.0),
            CostEstimate::new(Some(right), 1000.0),
        )
    }

    fn split(join: &Join) -> EquiCriteria {
        EquiCriteria::split(
            join.criteria(),
            &[ColumnRef::new("a", "k")],
            &[ColumnRef::new("b", "k")],
        )
    }

    #[test]
    fn test_weak_side_depends_on_strong_side() {
        let (strong, weak) = estimates(10.0, 1e6);
        assert_eq!(cost_choice(strong, weak), Some(Side::Right));
        assert_eq!(cost_choice(weak, strong), Some(Side::Left));
        assert_eq!(cost_choice(strong, strong), None);
        assert_eq!(cost_choice(weak, weak), None);
    }

    #[test]
    fn test_unbound_pattern_forces_dependent_side() {
        let a = Access::new("s1".into(), scan_command("a", "t1", &["k"]), vec![]);
        let b = Access::new(
            "s1".into(),
            scan_command("b", "t2", &["k"]),
            vec![AccessPattern::new(vec![ColumnRef::new("b", "k")])],
        );
        let join = Join::new(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))]);
        let equi = split(&join);

        let ctx = context(SourceCapabilities::full());
        let side = choose_side(&join, &[Some(&a), Some(&b)], &equi, &ctx, || estimates(1e6, 1.0));
        assert_eq!(side.unwrap(), Some((Side::Right, Reason::Required)));

        let ctx = context(SourceCapabilities::full().without(Capability::InCriteria));
        let err = choose_side(&join, &[Some(&a), Some(&b)], &equi, &ctx, || estimates(1.0, 1.0))
            .unwrap_err();
        assert!(matches!(
            OptimizerError::of(&err),
            Some(OptimizerError::UnsatisfiableAccessPattern(_))
        ));

        let outer = Join::new(JoinKind::RightOuter, join.criteria().to_vec());
        let ctx = context(SourceCapabilities::full());
        assert!(choose_side(&outer, &[Some(&a), Some(&b)], &equi, &ctx, || estimates(1.0, 1.0))
            .is_err());
    }

    #[test]
    fn test_hints() {
        let a = Access::new("s1".into(), scan_command("a", "t1", &["k"]), vec![]);
        let b = Access::new("s1".into(), scan_command("b", "t2", &["k"]), vec![]);
        let ctx = context(SourceCapabilities::full());
        let criteria = vec![col("a", "k").eq(col("b", "k"))];

        let both = Join::new(JoinKind::Inner, criteria.clone())
            .with_hint(Side::Left, JoinHint::MakeDep)
            .with_hint(Side::Right, JoinHint::MakeDep);
        let side = choose_side(&both, &[Some(&a), Some(&b)], &split(&both), &ctx, || {
            estimates(1.0, 1.0)
        });
        assert_eq!(side.unwrap(), Some((Side::Right, Reason::Required)));

        // The weak left side would depend on the strong right one.
        let not_dep = Join::new(JoinKind::Inner, criteria).with_hint(Side::Left, JoinHint::MakeNotDep);
        let side = choose_side(&not_dep, &[Some(&a), Some(&b)], &split(&not_dep), &ctx, || {
            estimates(1e6, 1.0)
        });
        assert_eq!(side.unwrap(), None);
    }

    #[test]
    fn test_unknown_cardinality_counts_as_weak() {
        let a = Access::new("s1".into(), scan_command("a", "t1", &["k"]), vec![]);
        let b = Access::new("s1".into(), scan_command("b", "t2", &["k"]), vec![]);
        let ctx = context(SourceCapabilities::full());
        let join = Join::new(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))]);
        let equi = split(&join);
        let known = |rows: f64| CostEstimate::new(Some(rows), 1000.0);
        let unknown = || CostEstimate::new(None, 1000.0);

        let side = choose_side(&join, &[Some(&a), Some(&b)], &equi, &ctx, || {
            (known(10.0), unknown())
        });
        assert_eq!(side.unwrap(), Some((Side::Right, Reason::Cost)));

        let side = choose_side(&join, &[Some(&a), Some(&b)], &equi, &ctx, || {
            (unknown(), known(10.0))
        });
        assert_eq!(side.unwrap(), Some((Side::Left, Reason::Cost)));

        let side = choose_side(&join, &[Some(&a), Some(&b)], &equi, &ctx, || {
            (known(1e6), unknown())
        });
        assert_eq!(side.unwrap(), None);

        let side = choose_side(&join, &[Some(&a), Some(&b)], &equi, &ctx, || {
            (unknown(), unknown())
        });
        assert_eq!(side.unwrap(), None);
    }
}
