use crate::capability::Capability;
use crate::command::{Command, Query};
use crate::error::{OptResult, OptimizerError};
use crate::expr::conjunction;
use crate::operator::LogicalOperator::{
    LogicalGroup, LogicalJoin, LogicalLimit, LogicalProject, LogicalSelect, LogicalSort,
    LogicalSource,
};
use crate::operator::PhysicalOperator::PhysicalAccess;
use crate::operator::{Access, JoinHint, Operator, Side};
use crate::optimizer::{Optimizer, OptimizerContext};
use crate::rules::push_select::select_over;
use crate::rules::{OptExpression, Pattern, Rule, RuleResult};

lazy_static! {
    static ref PATTERN: Pattern = Pattern::leaf(|op| op.is_logical());
}

/// Assigns sources to access nodes and raises operators over an access node into its pushed
/// command whenever the source validates the result.
#[derive(Clone, Debug)]
pub struct AssignAccess;

/// Layers an operation onto the command of `access`. When the command cannot take the
/// operation directly and the source supports inline views, the command is wrapped as a
/// derived table and the operation retried on top of it. Returns the first candidate the
/// source validates.
pub(crate) fn layer_command<F>(access: &Access, ctx: &OptimizerContext, f: F) -> Option<Command>
where
    F: Fn(&Command) -> Option<Command>,
{
    let registry = ctx.registry();
    let valid = |command: &Command| registry.validate(access.source(), command).is_ok();
    if let Some(command) = f(access.command()).filter(valid) {
        return Some(command);
    }
    if registry.supports(access.source(), Capability::InlineViews) {
        let view = access
            .command()
            .into_inline_view(&ctx.next_inline_view_alias());
        return f(&view).filter(valid);
    }
    None
}

/// The access node behind `expr`, if it is one.
pub(crate) fn access_of<'a, O: Optimizer>(expr: &'a OptExpression<O>, opt: &'a O) -> Option<&'a Access> {
    match expr.operator(opt) {
        Operator::Physical(PhysicalAccess(access)) => Some(access),
        _ => None,
    }
}

fn access_expr<O: Optimizer>(access: Access) -> OptExpression<O> {
    OptExpression::with_operator(PhysicalAccess(access), [])
}

impl Rule for AssignAccess {
    fn apply<O: Optimizer>(
        &self,
        input: OptExpression<O>,
        opt: &O,
        result: &mut RuleResult<O>,
    ) -> OptResult<()> {
        let ctx = opt.context();
        let logical = match input.operator(opt) {
            Operator::Logical(op) => op,
            Operator::Physical(_) => return Ok(()),
        };

        if let LogicalSource(source) = logical {
            if !ctx.registry().contains(source.source()) {
                return Err(OptimizerError::CapabilityUnsupported(format!(
                    "source {} of group {} is not registered",
                    source.source(),
                    source.group()
                ))
                .into());
            }
            let command = Query::scan(source.group(), source.columns()).into();
            result.add(access_expr(Access::new(
                source.source().clone(),
                command,
                source.access_patterns().to_vec(),
            )));
            return Ok(());
        }

        if let LogicalJoin(join) = logical {
            let (left, right) = match (
                access_of(input.input(0), opt),
                access_of(input.input(1), opt),
            ) {
                (Some(l), Some(r)) => (l, r),
                _ => return Ok(()),
            };
            let hinted = [Side::Left, Side::Right]
                .iter()
                .any(|s| join.hint(*s) == JoinHint::MakeDep);
            if hinted || left.source() != right.source() {
                return Ok(());
            }
            let joined = Command::join(left.command(), right.command(), join.kind(), join.criteria())
                .filter(|c| ctx.registry().validate(left.source(), c).is_ok());
            if let Some(command) = joined {
                let merged = left.merge(right, command);
                // Otherwise the unbound access pattern is left to a dependent join.
                if merged.is_satisfied() {
                    result.add(access_expr(merged));
                }
            }
            return Ok(());
        }

        let access = match input.inputs().first().and_then(|i| access_of(i, opt)) {
            Some(access) => access,
            None => return Ok(()),
        };
        let command = match logical {
            LogicalSelect(select) => {
                let mut current = access.clone();
                let mut remaining = vec![];
                for conjunct in select.criteria().conjuncts() {
                    match layer_command(&current, ctx, |c| c.push_criteria(&conjunct)) {
                        Some(command) => current = current.with_command(command),
                        None => remaining.push(conjunct),
                    }
                }
                if current == *access {
                    return Ok(());
                }
                result.add(select_over(conjunction(remaining), access_expr(current)));
                return Ok(());
            }
            LogicalProject(project) => layer_command(access, ctx, |c| {
                c.push_projection(project.items(), project.distinct())
            }),
            LogicalGroup(group) => layer_command(access, ctx, |c| {
                c.push_group(group.keys(), group.aggregates())
            }),
            LogicalSort(sort) => layer_command(access, ctx, |c| c.push_sort(sort.keys())),
            LogicalLimit(limit) => {
                layer_command(access, ctx, |c| Some(c.push_limit(limit.clause())))
            }
            _ => None,
        };
        if let Some(command) = command {
            result.add(access_expr(access.with_command(command)));
        }
        Ok(())
    }

    fn pattern(&self) -> &Pattern {
        &PATTERN
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capability::{CapabilityRegistry, SourceCapabilities};
    use crate::command::scan_command;
    use crate::config::OptimizerConfig;
    use crate::stat::NoStatistics;

    fn context(caps: SourceCapabilities) -> OptimizerContext {
        OptimizerContext::new(
            Arc::new(CapabilityRegistry::new().register("s1", caps)),
            Arc::new(NoStatistics),
            OptimizerConfig::default(),
        )
    }

    #[test]
    fn test_layer_retries_over_inline_view() {
        let limited = scan_command("a", "t", &["k"])
            .push_limit(crate::command::LimitClause::new(0, Some(5)));
        let access = Access::new("s1".into(), limited, vec![]);
        let criteria = crate::expr::col("a", "k").eq(crate::expr::lit(1));

        let ctx = context(SourceCapabilities::full());
        let command = layer_command(&access, &ctx, |c| c.push_criteria(&criteria)).unwrap();
        assert_eq!(
            command.to_string(),
            "SELECT v_0.c_0 AS k FROM (SELECT a.k AS c_0 FROM t AS a LIMIT 5) AS v_0 WHERE v_0.c_0 = 1"
        );

        let ctx = context(SourceCapabilities::full().without(Capability::InlineViews));
        assert!(layer_command(&access, &ctx, |c| c.push_criteria(&criteria)).is_none());
    }
}
