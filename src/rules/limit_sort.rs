use crate::error::OptResult;
use crate::operator::LogicalOperator::{LogicalLimit, LogicalProject, LogicalSort, LogicalUnion};
use crate::operator::PhysicalOperator::{
    PhysicalAccess, PhysicalLimit, PhysicalProject, PhysicalSort, PhysicalUnionAll,
};
use crate::operator::{Limit, Operator};
use crate::optimizer::Optimizer;
use crate::rules::{OptExpression, Pattern, Rule, RuleResult};

lazy_static! {
    static ref PATTERN: Pattern = Pattern::with_children(
        |op| matches!(
            op,
            Operator::Logical(LogicalLimit(_))
                | Operator::Physical(PhysicalLimit(_))
                | Operator::Logical(LogicalSort(_))
                | Operator::Physical(PhysicalSort(_))
        ),
        vec![Pattern::leaf(|_| true)],
    );
}

/// Moves row limits towards the sources and drops redundant orderings.
///
/// - A limit over a non-distinct projection moves beneath it.
/// - A limit over a `UNION ALL` is copied, widened by its offset, into every branch which has
///   no limit yet. The outer limit stays.
/// - Stacked limits combine into one.
/// - A sort directly over another sort replaces it.
#[derive(Clone, Debug)]
pub struct LimitSortPushdown;

impl Rule for LimitSortPushdown {
    fn apply<O: Optimizer>(
        &self,
        input: OptExpression<O>,
        opt: &O,
        result: &mut RuleResult<O>,
    ) -> OptResult<()> {
        let child = input.input(0);
        let child_op = child.operator(opt);

        let limit = match input.operator(opt) {
            Operator::Logical(LogicalLimit(limit)) | Operator::Physical(PhysicalLimit(limit)) => {
                limit
            }
            sort => {
                if matches!(
                    child_op,
                    Operator::Logical(LogicalSort(_)) | Operator::Physical(PhysicalSort(_))
                ) {
                    result.add(OptExpression::with_operator(
                        sort.clone(),
                        [child.input(0).reuse()],
                    ));
                }
                return Ok(());
            }
        };
        let limit_op = input.operator(opt).clone();

        match child_op {
            Operator::Logical(LogicalProject(project)) if !project.distinct() => {
                result.add(swap(limit_op, child, opt));
            }
            Operator::Physical(PhysicalProject(project)) if !project.distinct() => {
                result.add(swap(limit_op, child, opt));
            }
            Operator::Logical(LogicalLimit(inner)) | Operator::Physical(PhysicalLimit(inner)) => {
                let combined = inner.clause().then(limit.clause());
                let combined = Limit::new(combined.offset, combined.count);
                let op: Operator = match limit_op {
                    Operator::Physical(_) => PhysicalLimit(combined).into(),
                    Operator::Logical(_) => LogicalLimit(combined).into(),
                };
                result.add(OptExpression::with_operator(op, [child.input(0).reuse()]));
            }
            Operator::Logical(LogicalUnion(union)) if union.all() => {
                if let Some(union) = limit_branches(limit, child, opt) {
                    result.add(OptExpression::with_operator(limit_op, [union]));
                }
            }
            Operator::Physical(PhysicalUnionAll(_)) => {
                if let Some(union) = limit_branches(limit, child, opt) {
                    result.add(OptExpression::with_operator(limit_op, [union]));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn pattern(&self) -> &Pattern {
        &PATTERN
    }
}

/// `project(limit(x))` from `limit(project(x))`.
fn swap<O: Optimizer>(limit: Operator, project: &OptExpression<O>, opt: &O) -> OptExpression<O> {
    OptExpression::with_operator(
        project.operator(opt).clone(),
        [OptExpression::with_operator(
            limit,
            [project.input(0).reuse()],
        )],
    )
}

/// The union with `LIMIT offset + count` on every branch that has no limit of its own. `None`
/// when nothing changes.
fn limit_branches<O: Optimizer>(
    limit: &Limit,
    union: &OptExpression<O>,
    opt: &O,
) -> Option<OptExpression<O>> {
    let count = limit.count()?;
    let union_handle = union.handle()?;
    let mut changed = false;
    let branches: Vec<OptExpression<O>> = opt
        .inputs_of(union_handle)
        .into_iter()
        .map(|branch| {
            let limited = match opt.operator_at(branch) {
                Operator::Logical(LogicalLimit(_)) | Operator::Physical(PhysicalLimit(_)) => true,
                Operator::Physical(PhysicalAccess(access)) => access.command().limit().is_some(),
                _ => false,
            };
            if limited {
                OptExpression::from_handle(branch)
            } else {
                changed = true;
                OptExpression::with_operator(
                    LogicalLimit(Limit::new(0, Some(limit.offset() + count))),
                    [OptExpression::from_handle(branch)],
                )
            }
        })
        .collect();
    if !changed {
        return None;
    }
    Some(OptExpression::with_operator(
        union.operator(opt).clone(),
        branches,
    ))
}
