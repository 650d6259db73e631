use crate::command::SortKey;
use crate::error::OptResult;
use crate::operator::LogicalOperator::{
    LogicalGroup, LogicalLimit, LogicalProject, LogicalSelect, LogicalSort, LogicalSubquery,
    LogicalUnion, LogicalVirtualGroup,
};
use crate::operator::PhysicalOperator::{
    PhysicalAccess, PhysicalDependentProject, PhysicalDependentSelect, PhysicalDupRemove,
    PhysicalGrouping, PhysicalLimit, PhysicalProject, PhysicalSelect, PhysicalSort,
    PhysicalUnionAll,
};
use crate::operator::{DupRemove, Operator, Project, Sort, UnionAll};
use crate::optimizer::Optimizer;
use crate::rules::assign_access::access_of;
use crate::rules::{OptExpression, Pattern, Rule, RuleResult};

lazy_static! {
    static ref PATTERN: Pattern = Pattern::leaf(|op| op.is_logical());
}

/// Implements the logical operators left over after pushdown with in-process nodes.
#[derive(Clone, Debug)]
pub struct ImplementLocal;

impl Rule for ImplementLocal {
    fn apply<O: Optimizer>(
        &self,
        input: OptExpression<O>,
        opt: &O,
        result: &mut RuleResult<O>,
    ) -> OptResult<()> {
        let inputs = || input.inputs().iter().map(|i| i.reuse()).collect::<Vec<_>>();
        let implemented = match input.operator(opt) {
            Operator::Logical(LogicalSelect(select)) => {
                OptExpression::with_operator(PhysicalSelect(select.clone()), inputs())
            }
            Operator::Logical(LogicalProject(project)) if project.distinct() => {
                OptExpression::with_operator(
                    PhysicalDupRemove(DupRemove),
                    [OptExpression::with_operator(
                        PhysicalProject(Project::new(project.items().to_vec(), false)),
                        inputs(),
                    )],
                )
            }
            Operator::Logical(LogicalProject(project)) => {
                OptExpression::with_operator(PhysicalProject(project.clone()), inputs())
            }
            Operator::Logical(LogicalGroup(group)) => {
                let child = input.input(0);
                let keys: Vec<SortKey> = group
                    .keys()
                    .iter()
                    .map(|k| SortKey::asc(k.expr.clone()))
                    .collect();
                // Grouping streams over input ordered by its keys.
                let sorted = if keys.is_empty() {
                    child.reuse()
                } else {
                    let ctx = opt.context();
                    let pushed = access_of(child, opt).and_then(|access| {
                        access
                            .command()
                            .push_sort(&keys)
                            .filter(|c| ctx.registry().validate(access.source(), c).is_ok())
                            .map(|c| access.with_command(c))
                    });
                    match pushed {
                        Some(access) => OptExpression::with_operator(PhysicalAccess(access), []),
                        None => OptExpression::with_operator(
                            PhysicalSort(Sort::new(keys)),
                            [child.reuse()],
                        ),
                    }
                };
                OptExpression::with_operator(PhysicalGrouping(group.clone()), [sorted])
            }
            Operator::Logical(LogicalSort(sort)) => {
                OptExpression::with_operator(PhysicalSort(sort.clone()), inputs())
            }
            Operator::Logical(LogicalLimit(limit)) => {
                OptExpression::with_operator(PhysicalLimit(limit.clone()), inputs())
            }
            Operator::Logical(LogicalUnion(union)) => {
                let union_all = OptExpression::with_operator(PhysicalUnionAll(UnionAll), inputs());
                if union.all() {
                    union_all
                } else {
                    OptExpression::with_operator(PhysicalDupRemove(DupRemove), [union_all])
                }
            }
            Operator::Logical(LogicalVirtualGroup(vg)) => {
                let input_schema = match input.input(0).handle() {
                    Some(handle) => opt.schema_at(handle),
                    None => return Ok(()),
                };
                OptExpression::with_operator(
                    PhysicalProject(vg.as_projection(input_schema)),
                    inputs(),
                )
            }
            Operator::Logical(LogicalSubquery(subquery)) if subquery.is_filter() => {
                OptExpression::with_operator(PhysicalDependentSelect(subquery.clone()), inputs())
            }
            Operator::Logical(LogicalSubquery(subquery)) => {
                OptExpression::with_operator(PhysicalDependentProject(subquery.clone()), inputs())
            }
            _ => return Ok(()),
        };
        result.add(implemented);
        Ok(())
    }

    fn pattern(&self) -> &Pattern {
        &PATTERN
    }
}
