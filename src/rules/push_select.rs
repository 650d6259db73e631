use std::collections::{BTreeSet, HashMap};

use crate::error::OptResult;
use crate::expr::{conjunction, ColumnRef, Expr};
use crate::operator::LogicalOperator::{
    LogicalGroup, LogicalJoin, LogicalProject, LogicalSelect, LogicalSort, LogicalUnion,
    LogicalVirtualGroup,
};
use crate::operator::{Join, JoinKind, LogicalOperator, Operator, Select, Side};
use crate::optimizer::Optimizer;
use crate::rules::{OptExpression, Pattern, Rule, RuleResult};

lazy_static! {
    static ref PATTERN: Pattern = Pattern::with_children(
        |op| matches!(op, Operator::Logical(LogicalSelect(_))),
        vec![Pattern::leaf(|op| op.is_logical())],
    );
}

/// Moves filter criteria towards the sources: through joins, views, projections, sorts,
/// unions and grouping keys, and into join criteria when a conjunct spans both join sides.
#[derive(Clone, Debug)]
pub struct PushSelectCriteria;

/// Wraps `input` in a filter, unless there are no criteria.
pub(crate) fn select_over<O: Optimizer>(
    criteria: Option<Expr>,
    input: OptExpression<O>,
) -> OptExpression<O> {
    match criteria {
        Some(criteria) => {
            OptExpression::with_operator(LogicalOperator::LogicalSelect(Select::new(criteria)), [input])
        }
        None => input,
    }
}

impl Rule for PushSelectCriteria {
    fn apply<O: Optimizer>(
        &self,
        input: OptExpression<O>,
        opt: &O,
        result: &mut RuleResult<O>,
    ) -> OptResult<()> {
        let criteria = match input.operator(opt) {
            Operator::Logical(LogicalSelect(select)) => select.criteria().clone(),
            _ => return Ok(()),
        };
        let child = input.input(0);
        let rewritten = match child.operator(opt) {
            Operator::Logical(LogicalSelect(inner)) => Some(select_over(
                conjunction([inner.criteria().clone(), criteria]),
                child.input(0).reuse(),
            )),
            Operator::Logical(LogicalJoin(join)) => push_into_join(criteria, join, child, opt),
            Operator::Logical(LogicalVirtualGroup(vg)) => {
                let input_schema = schema_of(child.input(0), opt);
                let map: HashMap<ColumnRef, Expr> = vg
                    .output_columns()
                    .into_iter()
                    .zip(input_schema.iter().cloned().map(Expr::Column))
                    .collect();
                Some(OptExpression::with_operator(
                    child.operator(opt).clone(),
                    [select_over(
                        Some(criteria.substitute(&map)),
                        child.input(0).reuse(),
                    )],
                ))
            }
            Operator::Logical(LogicalProject(project))
                if project.items().iter().all(|i| !i.expr.contains_subquery()) =>
            {
                let map: HashMap<ColumnRef, Expr> = project
                    .items()
                    .iter()
                    .map(|i| (i.alias.clone(), i.expr.clone()))
                    .collect();
                Some(OptExpression::with_operator(
                    child.operator(opt).clone(),
                    [select_over(
                        Some(criteria.substitute(&map)),
                        child.input(0).reuse(),
                    )],
                ))
            }
            Operator::Logical(LogicalSort(_)) => Some(OptExpression::with_operator(
                child.operator(opt).clone(),
                [select_over(Some(criteria), child.input(0).reuse())],
            )),
            Operator::Logical(LogicalUnion(_)) => {
                let union_schema = schema_of(child, opt);
                let branches = child
                    .inputs()
                    .iter()
                    .map(|branch| {
                        let map: HashMap<ColumnRef, Expr> = union_schema
                            .iter()
                            .cloned()
                            .zip(schema_of(branch, opt).iter().cloned().map(Expr::Column))
                            .collect();
                        select_over(Some(criteria.substitute(&map)), branch.reuse())
                    })
                    .collect::<Vec<_>>();
                Some(OptExpression::with_operator(
                    child.operator(opt).clone(),
                    branches,
                ))
            }
            Operator::Logical(LogicalGroup(group)) => {
                let keys: HashMap<ColumnRef, Expr> = group
                    .keys()
                    .iter()
                    .map(|k| (k.alias.clone(), k.expr.clone()))
                    .collect();
                let (below, above): (Vec<Expr>, Vec<Expr>) =
                    criteria.into_conjuncts().into_iter().partition(|c| {
                        !c.contains_subquery()
                            && !c.columns().is_empty()
                            && c.columns().iter().all(|col| keys.contains_key(col))
                    });
                if below.is_empty() {
                    None
                } else {
                    let below = below.iter().map(|c| c.substitute(&keys));
                    Some(select_over(
                        conjunction(above),
                        OptExpression::with_operator(
                            child.operator(opt).clone(),
                            [select_over(conjunction(below), child.input(0).reuse())],
                        ),
                    ))
                }
            }
            _ => None,
        };
        if let Some(rewritten) = rewritten {
            result.add(rewritten);
        }
        Ok(())
    }

    fn pattern(&self) -> &Pattern {
        &PATTERN
    }
}

fn schema_of<O: Optimizer>(expr: &OptExpression<O>, opt: &O) -> Vec<ColumnRef> {
    expr.handle()
        .map(|h| opt.schema_at(h).to_vec())
        .unwrap_or_default()
}

fn push_into_join<O: Optimizer>(
    criteria: Expr,
    join: &Join,
    join_expr: &OptExpression<O>,
    opt: &O,
) -> Option<OptExpression<O>> {
    let left: BTreeSet<ColumnRef> = schema_of(join_expr.input(0), opt).into_iter().collect();
    let right: BTreeSet<ColumnRef> = schema_of(join_expr.input(1), opt).into_iter().collect();
    let kind = join.kind();

    let mut above = vec![];
    let mut to_left = vec![];
    let mut to_right = vec![];
    let mut spanning = vec![];
    for conjunct in criteria.into_conjuncts() {
        // Columns of neither side are correlated references, constant for this join.
        let local: Vec<ColumnRef> = conjunct
            .columns()
            .into_iter()
            .filter(|c| left.contains(c) || right.contains(c))
            .collect();
        let on_left = local.iter().all(|c| left.contains(c));
        let on_right = local.iter().all(|c| right.contains(c));
        if local.is_empty() || conjunct.contains_subquery() {
            above.push(conjunct);
        } else if on_left && !kind.preserves(Side::Right) {
            to_left.push(conjunct);
        } else if on_right && !kind.preserves(Side::Left) {
            to_right.push(conjunct);
        } else if !on_left && !on_right && matches!(kind, JoinKind::Inner | JoinKind::Cross) {
            spanning.push(conjunct);
        } else {
            above.push(conjunct);
        }
    }

    if to_left.is_empty() && to_right.is_empty() && spanning.is_empty() {
        return None;
    }
    let new_join = if spanning.is_empty() {
        join.clone()
    } else {
        join.with_criteria(spanning)
    };
    Some(select_over(
        conjunction(above),
        OptExpression::with_operator(
            LogicalOperator::LogicalJoin(new_join),
            [
                select_over(conjunction(to_left), join_expr.input(0).reuse()),
                select_over(conjunction(to_right), join_expr.input(1).reuse()),
            ],
        ),
    ))
}
