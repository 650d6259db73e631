use itertools::Itertools;

use crate::capability::Capability;
use crate::command::Command;
use crate::error::OptResult;
use crate::operator::LogicalOperator::{LogicalUnion, LogicalVirtualGroup};
use crate::operator::PhysicalOperator::{PhysicalAccess, PhysicalDupRemove, PhysicalUnionAll};
use crate::operator::{Access, Operator, Union};
use crate::optimizer::Optimizer;
use crate::rules::assign_access::access_of;
use crate::rules::{OptExpression, Pattern, Rule, RuleResult};

lazy_static! {
    static ref PATTERN: Pattern = Pattern::leaf(|op| matches!(
        op,
        Operator::Logical(LogicalUnion(_)) | Operator::Logical(LogicalVirtualGroup(_))
    ));
}

/// Flattens views over access nodes into the access command, and merges union branches
/// targeting the same source into one multi-branch command.
#[derive(Clone, Debug)]
pub struct MergeVirtual;

impl Rule for MergeVirtual {
    fn apply<O: Optimizer>(
        &self,
        input: OptExpression<O>,
        opt: &O,
        result: &mut RuleResult<O>,
    ) -> OptResult<()> {
        match input.operator(opt) {
            Operator::Logical(LogicalVirtualGroup(vg)) => {
                if let Some(access) = access_of(input.input(0), opt) {
                    let command = access.command().rename_outputs(&vg.output_columns());
                    result.add(OptExpression::with_operator(
                        PhysicalAccess(access.with_command(command)),
                        [],
                    ));
                }
            }
            Operator::Logical(LogicalUnion(union)) => {
                if let Some(merged) = merge_union(union, &input, opt) {
                    result.add(merged);
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

fn merge_union<O: Optimizer>(
    union: &Union,
    input: &OptExpression<O>,
    opt: &O,
) -> Option<OptExpression<O>> {
    let mut changed = false;
    let mut branches: Vec<O::ExprHandle> = vec![];
    for branch in input.inputs().iter().filter_map(|b| b.handle()) {
        match splice(branch, union.all(), opt) {
            Some(nested) => {
                changed = true;
                branches.extend(nested);
            }
            None => branches.push(branch),
        }
    }

    let ctx = opt.context();
    let set_capability = if union.all() {
        Capability::UnionAll
    } else {
        Capability::Union
    };
    // Branch indexes per source, in order of first appearance.
    let groups = branches
        .iter()
        .enumerate()
        .filter_map(|(idx, b)| match opt.operator_at(*b) {
            Operator::Physical(PhysicalAccess(access)) => Some((access.source().clone(), idx)),
            _ => None,
        })
        .into_group_map_by(|(source, _)| source.clone());

    let mut merged_at: Vec<Option<Access>> = vec![None; branches.len()];
    let mut absorbed = vec![false; branches.len()];
    let mut sources: Vec<_> = groups.keys().cloned().collect();
    sources.sort_by_key(|s| groups[s][0].1);
    for source in sources {
        let members: Vec<usize> = groups[&source].iter().map(|(_, idx)| *idx).collect();
        if members.len() < 2 || !ctx.registry().supports(&source, set_capability) {
            continue;
        }
        let accesses: Vec<&Access> = members
            .iter()
            .filter_map(|idx| access_of_handle(branches[*idx], opt))
            .collect();
        let command = Command::union(
            accesses.iter().map(|a| a.command().clone()).collect(),
            union.all(),
        );
        if ctx.registry().validate(&source, &command).is_err() {
            continue;
        }
        let first = accesses[0];
        let merged = accesses[1..]
            .iter()
            .fold(first.with_command(command.clone()), |acc, a| {
                acc.merge(a, command.clone())
            });
        merged_at[members[0]] = Some(merged);
        for idx in &members[1..] {
            absorbed[*idx] = true;
        }
        changed = true;
    }

    if !changed {
        return None;
    }
    let mut out: Vec<OptExpression<O>> = vec![];
    for (idx, branch) in branches.into_iter().enumerate() {
        if absorbed[idx] {
            continue;
        }
        match merged_at[idx].take() {
            Some(access) => out.push(OptExpression::with_operator(PhysicalAccess(access), [])),
            None => out.push(OptExpression::from_handle(branch)),
        }
    }
    if out.len() == 1 {
        return out.pop();
    }
    Some(OptExpression::with_operator(
        LogicalUnion(union.clone()),
        out,
    ))
}

fn access_of_handle<O: Optimizer>(handle: O::ExprHandle, opt: &O) -> Option<&Access> {
    match opt.operator_at(handle) {
        Operator::Physical(PhysicalAccess(access)) => Some(access),
        _ => None,
    }
}

/// Branches of an already planned nested union which can be spliced into the parent union.
fn splice<O: Optimizer>(branch: O::ExprHandle, all: bool, opt: &O) -> Option<Vec<O::ExprHandle>> {
    match opt.operator_at(branch) {
        Operator::Physical(PhysicalUnionAll(_)) => Some(opt.inputs_of(branch)),
        Operator::Physical(PhysicalDupRemove(_)) if !all => {
            let inner = opt.inputs_of(branch);
            match inner.as_slice() {
                [union_all] if matches!(opt.operator_at(*union_all), Operator::Physical(PhysicalUnionAll(_))) => {
                    Some(opt.inputs_of(*union_all))
                }
                _ => None,
            }
        }
        _ => None,
    }
}
