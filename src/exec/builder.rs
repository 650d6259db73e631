use std::collections::{BTreeSet, HashMap};

use anyhow::bail;

use crate::command::{SelectItem, SortKey};
use crate::error::{OptResult, OptimizerError};
use crate::expr::{conjunction, ColumnRef, Expr, ScalarValue};
use crate::operator::PhysicalOperator::{
    PhysicalAccess, PhysicalDependentAccess, PhysicalDependentProject, PhysicalDependentSelect,
    PhysicalDupRemove, PhysicalGrouping, PhysicalJoinStrategy, PhysicalLimit, PhysicalProject,
    PhysicalSelect, PhysicalSort, PhysicalUnionAll,
};
use crate::operator::{DependentJoin, JoinAlgorithm, Operator, SubqueryKind};
use crate::plan::{Plan, PlanNodeRef};

use super::{
    AccessExec, BoxExecNode, DependentAccessExec, DependentSubqueryExec, DupRemoveExec,
    ExecNodeImpl, GroupingExec, LimitExec, MergeJoinExec, NestedLoopJoinExec, ProjectExec,
    SelectExec, SortExec, UnionAllExec,
};

/// Run-time values of columns from enclosing scopes.
pub type Bindings = HashMap<ColumnRef, ScalarValue>;

/// Instantiates the execution tree of `node`, replacing references to enclosing scopes by
/// their values in `bindings`.
pub fn build_exec(node: &PlanNodeRef, bindings: &Bindings) -> OptResult<BoxExecNode> {
    let inputs = node.inputs();
    let visible: Vec<ColumnRef> = inputs
        .iter()
        .flat_map(|i| i.schema().iter().cloned())
        .collect();
    let bind = |e: &Expr| bind_expr(e, bindings, &visible);
    let bind_items = |items: &[SelectItem]| -> Vec<SelectItem> {
        items
            .iter()
            .map(|i| SelectItem::new(bind(&i.expr), i.alias.clone()))
            .collect()
    };
    let child = |idx: usize| build_exec(&inputs[idx], bindings);
    let schema = node.schema().to_vec();

    let op = match node.operator() {
        Operator::Physical(op) => op,
        Operator::Logical(op) => bail!(OptimizerError::Internal(format!(
            "logical operator {} reached execution",
            op
        ))),
    };
    let exec: ExecNodeImpl = match op {
        PhysicalAccess(access) => AccessExec::new(
            access.source().clone(),
            access.command().bind(bindings),
            schema,
        )
        .into(),
        PhysicalDependentAccess(dep) => DependentAccessExec::new(
            dep.access().source().clone(),
            dep.access().command().bind(bindings),
            dep.value_set().to_string(),
            schema,
        )
        .into(),
        PhysicalJoinStrategy(join) => {
            let criteria = conjunction(join.criteria().iter().map(bind));
            match join.algorithm() {
                JoinAlgorithm::NestedLoop { materialize } => NestedLoopJoinExec::new(
                    join.kind(),
                    criteria,
                    *materialize,
                    join.dependent().map(|d| DependentJoin {
                        value_set: d.value_set.clone(),
                        driving: d.driving,
                        driving_key: bind(&d.driving_key),
                    }),
                    [child(0)?, child(1)?],
                    inputs[0].schema().len(),
                    schema,
                )
                .into(),
                JoinAlgorithm::Merge {
                    left_keys,
                    right_keys,
                } => MergeJoinExec::new(
                    join.kind(),
                    left_keys.iter().map(bind).collect(),
                    right_keys.iter().map(bind).collect(),
                    [child(0)?, child(1)?],
                    [inputs[0].schema().to_vec(), inputs[1].schema().to_vec()],
                    schema,
                )
                .into(),
            }
        }
        PhysicalGrouping(group) => GroupingExec::new(
            bind_items(group.keys()),
            bind_items(group.aggregates()),
            child(0)?,
            schema,
        )
        .into(),
        PhysicalSort(sort) => SortExec::new(
            sort.keys()
                .iter()
                .map(|k| SortKey {
                    expr: bind(&k.expr),
                    ascending: k.ascending,
                })
                .collect(),
            child(0)?,
            schema,
        )
        .into(),
        PhysicalProject(project) => {
            ProjectExec::new(bind_items(project.items()), child(0)?, schema).into()
        }
        PhysicalSelect(select) => SelectExec::new(bind(select.criteria()), child(0)?, schema).into(),
        PhysicalUnionAll(_) => UnionAllExec::new(
            (0..inputs.len()).map(child).collect::<OptResult<Vec<_>>>()?,
            schema,
        )
        .into(),
        PhysicalDupRemove(_) => DupRemoveExec::new(child(0)?, schema).into(),
        PhysicalLimit(limit) => {
            LimitExec::new(limit.offset(), limit.count(), child(0)?, schema).into()
        }
        PhysicalDependentSelect(subquery) | PhysicalDependentProject(subquery) => {
            let outer_schema = inputs[0].schema();
            let bind_outer = |e: &Expr| bind_expr(e, bindings, outer_schema);
            let kind = match subquery.kind() {
                SubqueryKind::In { expr } => SubqueryKind::In {
                    expr: bind_outer(expr),
                },
                SubqueryKind::Compare { expr, op } => SubqueryKind::Compare {
                    expr: bind_outer(expr),
                    op: *op,
                },
                kind => kind.clone(),
            };
            DependentSubqueryExec::new(
                kind,
                subquery.negated(),
                child(0)?,
                inputs[1].clone(),
                correlated_columns(&inputs[1], outer_schema),
                bindings.clone(),
                schema,
            )
            .into()
        }
    };
    Ok(Box::new(exec))
}

/// Replaces bound columns not produced by the node's inputs by literals.
fn bind_expr(expr: &Expr, bindings: &Bindings, visible: &[ColumnRef]) -> Expr {
    if bindings.is_empty() {
        return expr.clone();
    }
    expr.transform(&mut |e| match e {
        Expr::Column(c) if !visible.contains(c) => {
            bindings.get(c).map(|v| Expr::Literal(v.clone()))
        }
        _ => None,
    })
}

/// Columns of `outer` referenced anywhere in the plan `inner`.
fn correlated_columns(inner: &PlanNodeRef, outer: &[ColumnRef]) -> Vec<ColumnRef> {
    let mut referenced = BTreeSet::new();
    for node in Plan::new(inner.clone()).bfs_iterator() {
        if let Operator::Physical(op) = node.operator() {
            if let Some(access) = op.access() {
                referenced.extend(access.command().free_columns());
            }
            for expr in op.local_exprs() {
                referenced.extend(expr.columns());
            }
        }
    }
    referenced
        .into_iter()
        .filter(|c| outer.contains(c))
        .collect()
}
