//! Cardinality and cost estimation.
//!
//! Row counts are derived bottom-up from catalog hints and the structure of the operators and
//! pushed commands:
//!
//! - Equality against a value: `1 / NDV`, or `unknown_ndv_selectivity` without an NDV.
//! - Range comparison: 1/3.
//! - Equi-join: `|L| * |R| / max(NDV(L.key), NDV(R.key))`, or `max(|L|, |R|)` without NDVs.
//! - Grouping: product of the key NDVs, capped by the input rows.
//! - Union: sum of the branches. Limit: at most its count.
//!
//! An unknown row count is a valid result and propagates upwards, except through a limit.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;

use crate::capability::SourceId;
use crate::command::{Command, FromClause, Query};
use crate::config::OptimizerConfig;
use crate::expr::{BinaryOp, ColumnRef, Expr};
use crate::operator::{
    Group, JoinKind, LogicalOperator, Operator, PhysicalOperator, Project, Source, SubqueryKind,
};
use crate::optimizer::{OptimizerContext, Optimizer};
use crate::stat::{CardinalityHints, Statistics};

const RANGE_SELECTIVITY: f64 = 1.0 / 3.0;

/// Cardinality of a sub-tree and its strong/weak classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    cardinality: Option<f64>,
    strong: bool,
}

impl CostEstimate {
    /// Strong iff the cardinality is known and below `threshold`.
    pub fn new(cardinality: Option<f64>, threshold: f64) -> Self {
        Self {
            cardinality,
            strong: cardinality.map_or(false, |c| c < threshold),
        }
    }

    pub fn cardinality(&self) -> Option<f64> {
        self.cardinality
    }

    pub fn is_known(&self) -> bool {
        self.cardinality.is_some()
    }

    pub fn is_strong(&self) -> bool {
        self.strong
    }
}

/// Estimates node statistics lazily, caching them per node handle. The owner invalidates the
/// handles of restructured sub-trees.
pub struct CostEstimator<H> {
    cache: RefCell<HashMap<H, Statistics>>,
}

impl<H: Copy + Eq + Hash> Default for CostEstimator<H> {
    fn default() -> Self {
        Self {
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl<H: Copy + Eq + Hash> CostEstimator<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate<I: IntoIterator<Item = H>>(&self, handles: I) {
        let mut cache = self.cache.borrow_mut();
        for handle in handles {
            cache.remove(&handle);
        }
    }

    pub fn cached(&self, handle: H) -> Option<Statistics> {
        self.cache.borrow().get(&handle).cloned()
    }

    pub fn estimate<O: Optimizer<ExprHandle = H>>(&self, handle: H, opt: &O) -> CostEstimate {
        let stats = self.statistics(handle, opt);
        CostEstimate::new(
            stats.row_count(),
            opt.context().config().strong_cost_threshold,
        )
    }

    /// Statistics of the sub-tree rooted at `handle`, computed with an explicit stack.
    pub fn statistics<O: Optimizer<ExprHandle = H>>(&self, handle: H, opt: &O) -> Statistics {
        let mut stack = vec![(handle, false)];
        while let Some((current, inputs_done)) = stack.pop() {
            if self.cache.borrow().contains_key(&current) {
                continue;
            }
            let inputs = opt.inputs_of(current);
            if !inputs_done {
                stack.push((current, true));
                stack.extend(inputs.into_iter().rev().map(|h| (h, false)));
                continue;
            }
            let input_stats: Vec<Statistics> = {
                let cache = self.cache.borrow();
                inputs
                    .iter()
                    .map(|h| cache.get(h).cloned().unwrap_or_default())
                    .collect()
            };
            let input_schemas: Vec<&[ColumnRef]> =
                inputs.iter().map(|h| opt.schema_at(*h)).collect();
            let stats = derive_statistics(
                opt.operator_at(current),
                &input_stats,
                &input_schemas,
                opt.context(),
            );
            self.cache.borrow_mut().insert(current, stats);
        }
        self.cached(handle).unwrap_or_default()
    }
}

fn derive_statistics(
    operator: &Operator,
    inputs: &[Statistics],
    input_schemas: &[&[ColumnRef]],
    ctx: &OptimizerContext,
) -> Statistics {
    let config = ctx.config();
    let first = || inputs.first().cloned().unwrap_or_default();
    match operator {
        Operator::Logical(op) => match op {
            LogicalOperator::LogicalSource(source) => source_statistics(source, ctx.hints()),
            LogicalOperator::LogicalSelect(select) => filter(first(), select.criteria(), config),
            LogicalOperator::LogicalProject(project) => project_statistics(first(), project),
            LogicalOperator::LogicalJoin(join) => join_statistics(
                join.kind(),
                join.criteria(),
                &inputs[0],
                &inputs[1],
                config,
            ),
            LogicalOperator::LogicalGroup(group) => group_statistics(first(), group),
            LogicalOperator::LogicalSort(_) => first(),
            LogicalOperator::LogicalLimit(limit) => {
                limit_statistics(first(), limit.offset(), limit.count())
            }
            LogicalOperator::LogicalUnion(union) => {
                let sum = union_statistics(inputs);
                if union.all() {
                    sum
                } else {
                    distinct_statistics(sum)
                }
            }
            LogicalOperator::LogicalSubquery(subquery) => {
                subquery_statistics(first(), subquery.kind(), config)
            }
            LogicalOperator::LogicalVirtualGroup(vg) => {
                let outputs = vg.output_columns();
                first().rename(input_schemas[0].iter().zip(outputs.iter()))
            }
        },
        Operator::Physical(op) => match op {
            PhysicalOperator::PhysicalAccess(access) => {
                command_statistics(access.source(), access.command(), ctx)
            }
            PhysicalOperator::PhysicalDependentAccess(dep) => {
                command_statistics(dep.access().source(), dep.access().command(), ctx)
            }
            PhysicalOperator::PhysicalJoinStrategy(join) => join_statistics(
                join.kind(),
                join.criteria(),
                &inputs[0],
                &inputs[1],
                config,
            ),
            PhysicalOperator::PhysicalGrouping(group) => group_statistics(first(), group),
            PhysicalOperator::PhysicalSort(_) => first(),
            PhysicalOperator::PhysicalProject(project) => project_statistics(first(), project),
            PhysicalOperator::PhysicalSelect(select) => {
                filter(first(), select.criteria(), config)
            }
            PhysicalOperator::PhysicalUnionAll(_) => union_statistics(inputs),
            PhysicalOperator::PhysicalDupRemove(_) => distinct_statistics(first()),
            PhysicalOperator::PhysicalLimit(limit) => {
                limit_statistics(first(), limit.offset(), limit.count())
            }
            PhysicalOperator::PhysicalDependentSelect(subquery)
            | PhysicalOperator::PhysicalDependentProject(subquery) => {
                subquery_statistics(first(), subquery.kind(), config)
            }
        },
    }
}

fn source_statistics(source: &Source, hints: &dyn CardinalityHints) -> Statistics {
    let group = source.group();
    table_statistics(source.source(), &group.table, &group.alias, hints)
}

fn table_statistics(
    source: &SourceId,
    table: &str,
    alias: &str,
    hints: &dyn CardinalityHints,
) -> Statistics {
    match hints.table_statistics(source, table) {
        None => Statistics::unknown(),
        Some(table_stats) => {
            table_stats
                .columns()
                .fold(Statistics::new(table_stats.row_count()), |stats, (name, ndv)| {
                    stats.with_column_ndv(ColumnRef::new(alias, name), ndv)
                })
        }
    }
}

fn filter(input: Statistics, criteria: &Expr, config: &OptimizerConfig) -> Statistics {
    let sel = selectivity(criteria, &input, config);
    let rows = input.row_count().map(|r| scale(r, sel));
    input.with_row_count(rows)
}

fn scale(rows: f64, selectivity: f64) -> f64 {
    (rows * selectivity).max(rows.min(1.0))
}

fn project_statistics(input: Statistics, project: &Project) -> Statistics {
    let renames: Vec<(ColumnRef, ColumnRef)> = project
        .items()
        .iter()
        .filter_map(|item| {
            item.expr
                .as_column()
                .map(|c| (c.clone(), item.alias.clone()))
        })
        .collect();
    let out = input.rename(renames.iter().map(|(a, b)| (a, b)));
    if project.distinct() {
        distinct_statistics(out)
    } else {
        out
    }
}

/// Duplicate removal never adds rows and nothing better is known.
fn distinct_statistics(input: Statistics) -> Statistics {
    input
}

fn group_statistics(input: Statistics, group: &Group) -> Statistics {
    let mut key_ndvs = vec![];
    let mut renames = vec![];
    for key in group.keys() {
        let ndv = key.expr.as_column().and_then(|c| {
            renames.push((c.clone(), key.alias.clone()));
            input.ndv(c)
        });
        key_ndvs.push(ndv);
    }
    let rows = if group.keys().is_empty() {
        Some(1.0)
    } else if key_ndvs.iter().all(|n| n.is_some()) {
        let product: f64 = key_ndvs.iter().flatten().product();
        Some(match input.row_count() {
            Some(r) => product.min(r),
            None => product,
        })
    } else {
        input.row_count()
    };
    input
        .rename(renames.iter().map(|(a, b)| (a, b)))
        .with_row_count(rows)
}

fn limit_statistics(input: Statistics, offset: u64, count: Option<u64>) -> Statistics {
    let after_offset = input.row_count().map(|r| (r - offset as f64).max(0.0));
    let rows = match (after_offset, count) {
        (Some(r), Some(c)) => Some(r.min(c as f64)),
        (None, Some(c)) => Some(c as f64),
        (r, None) => r,
    };
    input.with_row_count(rows)
}

fn union_statistics(inputs: &[Statistics]) -> Statistics {
    let rows = inputs
        .iter()
        .map(|s| s.row_count())
        .sum::<Option<f64>>();
    let mut out = inputs.first().cloned().unwrap_or_default();
    out = out.with_row_count(rows);
    out
}

fn subquery_statistics(
    outer: Statistics,
    kind: &SubqueryKind,
    config: &OptimizerConfig,
) -> Statistics {
    match kind {
        SubqueryKind::Scalar { .. } => outer,
        _ => {
            let rows = outer.row_count().map(|r| scale(r, config.default_selectivity));
            outer.with_row_count(rows)
        }
    }
}

fn join_statistics(
    kind: JoinKind,
    criteria: &[Expr],
    left: &Statistics,
    right: &Statistics,
    config: &OptimizerConfig,
) -> Statistics {
    let mut merged = left.clone();
    merged.merge_columns(right);
    let (l, r) = match (left.row_count(), right.row_count()) {
        (Some(l), Some(r)) => (l, r),
        _ => return merged.with_row_count(None),
    };
    let mut rows = l * r;
    let mut has_equi = false;
    let mut equi_known = true;
    for conjunct in criteria.iter().flat_map(|c| c.conjuncts()) {
        match conjunct.as_equality() {
            Some((Expr::Column(a), Expr::Column(b))) => {
                has_equi = true;
                match (merged.ndv(a), merged.ndv(b)) {
                    (Some(x), Some(y)) => rows /= x.max(y).max(1.0),
                    _ => equi_known = false,
                }
            }
            _ => rows *= config.default_selectivity,
        }
    }
    if has_equi && !equi_known {
        rows = l.max(r);
    }
    rows = match kind {
        JoinKind::LeftOuter => rows.max(l),
        JoinKind::RightOuter => rows.max(r),
        JoinKind::FullOuter => rows.max(l).max(r),
        JoinKind::Inner | JoinKind::Cross => rows,
    };
    merged.with_row_count(Some(rows))
}

/// Fraction of rows of `input` for which `criteria` holds.
pub fn selectivity(criteria: &Expr, input: &Statistics, config: &OptimizerConfig) -> f64 {
    criteria
        .conjuncts()
        .iter()
        .map(|c| conjunct_selectivity(c, input, config))
        .product()
}

fn equality_selectivity(column: &ColumnRef, input: &Statistics, config: &OptimizerConfig) -> f64 {
    input
        .ndv(column)
        .map_or(config.unknown_ndv_selectivity, |n| 1.0 / n.max(1.0))
}

fn conjunct_selectivity(conjunct: &Expr, input: &Statistics, config: &OptimizerConfig) -> f64 {
    match conjunct {
        Expr::Binary { op, left, right } => {
            let column = left.as_column().or_else(|| right.as_column());
            match (op, column) {
                (BinaryOp::Eq, Some(c)) => match (left.as_column(), right.as_column()) {
                    (Some(a), Some(b)) => match (input.ndv(a), input.ndv(b)) {
                        (Some(x), Some(y)) => 1.0 / x.max(y).max(1.0),
                        _ => config.unknown_ndv_selectivity,
                    },
                    _ => equality_selectivity(c, input, config),
                },
                (BinaryOp::NotEq, Some(c)) => 1.0 - equality_selectivity(c, input, config),
                (BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq, _) => {
                    RANGE_SELECTIVITY
                }
                _ => config.default_selectivity,
            }
        }
        Expr::InList { expr, list } => match expr.as_column() {
            Some(c) => (list.len() as f64 * equality_selectivity(c, input, config)).min(1.0),
            None => config.default_selectivity,
        },
        Expr::IsNull(_) => config.unknown_ndv_selectivity,
        Expr::Or(items) => {
            1.0 - items
                .iter()
                .map(|e| 1.0 - selectivity(e, input, config))
                .product::<f64>()
        }
        Expr::Not(e) => 1.0 - selectivity(e, input, config),
        Expr::And(_) => selectivity(conjunct, input, config),
        _ => config.default_selectivity,
    }
}

/// Statistics of a pushed command, derived from the command's structure.
pub fn command_statistics(source: &SourceId, command: &Command, ctx: &OptimizerContext) -> Statistics {
    match command {
        Command::SetQuery(s) => {
            let branches: Vec<Statistics> = s
                .branches
                .iter()
                .map(|b| command_statistics(source, b, ctx))
                .collect();
            let out = union_statistics(&branches);
            match s.limit {
                Some(limit) => limit_statistics(out, limit.offset, limit.count),
                None => out,
            }
        }
        Command::Query(q) => query_statistics(source, q, ctx),
    }
}

fn query_statistics(source: &SourceId, q: &Query, ctx: &OptimizerContext) -> Statistics {
    let config = ctx.config();
    let mut stats = from_statistics(source, &q.from, ctx);
    if let Some(criteria) = &q.criteria {
        stats = filter(stats, criteria, config);
    }
    if !q.group_by.is_empty() {
        let ndvs: Option<Vec<f64>> = q
            .group_by
            .iter()
            .map(|k| k.as_column().and_then(|c| stats.ndv(c)))
            .collect();
        let rows = match (ndvs, stats.row_count()) {
            (Some(ndvs), Some(r)) => Some(ndvs.iter().product::<f64>().min(r)),
            (Some(ndvs), None) => Some(ndvs.iter().product()),
            (None, r) => r,
        };
        stats = stats.with_row_count(rows);
    } else if q.is_grouped() {
        stats = stats.with_row_count(Some(1.0));
    }
    if let Some(having) = &q.having {
        stats = filter(stats, having, config);
    }
    let renames: Vec<(ColumnRef, ColumnRef)> = q
        .select
        .iter()
        .filter_map(|item| item.expr.as_column().map(|c| (c.clone(), item.alias.clone())))
        .collect();
    stats = stats.rename(renames.iter().map(|(a, b)| (a, b)));
    match q.limit {
        Some(limit) => limit_statistics(stats, limit.offset, limit.count),
        None => stats,
    }
}

fn from_statistics(source: &SourceId, from: &FromClause, ctx: &OptimizerContext) -> Statistics {
    match from {
        FromClause::Group(g) => table_statistics(source, &g.table, &g.alias, ctx.hints()),
        FromClause::Derived { command, .. } => command_statistics(source, command, ctx),
        FromClause::Join {
            kind,
            left,
            right,
            criteria,
        } => {
            let l = from_statistics(source, left, ctx);
            let r = from_statistics(source, right, ctx);
            join_statistics(*kind, criteria, &l, &r, ctx.config())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::scan_command;
    use crate::expr::{col, lit};
    use crate::stat::{InMemoryStatistics, TableStatistics};
    use std::sync::Arc;

    fn context() -> OptimizerContext {
        let hints = InMemoryStatistics::new()
            .with_table(
                "s1",
                "t1",
                TableStatistics::new(100.0).with_column_ndv("k", 10.0),
            )
            .with_table(
                "s1",
                "t2",
                TableStatistics::new(1000.0).with_column_ndv("k", 100.0),
            );
        OptimizerContext::new(
            Arc::new(crate::capability::CapabilityRegistry::new()),
            Arc::new(hints),
            OptimizerConfig::default(),
        )
    }

    #[test]
    fn test_strong_classification() {
        assert!(CostEstimate::new(Some(10.0), 1000.0).is_strong());
        assert!(!CostEstimate::new(Some(1000.0), 1000.0).is_strong());
        assert!(!CostEstimate::new(None, 1000.0).is_strong());
    }

    #[test]
    fn test_equality_uses_ndv() {
        let ctx = context();
        let cmd = scan_command("a", "t1", &["k"])
            .push_criteria(&col("a", "k").eq(lit(1)))
            .unwrap();
        let stats = command_statistics(&SourceId::from("s1"), &cmd, &ctx);
        assert_eq!(stats.row_count(), Some(10.0));
    }

    #[test]
    fn test_join_uses_max_ndv() {
        let ctx = context();
        let a = scan_command("a", "t1", &["k"]);
        let b = scan_command("b", "t2", &["k"]);
        let joined =
            Command::join(&a, &b, JoinKind::Inner, &[col("a", "k").eq(col("b", "k"))]).unwrap();
        let stats = command_statistics(&SourceId::from("s1"), &joined, &ctx);
        assert_eq!(stats.row_count(), Some(1000.0));
    }

    #[test]
    fn test_unknown_table_and_limit_bound() {
        let ctx = context();
        let cmd = scan_command("c", "t3", &["k"]);
        let source = SourceId::from("s1");
        assert_eq!(command_statistics(&source, &cmd, &ctx).row_count(), None);
        let limited = cmd.push_limit(crate::command::LimitClause::new(0, Some(5)));
        assert_eq!(
            command_statistics(&source, &limited, &ctx).row_count(),
            Some(5.0)
        );
    }
}
