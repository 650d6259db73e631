use std::collections::BTreeSet;
use std::task::{Context, Poll};

use log::debug;

use crate::error::OptResult;
use crate::expr::{ColumnRef, Expr, ScalarValue};
use crate::operator::{DependentJoin, JoinKind, Side};

use super::eval::Evaluator;
use super::{poll_child, Batch, BatchPoll, BoxExecNode, ExecContext, ExecNode, Row};

/// Joins rows of two sides, padding the missing side with NULLs.
pub(crate) fn join_rows(left: Option<&Row>, right: Option<&Row>, widths: [usize; 2]) -> Row {
    let mut row = Vec::with_capacity(widths[0] + widths[1]);
    match left {
        Some(l) => row.extend(l.iter().cloned()),
        None => row.extend(std::iter::repeat(ScalarValue::Null).take(widths[0])),
    }
    match right {
        Some(r) => row.extend(r.iter().cloned()),
        None => row.extend(std::iter::repeat(ScalarValue::Null).take(widths[1])),
    }
    row
}

/// Nested loop join materializing one side, the build side, and streaming the other past it.
///
/// As a dependent join the build side is the driving side: once materialized, the distinct
/// non-null values of its join key fill the dependent value set, and only then is the other
/// side, whose access reads the set, opened.
pub struct NestedLoopJoinExec {
    kind: JoinKind,
    criteria: Option<Expr>,
    build_side: Side,
    dependent: Option<DependentJoin>,
    inputs: [BoxExecNode; 2],
    /// Column count of the left input.
    left_width: usize,
    schema: Vec<ColumnRef>,
    build: Vec<Row>,
    build_matched: Vec<bool>,
    build_done: bool,
    probe_open: bool,
    probe_done: bool,
    finished: bool,
}

impl NestedLoopJoinExec {
    pub fn new(
        kind: JoinKind,
        criteria: Option<Expr>,
        materialize: Side,
        dependent: Option<DependentJoin>,
        inputs: [BoxExecNode; 2],
        left_width: usize,
        schema: Vec<ColumnRef>,
    ) -> Self {
        let build_side = dependent.as_ref().map_or(materialize, |d| d.driving);
        Self {
            kind,
            criteria,
            build_side,
            dependent,
            inputs,
            left_width,
            schema,
            build: vec![],
            build_matched: vec![],
            build_done: false,
            probe_open: false,
            probe_done: false,
            finished: false,
        }
    }

    fn widths(&self) -> [usize; 2] {
        [self.left_width, self.schema.len() - self.left_width]
    }

    /// Publishes the driving key values of the materialized build side.
    fn populate_value_set(&self, ctx: &ExecContext) -> OptResult<()> {
        if let Some(dep) = &self.dependent {
            let eval = Evaluator::new(self.inputs[self.build_side.index()].schema());
            let mut values = BTreeSet::new();
            for row in &self.build {
                let value = eval.eval(&dep.driving_key, row)?;
                if !value.is_null() {
                    values.insert(value);
                }
            }
            debug!(
                "Populated value set {} with {} values",
                dep.value_set,
                values.len()
            );
            ctx.set_value_set(&dep.value_set, values.into_iter().collect());
        }
        Ok(())
    }

    fn probe_batch(&mut self, batch: Batch) -> OptResult<Vec<Row>> {
        let eval = Evaluator::new(&self.schema);
        let widths = self.widths();
        let probe_side = self.build_side.other();
        let keep_unmatched_probe = self.kind.preserves(probe_side);
        let mut out = vec![];
        for probe in batch.rows() {
            let mut matched = false;
            for (idx, build) in self.build.iter().enumerate() {
                let row = match self.build_side {
                    Side::Left => join_rows(Some(build), Some(probe), widths),
                    Side::Right => join_rows(Some(probe), Some(build), widths),
                };
                let passes = match &self.criteria {
                    Some(criteria) => eval.matches(criteria, &row)?,
                    None => true,
                };
                if passes {
                    matched = true;
                    self.build_matched[idx] = true;
                    out.push(row);
                }
            }
            if !matched && keep_unmatched_probe {
                out.push(match probe_side {
                    Side::Left => join_rows(Some(probe), None, widths),
                    Side::Right => join_rows(None, Some(probe), widths),
                });
            }
        }
        Ok(out)
    }

    fn unmatched_build(&self) -> Vec<Row> {
        let widths = self.widths();
        self.build
            .iter()
            .zip(&self.build_matched)
            .filter(|(_, matched)| !**matched)
            .map(|(row, _)| match self.build_side {
                Side::Left => join_rows(Some(row), None, widths),
                Side::Right => join_rows(None, Some(row), widths),
            })
            .collect()
    }
}

impl ExecNode for NestedLoopJoinExec {
    fn name(&self) -> &'static str {
        "NestedLoopJoin"
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    fn open(&mut self, ctx: &ExecContext) -> OptResult<()> {
        self.inputs[self.build_side.index()].open(ctx)
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        let build_idx = self.build_side.index();
        let probe_idx = self.build_side.other().index();
        loop {
            if self.finished {
                return Poll::Ready(None);
            }
            if !self.build_done {
                match poll_child!(self.inputs[build_idx].poll_next_batch(cx, ctx)) {
                    Some(batch) => self.build.extend(batch.into_rows()),
                    None => {
                        self.build_done = true;
                        self.build_matched = vec![false; self.build.len()];
                        if let Err(e) = self.populate_value_set(ctx) {
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }
                continue;
            }
            if !self.probe_open {
                if let Err(e) = self.inputs[probe_idx].open(ctx) {
                    return Poll::Ready(Some(Err(e)));
                }
                self.probe_open = true;
            }
            if !self.probe_done {
                match poll_child!(self.inputs[probe_idx].poll_next_batch(cx, ctx)) {
                    Some(batch) => match self.probe_batch(batch) {
                        Ok(rows) if rows.is_empty() => continue,
                        Ok(rows) => return Poll::Ready(Some(Ok(Batch::new(rows)))),
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    },
                    None => self.probe_done = true,
                }
                continue;
            }
            self.finished = true;
            if self.kind.preserves(self.build_side) {
                let rows = self.unmatched_build();
                if !rows.is_empty() {
                    return Poll::Ready(Some(Ok(Batch::new(rows))));
                }
            }
        }
    }

    fn close(&mut self) {
        self.inputs.iter_mut().for_each(|i| i.close());
        self.build.clear();
        self.build_matched.clear();
    }

    fn cancel(&mut self) {
        self.inputs.iter_mut().for_each(|i| i.cancel());
        self.finished = true;
    }
}
