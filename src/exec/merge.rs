use std::cmp::Ordering;
use std::collections::VecDeque;
use std::task::{Context, Poll};

use crate::error::OptResult;
use crate::expr::{ColumnRef, Expr, ScalarValue};
use crate::operator::{JoinKind, Side};

use super::eval::Evaluator;
use super::join::join_rows;
use super::{Batch, BatchPoll, BoxExecNode, ExecContext, ExecNode, Row};

type Keyed = (Vec<ScalarValue>, Row);

fn compare_keys(a: &[ScalarValue], b: &[ScalarValue]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.cmp(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Merge join over inputs sorted ascending on their join keys.
///
/// Rows sharing a key form a run; a run is joined once the row after it, or the end of its
/// input, has been seen. Rows with a NULL key never match.
pub struct MergeJoinExec {
    kind: JoinKind,
    keys: [Vec<Expr>; 2],
    inputs: [BoxExecNode; 2],
    input_schemas: [Vec<ColumnRef>; 2],
    schema: Vec<ColumnRef>,
    queues: [VecDeque<Keyed>; 2],
    done: [bool; 2],
    out: Vec<Row>,
    finished: bool,
}

impl MergeJoinExec {
    pub fn new(
        kind: JoinKind,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        inputs: [BoxExecNode; 2],
        input_schemas: [Vec<ColumnRef>; 2],
        schema: Vec<ColumnRef>,
    ) -> Self {
        Self {
            kind,
            keys: [left_keys, right_keys],
            inputs,
            input_schemas,
            schema,
            queues: [VecDeque::new(), VecDeque::new()],
            done: [false, false],
            out: vec![],
            finished: false,
        }
    }

    fn widths(&self) -> [usize; 2] {
        [self.input_schemas[0].len(), self.input_schemas[1].len()]
    }

    fn enqueue(&mut self, idx: usize, batch: Batch) -> OptResult<()> {
        let eval = Evaluator::new(&self.input_schemas[idx]);
        for row in batch.into_rows() {
            let key = self.keys[idx]
                .iter()
                .map(|k| eval.eval(k, &row))
                .collect::<OptResult<Vec<_>>>()?;
            self.queues[idx].push_back((key, row));
        }
        Ok(())
    }

    fn emit_unmatched(&mut self, side: Side, row: &Row) {
        if self.kind.preserves(side) {
            let widths = self.widths();
            self.out.push(match side {
                Side::Left => join_rows(Some(row), None, widths),
                Side::Right => join_rows(None, Some(row), widths),
            });
        }
    }

    /// Drops rows with a NULL key from the head of a queue.
    fn skip_null_keys(&mut self, side: Side) {
        while let Some((key, _)) = self.queues[side.index()].front() {
            if !key.iter().any(ScalarValue::is_null) {
                break;
            }
            if let Some((_, row)) = self.queues[side.index()].pop_front() {
                self.emit_unmatched(side, &row);
            }
        }
    }

    /// Length of the run at the head of a queue, `None` while more input is needed to tell.
    fn head_run(&self, idx: usize) -> Option<usize> {
        let queue = &self.queues[idx];
        let head = match queue.front() {
            Some((key, _)) => key,
            None => return if self.done[idx] { Some(0) } else { None },
        };
        let len = queue
            .iter()
            .take_while(|(key, _)| compare_keys(key, head) == Ordering::Equal)
            .count();
        if len < queue.len() || self.done[idx] {
            Some(len)
        } else {
            None
        }
    }

    fn pop_run(&mut self, idx: usize, len: usize) -> Vec<Row> {
        self.queues[idx].drain(..len).map(|(_, row)| row).collect()
    }

    /// Consumes one run, or one pair of runs, from the queue heads. Returns false once both
    /// inputs are exhausted.
    fn merge_step(&mut self, runs: [usize; 2]) -> bool {
        match runs {
            [0, 0] => false,
            [n, 0] => {
                for row in self.pop_run(0, n) {
                    self.emit_unmatched(Side::Left, &row);
                }
                true
            }
            [0, n] => {
                for row in self.pop_run(1, n) {
                    self.emit_unmatched(Side::Right, &row);
                }
                true
            }
            [l, r] => {
                let ord = match (self.queues[0].front(), self.queues[1].front()) {
                    (Some((lk, _)), Some((rk, _))) => compare_keys(lk, rk),
                    _ => return true,
                };
                match ord {
                    Ordering::Less => {
                        for row in self.pop_run(0, l) {
                            self.emit_unmatched(Side::Left, &row);
                        }
                    }
                    Ordering::Greater => {
                        for row in self.pop_run(1, r) {
                            self.emit_unmatched(Side::Right, &row);
                        }
                    }
                    Ordering::Equal => {
                        let widths = self.widths();
                        let left = self.pop_run(0, l);
                        let right = self.pop_run(1, r);
                        for lrow in &left {
                            for rrow in &right {
                                self.out.push(join_rows(Some(lrow), Some(rrow), widths));
                            }
                        }
                    }
                }
                true
            }
        }
    }

    fn flush(&mut self) -> Option<Batch> {
        if self.out.is_empty() {
            None
        } else {
            Some(Batch::new(std::mem::take(&mut self.out)))
        }
    }
}

impl ExecNode for MergeJoinExec {
    fn name(&self) -> &'static str {
        "MergeJoin"
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    fn open(&mut self, ctx: &ExecContext) -> OptResult<()> {
        for input in self.inputs.iter_mut() {
            input.open(ctx)?;
        }
        Ok(())
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        loop {
            if self.finished {
                return Poll::Ready(self.flush().map(Ok));
            }
            if self.out.len() >= ctx.batch_size() {
                return Poll::Ready(self.flush().map(Ok));
            }
            self.skip_null_keys(Side::Left);
            self.skip_null_keys(Side::Right);
            let runs = [self.head_run(0), self.head_run(1)];
            if let [Some(l), Some(r)] = runs {
                if !self.merge_step([l, r]) {
                    self.finished = true;
                }
                continue;
            }
            let idx = if runs[0].is_none() { 0 } else { 1 };
            match self.inputs[idx].poll_next_batch(cx, ctx) {
                Poll::Pending => {
                    return match self.flush() {
                        Some(batch) => Poll::Ready(Some(Ok(batch))),
                        None => Poll::Pending,
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(Some(Ok(batch))) => {
                    if let Err(e) = self.enqueue(idx, batch) {
                        return Poll::Ready(Some(Err(e)));
                    }
                }
                Poll::Ready(None) => self.done[idx] = true,
            }
        }
    }

    fn close(&mut self) {
        self.inputs.iter_mut().for_each(|i| i.close());
        self.queues.iter_mut().for_each(VecDeque::clear);
        self.out.clear();
    }

    fn cancel(&mut self) {
        self.inputs.iter_mut().for_each(|i| i.cancel());
        self.finished = true;
        self.out.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_keys_is_lexicographic() {
        let a = vec![ScalarValue::Int64(1), ScalarValue::Int64(5)];
        let b = vec![ScalarValue::Int64(1), ScalarValue::Int64(7)];
        assert_eq!(Ordering::Less, compare_keys(&a, &b));
        assert_eq!(Ordering::Equal, compare_keys(&a, &a));
        assert_eq!(
            Ordering::Equal,
            compare_keys(&[ScalarValue::Int64(2)], &[ScalarValue::Float64(2.0)])
        );
    }
}
