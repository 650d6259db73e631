use std::cmp::Ordering;
use std::collections::VecDeque;
use std::task::{Context, Poll};

use crate::command::SortKey;
use crate::error::OptResult;
use crate::expr::{ColumnRef, ScalarValue};

use super::eval::Evaluator;
use super::{poll_child, split_batches, Batch, BatchPoll, BoxExecNode, ExecContext, ExecNode, Row};

/// Materializes its input and emits it stably sorted. NULLs sort first ascending.
pub struct SortExec {
    keys: Vec<SortKey>,
    child: BoxExecNode,
    schema: Vec<ColumnRef>,
    rows: Vec<(Vec<ScalarValue>, Row)>,
    output: Option<VecDeque<Batch>>,
}

impl SortExec {
    pub fn new(keys: Vec<SortKey>, child: BoxExecNode, schema: Vec<ColumnRef>) -> Self {
        Self {
            keys,
            child,
            schema,
            rows: vec![],
            output: None,
        }
    }

    fn buffer(&mut self, batch: Batch) -> OptResult<()> {
        let eval = Evaluator::new(self.child.schema());
        for row in batch.into_rows() {
            let key = self
                .keys
                .iter()
                .map(|k| eval.eval(&k.expr, &row))
                .collect::<OptResult<Vec<_>>>()?;
            self.rows.push((key, row));
        }
        Ok(())
    }

    fn compare(&self, a: &[ScalarValue], b: &[ScalarValue]) -> Ordering {
        self.keys
            .iter()
            .zip(a.iter().zip(b))
            .map(|(key, (x, y))| {
                if key.ascending {
                    x.cmp(y)
                } else {
                    y.cmp(x)
                }
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl ExecNode for SortExec {
    fn name(&self) -> &'static str {
        "Sort"
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    fn open(&mut self, ctx: &ExecContext) -> OptResult<()> {
        self.child.open(ctx)
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        loop {
            if let Some(output) = &mut self.output {
                return Poll::Ready(output.pop_front().map(Ok));
            }
            match poll_child!(self.child.poll_next_batch(cx, ctx)) {
                Some(batch) => {
                    if let Err(e) = self.buffer(batch) {
                        return Poll::Ready(Some(Err(e)));
                    }
                }
                None => {
                    let mut rows = std::mem::take(&mut self.rows);
                    rows.sort_by(|(a, _), (b, _)| self.compare(a, b));
                    let rows = rows.into_iter().map(|(_, row)| row).collect();
                    self.output = Some(split_batches(rows, ctx.batch_size()));
                }
            }
        }
    }

    fn close(&mut self) {
        self.child.close();
        self.rows.clear();
        self.output = None;
    }

    fn cancel(&mut self) {
        self.child.cancel();
        self.rows.clear();
        self.output = Some(VecDeque::new());
    }
}
