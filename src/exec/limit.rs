use std::task::{Context, Poll};

use log::debug;

use crate::error::OptResult;
use crate::expr::ColumnRef;

use super::{poll_child, Batch, BatchPoll, BoxExecNode, ExecContext, ExecNode};

/// Skips `offset` rows, then passes at most `count` rows. The input is cancelled as soon as
/// the count is reached.
pub struct LimitExec {
    offset: u64,
    count: Option<u64>,
    child: BoxExecNode,
    schema: Vec<ColumnRef>,
    skipped: u64,
    emitted: u64,
    done: bool,
}

impl LimitExec {
    pub fn new(offset: u64, count: Option<u64>, child: BoxExecNode, schema: Vec<ColumnRef>) -> Self {
        Self {
            offset,
            count,
            child,
            schema,
            skipped: 0,
            emitted: 0,
            done: count == Some(0),
        }
    }

    fn apply(&mut self, batch: Batch) -> Batch {
        let mut rows = batch.into_rows();
        let skip = ((self.offset - self.skipped) as usize).min(rows.len());
        self.skipped += skip as u64;
        rows.drain(..skip);
        if let Some(count) = self.count {
            let remaining = (count - self.emitted) as usize;
            rows.truncate(remaining);
        }
        self.emitted += rows.len() as u64;
        Batch::new(rows)
    }

    fn stop_input(&mut self) {
        debug!("Limit reached after {} rows, cancelling input", self.emitted);
        self.done = true;
        self.child.cancel();
    }
}

impl ExecNode for LimitExec {
    fn name(&self) -> &'static str {
        "Limit"
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    fn open(&mut self, ctx: &ExecContext) -> OptResult<()> {
        if self.done {
            return Ok(());
        }
        self.child.open(ctx)
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            match poll_child!(self.child.poll_next_batch(cx, ctx)) {
                Some(batch) => {
                    let batch = self.apply(batch);
                    if self.count == Some(self.emitted) {
                        self.stop_input();
                    }
                    if !batch.is_empty() {
                        return Poll::Ready(Some(Ok(batch)));
                    }
                }
                None => self.done = true,
            }
        }
    }

    fn close(&mut self) {
        self.child.close();
    }

    fn cancel(&mut self) {
        self.child.cancel();
        self.done = true;
    }
}
