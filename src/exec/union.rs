use std::collections::HashSet;
use std::task::{Context, Poll};

use crate::error::OptResult;
use crate::expr::ColumnRef;

use super::{poll_child, Batch, BatchPoll, BoxExecNode, ExecContext, ExecNode, Row};

/// Concatenates its inputs in order. All inputs are opened up front so their pushed commands
/// run at their sources concurrently.
pub struct UnionAllExec {
    inputs: Vec<BoxExecNode>,
    schema: Vec<ColumnRef>,
    current: usize,
}

impl UnionAllExec {
    pub fn new(inputs: Vec<BoxExecNode>, schema: Vec<ColumnRef>) -> Self {
        Self {
            inputs,
            schema,
            current: 0,
        }
    }
}

impl ExecNode for UnionAllExec {
    fn name(&self) -> &'static str {
        "UnionAll"
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
        while let Some(input) = self.inputs.get_mut(self.current) {
            match poll_child!(input.poll_next_batch(cx, ctx)) {
                Some(batch) => return Poll::Ready(Some(Ok(batch))),
                None => self.current += 1,
            }
        }
        Poll::Ready(None)
    }

    fn close(&mut self) {
        self.inputs.iter_mut().for_each(|i| i.close());
    }

    fn cancel(&mut self) {
        self.inputs.iter_mut().for_each(|i| i.cancel());
        self.current = self.inputs.len();
    }
}

/// Drops rows already emitted.
pub struct DupRemoveExec {
    child: BoxExecNode,
    schema: Vec<ColumnRef>,
    seen: HashSet<Row>,
}

impl DupRemoveExec {
    pub fn new(child: BoxExecNode, schema: Vec<ColumnRef>) -> Self {
        Self {
            child,
            schema,
            seen: HashSet::new(),
        }
    }
}

impl ExecNode for DupRemoveExec {
    fn name(&self) -> &'static str {
        "DupRemove"
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    fn open(&mut self, ctx: &ExecContext) -> OptResult<()> {
        self.child.open(ctx)
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        loop {
            match poll_child!(self.child.poll_next_batch(cx, ctx)) {
                Some(batch) => {
                    let rows: Vec<Row> = batch
                        .into_rows()
                        .into_iter()
                        .filter(|row| self.seen.insert(row.clone()))
                        .collect();
                    if !rows.is_empty() {
                        return Poll::Ready(Some(Ok(Batch::new(rows))));
                    }
                }
                None => return Poll::Ready(None),
            }
        }
    }

    fn close(&mut self) {
        self.child.close();
        self.seen.clear();
    }

    fn cancel(&mut self) {
        self.child.cancel();
    }
}
