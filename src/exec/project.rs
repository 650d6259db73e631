use std::task::{Context, Poll};

use crate::command::SelectItem;
use crate::error::OptResult;
use crate::expr::{ColumnRef, Expr};

use super::eval::Evaluator;
use super::{poll_child, Batch, BatchPoll, BoxExecNode, ExecContext, ExecNode, Row};

/// Computes the select items over every input row.
pub struct ProjectExec {
    items: Vec<SelectItem>,
    child: BoxExecNode,
    schema: Vec<ColumnRef>,
}

impl ProjectExec {
    pub fn new(items: Vec<SelectItem>, child: BoxExecNode, schema: Vec<ColumnRef>) -> Self {
        Self {
            items,
            child,
            schema,
        }
    }

    fn project(&self, batch: Batch) -> OptResult<Batch> {
        let eval = Evaluator::new(self.child.schema());
        let rows = batch
            .rows()
            .iter()
            .map(|row| {
                self.items
                    .iter()
                    .map(|item| eval.eval(&item.expr, row))
                    .collect::<OptResult<Row>>()
            })
            .collect::<OptResult<Vec<_>>>()?;
        Ok(Batch::new(rows))
    }
}

impl ExecNode for ProjectExec {
    fn name(&self) -> &'static str {
        "Project"
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    fn open(&mut self, ctx: &ExecContext) -> OptResult<()> {
        self.child.open(ctx)
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        Poll::Ready(poll_child!(self.child.poll_next_batch(cx, ctx)).map(|b| self.project(b)))
    }

    fn close(&mut self) {
        self.child.close();
    }

    fn cancel(&mut self) {
        self.child.cancel();
    }
}

/// Keeps the rows whose criteria evaluate to TRUE.
pub struct SelectExec {
    criteria: Expr,
    child: BoxExecNode,
    schema: Vec<ColumnRef>,
}

impl SelectExec {
    pub fn new(criteria: Expr, child: BoxExecNode, schema: Vec<ColumnRef>) -> Self {
        Self {
            criteria,
            child,
            schema,
        }
    }

    fn filter(&self, batch: Batch) -> OptResult<Vec<Row>> {
        let eval = Evaluator::new(self.child.schema());
        let mut out = vec![];
        for row in batch.into_rows() {
            if eval.matches(&self.criteria, &row)? {
                out.push(row);
            }
        }
        Ok(out)
    }
}

impl ExecNode for SelectExec {
    fn name(&self) -> &'static str {
        "Select"
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
                Some(batch) => match self.filter(batch) {
                    Ok(rows) if rows.is_empty() => continue,
                    Ok(rows) => return Poll::Ready(Some(Ok(Batch::new(rows)))),
                    Err(e) => return Poll::Ready(Some(Err(e))),
                },
                None => return Poll::Ready(None),
            }
        }
    }

    fn close(&mut self) {
        self.child.close();
    }

    fn cancel(&mut self) {
        self.child.cancel();
    }
}
