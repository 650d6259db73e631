use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::bail;
use log::debug;

use crate::error::{OptResult, OptimizerError};
use crate::expr::{ColumnRef, Expr, ScalarValue};
use crate::operator::SubqueryKind;
use crate::plan::PlanNodeRef;

use super::eval::{compare, in_values, Evaluator};
use super::{build_exec, Batch, BatchPoll, Bindings, BoxExecNode, ExecContext, ExecNode, Row};

/// Inner plan instance running for one correlation key.
struct InnerRun {
    key: Vec<ScalarValue>,
    exec: BoxExecNode,
    rows: Vec<Row>,
}

/// Evaluates a subquery the sources could not take, once per distinct correlation key of
/// the outer rows.
///
/// Filter kinds keep the outer rows the subquery accepts; the scalar kind appends the
/// subquery value to every outer row. The inner plan is instantiated with the correlated
/// outer columns bound to literals, and its result is cached by key.
pub struct DependentSubqueryExec {
    kind: SubqueryKind,
    negated: bool,
    outer: BoxExecNode,
    inner: PlanNodeRef,
    correlation: Vec<ColumnRef>,
    bindings: Bindings,
    schema: Vec<ColumnRef>,
    cache: HashMap<Vec<ScalarValue>, Arc<Vec<Row>>>,
    running: Option<InnerRun>,
    /// Outer batch being processed and the position of its next row.
    pending: Option<(Vec<Row>, usize)>,
    out: Vec<Row>,
    finished: bool,
}

impl DependentSubqueryExec {
    pub fn new(
        kind: SubqueryKind,
        negated: bool,
        outer: BoxExecNode,
        inner: PlanNodeRef,
        correlation: Vec<ColumnRef>,
        bindings: Bindings,
        schema: Vec<ColumnRef>,
    ) -> Self {
        Self {
            kind,
            negated,
            outer,
            inner,
            correlation,
            bindings,
            schema,
            cache: HashMap::new(),
            running: None,
            pending: None,
            out: vec![],
            finished: false,
        }
    }

    fn correlation_key(&self, row: &Row) -> OptResult<Vec<ScalarValue>> {
        let eval = Evaluator::new(self.outer.schema());
        self.correlation
            .iter()
            .map(|c| eval.eval(&Expr::Column(c.clone()), row))
            .collect()
    }

    fn start_inner(&mut self, key: Vec<ScalarValue>, ctx: &ExecContext) -> OptResult<()> {
        let mut bindings = self.bindings.clone();
        bindings.extend(self.correlation.iter().cloned().zip(key.iter().cloned()));
        debug!(
            "Running dependent subquery for key ({})",
            key.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
        );
        let mut exec = build_exec(&self.inner, &bindings)?;
        exec.open(ctx)?;
        self.running = Some(InnerRun {
            key,
            exec,
            rows: vec![],
        });
        Ok(())
    }

    fn single_value(inner: &[Row]) -> OptResult<ScalarValue> {
        match inner {
            [] => Ok(ScalarValue::Null),
            [row] => Ok(row.first().cloned().unwrap_or(ScalarValue::Null)),
            _ => bail!(OptimizerError::Execution(
                "scalar subquery returned more than one row".to_string()
            )),
        }
    }

    /// Output row for `row` given the subquery result, `None` when the row is filtered out.
    fn apply(&self, row: Row, inner: &[Row]) -> OptResult<Option<Row>> {
        let eval = Evaluator::new(self.outer.schema());
        let truth = match &self.kind {
            SubqueryKind::Exists => Some(!inner.is_empty()),
            SubqueryKind::In { expr } => {
                let value = eval.eval(expr, &row)?;
                let values: Vec<ScalarValue> = inner
                    .iter()
                    .map(|r| r.first().cloned().unwrap_or(ScalarValue::Null))
                    .collect();
                in_values(&value, &values)
            }
            SubqueryKind::Compare { expr, op } => {
                let value = eval.eval(expr, &row)?;
                compare(*op, &value, &Self::single_value(inner)?)
            }
            SubqueryKind::Scalar { .. } => {
                let mut row = row;
                row.push(Self::single_value(inner)?);
                return Ok(Some(row));
            }
        };
        let truth = if self.negated { truth.map(|b| !b) } else { truth };
        Ok((truth == Some(true)).then_some(row))
    }

    fn flush(&mut self) -> Option<Batch> {
        if self.out.is_empty() {
            None
        } else {
            Some(Batch::new(std::mem::take(&mut self.out)))
        }
    }

    /// Processes buffered outer rows until one needs an inner run not yet cached.
    fn advance(&mut self, ctx: &ExecContext) -> OptResult<()> {
        while let Some((rows, pos)) = &mut self.pending {
            let row = match rows.get(*pos) {
                Some(row) => row.clone(),
                None => {
                    self.pending = None;
                    break;
                }
            };
            let key = self.correlation_key(&row)?;
            match self.cache.get(&key).cloned() {
                Some(inner) => {
                    if let Some(out) = self.apply(row, &inner)? {
                        self.out.push(out);
                    }
                    if let Some((_, pos)) = &mut self.pending {
                        *pos += 1;
                    }
                    if self.out.len() >= ctx.batch_size() {
                        break;
                    }
                }
                None => {
                    self.start_inner(key, ctx)?;
                    break;
                }
            }
        }
        Ok(())
    }
}

impl ExecNode for DependentSubqueryExec {
    fn name(&self) -> &'static str {
        match self.kind {
            SubqueryKind::Scalar { .. } => "DependentProject",
            _ => "DependentSelect",
        }
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    fn open(&mut self, ctx: &ExecContext) -> OptResult<()> {
        self.outer.open(ctx)
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        loop {
            if self.finished {
                return Poll::Ready(self.flush().map(Ok));
            }
            if let Some(run) = &mut self.running {
                match run.exec.poll_next_batch(cx, ctx) {
                    Poll::Pending => {
                        return match self.flush() {
                            Some(batch) => Poll::Ready(Some(Ok(batch))),
                            None => Poll::Pending,
                        }
                    }
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                    Poll::Ready(Some(Ok(batch))) => run.rows.extend(batch.into_rows()),
                    Poll::Ready(None) => {
                        if let Some(mut run) = self.running.take() {
                            run.exec.close();
                            self.cache.insert(run.key, Arc::new(run.rows));
                        }
                    }
                }
                continue;
            }
            if self.out.len() >= ctx.batch_size() {
                return Poll::Ready(self.flush().map(Ok));
            }
            if self.pending.is_some() {
                if let Err(e) = self.advance(ctx) {
                    return Poll::Ready(Some(Err(e)));
                }
                continue;
            }
            if let Some(batch) = self.flush() {
                return Poll::Ready(Some(Ok(batch)));
            }
            match self.outer.poll_next_batch(cx, ctx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(Some(Ok(batch))) => self.pending = Some((batch.into_rows(), 0)),
                Poll::Ready(None) => self.finished = true,
            }
        }
    }

    fn close(&mut self) {
        self.outer.close();
        if let Some(mut run) = self.running.take() {
            run.exec.close();
        }
        self.cache.clear();
        self.pending = None;
        self.out.clear();
    }

    fn cancel(&mut self) {
        self.outer.cancel();
        if let Some(run) = &mut self.running {
            run.exec.cancel();
        }
        self.finished = true;
        self.out.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_value() {
        assert_eq!(
            ScalarValue::Null,
            DependentSubqueryExec::single_value(&[]).unwrap()
        );
        assert_eq!(
            ScalarValue::Int64(4),
            DependentSubqueryExec::single_value(&[vec![ScalarValue::Int64(4)]]).unwrap()
        );
        let err = DependentSubqueryExec::single_value(&[
            vec![ScalarValue::Int64(4)],
            vec![ScalarValue::Int64(5)],
        ])
        .unwrap_err();
        assert!(err.to_string().contains("more than one row"));
    }
}
