use std::collections::HashSet;
use std::task::{Context, Poll};

use anyhow::bail;

use crate::command::SelectItem;
use crate::error::{OptResult, OptimizerError};
use crate::expr::{AggregateFunction, ColumnRef, Expr, ScalarValue};

use super::eval::{as_f64, Evaluator};
use super::{poll_child, Batch, BatchPoll, BoxExecNode, ExecContext, ExecNode, Row};

/// Running state of one aggregate over one group. NULL inputs are ignored.
#[derive(Debug, Clone)]
struct Accumulator {
    func: AggregateFunction,
    count_star: bool,
    seen: Option<HashSet<ScalarValue>>,
    count: i64,
    value: ScalarValue,
}

impl Accumulator {
    fn new(func: AggregateFunction, count_star: bool, distinct: bool) -> Self {
        Self {
            func,
            count_star,
            seen: distinct.then(HashSet::new),
            count: 0,
            value: ScalarValue::Null,
        }
    }

    fn update(&mut self, value: Option<ScalarValue>) -> OptResult<()> {
        let value = match value {
            None if self.count_star => {
                self.count += 1;
                return Ok(());
            }
            Some(v) if !v.is_null() => v,
            _ => return Ok(()),
        };
        if let Some(seen) = &mut self.seen {
            if !seen.insert(value.clone()) {
                return Ok(());
            }
        }
        self.count += 1;
        self.value = match (self.func, &self.value) {
            (AggregateFunction::Count, _) => ScalarValue::Null,
            (_, ScalarValue::Null) => value,
            (AggregateFunction::Sum | AggregateFunction::Avg, acc) => match (acc, &value) {
                (ScalarValue::Int64(a), ScalarValue::Int64(b)) => match a.checked_add(*b) {
                    Some(sum) => ScalarValue::Int64(sum),
                    None => bail!(OptimizerError::Execution(format!(
                        "{} overflows adding {} to {}",
                        self.func, b, a
                    ))),
                },
                (ScalarValue::Int64(_) | ScalarValue::Float64(_), ScalarValue::Int64(_))
                | (ScalarValue::Int64(_) | ScalarValue::Float64(_), ScalarValue::Float64(_)) => {
                    ScalarValue::Float64(as_f64(acc) + as_f64(&value))
                }
                _ => bail!(OptimizerError::Execution(format!(
                    "{} over non-numeric value {}",
                    self.func, value
                ))),
            },
            (AggregateFunction::Min, acc) if value < *acc => value,
            (AggregateFunction::Max, acc) if value > *acc => value,
            (_, acc) => acc.clone(),
        };
        Ok(())
    }

    fn finish(&self) -> ScalarValue {
        match self.func {
            AggregateFunction::Count => ScalarValue::Int64(self.count),
            AggregateFunction::Avg if self.count > 0 => {
                ScalarValue::Float64(as_f64(&self.value) / self.count as f64)
            }
            AggregateFunction::Avg => ScalarValue::Null,
            _ => self.value.clone(),
        }
    }
}

/// An aggregate item: `(function, argument, distinct)`.
type AggregateSpec = (AggregateFunction, Option<Expr>, bool);

fn aggregate_spec(item: &SelectItem) -> OptResult<AggregateSpec> {
    match &item.expr {
        Expr::Aggregate {
            func,
            arg,
            distinct,
        } => Ok((*func, arg.as_deref().cloned(), *distinct)),
        other => bail!(OptimizerError::Execution(format!(
            "grouping output {} is not an aggregate",
            other
        ))),
    }
}

/// Streaming aggregation over input sorted on the grouping keys. Without keys the whole
/// input is one group, which yields a row even when the input is empty.
pub struct GroupingExec {
    keys: Vec<SelectItem>,
    aggregates: Vec<SelectItem>,
    child: BoxExecNode,
    schema: Vec<ColumnRef>,
    specs: Vec<AggregateSpec>,
    current: Option<(Vec<ScalarValue>, Vec<Accumulator>)>,
    seen_rows: bool,
    finished: bool,
}

impl GroupingExec {
    pub fn new(
        keys: Vec<SelectItem>,
        aggregates: Vec<SelectItem>,
        child: BoxExecNode,
        schema: Vec<ColumnRef>,
    ) -> Self {
        Self {
            keys,
            aggregates,
            child,
            schema,
            specs: vec![],
            current: None,
            seen_rows: false,
            finished: false,
        }
    }

    fn accumulators(&self) -> Vec<Accumulator> {
        self.specs
            .iter()
            .map(|(func, arg, distinct)| Accumulator::new(*func, arg.is_none(), *distinct))
            .collect()
    }

    fn group_row(key: Vec<ScalarValue>, accs: &[Accumulator]) -> Row {
        key.into_iter().chain(accs.iter().map(Accumulator::finish)).collect()
    }

    /// Folds a batch into the running groups, returning the groups it completed.
    fn consume(&mut self, batch: Batch) -> OptResult<Vec<Row>> {
        let eval = Evaluator::new(self.child.schema());
        let mut out = vec![];
        for row in batch.rows() {
            self.seen_rows = true;
            let key = self
                .keys
                .iter()
                .map(|k| eval.eval(&k.expr, row))
                .collect::<OptResult<Vec<_>>>()?;
            let start_new = match &self.current {
                Some((current, _)) => *current != key,
                None => true,
            };
            if start_new {
                if let Some((done, accs)) = self.current.take() {
                    out.push(Self::group_row(done, &accs));
                }
                self.current = Some((key, self.accumulators()));
            }
            if let Some((_, accs)) = &mut self.current {
                for (acc, (_, arg, _)) in accs.iter_mut().zip(&self.specs) {
                    let value = match arg {
                        Some(arg) => Some(eval.eval(arg, row)?),
                        None => None,
                    };
                    acc.update(value)?;
                }
            }
        }
        Ok(out)
    }

    fn finish(&mut self) -> Option<Row> {
        match self.current.take() {
            Some((key, accs)) => Some(Self::group_row(key, &accs)),
            None if self.keys.is_empty() && !self.seen_rows => {
                Some(Self::group_row(vec![], &self.accumulators()))
            }
            None => None,
        }
    }
}

impl ExecNode for GroupingExec {
    fn name(&self) -> &'static str {
        "Grouping"
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    fn open(&mut self, ctx: &ExecContext) -> OptResult<()> {
        self.specs = self
            .aggregates
            .iter()
            .map(aggregate_spec)
            .collect::<OptResult<_>>()?;
        self.child.open(ctx)
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        loop {
            if self.finished {
                return Poll::Ready(None);
            }
            match poll_child!(self.child.poll_next_batch(cx, ctx)) {
                Some(batch) => match self.consume(batch) {
                    Ok(rows) if rows.is_empty() => continue,
                    Ok(rows) => return Poll::Ready(Some(Ok(Batch::new(rows)))),
                    Err(e) => return Poll::Ready(Some(Err(e))),
                },
                None => {
                    self.finished = true;
                    if let Some(row) = self.finish() {
                        return Poll::Ready(Some(Ok(Batch::new(vec![row]))));
                    }
                }
            }
        }
    }

    fn close(&mut self) {
        self.child.close();
        self.current = None;
    }

    fn cancel(&mut self) {
        self.child.cancel();
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(mut acc: Accumulator, values: Vec<ScalarValue>) -> ScalarValue {
        for v in values {
            acc.update(Some(v)).unwrap();
        }
        acc.finish()
    }

    #[test]
    fn test_aggregates_skip_nulls() {
        use ScalarValue::*;
        let values = vec![Int64(3), Null, Int64(1), Int64(3)];
        assert_eq!(
            Int64(3),
            fold(Accumulator::new(AggregateFunction::Count, false, false), values.clone())
        );
        assert_eq!(
            Int64(2),
            fold(Accumulator::new(AggregateFunction::Count, false, true), values.clone())
        );
        assert_eq!(
            Int64(7),
            fold(Accumulator::new(AggregateFunction::Sum, false, false), values.clone())
        );
        assert_eq!(
            Int64(1),
            fold(Accumulator::new(AggregateFunction::Min, false, false), values.clone())
        );
        assert_eq!(
            Int64(3),
            fold(Accumulator::new(AggregateFunction::Max, false, false), values.clone())
        );
        assert_eq!(
            Float64(2.0),
            fold(Accumulator::new(AggregateFunction::Avg, false, true), values)
        );
    }

    #[test]
    fn test_empty_aggregates() {
        let mut star = Accumulator::new(AggregateFunction::Count, true, false);
        assert_eq!(ScalarValue::Int64(0), star.finish());
        star.update(None).unwrap();
        star.update(None).unwrap();
        assert_eq!(ScalarValue::Int64(2), star.finish());
        assert_eq!(
            ScalarValue::Null,
            Accumulator::new(AggregateFunction::Sum, false, false).finish()
        );
    }

    #[test]
    fn test_sum_promotes_to_float() {
        let acc = Accumulator::new(AggregateFunction::Sum, false, false);
        assert_eq!(
            ScalarValue::Float64(3.5),
            fold(acc, vec![ScalarValue::Int64(1), ScalarValue::Float64(2.5)])
        );
    }

    #[test]
    fn test_sum_overflow_is_an_error() {
        let mut acc = Accumulator::new(AggregateFunction::Sum, false, false);
        acc.update(Some(ScalarValue::Int64(i64::MAX))).unwrap();
        let err = acc.update(Some(ScalarValue::Int64(1))).unwrap_err();
        assert!(matches!(
            OptimizerError::of(&err),
            Some(OptimizerError::Execution(_))
        ));
    }
}
