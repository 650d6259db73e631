//! Execution of physical plans.
//!
//! Every plan node becomes an [`ExecNode`] following the `open` / `poll_next_batch` / `close` /
//! `cancel` contract. Polling never blocks: access nodes hand pushed commands to a
//! [`Connector`] and return `Poll::Pending` while its stream has nothing ready, so one driver
//! task can run a whole plan. [`PlanExecution`] is that driver, exposed as a
//! `futures::Stream` of row batches.

use std::cell::RefCell;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use enum_dispatch::enum_dispatch;
use futures::{Stream, StreamExt};
use log::{debug, warn};

use crate::capability::{CapabilityRegistry, SourceId};
use crate::config::OptimizerConfig;
use crate::error::{OptResult, OptimizerError};
use crate::expr::{ColumnRef, ScalarValue};
use crate::plan::Plan;

mod access;
pub use access::*;
mod builder;
pub use builder::*;
mod connector;
pub use connector::*;
pub mod eval;
mod group;
pub use group::*;
mod join;
pub use join::*;
mod limit;
pub use limit::*;
mod merge;
pub use merge::*;
mod project;
pub use project::*;
mod sort;
pub use sort::*;
mod subquery;
pub use subquery::*;
mod union;
pub use union::*;

pub type Row = Vec<ScalarValue>;

/// Rows produced by one `poll_next_batch` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    rows: Vec<Row>,
}

impl Batch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// State shared by the nodes of one execution.
pub struct ExecContext {
    connectors: Arc<ConnectorRegistry>,
    registry: Arc<CapabilityRegistry>,
    config: OptimizerConfig,
    cancel: CancelToken,
    /// Dependent value sets, written by the driving side of a dependent join before its
    /// dependent side is opened.
    value_sets: RefCell<HashMap<String, Arc<Vec<ScalarValue>>>>,
}

impl ExecContext {
    pub fn new(
        connectors: Arc<ConnectorRegistry>,
        registry: Arc<CapabilityRegistry>,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            connectors,
            registry,
            config,
            cancel: CancelToken::new(),
            value_sets: RefCell::new(HashMap::new()),
        }
    }

    pub fn connector(&self, source: &SourceId) -> OptResult<Arc<dyn Connector>> {
        self.connectors.get(source).cloned().ok_or_else(|| {
            OptimizerError::ConnectorExecution {
                source_id: source.clone(),
                message: "no connector registered".to_string(),
            }
            .into()
        })
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Values bound per IN list for `source`.
    pub fn max_in_size(&self, source: &SourceId) -> usize {
        self.registry
            .max_in_predicate_size(source)
            .unwrap_or(self.config.default_max_in_size)
            .max(1) as usize
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_value_set(&self, name: &str, values: Vec<ScalarValue>) {
        self.value_sets
            .borrow_mut()
            .insert(name.to_string(), Arc::new(values));
    }

    pub fn value_set(&self, name: &str) -> Option<Arc<Vec<ScalarValue>>> {
        self.value_sets.borrow().get(name).cloned()
    }
}

pub type BatchPoll = Poll<Option<OptResult<Batch>>>;

#[enum_dispatch]
pub trait ExecNode {
    fn name(&self) -> &'static str;

    fn schema(&self) -> &[ColumnRef];

    /// Prepares the node and its inputs. Calling it again has no effect.
    fn open(&mut self, ctx: &ExecContext) -> OptResult<()>;

    /// Next batch of rows, `None` once exhausted. Returns `Pending` while waiting on a
    /// connector, after registering the task for wake up.
    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll;

    /// Releases buffered state. A cancelled node still accepts `close`.
    fn close(&mut self);

    /// Stops in-flight work of this node and its inputs.
    fn cancel(&mut self);
}

#[enum_dispatch(ExecNode)]
pub enum ExecNodeImpl {
    AccessExec,
    DependentAccessExec,
    NestedLoopJoinExec,
    MergeJoinExec,
    GroupingExec,
    SortExec,
    ProjectExec,
    SelectExec,
    UnionAllExec,
    DupRemoveExec,
    LimitExec,
    DependentSubqueryExec,
}

pub type BoxExecNode = Box<ExecNodeImpl>;

/// Returns from the enclosing poll function unless the child produced a batch.
macro_rules! poll_child {
    ($poll:expr) => {
        match $poll {
            std::task::Poll::Pending => return std::task::Poll::Pending,
            std::task::Poll::Ready(Some(Err(e))) => return std::task::Poll::Ready(Some(Err(e))),
            std::task::Poll::Ready(Some(Ok(batch))) => Some(batch),
            std::task::Poll::Ready(None) => None,
        }
    };
}
pub(crate) use poll_child;

/// Splits `rows` into batches of at most `size` rows.
pub(crate) fn split_batches(rows: Vec<Row>, size: usize) -> std::collections::VecDeque<Batch> {
    let mut out = std::collections::VecDeque::new();
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        out.push_back(Batch::new(rows.by_ref().take(size).collect()));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionState {
    Created,
    Open,
    Done,
}

/// Drives the root node of a physical plan.
///
/// The first error, whether raised in process or by a connector, cancels every node of the
/// plan before it is returned.
pub struct PlanExecution {
    root: BoxExecNode,
    ctx: ExecContext,
    state: ExecutionState,
}

impl PlanExecution {
    pub fn new(plan: &Plan, ctx: ExecContext) -> OptResult<Self> {
        let root = build_exec(&plan.root(), &HashMap::new())?;
        Ok(Self {
            root,
            ctx,
            state: ExecutionState::Created,
        })
    }

    pub fn schema(&self) -> &[ColumnRef] {
        self.root.schema()
    }

    /// Handle cancelling this execution from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.ctx.cancel_token()
    }

    pub fn cancel(&mut self) {
        self.ctx.cancel_token().cancel();
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.state != ExecutionState::Done {
            self.root.cancel();
            self.root.close();
            self.state = ExecutionState::Done;
        }
    }

    fn fail(&mut self, err: anyhow::Error) -> Poll<Option<OptResult<Batch>>> {
        warn!("Execution failed, cancelling the plan: {}", err);
        self.ctx.cancel_token().cancel();
        self.shutdown();
        Poll::Ready(Some(Err(err)))
    }

    /// All remaining rows.
    pub async fn collect_rows(mut self) -> OptResult<Vec<Row>> {
        let mut rows = vec![];
        while let Some(batch) = self.next().await {
            rows.extend(batch?.into_rows());
        }
        Ok(rows)
    }

    /// All remaining rows, blocking the current thread.
    pub fn collect_blocking(self) -> OptResult<Vec<Row>> {
        futures::executor::block_on(self.collect_rows())
    }
}

impl Stream for PlanExecution {
    type Item = OptResult<Batch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state == ExecutionState::Done {
            return Poll::Ready(None);
        }
        this.ctx.cancel_token().register(cx);
        if this.ctx.is_cancelled() {
            return this.fail(OptimizerError::Cancelled.into());
        }
        if this.state == ExecutionState::Created {
            debug!("Opening plan rooted at {}", this.root.name());
            if let Err(e) = this.root.open(&this.ctx) {
                return this.fail(e);
            }
            this.state = ExecutionState::Open;
        }
        match this.root.poll_next_batch(cx, &this.ctx) {
            Poll::Ready(Some(Err(e))) => this.fail(e),
            Poll::Ready(None) => {
                this.root.close();
                this.state = ExecutionState::Done;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
