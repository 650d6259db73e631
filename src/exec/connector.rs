use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Context;

use futures::stream::BoxStream;
use futures::task::AtomicWaker;

use crate::capability::SourceId;
use crate::command::Command;
use crate::error::OptResult;

use super::Batch;

/// Cooperative cancellation flag shared by every node of one execution and the connector
/// requests they issue. Cloning shares the flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    waker: AtomicWaker,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the execution cancelled and wakes its driver. Safe to call from any thread.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.waker.wake();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wakes the task of `cx` on cancellation.
    pub fn register(&self, cx: &Context<'_>) {
        self.inner.waker.register(cx.waker());
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One pushed command sent to a source.
#[derive(Clone, Debug)]
pub struct ConnectorRequest {
    pub source: SourceId,
    pub command: Command,
    pub cancel: CancelToken,
}

pub type BatchStream = BoxStream<'static, OptResult<Batch>>;

/// Executes pushed commands against one kind of source. The returned stream is polled by
/// the access node and dropped when the node is cancelled or closed.
pub trait Connector: Send + Sync {
    fn execute(&self, request: ConnectorRequest) -> OptResult<BatchStream>;
}

/// Connectors keyed by source id.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<SourceId, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<SourceId>>(mut self, source: S, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(source.into(), connector);
        self
    }

    pub fn get(&self, source: &SourceId) -> Option<&Arc<dyn Connector>> {
        self.connectors.get(source)
    }
}
