use std::collections::VecDeque;
use std::task::{Context, Poll};

use futures::StreamExt;
use log::debug;

use crate::capability::SourceId;
use crate::command::Command;
use crate::error::{OptResult, OptimizerError};
use crate::expr::ColumnRef;

use super::{BatchPoll, BatchStream, ConnectorRequest, ExecContext, ExecNode};

/// Turns a connector failure into a `ConnectorExecution` error of `source`, leaving
/// cancellation and errors already attributed to a source untouched.
fn connector_error(source: &SourceId, err: anyhow::Error) -> anyhow::Error {
    match OptimizerError::of(&err) {
        Some(OptimizerError::Cancelled) | Some(OptimizerError::ConnectorExecution { .. }) => err,
        _ => OptimizerError::ConnectorExecution {
            source_id: source.clone(),
            message: format!("{:#}", err),
        }
        .into(),
    }
}

fn dispatch(source: &SourceId, command: Command, ctx: &ExecContext) -> OptResult<BatchStream> {
    debug!("Dispatching to {}: {}", source, command);
    let connector = ctx.connector(source)?;
    connector
        .execute(ConnectorRequest {
            source: source.clone(),
            command,
            cancel: ctx.cancel_token(),
        })
        .map_err(|e| connector_error(source, e))
}

fn poll_stream(
    stream: &mut Option<BatchStream>,
    source: &SourceId,
    cx: &mut Context<'_>,
    ctx: &ExecContext,
) -> BatchPoll {
    if ctx.is_cancelled() {
        *stream = None;
        return Poll::Ready(Some(Err(OptimizerError::Cancelled.into())));
    }
    let polled = match stream {
        Some(s) => s.poll_next_unpin(cx),
        None => return Poll::Ready(None),
    };
    match polled {
        Poll::Ready(Some(Err(e))) => {
            *stream = None;
            Poll::Ready(Some(Err(connector_error(source, e))))
        }
        Poll::Ready(None) => {
            *stream = None;
            Poll::Ready(None)
        }
        other => other,
    }
}

/// Streams the result of one pushed command.
pub struct AccessExec {
    source: SourceId,
    command: Command,
    schema: Vec<ColumnRef>,
    stream: Option<BatchStream>,
    opened: bool,
}

impl AccessExec {
    pub fn new(source: SourceId, command: Command, schema: Vec<ColumnRef>) -> Self {
        Self {
            source,
            command,
            schema,
            stream: None,
            opened: false,
        }
    }
}

impl ExecNode for AccessExec {
    fn name(&self) -> &'static str {
        "Access"
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    fn open(&mut self, ctx: &ExecContext) -> OptResult<()> {
        if !self.opened {
            self.stream = Some(dispatch(&self.source, self.command.clone(), ctx)?);
            self.opened = true;
        }
        Ok(())
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        poll_stream(&mut self.stream, &self.source, cx, ctx)
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn cancel(&mut self) {
        self.stream = None;
    }
}

/// Streams a pushed command once per chunk of its dependent value set. Each chunk holds at
/// most the source's max IN size values; an empty set produces no rows and contacts no
/// connector.
pub struct DependentAccessExec {
    source: SourceId,
    command: Command,
    value_set: String,
    schema: Vec<ColumnRef>,
    /// `None` until the value set is read on first poll.
    chunks: Option<VecDeque<Command>>,
    stream: Option<BatchStream>,
    cancelled: bool,
}

impl DependentAccessExec {
    pub fn new(source: SourceId, command: Command, value_set: String, schema: Vec<ColumnRef>) -> Self {
        Self {
            source,
            command,
            value_set,
            schema,
            chunks: None,
            stream: None,
            cancelled: false,
        }
    }

    fn prepare_chunks(&mut self, ctx: &ExecContext) -> OptResult<()> {
        let values = ctx.value_set(&self.value_set).ok_or_else(|| {
            OptimizerError::Internal(format!(
                "dependent value set {} read before it was populated",
                self.value_set
            ))
        })?;
        let chunk_size = ctx.max_in_size(&self.source);
        debug!(
            "Value set {} holds {} values, {} per command",
            self.value_set,
            values.len(),
            chunk_size
        );
        self.chunks = Some(
            values
                .chunks(chunk_size)
                .map(|chunk| self.command.bind_dependent_values(&self.value_set, chunk))
                .collect(),
        );
        Ok(())
    }
}

impl ExecNode for DependentAccessExec {
    fn name(&self) -> &'static str {
        "DependentAccess"
    }

    fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    /// The value set may still be filling, so nothing is dispatched here.
    fn open(&mut self, _ctx: &ExecContext) -> OptResult<()> {
        Ok(())
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>, ctx: &ExecContext) -> BatchPoll {
        if self.cancelled {
            return Poll::Ready(None);
        }
        if self.chunks.is_none() {
            if let Err(e) = self.prepare_chunks(ctx) {
                return Poll::Ready(Some(Err(e)));
            }
        }
        loop {
            if self.stream.is_none() {
                let next = self.chunks.as_mut().and_then(|c| c.pop_front());
                match next {
                    Some(command) => match dispatch(&self.source, command, ctx) {
                        Ok(stream) => self.stream = Some(stream),
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    },
                    None => return Poll::Ready(None),
                }
            }
            match poll_stream(&mut self.stream, &self.source, cx, ctx) {
                // Chunk exhausted, move to the next one.
                Poll::Ready(None) => continue,
                other => return other,
            }
        }
    }

    fn close(&mut self) {
        self.stream = None;
        self.chunks = None;
    }

    fn cancel(&mut self) {
        self.stream = None;
        self.cancelled = true;
    }
}
