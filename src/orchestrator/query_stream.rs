//! Streaming analysis queries.
//!
//! [`StreamingQueryClient`] owns one analysis stream at a time. Token chunks are
//! accumulated in arrival order; the first terminal item (final result, error
//! or transport failure) resolves the query and nothing after it is delivered.

use super::{lock, RunGate, RunTicket};
use crate::backend::Backend;
use crate::model::{AnalysisOutcome, QueryEvent, QueryRequest, QueryState, StreamEvent};
use futures::StreamExt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) const STREAM_CLOSED: &str = "analysis stream closed before a final result";

#[derive(Debug)]
struct Shared {
    state: QueryState,
    buffer: String,
}

pub(crate) struct StreamingQueryClient {
    backend: Arc<dyn Backend>,
    event_tx: UnboundedSender<QueryEvent>,
    gate: RunGate,
    shared: Arc<Mutex<Shared>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamingQueryClient {
    pub fn new(backend: Arc<dyn Backend>, event_tx: UnboundedSender<QueryEvent>) -> Self {
        Self {
            backend,
            event_tx,
            gate: RunGate::default(),
            shared: Arc::new(Mutex::new(Shared {
                state: QueryState::Idle,
                buffer: String::new(),
            })),
            handle: None,
        }
    }

    /// Open a stream for `request`, cancelling any query still in flight.
    pub fn start(&mut self, request: QueryRequest) {
        self.cancel();
        let ticket = self.gate.issue();
        {
            let mut shared = lock(&self.shared);
            shared.state = QueryState::Streaming;
            shared.buffer.clear();
        }
        let worker = StreamWorker {
            backend: self.backend.clone(),
            request,
            ticket,
            shared: self.shared.clone(),
            event_tx: self.event_tx.clone(),
        };
        self.handle = Some(tokio::spawn(worker.run()));
    }

    /// Abort the active stream. Events already in flight from it are dropped.
    pub fn cancel(&mut self) {
        self.gate.retire();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        let mut shared = lock(&self.shared);
        if shared.state == QueryState::Streaming {
            debug!(received = shared.buffer.len(), "analysis stream cancelled");
            shared.state = QueryState::Cancelled;
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> QueryState {
        lock(&self.shared).state
    }

    pub fn buffer(&self) -> String {
        lock(&self.shared).buffer.clone()
    }
}

impl Drop for StreamingQueryClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct StreamWorker {
    backend: Arc<dyn Backend>,
    request: QueryRequest,
    ticket: RunTicket,
    shared: Arc<Mutex<Shared>>,
    event_tx: UnboundedSender<QueryEvent>,
}

impl StreamWorker {
    async fn run(self) {
        let mut events = match self.backend.open_analysis(&self.request).await {
            Ok(events) => events,
            Err(err) => {
                self.fail(err.to_string());
                return;
            }
        };

        while let Some(item) = events.next().await {
            let flow = match item {
                Ok(StreamEvent::TokenChunk(text)) => self.on_token(&text),
                Ok(StreamEvent::FinalResult(payload)) => {
                    self.on_final(&payload);
                    ControlFlow::Break(())
                }
                Ok(StreamEvent::ErrorEvent(message)) => {
                    self.fail(message);
                    ControlFlow::Break(())
                }
                Err(err) => {
                    self.fail(err.to_string());
                    ControlFlow::Break(())
                }
            };
            if flow.is_break() {
                return;
            }
        }
        self.fail(STREAM_CLOSED.to_string());
    }

    fn on_token(&self, text: &str) -> ControlFlow<()> {
        let published = self.ticket.publish(|| {
            let mut shared = lock(&self.shared);
            shared.buffer.push_str(text);
            let _ = self.event_tx.send(QueryEvent::Partial {
                text: shared.buffer.clone(),
            });
        });
        match published {
            Some(()) => ControlFlow::Continue(()),
            None => ControlFlow::Break(()),
        }
    }

    fn on_final(&self, payload: &str) {
        self.ticket.publish(|| {
            let mut shared = lock(&self.shared);
            let outcome = AnalysisOutcome::from_payload(payload, &shared.buffer);
            if matches!(outcome, AnalysisOutcome::Fallback(_)) {
                debug!("analysis payload is not structured, falling back to raw text");
            }
            shared.state = QueryState::Completed;
            let _ = self.event_tx.send(QueryEvent::Completed { outcome });
        });
    }

    fn fail(&self, message: String) {
        self.ticket.publish(|| {
            warn!(error = %message, "analysis query failed");
            lock(&self.shared).state = QueryState::Errored;
            let _ = self.event_tx.send(QueryEvent::Errored { message });
        });
    }
}
