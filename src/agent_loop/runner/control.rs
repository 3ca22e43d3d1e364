use std::sync::Arc;

use tokio::sync::watch;

use super::super::events::AgentEvent;
use super::super::types::{LoopState, RunId, RunOutcome};
use super::AgentEventSink;
use crate::channel::EventSender;

/// Single producer for a run's events and observable state.
#[derive(Clone)]
pub(super) struct AgentEventEmitter {
    run_id: RunId,
    sender: EventSender<AgentEvent, RunOutcome>,
    sink: Option<AgentEventSink>,
    state: Arc<watch::Sender<LoopState>>,
}

impl AgentEventEmitter {
    pub(super) fn new(
        run_id: RunId,
        sender: EventSender<AgentEvent, RunOutcome>,
        sink: Option<AgentEventSink>,
        state: watch::Sender<LoopState>,
    ) -> Self {
        Self {
            run_id,
            sender,
            sink,
            state: Arc::new(state),
        }
    }

    pub(super) fn run_id(&self) -> RunId {
        self.run_id
    }

    pub(super) fn emit(&self, event: AgentEvent) {
        if let Some(sink) = &self.sink {
            sink(event.clone());
        }
        if self.sender.push(event).is_err() {
            tracing::warn!(run_id = %self.run_id, "event emitted after run end");
        }
    }

    pub(super) fn set_state(&self, state: LoopState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(run_id = %self.run_id, from = %previous, to = %state, "loop state");
        }
    }

    pub(super) fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Emit the terminal `AgentEnd` and resolve the run's outcome.
    pub(super) fn finish(&self, outcome: RunOutcome) {
        self.set_state(outcome.state.into());
        let terminal = AgentEvent::AgentEnd {
            run_id: self.run_id,
            state: outcome.state,
            error: outcome.error.clone(),
        };
        if let Some(sink) = &self.sink {
            sink(terminal.clone());
        }
        if self.sender.end(terminal, outcome).is_err() {
            tracing::warn!(run_id = %self.run_id, "run finished twice");
        }
    }
}
