//! Runner for agent loop requests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::AgentEvent;
use super::types::{LoopState, RunId, RunOutcome};
use crate::channel::{event_channel, EventResult, EventStream};
use crate::compaction::{CompactionEngine, Summarizer};
use crate::config::LoopConfig;
use crate::error::StrandError;
use crate::provider::{GenerationSettings, ModelClient};
use crate::session::SharedSession;
use crate::tools::{Tool, ToolExecutor};
use crate::types::{Message, StopReason};

mod control;
mod engine;
mod message_events;
mod tooling;

pub use engine::MAX_OVERFLOW_RECOVERIES;
pub use tooling::SKIPPED_DUE_TO_STEERING;

/// Async callback to retrieve messages between loop phases.
pub type MessageBatchFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Vec<Message>> + Send>> + Send + Sync>;

/// Callback consulted after each tool call and after each turn.
pub type SteeringMessagesFn = MessageBatchFn;

/// Callback consulted when the inner loop would otherwise finish.
pub type FollowUpMessagesFn = MessageBatchFn;

/// Hook to convert/filter the materialized context into the messages sent to the model.
pub type ConvertToLlmFn = Arc<
    dyn Fn(Vec<Message>) -> Pin<Box<dyn Future<Output = Vec<Message>> + Send>> + Send + Sync,
>;

/// Sink for agent events, for hosts that prefer a callback over the event stream.
pub type AgentEventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Context filter used when a request sets no `convert_to_llm` hook.
///
/// Drops custom messages, which only hosts interpret, and failed or aborted
/// assistant messages that carry no content.
pub fn default_convert_to_llm(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter(|message| match message {
            Message::Custom { .. } => false,
            Message::Assistant(assistant) => {
                !(matches!(assistant.stop_reason, StopReason::Error | StopReason::Aborted)
                    && assistant.is_empty())
            }
            _ => true,
        })
        .collect()
}

/// Request payload to start a run.
#[derive(Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    pub session: SharedSession,
    /// Messages appended to the session at the start of the first turn.
    pub input: Vec<Message>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub config: LoopConfig,
    pub settings: GenerationSettings,
    pub get_steering_messages: Option<SteeringMessagesFn>,
    pub get_follow_up_messages: Option<FollowUpMessagesFn>,
    pub convert_to_llm: Option<ConvertToLlmFn>,
    /// Called with every event before it is pushed to the event stream.
    pub event_sink: Option<AgentEventSink>,
}

impl RunRequest {
    pub fn new(session: SharedSession, input: Vec<Message>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            session,
            input,
            tools: Vec::new(),
            config: LoopConfig::default(),
            settings: GenerationSettings::default(),
            get_steering_messages: None,
            get_follow_up_messages: None,
            convert_to_llm: None,
            event_sink: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_steering_messages(mut self, get_steering_messages: SteeringMessagesFn) -> Self {
        self.get_steering_messages = Some(get_steering_messages);
        self
    }

    pub fn with_follow_up_messages(mut self, get_follow_up_messages: FollowUpMessagesFn) -> Self {
        self.get_follow_up_messages = Some(get_follow_up_messages);
        self
    }

    pub fn with_convert_to_llm(mut self, convert_to_llm: ConvertToLlmFn) -> Self {
        self.convert_to_llm = Some(convert_to_llm);
        self
    }

    pub fn with_event_sink(mut self, sink: AgentEventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }
}

/// Handle for an in-flight run.
pub struct RunHandle {
    run_id: RunId,
    events: Option<EventStream<AgentEvent>>,
    result: EventResult<RunOutcome>,
    abort: CancellationToken,
    state: watch::Receiver<LoopState>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation. Returns `false` if the run was already aborted.
    pub fn abort(&self) -> bool {
        if self.abort.is_cancelled() {
            return false;
        }
        self.abort.cancel();
        true
    }

    /// Token that aborts this run when cancelled.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// The run's event stream. Available once; events are buffered until taken.
    pub fn take_events(&mut self) -> Option<EventStream<AgentEvent>> {
        self.events.take()
    }

    pub async fn wait(self) -> RunOutcome {
        let run_id = self.run_id;
        self.result
            .wait()
            .await
            .unwrap_or_else(|_| RunOutcome::lost(run_id))
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("state", &self.state())
            .field("aborted", &self.abort.is_cancelled())
            .finish()
    }
}

/// Drives runs against one model client.
#[derive(Clone)]
pub struct AgentLoop {
    client: Arc<dyn ModelClient>,
}

impl AgentLoop {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn ModelClient> {
        &self.client
    }

    /// Compaction engine configured the way runs started with `config` use it.
    pub fn compaction_engine(&self, config: &LoopConfig) -> CompactionEngine {
        CompactionEngine::new(
            Summarizer::new(self.client.clone(), config.retry),
            config.compaction,
            config
                .context_window
                .unwrap_or_else(|| self.client.context_window()),
        )
    }

    /// Validate the request and spawn the run on the tokio runtime.
    pub fn start(&self, request: RunRequest) -> Result<RunHandle, StrandError> {
        request.config.validate()?;

        let (sender, events, result) = event_channel();
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);
        let abort = CancellationToken::new();
        let run_id = request.run_id;

        let run = engine::LoopRun {
            compaction: self.compaction_engine(&request.config),
            executor: ToolExecutor::new(request.tools.clone())
                .with_abort_grace(Duration::from_millis(request.config.abort_grace_ms)),
            client: self.client.clone(),
            emitter: control::AgentEventEmitter::new(
                run_id,
                sender,
                request.event_sink.clone(),
                state_tx,
            ),
            cancel: abort.clone(),
            request,
        };
        tokio::spawn(run.drive());

        Ok(RunHandle {
            run_id,
            events: Some(events),
            result,
            abort,
            state: state_rx,
        })
    }
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("model_id", &self.client.model_id())
            .finish()
    }
}

#[cfg(test)]
mod tests;
