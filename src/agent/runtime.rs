//! High-level agent runtime wrapping the agent loop.
//!
//! - [`Agent::prompt`] / [`Agent::prompt_messages`] start a run with new input
//! - [`Agent::continue_run`] resumes from the session's current leaf
//! - [`Agent::steer`] interrupts the remaining tool calls of a batch
//! - [`Agent::follow_up`] extends a run that would otherwise finish
//! - [`Agent::abort`] / [`Agent::wait_for_idle`] control the run lifecycle
//! - [`Agent::branch`], [`Agent::label`] and [`Agent::compact`] edit the session while idle

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

use crate::agent_loop::{
    AgentEventSink, AgentLoop, ConvertToLlmFn, FollowUpMessagesFn, RunOutcome, RunRequest,
    SteeringMessagesFn,
};
use crate::compaction::CompactionResult;
use crate::config::LoopConfig;
use crate::error::{Result, StrandError};
use crate::provider::{GenerationSettings, ModelClient};
use crate::session::{EntryId, EntryPayload, SharedSession};
use crate::tools::Tool;
use crate::types::Message;

/// Agent runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AgentState {
    /// No run in progress; ready to accept prompts.
    Idle,
    /// A run (or a manual compaction) is in progress.
    Running,
    /// An abort has been requested; waiting for the run to wind down.
    Aborting,
}

/// How many queued messages each steering or follow-up poll takes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueMode {
    /// At most one message per poll.
    #[default]
    OneAtATime,
    /// Everything queued.
    All,
}

fn drain_queue(queue: &mut Vec<Message>, mode: QueueMode) -> Vec<Message> {
    match mode {
        QueueMode::All => std::mem::take(queue),
        QueueMode::OneAtATime => {
            if queue.is_empty() {
                Vec::new()
            } else {
                vec![queue.remove(0)]
            }
        }
    }
}

fn queue_provider(queue: Arc<Mutex<Vec<Message>>>, mode: QueueMode) -> SteeringMessagesFn {
    Arc::new(move || {
        let queue = queue.clone();
        Box::pin(async move {
            let mut queue = queue.lock().await;
            drain_queue(&mut queue, mode)
        })
    })
}

/// Configuration for creating an [`Agent`].
#[derive(Clone, Default)]
pub struct AgentConfig {
    pub loop_config: LoopConfig,
    /// Tools available to every run.
    pub tools: Vec<Arc<dyn Tool>>,
    pub settings: GenerationSettings,
    /// Optional hook to convert/filter the context before each model request.
    pub convert_to_llm: Option<ConvertToLlmFn>,
    /// Optional sink receiving every event of every run.
    pub event_sink: Option<AgentEventSink>,
    pub steering_mode: QueueMode,
    pub follow_up_mode: QueueMode,
}

/// High-level agent runtime over one session.
///
/// All public methods take `&self`; one `Agent` can be shared between tasks.
/// Only one run executes at a time.
pub struct Agent {
    config: AgentConfig,
    agent_loop: AgentLoop,
    session: SharedSession,
    state: Arc<Mutex<AgentState>>,
    state_tx: watch::Sender<AgentState>,
    state_rx: watch::Receiver<AgentState>,
    steering_queue: Arc<Mutex<Vec<Message>>>,
    follow_up_queue: Arc<Mutex<Vec<Message>>>,
    active_abort: Arc<Mutex<Option<CancellationToken>>>,
    idle_notify: Arc<Notify>,
    last_outcome: Arc<Mutex<Option<RunOutcome>>>,
}

impl Agent {
    pub fn new(client: Arc<dyn ModelClient>, session: SharedSession, config: AgentConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(AgentState::Idle);
        Self {
            config,
            agent_loop: AgentLoop::new(client),
            session,
            state: Arc::new(Mutex::new(AgentState::Idle)),
            state_tx,
            state_rx,
            steering_queue: Arc::new(Mutex::new(Vec::new())),
            follow_up_queue: Arc::new(Mutex::new(Vec::new())),
            active_abort: Arc::new(Mutex::new(None)),
            idle_notify: Arc::new(Notify::new()),
            last_outcome: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn state(&self) -> AgentState {
        *self.state.lock().await
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state_rx.clone()
    }

    /// The session this agent appends to. Read freely; mutate only while idle.
    pub fn session(&self) -> SharedSession {
        self.session.clone()
    }

    /// Outcome of the most recent run.
    pub async fn last_outcome(&self) -> Option<RunOutcome> {
        self.last_outcome.lock().await.clone()
    }

    pub async fn clear_steering_queue(&self) {
        self.steering_queue.lock().await.clear();
    }

    pub async fn clear_follow_up_queue(&self) {
        self.follow_up_queue.lock().await.clear();
    }

    pub async fn clear_all_queues(&self) {
        self.clear_steering_queue().await;
        self.clear_follow_up_queue().await;
    }

    pub async fn has_queued_messages(&self) -> bool {
        !self.steering_queue.lock().await.is_empty()
            || !self.follow_up_queue.lock().await.is_empty()
    }

    /// Start a run with a user prompt.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::InvalidState`] if the agent is not idle.
    pub async fn prompt(&self, text: impl Into<String>) -> Result<RunOutcome> {
        self.prompt_messages(vec![Message::user(text)]).await
    }

    /// Start a run whose first turn opens with `messages`.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::InvalidArgument`] for an empty batch and
    /// [`StrandError::InvalidState`] if the agent is not idle.
    pub async fn prompt_messages(&self, messages: Vec<Message>) -> Result<RunOutcome> {
        if messages.is_empty() {
            return Err(StrandError::InvalidArgument(
                "prompt requires at least one message".into(),
            ));
        }
        self.transition_to_running()?;
        self.run_loop(messages).await
    }

    /// Continue from the session's current leaf without new user input.
    ///
    /// When the context ends with an assistant message, queued steering (or,
    /// failing that, follow-up) messages open the run.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::InvalidState`] if:
    /// - the agent is not idle,
    /// - the session has no messages to continue from,
    /// - the context ends with an assistant message and nothing is queued.
    pub async fn continue_run(&self) -> Result<RunOutcome> {
        self.transition_to_running()?;

        let context = match self.session.read().await.build_context(None) {
            Ok(context) => context,
            Err(err) => {
                self.restore_idle_after_preflight_error().await;
                return Err(err.into());
            }
        };
        let Some(last) = context.messages.last() else {
            self.restore_idle_after_preflight_error().await;
            return Err(StrandError::InvalidState(
                "No messages to continue from".into(),
            ));
        };

        let mut input = Vec::new();
        if last.as_assistant().is_some() {
            input = drain_queue(
                &mut *self.steering_queue.lock().await,
                self.config.steering_mode,
            );
            if input.is_empty() {
                input = drain_queue(
                    &mut *self.follow_up_queue.lock().await,
                    self.config.follow_up_mode,
                );
            }
            if input.is_empty() {
                self.restore_idle_after_preflight_error().await;
                return Err(StrandError::InvalidState(
                    "Cannot continue from message role: assistant".into(),
                ));
            }
        }

        self.run_loop(input).await
    }

    /// Queue a steering message.
    ///
    /// The running loop picks it up after the current tool call finishes and
    /// skips the rest of the batch. Queued while idle, it waits for the next run.
    pub async fn steer(&self, message: impl Into<Message>) {
        self.steering_queue.lock().await.push(message.into());
    }

    /// Queue a message consulted only when the run would otherwise finish.
    pub async fn follow_up(&self, message: impl Into<Message>) {
        self.follow_up_queue.lock().await.push(message.into());
    }

    /// Abort the current run.
    ///
    /// Returns `true` if an abort was requested, `false` if nothing was running.
    pub async fn abort(&self) -> bool {
        let mut state = self.state.lock().await;
        if *state != AgentState::Running {
            return false;
        }
        *state = AgentState::Aborting;
        let _ = self.state_tx.send(AgentState::Aborting);
        drop(state);

        // Without a token yet, run_loop sees Aborting once the run starts.
        if let Some(token) = self.active_abort.lock().await.as_ref() {
            token.cancel();
        }
        true
    }

    /// Wait until the agent is idle. Returns immediately if it already is.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if *self.state.lock().await == AgentState::Idle {
                return;
            }
            notified.await;
        }
    }

    /// Move the session leaf to `entry_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::InvalidState`] while a run is active.
    pub async fn branch(&self, entry_id: &str) -> Result<()> {
        let _state_guard = self.lock_state_for_idle_mutation()?;
        self.session.write().await.branch(entry_id)?;
        Ok(())
    }

    /// Branch to `entry_id`, recording a marker with an optional summary of the
    /// branch being left.
    pub async fn branch_with_summary(
        &self,
        entry_id: &str,
        summary: Option<String>,
    ) -> Result<EntryId> {
        let _state_guard = self.lock_state_for_idle_mutation()?;
        Ok(self
            .session
            .write()
            .await
            .branch_with_summary(entry_id, summary)?)
    }

    /// Attach a label to an entry, or clear it with `None`.
    pub async fn label(&self, entry_id: &str, label: Option<String>) -> Result<EntryId> {
        let _state_guard = self.lock_state_for_idle_mutation()?;
        Ok(self.session.write().await.append_label(entry_id, label)?)
    }

    /// Append host data the core never interprets.
    pub async fn append_custom(
        &self,
        custom_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<EntryId> {
        let _state_guard = self.lock_state_for_idle_mutation()?;
        Ok(self.session.write().await.append(EntryPayload::Custom {
            custom_type: custom_type.into(),
            data,
        })?)
    }

    /// Compact the session now, whatever its size.
    ///
    /// Returns `None` when no part of the history can be discarded. Counts as
    /// a run: [`abort`](Self::abort) cancels it and prompts are rejected meanwhile.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::InvalidState`] if the agent is not idle.
    pub async fn compact(&self) -> Result<Option<CompactionResult>> {
        self.transition_to_running()?;
        let cancel = CancellationToken::new();
        self.register_abort_token(cancel.clone()).await;

        let engine = self.agent_loop.compaction_engine(&self.config.loop_config);
        let result = engine.compact(&self.session, None, &cancel, true).await;

        self.active_abort.lock().await.take();
        self.set_idle().await;
        result
    }

    // -- Internal helpers --

    /// Atomically transition from Idle → Running without holding the lock
    /// across an await point.
    fn transition_to_running(&self) -> Result<()> {
        let mut state = self
            .state
            .try_lock()
            .map_err(|_| StrandError::InvalidState("Agent is busy (state lock contended)".into()))?;
        if *state != AgentState::Idle {
            return Err(StrandError::InvalidState(
                "Agent is not idle; call abort() or wait_for_idle() first".into(),
            ));
        }
        *state = AgentState::Running;
        let _ = self.state_tx.send(AgentState::Running);
        Ok(())
    }

    fn lock_state_for_idle_mutation(&self) -> Result<MutexGuard<'_, AgentState>> {
        let state = self
            .state
            .try_lock()
            .map_err(|_| StrandError::InvalidState("Agent is busy (state lock contended)".into()))?;
        if *state != AgentState::Idle {
            return Err(StrandError::InvalidState(
                "Agent is not idle; session mutation requires idle state".into(),
            ));
        }
        Ok(state)
    }

    async fn set_idle(&self) {
        let mut state = self.state.lock().await;
        *state = AgentState::Idle;
        let _ = self.state_tx.send(AgentState::Idle);
        drop(state);
        self.idle_notify.notify_waiters();
    }

    /// Make `token` the target of [`abort`](Self::abort), cancelling it at once
    /// if an abort landed before it was registered.
    async fn register_abort_token(&self, token: CancellationToken) {
        *self.active_abort.lock().await = Some(token.clone());
        if *self.state.lock().await == AgentState::Aborting {
            token.cancel();
        }
    }

    async fn restore_idle_after_preflight_error(&self) {
        self.set_idle().await;
    }

    /// Build a [`RunRequest`], start the loop, wait for the outcome, then
    /// transition back to Idle.
    async fn run_loop(&self, input: Vec<Message>) -> Result<RunOutcome> {
        let steering_fn: SteeringMessagesFn =
            queue_provider(self.steering_queue.clone(), self.config.steering_mode);
        let follow_up_fn: FollowUpMessagesFn =
            queue_provider(self.follow_up_queue.clone(), self.config.follow_up_mode);

        let mut request = RunRequest::new(self.session.clone(), input)
            .with_tools(self.config.tools.clone())
            .with_config(self.config.loop_config.clone())
            .with_settings(self.config.settings.clone())
            .with_steering_messages(steering_fn)
            .with_follow_up_messages(follow_up_fn);
        if let Some(convert) = &self.config.convert_to_llm {
            request = request.with_convert_to_llm(convert.clone());
        }
        if let Some(sink) = &self.config.event_sink {
            request = request.with_event_sink(sink.clone());
        }

        let handle = match self.agent_loop.start(request) {
            Ok(handle) => handle,
            Err(err) => {
                self.restore_idle_after_preflight_error().await;
                return Err(err);
            }
        };
        self.register_abort_token(handle.abort_token()).await;

        let outcome = handle.wait().await;

        self.active_abort.lock().await.take();
        *self.last_outcome.lock().await = Some(outcome.clone());
        self.set_idle().await;
        Ok(outcome)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_loop", &self.agent_loop)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}
