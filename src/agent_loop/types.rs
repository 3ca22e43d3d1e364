//! Shared types for agent loop runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::session::EntryId;
use crate::types::Message;

/// Unique identifier for a run.
pub type RunId = Uuid;

/// Observable position of a run in the loop state machine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoopState {
    #[default]
    Idle,
    Streaming,
    ExecutingTools,
    AwaitingSteering,
    Done,
    Aborted,
    Error,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::Error)
    }
}

/// How a run ended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TerminalState {
    Done,
    Aborted,
    Error,
}

impl From<TerminalState> for LoopState {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Done => Self::Done,
            TerminalState::Aborted => Self::Aborted,
            TerminalState::Error => Self::Error,
        }
    }
}

/// Final result of a run.
///
/// `messages` is the context materialized at `leaf_id` when the run ended, so a
/// failed run can be inspected or resumed from the same point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub state: TerminalState,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub leaf_id: Option<EntryId>,
    pub messages: Vec<Message>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        self.state == TerminalState::Done
    }

    /// Outcome for a run whose task went away without reporting.
    pub(crate) fn lost(run_id: RunId) -> Self {
        Self {
            run_id,
            state: TerminalState::Error,
            error: Some("run task ended without a result".to_string()),
            error_kind: Some(ErrorKind::Fatal),
            leaf_id: None,
            messages: Vec::new(),
            finished_at: Utc::now(),
        }
    }
}
