//! Convenience re-exports for common use.

pub use crate::agent::{Agent, AgentConfig, AgentState, QueueMode};
pub use crate::agent_loop::{AgentEvent, AgentLoop, RunHandle, RunOutcome, RunRequest, TerminalState};
pub use crate::config::{CompactionSettings, LoopConfig, ToolExecutionMode};
pub use crate::error::{ErrorKind, Result, StrandError};
pub use crate::provider::{GenerationSettings, ModelClient, ModelRequest, ModelStream};
pub use crate::session::{EntryPayload, SessionTree, SharedSession};
pub use crate::tools::{FnTool, Tool, ToolOutput, ToolParameters};
pub use crate::types::{AssistantMessage, ContentBlock, Message, StopReason, ToolCall, ToolResultMessage};
