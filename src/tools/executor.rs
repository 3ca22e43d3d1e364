//! Runs single tool calls under validation and cancellation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::tool::{Tool, ToolDefinition, ToolOutput, ToolUpdateCallback};
use super::validation::validate_arguments;
use crate::types::{ToolCall, ToolContent};

/// Default time an aborted tool gets to settle before it is abandoned.
pub const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(5);

/// Registered tools plus the rules for running them.
#[derive(Clone)]
pub struct ToolExecutor {
    tools: Vec<Arc<dyn Tool>>,
    abort_grace: Duration,
}

impl ToolExecutor {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            tools,
            abort_grace: DEFAULT_ABORT_GRACE,
        }
    }

    pub fn with_abort_grace(mut self, abort_grace: Duration) -> Self {
        self.abort_grace = abort_grace;
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute one call. Never fails: every problem becomes an `is_error` output.
    ///
    /// When `cancel` fires mid-call, the tool's future keeps being polled for up
    /// to the abort grace period so in-flight work can settle; the result is then
    /// flagged as an aborted error either way.
    pub async fn execute(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
        on_update: Option<ToolUpdateCallback>,
    ) -> ToolOutput {
        let Some(tool) = self.get(&call.name) else {
            return ToolOutput::error(format!("Tool '{}' not found", call.name))
                .with_details(json!({ "reason": "unknown_tool" }));
        };

        if let Err(err) = validate_arguments(&call.arguments, &tool.parameters().schema) {
            return ToolOutput::error(format!("Argument validation failed: {err}")).with_details(
                json!({
                    "reason": "validation",
                    "path": err.path,
                    "message": err.message,
                }),
            );
        }

        if cancel.is_cancelled() {
            return aborted_output(None);
        }

        let future = tool.execute(&call.id, call.arguments.clone(), cancel.child_token(), on_update);
        tokio::pin!(future);

        tokio::select! {
            biased;
            result = &mut future => {
                let output = into_output(&call.name, result);
                if cancel.is_cancelled() {
                    return aborted_output(Some(output));
                }
                return output;
            }
            _ = cancel.cancelled() => {}
        }

        tracing::debug!(
            tool_call_id = %call.id,
            tool_name = %call.name,
            grace_ms = self.abort_grace.as_millis() as u64,
            "tool call aborted; awaiting in-flight work"
        );
        match tokio::time::timeout(self.abort_grace, &mut future).await {
            Ok(result) => aborted_output(Some(into_output(&call.name, result))),
            Err(_) => {
                tracing::warn!(
                    tool_call_id = %call.id,
                    tool_name = %call.name,
                    "tool did not settle within abort grace period"
                );
                aborted_output(None)
            }
        }
    }
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field(
                "tools",
                &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("abort_grace", &self.abort_grace)
            .finish()
    }
}

fn into_output(tool_name: &str, result: crate::error::Result<ToolOutput>) -> ToolOutput {
    match result {
        Ok(output) => output,
        Err(err) => {
            tracing::debug!(tool_name, error = %err, "tool returned an error");
            ToolOutput::error(err.to_string())
        }
    }
}

/// Result for a call cut short by an abort. Keeps any partial content the tool produced.
pub fn aborted_output(partial: Option<ToolOutput>) -> ToolOutput {
    let mut content = vec![ToolContent::text("Tool execution aborted")];
    let mut details = json!({ "reason": "aborted" });
    if let Some(partial) = partial {
        content.extend(partial.content);
        details["partial"] = partial.details;
    }
    ToolOutput {
        content,
        details,
        is_error: true,
    }
}
