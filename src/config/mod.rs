//! Loop configuration.
//!
//! Configuration is always an explicit value handed to [`AgentLoop`](crate::agent_loop::AgentLoop)
//! or [`Agent`](crate::agent::Agent). Nothing here reads process environment.
//! Hosts that keep settings on disk can use [`LoopConfig::from_toml_file`].

use std::path::Path;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Result, StrandError};
use crate::util::retry::RetryPolicy;

/// Default stream idle timeout for a model turn.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 120_000;

/// How tool calls within one assistant message are executed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolExecutionMode {
    /// One call at a time, consulting steering after each call.
    #[default]
    Sequential,
    /// All calls of a batch concurrently; steering is consulted once after the batch.
    Parallel,
}

/// History compaction thresholds, in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub enabled: bool,
    /// Headroom kept free below the context window.
    pub reserve_tokens: usize,
    /// Minimum recent history kept verbatim after a cut.
    pub keep_recent_tokens: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reserve_tokens: 16_384,
            keep_recent_tokens: 20_000,
        }
    }
}

/// Settings for one agent loop run.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// System prompt sent with every model turn.
    pub system_prompt: Option<String>,
    /// Overrides the model's advertised context window.
    pub context_window: Option<usize>,
    #[builder(default)]
    pub compaction: CompactionSettings,
    #[builder(default)]
    pub retry: RetryPolicy,
    /// Server retry hints above this are treated as fatal.
    pub max_retry_delay_ms: Option<u64>,
    #[builder(default)]
    pub tool_execution: ToolExecutionMode,
    /// `Some(0)` disables the idle timeout.
    pub stream_idle_timeout_ms: Option<u64>,
    /// Time allowed for in-flight work to settle after an abort.
    #[builder(default = 5_000)]
    pub abort_grace_ms: u64,
    /// Model turns allowed in one run.
    pub max_turns: Option<usize>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LoopConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compaction.enabled && self.compaction.keep_recent_tokens == 0 {
            return Err(StrandError::Configuration(
                "compaction.keep_recent_tokens must be greater than zero".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(StrandError::Configuration(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.max_turns == Some(0) {
            return Err(StrandError::Configuration(
                "max_turns must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }

    pub fn stream_idle_timeout_ms(&self) -> u64 {
        self.stream_idle_timeout_ms
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_MS)
    }
}
