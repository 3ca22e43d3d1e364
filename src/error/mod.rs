//! Error types for strand.

pub mod classify;

pub use classify::{classify_error_text, extract_retry_delay_ms, ErrorKind};

use std::path::PathBuf;

use thiserror::Error;

use crate::session::EntryId;

/// Primary error type for all strand operations.
#[derive(Error, Debug)]
pub enum StrandError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider error (status {status:?}): {message}")]
    Provider {
        message: String,
        status: Option<u16>,
        retry_after_ms: Option<u64>,
    },

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Operation aborted")]
    Aborted,

    /// A retryable failure that is no longer retried.
    #[error("{reason}: {source}")]
    RetryAbandoned {
        reason: String,
        #[source]
        source: Box<StrandError>,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl StrandError {
    /// Provider error built from raw message text and an optional HTTP status.
    pub fn provider(message: impl Into<String>, status: Option<u16>) -> Self {
        let message = message.into();
        let retry_after_ms = extract_retry_delay_ms(&message);
        Self::Provider {
            message,
            status,
            retry_after_ms,
        }
    }

    /// Map this error onto the model-turn failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContextOverflow(_) => ErrorKind::ContextOverflow,
            Self::RateLimited { .. } | Self::Timeout(_) => ErrorKind::Retryable,
            Self::Provider {
                message, status, ..
            } => classify_error_text(message, *status),
            Self::Stream(message) => classify_error_text(message, None),
            Self::Io(err) => classify_error_text(&err.to_string(), None),
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Server-supplied retry delay, when the error carries one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => *retry_after_ms,
            Self::Provider { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Errors raised by the session tree and its JSONL log.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path} at line {line}: {source}")]
    JsonLineParse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("session log {path} is empty")]
    MissingHeader { path: PathBuf },

    #[error("session log {path} line {line}: first record must be a session header")]
    InvalidHeader { path: PathBuf, line: usize },

    #[error("session log {path} has unsupported version {found}; newest supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("duplicate entry id {id} in {path} at line {line}")]
    DuplicateEntryId {
        path: PathBuf,
        line: usize,
        id: EntryId,
    },

    #[error("entry {id} in {path} at line {line} references missing parent {parent_id}")]
    DanglingParentId {
        path: PathBuf,
        line: usize,
        id: EntryId,
        parent_id: EntryId,
    },

    #[error("unknown entry id {0}")]
    UnknownEntryId(EntryId),

    #[error("cycle detected while walking ancestors of {0}")]
    Cycle(EntryId),

    #[error("failed to encode entry {id}: {source}")]
    Encode {
        id: EntryId,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, StrandError>;
