//! Session entries: the records that make up a session tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Message;

/// Identifier of a session entry (8 hex characters for freshly generated ids).
pub type EntryId = String;

/// One immutable node of the session tree.
///
/// Serialized as a flat JSON record: `{"type", "id", "parentId", "timestamp", ...payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEntry {
    pub id: EntryId,
    #[serde(rename = "parentId")]
    pub parent_id: Option<EntryId>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EntryPayload,
}

impl SessionEntry {
    pub fn message(&self) -> Option<&Message> {
        match &self.payload {
            EntryPayload::Message { message } => Some(message),
            _ => None,
        }
    }

    pub fn compaction(&self) -> Option<&CompactionRecord> {
        match &self.payload {
            EntryPayload::CompactionSummary(record) => Some(record),
            _ => None,
        }
    }
}

/// Type-specific entry payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    Message {
        message: Message,
    },
    CompactionSummary(CompactionRecord),
    /// Marks a jump in the tree. `from_id` is the leaf that was left behind.
    BranchMarker {
        from_id: EntryId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Label {
        target_id: EntryId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// Host data the core never interprets.
    Custom {
        custom_type: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// A record type this version does not know. `data` is the raw record,
    /// written back verbatim.
    #[serde(skip)]
    Unknown {
        record_type: String,
        data: serde_json::Value,
    },
}

impl EntryPayload {
    pub fn message(message: impl Into<Message>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// Record type tag as written to the log.
    pub fn record_type(&self) -> &str {
        match self {
            Self::Message { .. } => "message",
            Self::CompactionSummary(_) => "compaction_summary",
            Self::BranchMarker { .. } => "branch_marker",
            Self::Label { .. } => "label",
            Self::Custom { .. } => "custom",
            Self::Unknown { record_type, .. } => record_type,
        }
    }
}

/// Record types this version can decode.
pub(crate) const KNOWN_RECORD_TYPES: &[&str] = &[
    "message",
    "compaction_summary",
    "branch_marker",
    "label",
    "custom",
];

/// A compaction: everything on the path before `first_kept_entry_id` is
/// represented by `summary` when the path is materialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompactionRecord {
    pub summary: String,
    pub first_kept_entry_id: EntryId,
    pub tokens_before: usize,
    pub tokens_after: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<CompactionDetails>,
}

/// Files touched by the summarized history, carried forward across compactions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompactionDetails {
    pub read_files: Vec<String>,
    pub modified_files: Vec<String>,
}

/// Generate a fresh 8-hex entry id for which `is_taken` returns false.
pub(crate) fn generate_entry_id(is_taken: impl Fn(&str) -> bool) -> EntryId {
    for _ in 0..100 {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        if !is_taken(&id) {
            return id;
        }
    }
    uuid::Uuid::new_v4().simple().to_string()
}
