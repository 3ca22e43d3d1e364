//! Turning a root-to-leaf path into the message sequence sent to the model.

use super::entry::{CompactionRecord, EntryId, EntryPayload, SessionEntry};
use crate::types::Message;

pub const COMPACTION_SUMMARY_PREFIX: &str = "<compaction_summary>";
pub const COMPACTION_SUMMARY_SUFFIX: &str = "</compaction_summary>";
pub const BRANCH_SUMMARY_PREFIX: &str = "<branch_summary>";
pub const BRANCH_SUMMARY_SUFFIX: &str = "</branch_summary>";

const COMPACTION_SUMMARY_PREAMBLE: &str =
    "Earlier conversation history was compacted. Summary of what happened so far:";
const BRANCH_SUMMARY_PREAMBLE: &str =
    "The conversation returned here from another branch. Summary of that branch:";

/// Materialized view of one path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    pub messages: Vec<Message>,
    /// Source entry of each message, index-aligned with `messages`.
    pub entry_ids: Vec<EntryId>,
    /// The compaction that shaped this context, if any.
    pub latest_compaction: Option<(EntryId, CompactionRecord)>,
}

pub fn wrap_compaction_summary(summary: &str) -> String {
    format!(
        "{COMPACTION_SUMMARY_PREAMBLE}\n\n{COMPACTION_SUMMARY_PREFIX}\n{summary}\n{COMPACTION_SUMMARY_SUFFIX}"
    )
}

pub fn wrap_branch_summary(summary: &str) -> String {
    format!("{BRANCH_SUMMARY_PREAMBLE}\n\n{BRANCH_SUMMARY_PREFIX}\n{summary}\n{BRANCH_SUMMARY_SUFFIX}")
}

/// Inner text of a wrapped compaction summary message.
pub fn unwrap_compaction_summary(text: &str) -> Option<&str> {
    let start = text.find(COMPACTION_SUMMARY_PREFIX)? + COMPACTION_SUMMARY_PREFIX.len();
    let end = text.rfind(COMPACTION_SUMMARY_SUFFIX)?;
    (start <= end).then(|| text[start..end].trim())
}

/// Entries of `path` that remain verbatim after the latest compaction,
/// excluding compaction entries themselves.
///
/// Returns the index of the latest compaction entry (if any) and the indices
/// of kept entries.
pub(crate) fn kept_indices(path: &[&SessionEntry]) -> (Option<usize>, Vec<usize>) {
    let Some(compaction_index) = path.iter().rposition(|e| e.compaction().is_some()) else {
        return (
            None,
            (0..path.len())
                .filter(|&i| path[i].compaction().is_none())
                .collect(),
        );
    };
    let first_kept_id = path[compaction_index]
        .compaction()
        .map(|record| record.first_kept_entry_id.as_str());
    let start = path[..compaction_index]
        .iter()
        .position(|e| Some(e.id.as_str()) == first_kept_id)
        .unwrap_or(compaction_index + 1);
    let kept = (start..path.len())
        .filter(|&i| i != compaction_index && path[i].compaction().is_none())
        .collect();
    (Some(compaction_index), kept)
}

pub(crate) fn materialize(path: &[&SessionEntry]) -> SessionContext {
    let mut context = SessionContext::default();
    let (compaction_index, kept) = kept_indices(path);

    if let Some(index) = compaction_index {
        let entry = path[index];
        if let Some(record) = entry.compaction() {
            context.messages.push(Message::User {
                content: wrap_compaction_summary(&record.summary),
                timestamp: entry.timestamp,
            });
            context.entry_ids.push(entry.id.clone());
            context.latest_compaction = Some((entry.id.clone(), record.clone()));
        }
    }

    for index in kept {
        let entry = path[index];
        if let Some(message) = entry_message(entry) {
            context.messages.push(message);
            context.entry_ids.push(entry.id.clone());
        }
    }
    context
}

/// The message an entry contributes to a materialized context, if any.
pub(crate) fn entry_message(entry: &SessionEntry) -> Option<Message> {
    match &entry.payload {
        EntryPayload::Message { message } => Some(message.clone()),
        EntryPayload::BranchMarker {
            summary: Some(summary),
            ..
        } => Some(Message::User {
            content: wrap_branch_summary(summary),
            timestamp: entry.timestamp,
        }),
        _ => None,
    }
}
