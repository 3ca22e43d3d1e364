use std::collections::HashMap;

use super::file_ops::{extract_file_operations, FileOperationSet};
use super::{estimate_entry_tokens, estimate_session_tokens};
use crate::error::SessionError;
use crate::session::context::{entry_message, kept_indices};
use crate::session::{EntryId, EntryPayload, SessionEntry, SessionTree};
use crate::types::Message;

/// Where a compaction splits history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutPoint {
    /// Index of the first entry kept verbatim.
    pub first_kept_index: usize,
    /// Set when the cut falls inside a turn.
    pub split_turn: bool,
    /// Index of the entry that opened the split turn.
    pub turn_start_index: Option<usize>,
}

/// Choose the cut for `entries`, oldest first.
///
/// Walks back from the newest entry until at least `keep_recent_tokens` are
/// kept, then moves left to the nearest entry that can open the kept suffix
/// without separating a tool call from its result. Returns `None` when the
/// whole slice fits or no valid cut discards anything.
pub fn find_cut_point(entries: &[&SessionEntry], keep_recent_tokens: usize) -> Option<CutPoint> {
    let mut kept_tokens = 0usize;
    let mut candidate = None;
    for (index, entry) in entries.iter().enumerate().rev() {
        kept_tokens += estimate_entry_tokens(entry);
        if kept_tokens >= keep_recent_tokens {
            candidate = Some(index);
            break;
        }
    }
    let candidate = candidate?;

    let inside_call = open_call_spans(entries);
    let first_kept_index = (1..=candidate)
        .rev()
        .find(|&index| is_cut_boundary(entries[index]) && !inside_call[index])?;

    let turn_start_index = if opens_turn(entries[first_kept_index]) {
        None
    } else {
        entries[..first_kept_index]
            .iter()
            .rposition(|entry| opens_turn(entry))
    };

    Some(CutPoint {
        first_kept_index,
        split_turn: turn_start_index.is_some(),
        turn_start_index,
    })
}

/// `true` at every index that lies after a tool call and at or before its result.
fn open_call_spans(entries: &[&SessionEntry]) -> Vec<bool> {
    let result_index: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let result = entry.message()?.as_tool_result()?;
            Some((result.tool_call_id.as_str(), index))
        })
        .collect();

    let mut inside = vec![false; entries.len()];
    for (index, entry) in entries.iter().enumerate() {
        let Some(assistant) = entry.message().and_then(Message::as_assistant) else {
            continue;
        };
        for call in assistant.tool_calls() {
            if let Some(&result) = result_index.get(call.id.as_str()) {
                for slot in inside.iter_mut().take(result + 1).skip(index + 1) {
                    *slot = true;
                }
            }
        }
    }
    inside
}

fn is_cut_boundary(entry: &SessionEntry) -> bool {
    match &entry.payload {
        EntryPayload::Message { message } => !matches!(message, Message::ToolResult(_)),
        EntryPayload::BranchMarker { .. } => true,
        _ => false,
    }
}

fn opens_turn(entry: &SessionEntry) -> bool {
    matches!(
        &entry.payload,
        EntryPayload::Message {
            message: Message::User { .. }
        } | EntryPayload::BranchMarker { .. }
    )
}

/// Everything the summarizer needs for one compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPreparation {
    /// Leaf the compaction entry will be appended under.
    pub leaf_id: EntryId,
    pub first_kept_entry_id: EntryId,
    /// History before the cut, excluding the opening of a split turn.
    pub messages_to_summarize: Vec<Message>,
    /// Opening of a split turn, summarized separately.
    pub turn_prefix_messages: Vec<Message>,
    pub split_turn: bool,
    pub previous_summary: Option<String>,
    /// Cumulative across compactions.
    pub file_ops: FileOperationSet,
    pub tokens_before: usize,
    pub kept_tokens: usize,
}

/// Work out what a compaction of the path to `leaf_id` (the current leaf when
/// `None`) would discard and keep.
///
/// Only entries after the previous compaction's kept boundary are candidates,
/// so an already-compacted tail with no new entries yields `None`.
pub fn prepare_compaction(
    tree: &SessionTree,
    leaf_id: Option<&str>,
    keep_recent_tokens: usize,
) -> Result<Option<CompactionPreparation>, SessionError> {
    let Some(leaf_id) = leaf_id.or(tree.leaf_id()) else {
        return Ok(None);
    };
    let path = tree.path_to_leaf(leaf_id)?;
    let (compaction_index, kept) = kept_indices(&path);
    let window: Vec<&SessionEntry> = kept.iter().map(|&index| path[index]).collect();

    let Some(cut) = find_cut_point(&window, keep_recent_tokens) else {
        return Ok(None);
    };

    let previous = compaction_index.and_then(|index| path[index].compaction());
    let history_end = cut.turn_start_index.unwrap_or(cut.first_kept_index);
    let messages_to_summarize: Vec<Message> = window[..history_end]
        .iter()
        .filter_map(|entry| entry_message(entry))
        .collect();
    let turn_prefix_messages: Vec<Message> = window[history_end..cut.first_kept_index]
        .iter()
        .filter_map(|entry| entry_message(entry))
        .collect();

    let mut file_ops = previous
        .and_then(|record| record.details.as_ref())
        .map(FileOperationSet::from_details)
        .unwrap_or_default();
    file_ops.extend(extract_file_operations(&messages_to_summarize));
    file_ops.extend(extract_file_operations(&turn_prefix_messages));

    let tokens_before = estimate_session_tokens(&tree.build_context(Some(leaf_id))?);
    let kept_tokens = window[cut.first_kept_index..]
        .iter()
        .map(|entry| estimate_entry_tokens(entry))
        .sum();

    Ok(Some(CompactionPreparation {
        leaf_id: leaf_id.to_string(),
        first_kept_entry_id: window[cut.first_kept_index].id.clone(),
        messages_to_summarize,
        turn_prefix_messages,
        split_turn: cut.split_turn,
        previous_summary: previous.map(|record| record.summary.clone()),
        file_ops,
        tokens_before,
        kept_tokens,
    }))
}
