use tokio_util::sync::CancellationToken;

use super::cut::prepare_compaction;
use super::summarize::Summarizer;
use super::{estimate_session_tokens, estimate_text_tokens, should_compact};
use crate::config::CompactionSettings;
use crate::error::{Result, StrandError};
use crate::session::context::wrap_compaction_summary;
use crate::session::{CompactionRecord, EntryId, EntryPayload, SharedSession};

/// What a compaction appended.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResult {
    pub entry_id: EntryId,
    pub record: CompactionRecord,
    pub split_turn: bool,
    pub summarized_messages: usize,
}

/// Decides when to compact a session and performs the compaction.
#[derive(Debug, Clone)]
pub struct CompactionEngine {
    summarizer: Summarizer,
    settings: CompactionSettings,
    context_window: usize,
}

impl CompactionEngine {
    pub fn new(summarizer: Summarizer, settings: CompactionSettings, context_window: usize) -> Self {
        Self {
            summarizer,
            settings,
            context_window,
        }
    }

    pub fn settings(&self) -> &CompactionSettings {
        &self.settings
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    /// Estimated size of the context materialized at `leaf_id`.
    pub async fn context_tokens(
        &self,
        session: &SharedSession,
        leaf_id: Option<&str>,
    ) -> Result<usize> {
        let tree = session.read().await;
        Ok(estimate_session_tokens(&tree.build_context(leaf_id)?))
    }

    pub async fn needs_compaction(
        &self,
        session: &SharedSession,
        leaf_id: Option<&str>,
    ) -> Result<bool> {
        let tokens = self.context_tokens(session, leaf_id).await?;
        Ok(should_compact(tokens, self.context_window, &self.settings))
    }

    /// Compact the path to `leaf_id` (the current leaf when `None`).
    ///
    /// Without `force`, nothing happens unless the context is over budget.
    /// Returns `None` when nothing was appended: under budget, or no part of
    /// the history can be discarded.
    ///
    /// The session is only read-locked while preparing and write-locked while
    /// appending; the summarization call runs with no lock held.
    pub async fn compact(
        &self,
        session: &SharedSession,
        leaf_id: Option<&str>,
        cancel: &CancellationToken,
        force: bool,
    ) -> Result<Option<CompactionResult>> {
        if cancel.is_cancelled() {
            return Err(StrandError::Aborted);
        }

        let preparation = {
            let tree = session.read().await;
            if !force {
                let tokens = estimate_session_tokens(&tree.build_context(leaf_id)?);
                if !should_compact(tokens, self.context_window, &self.settings) {
                    return Ok(None);
                }
            }
            prepare_compaction(&tree, leaf_id, self.settings.keep_recent_tokens)?
        };
        let Some(preparation) = preparation else {
            tracing::debug!("compaction found no history to discard");
            return Ok(None);
        };

        let summary = self.summarizer.summarize(&preparation, cancel).await?;
        if cancel.is_cancelled() {
            return Err(StrandError::Aborted);
        }

        let details = (!preparation.file_ops.is_empty()).then(|| preparation.file_ops.to_details());
        let summary_tokens = estimate_text_tokens(&wrap_compaction_summary(&summary)) + 4;
        let record = CompactionRecord {
            tokens_after: summary_tokens + preparation.kept_tokens,
            summary,
            first_kept_entry_id: preparation.first_kept_entry_id.clone(),
            tokens_before: preparation.tokens_before,
            details,
        };

        let entry_id = {
            let mut tree = session.write().await;
            tree.append_with_parent(
                EntryPayload::CompactionSummary(record.clone()),
                Some(&preparation.leaf_id),
            )?
        };

        tracing::info!(
            entry_id = %entry_id,
            first_kept_entry_id = %record.first_kept_entry_id,
            tokens_before = record.tokens_before,
            tokens_after = record.tokens_after,
            split_turn = preparation.split_turn,
            "compacted session history"
        );

        Ok(Some(CompactionResult {
            entry_id,
            record,
            split_turn: preparation.split_turn,
            summarized_messages: preparation.messages_to_summarize.len()
                + preparation.turn_prefix_messages.len(),
        }))
    }
}
