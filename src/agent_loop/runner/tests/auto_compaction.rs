use super::*;
use pretty_assertions::assert_eq;

use crate::config::CompactionSettings;
use crate::error::ErrorKind;
use crate::provider::scripted::ScriptedModel;
use crate::session::context::unwrap_compaction_summary;
use crate::session::{shared, EntryPayload, SessionTree};
use crate::types::AssistantMessage;

use super::super::super::events::CompactionReason;

/// Five alternating 18-token messages.
fn long_session() -> SharedSession {
    let text = "x".repeat(56);
    let mut tree = SessionTree::in_memory();
    for index in 0..5 {
        let message = if index % 2 == 0 {
            Message::user(text.clone())
        } else {
            AssistantMessage::text_only(text.clone()).into()
        };
        tree.append(EntryPayload::message(message)).unwrap();
    }
    shared(tree)
}

fn compaction_config(context_window: usize) -> LoopConfig {
    LoopConfig {
        context_window: Some(context_window),
        compaction: CompactionSettings {
            enabled: true,
            reserve_tokens: 20,
            keep_recent_tokens: 50,
        },
        ..LoopConfig::default()
    }
}

fn overflow_error() -> StrandError {
    StrandError::provider("prompt is too long: 250000 tokens > 200000 maximum", Some(400))
}

fn compaction_reasons(events: &EventLog) -> Vec<(CompactionReason, bool)> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            AgentEvent::CompactionEnd {
                reason, entry_id, ..
            } => Some((*reason, entry_id.is_some())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn over_budget_context_is_compacted_before_the_turn() {
    let model = Arc::new(ScriptedModel::new());
    model.push_text("user asked for x twice").push_text("done");
    let (sink, events) = capture_agent_events();

    let request = RunRequest::new(long_session(), vec![Message::user("keep going")])
        .with_config(compaction_config(100))
        .with_event_sink(sink);
    let outcome = test_loop(&model).start(request).expect("start run").wait().await;

    assert!(outcome.is_done(), "{:?}", outcome.error);
    assert_eq!(
        compaction_reasons(&events),
        vec![(CompactionReason::Threshold, true)]
    );

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    // The first request is the summarization call.
    assert_eq!(requests[0].messages.len(), 1);
    let turn = &requests[1];
    assert_eq!(
        unwrap_compaction_summary(&turn.messages[0].text()),
        Some("user asked for x twice")
    );
    assert_eq!(turn.messages.len(), 5);
    assert_eq!(outcome.messages.len(), 6);
}

#[tokio::test]
async fn context_overflow_compacts_and_reissues_the_turn() {
    let model = Arc::new(ScriptedModel::new());
    model
        .push_error(overflow_error())
        .push_text("summary of the early exchange")
        .push_text("fits now");
    let (sink, events) = capture_agent_events();

    // A large window keeps the threshold check quiet; only the model's rejection triggers compaction.
    let request = RunRequest::new(long_session(), vec![Message::user("keep going")])
        .with_config(compaction_config(100_000))
        .with_event_sink(sink);
    let outcome = test_loop(&model).start(request).expect("start run").wait().await;

    assert!(outcome.is_done(), "{:?}", outcome.error);
    assert_eq!(
        compaction_reasons(&events),
        vec![(CompactionReason::Overflow, true)]
    );
    assert_eq!(
        count_events(&events, |event| matches!(event, AgentEvent::RetryScheduled { .. })),
        0
    );

    let requests = model.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].messages.len(), 6);
    assert_eq!(requests[2].messages.len(), 5);
    assert_eq!(
        outcome.messages.last().map(Message::text).as_deref(),
        Some("fits now")
    );
}

#[tokio::test]
async fn overflow_with_nothing_to_compact_fails() {
    let model = Arc::new(ScriptedModel::new());
    model.push_error(overflow_error());

    let request = RunRequest::new(empty_session(), vec![Message::user("huge prompt")])
        .with_config(compaction_config(100_000));
    let outcome = test_loop(&model).start(request).expect("start run").wait().await;

    assert_eq!(outcome.state, TerminalState::Error);
    assert_eq!(outcome.error_kind, Some(ErrorKind::ContextOverflow));
    assert!(outcome
        .error
        .as_deref()
        .is_some_and(|error| error.contains("no history left to compact")));
}

#[tokio::test]
async fn overflow_with_compaction_disabled_fails_immediately() {
    let model = Arc::new(ScriptedModel::new());
    model.push_error(overflow_error());
    let mut config = compaction_config(100_000);
    config.compaction.enabled = false;

    let request = RunRequest::new(long_session(), vec![Message::user("keep going")])
        .with_config(config);
    let outcome = test_loop(&model).start(request).expect("start run").wait().await;

    assert_eq!(outcome.state, TerminalState::Error);
    assert_eq!(outcome.error_kind, Some(ErrorKind::ContextOverflow));
    assert_eq!(model.requests().len(), 1);
    // History is preserved: five seeded entries, the prompt and the failed turn.
    assert_eq!(outcome.messages.len(), 7);
}
