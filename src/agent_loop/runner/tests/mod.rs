use super::*;
use pretty_assertions::assert_eq;

mod auto_compaction;
mod support;

use super::super::types::TerminalState;
use support::*;

#[test]
fn default_convert_drops_custom_and_empty_failed_turns() {
    let mut failed = crate::types::AssistantMessage::new(Vec::new(), StopReason::Error);
    failed.error_message = Some("boom".into());
    let messages = vec![
        Message::user("hi"),
        Message::custom("ui_note", serde_json::json!({ "pinned": true })),
        failed.into(),
        crate::types::AssistantMessage::text_only("hello").into(),
    ];

    let converted = default_convert_to_llm(messages);
    assert_eq!(converted.len(), 2);
    assert_eq!(converted[0].text(), "hi");
    assert_eq!(converted[1].text(), "hello");
}
