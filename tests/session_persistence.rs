use std::fs;
use std::io::Write;

use pretty_assertions::assert_eq;
use strand::error::SessionError;
use strand::session::{EntryPayload, SessionLog, SessionTree, CURRENT_SESSION_VERSION};
use strand::types::{AssistantMessage, Message};
use tempfile::TempDir;

fn log_lines(tree: &SessionTree) -> Vec<serde_json::Value> {
    let raw = fs::read_to_string(tree.path().expect("persisted session")).unwrap();
    raw.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn persisted_tree_reopens_with_branches_and_leaf() {
    let dir = TempDir::new().unwrap();
    let mut tree = SessionTree::create(dir.path(), Some(dir.path())).unwrap();
    let root = tree.append(EntryPayload::message(Message::user("hi"))).unwrap();
    let first = tree
        .append(EntryPayload::message(AssistantMessage::text_only("first try")))
        .unwrap();
    tree.branch(&root).unwrap();
    let second = tree
        .append(EntryPayload::message(AssistantMessage::text_only("second try")))
        .unwrap();
    tree.append_label(&first, Some("abandoned".into())).unwrap();
    let path = tree.path().unwrap().to_path_buf();

    let header = &log_lines(&tree)[0];
    assert_eq!(header["type"], "session");
    assert_eq!(header["version"], CURRENT_SESSION_VERSION);
    drop(tree);

    let reopened = SessionTree::open(&path).unwrap();
    assert_eq!(reopened.len(), 4);
    assert_eq!(reopened.children(&root).len(), 2);
    assert_eq!(reopened.label_for(&first), Some("abandoned"));

    // The label entry was appended last, under the second branch.
    let context = reopened.build_context(None).unwrap();
    let texts: Vec<String> = context.messages.iter().map(Message::text).collect();
    assert_eq!(texts, vec!["hi", "second try"]);
    assert_eq!(context.entry_ids[1], second);
}

#[test]
fn version_one_log_is_chained_and_rewritten() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.jsonl");
    let ts = "2025-01-01T00:00:00Z";
    let lines = [
        format!(r#"{{"type":"session","version":1,"id":"legacy","timestamp":"{ts}"}}"#),
        format!(
            r#"{{"type":"message","timestamp":"{ts}","message":{{"role":"user","content":"one","timestamp":"{ts}"}}}}"#
        ),
        format!(
            r#"{{"type":"message","timestamp":"{ts}","message":{{"role":"user","content":"two","timestamp":"{ts}"}}}}"#
        ),
        format!(
            r#"{{"type":"message","timestamp":"{ts}","message":{{"role":"user","content":"three","timestamp":"{ts}"}}}}"#
        ),
        format!(
            r#"{{"type":"compaction_summary","timestamp":"{ts}","summary":"one happened","first_kept_index":1,"tokens_before":30}}"#
        ),
    ];
    fs::write(&path, lines.join("\n") + "\n").unwrap();

    let loaded = SessionLog::load(&path).unwrap();
    assert_eq!(loaded.migrated_from, Some(1));
    assert_eq!(loaded.log.header().version, CURRENT_SESSION_VERSION);
    let entries = &loaded.entries;
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].parent_id, None);
    assert_eq!(entries[2].parent_id.as_deref(), Some(entries[1].id.as_str()));
    let record = entries[3].compaction().unwrap();
    assert_eq!(record.first_kept_entry_id, entries[1].id);
    drop(loaded);

    let rewritten = fs::read_to_string(&path).unwrap();
    assert!(rewritten.contains(&format!("\"version\":{CURRENT_SESSION_VERSION}")));
    assert!(!rewritten.contains("first_kept_index"));

    let tree = SessionTree::open(&path).unwrap();
    let texts: Vec<String> = tree
        .build_context(None)
        .unwrap()
        .messages
        .iter()
        .map(Message::text)
        .collect();
    assert_eq!(texts.len(), 3);
    assert!(texts[0].contains("one happened"));
    assert_eq!(&texts[1..], &["two".to_string(), "three".to_string()]);
}

#[test]
fn unknown_records_survive_a_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut tree = SessionTree::create(dir.path(), None).unwrap();
    let root = tree.append(EntryPayload::message(Message::user("hi"))).unwrap();
    let path = tree.path().unwrap().to_path_buf();
    drop(tree);

    let future_record = format!(
        r#"{{"type":"bookmark_v9","id":"feedbeef","parentId":"{root}","timestamp":"2025-01-01T00:00:00Z","color":"red"}}"#
    );
    fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{future_record}"))
        .unwrap();

    let mut tree = SessionTree::open(&path).unwrap();
    let unknown = tree.get("feedbeef").unwrap();
    assert_eq!(unknown.payload.record_type(), "bookmark_v9");
    // Unknown entries never reach the model.
    assert_eq!(tree.build_context(None).unwrap().messages.len(), 1);

    tree.append(EntryPayload::message(AssistantMessage::text_only("after")))
        .unwrap();
    let lines = log_lines(&tree);
    assert_eq!(lines[2]["color"], "red");
    assert_eq!(lines[3]["parentId"], "feedbeef");
}

#[test]
fn torn_final_line_is_dropped_and_truncated() {
    let dir = TempDir::new().unwrap();
    let mut tree = SessionTree::create(dir.path(), None).unwrap();
    tree.append(EntryPayload::message(Message::user("kept"))).unwrap();
    let path = tree.path().unwrap().to_path_buf();
    drop(tree);

    fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .and_then(|mut file| write!(file, r#"{{"type":"message","id":"abc"#))
        .unwrap();

    let mut tree = SessionTree::open(&path).unwrap();
    assert_eq!(tree.len(), 1);
    tree.append(EntryPayload::message(AssistantMessage::text_only("next")))
        .unwrap();
    assert_eq!(log_lines(&tree).len(), 3);
}

#[test]
fn unterminated_final_record_is_kept_and_next_append_starts_a_new_line() {
    let dir = TempDir::new().unwrap();
    let mut tree = SessionTree::create(dir.path(), None).unwrap();
    let first = tree.append(EntryPayload::message(Message::user("one"))).unwrap();
    let path = tree.path().unwrap().to_path_buf();
    drop(tree);

    let raw = fs::read_to_string(&path).unwrap();
    fs::write(&path, raw.trim_end_matches('\n')).unwrap();

    let mut tree = SessionTree::open(&path).unwrap();
    assert_eq!(tree.len(), 1);
    tree.append(EntryPayload::message(AssistantMessage::text_only("two")))
        .unwrap();
    drop(tree);

    let reopened = SessionTree::open(&path).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(log_lines(&reopened).len(), 3);
    let texts: Vec<String> = reopened
        .build_context(None)
        .unwrap()
        .messages
        .iter()
        .map(Message::text)
        .collect();
    assert_eq!(texts, vec!["one", "two"]);
    assert!(reopened.get(&first).is_some());
}

#[test]
fn corrupt_middle_line_is_reported_with_its_line_number() {
    let dir = TempDir::new().unwrap();
    let mut tree = SessionTree::create(dir.path(), None).unwrap();
    tree.append(EntryPayload::message(Message::user("one"))).unwrap();
    let path = tree.path().unwrap().to_path_buf();
    drop(tree);

    let raw = fs::read_to_string(&path).unwrap();
    fs::write(&path, format!("{raw}not json\n")).unwrap();

    match SessionTree::open(&path) {
        Err(SessionError::JsonLineParse { line, .. }) => assert_eq!(line, 3),
        other => panic!("expected a parse error, got {other:?}"),
    }
}

#[test]
fn newer_log_versions_are_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("future.jsonl");
    fs::write(
        &path,
        r#"{"type":"session","version":99,"id":"x","timestamp":"2025-01-01T00:00:00Z"}
"#,
    )
    .unwrap();

    assert!(matches!(
        SessionLog::load(&path),
        Err(SessionError::UnsupportedVersion { found: 99, .. })
    ));
}
