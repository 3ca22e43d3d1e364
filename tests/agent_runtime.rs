use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use strand::agent::{Agent, AgentConfig, AgentState, QueueMode};
use strand::agent_loop::{AgentEvent, AgentEventSink, TerminalState, SKIPPED_DUE_TO_STEERING};
use strand::provider::scripted::ScriptedModel;
use strand::session::{shared, SessionTree};
use strand::tools::{FnTool, Tool, ToolOutput, ToolParameters};
use strand::types::{Message, ToolCall};
use tempfile::TempDir;
use tokio::sync::Notify;

fn slow_tool(name: &'static str, runs: Arc<Mutex<Vec<String>>>) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        "sleeps briefly",
        ToolParameters::empty(),
        move |invocation| {
            let runs = runs.clone();
            async move {
                runs.lock().unwrap().push(invocation.call_id.clone());
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(ToolOutput::text(format!("{name} finished")))
            }
        },
    ))
}

#[tokio::test]
async fn steering_while_a_tool_runs_skips_the_rest_of_the_batch() {
    let model = Arc::new(ScriptedModel::new());
    model
        .push_tool_calls(vec![
            ToolCall::new("call-search", "search", serde_json::json!({})),
            ToolCall::new("call-write", "write", serde_json::json!({})),
        ])
        .push_text("switching to file B");
    let runs = Arc::new(Mutex::new(Vec::new()));
    let tool_started = Arc::new(Notify::new());
    let notify = tool_started.clone();
    let sink: AgentEventSink = Arc::new(move |event| {
        if matches!(event, AgentEvent::ToolExecutionStart { .. }) {
            notify.notify_one();
        }
    });

    let config = AgentConfig {
        tools: vec![slow_tool("search", runs.clone()), slow_tool("write", runs.clone())],
        event_sink: Some(sink),
        ..AgentConfig::default()
    };
    let agent = Arc::new(Agent::new(
        model.clone(),
        shared(SessionTree::in_memory()),
        config,
    ));

    let run = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.prompt("edit file A").await })
    };
    tool_started.notified().await;
    agent.steer("use file B instead").await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run timeout")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, TerminalState::Done);
    assert_eq!(*runs.lock().unwrap(), vec!["call-search".to_string()]);

    let skipped = outcome
        .messages
        .iter()
        .filter_map(Message::as_tool_result)
        .find(|result| result.tool_call_id == "call-write")
        .unwrap();
    assert!(skipped.is_error);
    assert_eq!(skipped.text(), SKIPPED_DUE_TO_STEERING);
    assert_eq!(
        outcome.messages.last().map(Message::text).as_deref(),
        Some("switching to file B")
    );
    assert_eq!(agent.state().await, AgentState::Idle);
}

#[tokio::test]
async fn queue_mode_all_delivers_every_follow_up_at_once() {
    let model = Arc::new(ScriptedModel::new());
    model.push_text("first").push_text("both handled");
    let config = AgentConfig {
        follow_up_mode: QueueMode::All,
        ..AgentConfig::default()
    };
    let agent = Agent::new(model.clone(), shared(SessionTree::in_memory()), config);
    agent.follow_up("also this").await;
    agent.follow_up("and that").await;

    let outcome = agent.prompt("start").await.unwrap();
    assert!(outcome.is_done());
    assert_eq!(model.requests().len(), 2);
    let second: Vec<String> = model.requests()[1]
        .messages
        .iter()
        .map(Message::text)
        .collect();
    assert_eq!(second, vec!["start", "first", "also this", "and that"]);
}

#[tokio::test]
async fn persisted_session_resumes_in_a_new_agent() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    model.push_text("noted").push_text("you said 42");

    let tree = SessionTree::create(dir.path(), None).unwrap();
    let path = tree.path().unwrap().to_path_buf();
    let agent = Agent::new(model.clone(), shared(tree), AgentConfig::default());
    agent.prompt("remember 42").await.unwrap();
    drop(agent);

    let reopened = SessionTree::open(&path).unwrap();
    let agent = Agent::new(model.clone(), shared(reopened), AgentConfig::default());
    let outcome = agent.prompt("what did I say?").await.unwrap();

    let texts: Vec<String> = outcome.messages.iter().map(Message::text).collect();
    assert_eq!(
        texts,
        vec!["remember 42", "noted", "what did I say?", "you said 42"]
    );
}

#[tokio::test]
async fn manual_compaction_summarizes_older_history() {
    let model = Arc::new(ScriptedModel::new());
    let config = AgentConfig {
        loop_config: strand::config::LoopConfig {
            compaction: strand::config::CompactionSettings {
                enabled: true,
                reserve_tokens: 1_000,
                keep_recent_tokens: 105,
            },
            ..Default::default()
        },
        ..AgentConfig::default()
    };
    let agent = Agent::new(model.clone(), shared(SessionTree::in_memory()), config);
    model.push_text(&"a".repeat(400));
    agent.prompt("first question").await.unwrap();
    model.push_text(&"b".repeat(400));
    agent.prompt("second question").await.unwrap();

    model.push_text("two questions were asked");
    let result = agent.compact().await.unwrap().expect("history to compact");
    assert!(result.record.tokens_after < result.record.tokens_before);
    assert_eq!(agent.state().await, AgentState::Idle);

    let session = agent.session();
    let tree = session.read().await;
    assert_eq!(tree.leaf_id(), Some(result.entry_id.as_str()));
    let context = tree.build_context(None).unwrap();
    assert!(context.messages[0].text().contains("two questions were asked"));
}
