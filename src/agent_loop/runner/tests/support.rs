use super::*;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::provider::scripted::ScriptedModel;
use crate::session::{shared, SessionTree};
use crate::tools::{FnTool, ToolOutput, ToolParameters};
use crate::types::ToolCall;

pub(super) use tokio::time::timeout;

pub(super) type EventLog = Arc<Mutex<Vec<AgentEvent>>>;

pub(super) fn test_loop(model: &Arc<ScriptedModel>) -> AgentLoop {
    AgentLoop::new(model.clone())
}

pub(super) fn empty_session() -> SharedSession {
    shared(SessionTree::in_memory())
}

pub(super) fn capture_agent_events() -> (AgentEventSink, EventLog) {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: AgentEventSink = Arc::new(move |event| {
        sink_events.lock().expect("event lock").push(event);
    });
    (sink, events)
}

/// Provider that hands out one scripted batch per call, then empty batches.
pub(super) fn batches(batches: Vec<Vec<Message>>) -> (MessageBatchFn, Arc<AtomicUsize>) {
    let queue = Arc::new(Mutex::new(VecDeque::from(batches)));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let provider: MessageBatchFn = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let next = queue.lock().expect("batch lock").pop_front();
        Box::pin(async move { next.unwrap_or_default() })
    });
    (provider, calls)
}

/// Tool that records its name when it runs and answers after `delay`.
pub(super) fn recording_tool(
    name: &'static str,
    delay: Duration,
    log: Arc<Mutex<Vec<String>>>,
) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        format!("{name} test tool"),
        ToolParameters::empty(),
        move |_invocation| {
            let log = log.clone();
            async move {
                log.lock().expect("tool log lock").push(name.to_string());
                tokio::time::sleep(delay).await;
                Ok(ToolOutput::text(format!("{name} ok")))
            }
        },
    ))
}

/// Tool that runs until cancelled, tracking how many calls are active at once.
pub(super) fn blocking_tool(
    name: &'static str,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        "runs until cancelled",
        ToolParameters::empty(),
        move |invocation| {
            let active = active.clone();
            let max_active = max_active.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                invocation.cancel.cancelled().await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(ToolOutput::text("stopped"))
            }
        },
    ))
}

pub(super) fn call(id: &str, name: &str) -> ToolCall {
    ToolCall::new(id, name, serde_json::json!({}))
}

pub(super) fn tool_results(messages: &[Message]) -> Vec<&crate::types::ToolResultMessage> {
    messages.iter().filter_map(Message::as_tool_result).collect()
}

pub(super) fn count_events(events: &EventLog, predicate: impl Fn(&AgentEvent) -> bool) -> usize {
    events
        .lock()
        .expect("event lock")
        .iter()
        .filter(|event| predicate(event))
        .count()
}

pub(super) async fn wait_for_state(handle: &RunHandle, wanted: LoopState) {
    let mut state = handle.watch_state();
    while *state.borrow() != wanted {
        state.changed().await.expect("run state channel closed");
    }
}
