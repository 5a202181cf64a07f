//! Tests for the streaming event protocol.

mod common;

use std::time::Duration;

use conduit_agent::{
    AgentEvent, CancellationToken, ChatResponse, Engine, RunRequest, StreamEvent, StreamEventType,
};
use futures::StreamExt;
use serde_json::json;

use common::*;

async fn collect(engine: &Engine, request: RunRequest) -> Vec<StreamEvent> {
    engine
        .stream(request, CancellationToken::new())
        .collect()
        .await
}

fn kinds(events: &[StreamEvent]) -> Vec<StreamEventType> {
    events.iter().map(|e| e.kind).collect()
}

// ── ordering ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn text_fragments_then_one_complete() {
    let llm = shared(ScriptedLlm::new(vec![Reply::Respond(ChatResponse {
        content: "Hello streaming world".into(),
        thinking: Some("user wants a greeting".into()),
        ..ChatResponse::default()
    })]));
    let engine = Engine::new(llm, shared(FakeTools::new()), config());

    let events = collect(&engine, RunRequest::new("hi")).await;

    use StreamEventType::*;
    assert_eq!(kinds(&events), vec![Thinking, Text, Text, Text, Complete]);
    let text: String = events
        .iter()
        .filter(|e| e.kind == Text)
        .filter_map(|e| e.content.clone())
        .collect();
    assert_eq!(text, "Hello streaming world");

    let last = events.last().unwrap();
    assert_eq!(last.content.as_deref(), Some("Hello streaming world"));
    assert!(last.attachments.is_none());
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn tool_events_bracket_each_execution() {
    let llm = shared(ScriptedLlm::new(vec![
        respond_tools(vec![
            call("c1", "read_file", json!({"path": "a"})),
            call("c2", "broken", json!({})),
        ]),
        respond_text("ok"),
    ]));
    let tools = shared(
        FakeTools::new()
            .with("read_file", Behavior::Return(json!("A")))
            .with("broken", Behavior::Fail("nope".into())),
    );
    let engine = Engine::new(llm, tools, config());

    let events = collect(&engine, RunRequest::new("go")).await;

    use StreamEventType::*;
    assert_eq!(
        kinds(&events),
        vec![ToolStart, ToolResult, ToolStart, ToolResult, Text, Complete]
    );
    assert_eq!(events[0].tool.as_deref(), Some("read_file"));
    assert_eq!(events[0].tool_id.as_deref(), Some("c1"));
    assert_eq!(events[0].args, Some(json!({"path": "a"})));
    assert_eq!(events[1].result, Some(json!("A")));
    assert_eq!(events[1].content, None);
    assert_eq!(events[3].tool_id.as_deref(), Some("c2"));
    assert_eq!(events[3].content.as_deref(), Some("error"));
    assert_eq!(
        events[3].result,
        Some(json!("Error: tool execution failed for `broken`: nope"))
    );
}

#[tokio::test]
async fn complete_carries_collected_attachments() {
    let llm = shared(ScriptedLlm::new(vec![
        respond_tools(vec![call("c1", "export", json!({}))]),
        respond_text("exported"),
    ]));
    let tools = shared(FakeTools::new().with(
        "export",
        Behavior::Return(json!({"attachments": [{"name": "data.csv", "url": "/files/data.csv"}]})),
    ));
    let engine = Engine::new(llm, tools, config());

    let events = collect(&engine, RunRequest::new("go")).await;
    let complete = events.last().unwrap();
    assert_eq!(complete.kind, StreamEventType::Complete);
    let attachments = complete.attachments.as_ref().unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].url, "/files/data.csv");
}

#[tokio::test]
async fn model_failure_ends_with_error_event() {
    let llm = shared(ScriptedLlm::new(vec![
        respond_tools(vec![call("c1", "export", json!({}))]),
        Reply::Fail("socket hang up".into()),
    ]));
    let tools = shared(FakeTools::new().with(
        "export",
        Behavior::Return(json!({"name": "data.csv", "url": "/files/data.csv"})),
    ));
    let engine = Engine::new(llm, tools, config());

    let events = collect(&engine, RunRequest::new("go")).await;
    let error = events.last().unwrap();
    assert_eq!(error.kind, StreamEventType::Error);
    assert!(error.content.as_deref().unwrap().contains("socket hang up"));
    assert_eq!(error.attachments.as_ref().unwrap().len(), 1);
    assert_eq!(error.result.as_ref().unwrap()["category"], json!("NETWORK"));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn nameless_streamed_tool_call_is_a_stream_error() {
    let llm = shared(ScriptedLlm::new(vec![respond_tools(vec![call("c7", "", json!({}))])]));
    let tools = shared(FakeTools::new());
    let engine = Engine::new(llm, tools.clone(), config());

    let events = collect(&engine, RunRequest::new("go")).await;
    assert_eq!(kinds(&events), vec![StreamEventType::Error]);
    let content = events[0].content.as_deref().unwrap();
    assert!(content.contains("llm stream error"));
    assert!(content.contains("c7"));
    assert_eq!(events[0].result.as_ref().unwrap()["category"], json!("EXTERNAL_SERVICE"));
    assert!(tools.executed().is_empty());
}

// ── permissions ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn permission_event_is_answered_out_of_band() {
    let llm = shared(ScriptedLlm::new(vec![
        respond_tools(vec![call("c1", "bash", json!({"command": "rm -rf /tmp/x"}))]),
        respond_text("cleaned"),
    ]));
    let tools = shared(FakeTools::new().with("bash", Behavior::Return(json!("removed"))));
    let engine = Engine::new(llm, tools.clone(), config());

    let mut stream = engine.stream(RunRequest::new("clean"), CancellationToken::new());
    let mut seen = Vec::new();
    while let Some(event) = stream.next().await {
        if event.kind == StreamEventType::Permission {
            assert_eq!(event.tool.as_deref(), Some("bash"));
            let request = event.result.clone().unwrap();
            assert_eq!(request["isDangerous"], json!(true));
            let id = request["requestId"].as_str().unwrap().to_owned();
            assert!(engine.respond_permission(&id, true, None));
        }
        seen.push(event.kind);
    }

    use StreamEventType::*;
    assert_eq!(seen, vec![ToolStart, Permission, ToolResult, Text, Complete]);
    assert_eq!(tools.executed_names(), vec!["bash"]);
}

// ── cancellation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_stream_ends_with_aborted_error() {
    let llm = shared(ScriptedLlm::new(vec![respond_text("unused")]));
    let engine = Engine::new(llm.clone(), shared(FakeTools::new()), config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let events: Vec<AgentEvent> = engine
        .stream(RunRequest::new("hi"), cancel)
        .into_agent_events()
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        AgentEvent::Failed(failure) => assert!(failure.is_aborted()),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(llm.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_cancels_the_run() {
    let llm = shared(ScriptedLlm::new(vec![respond_tools(vec![
        call("c1", "slow", json!({})),
        call("c2", "read_file", json!({})),
    ])]));
    let tools = shared(
        FakeTools::new()
            .with("slow", Behavior::SleepThen(Duration::from_secs(5), json!("done")))
            .with("read_file", Behavior::Return(json!("never"))),
    );
    let engine = Engine::new(llm, tools.clone(), config());

    let mut stream = engine.stream(RunRequest::new("go"), CancellationToken::new());
    let first = stream.next().await.unwrap();
    assert_eq!(first.kind, StreamEventType::ToolStart);
    drop(stream);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(tools.executed_names(), vec!["slow"]);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_during_approval_withdraws_the_request() {
    let llm = shared(ScriptedLlm::new(vec![
        respond_tools(vec![call("c1", "bash", json!({"command": "rm -rf /tmp/x"}))]),
        respond_text("cleaned"),
    ]));
    let tools = shared(FakeTools::new().with("bash", Behavior::Return(json!("removed"))));
    let engine = Engine::new(llm.clone(), tools.clone(), config());

    let mut stream = engine.stream(RunRequest::new("clean"), CancellationToken::new());
    let request_id = loop {
        let event = stream.next().await.unwrap();
        if event.kind == StreamEventType::Permission {
            let request = event.result.unwrap();
            break request["requestId"].as_str().unwrap().to_owned();
        }
    };
    drop(stream);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(engine.pending_permissions().is_empty());
    assert!(!engine.respond_permission(&request_id, true, None));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(tools.executed_names().is_empty());
    assert_eq!(llm.calls(), 1);
}
