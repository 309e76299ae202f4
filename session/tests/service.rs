//! Service-level tests: env resolution, dispatch, and folding the event
//! stream through the reducer.
//!
//! Environment mutation is process-global, so every path that touches the
//! credential variables lives in this single test function.

use std::sync::Arc;
use std::time::Instant;

use parley_config::{API_KEY_VAR, BASE_URL_VAR, MODEL_VAR};
use parley_session::{ChatAction, ChatService, ChatState, StartError, reduce};
use parley_tools::{DirectoryAuthorizer, ToolSet};
use parley_types::{MessageStatus, StreamStatus};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(events: &[&str]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str("data: ");
        body.push_str(event);
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test(flavor = "multi_thread")]
async fn start_turn_checks_credential_then_streams_to_done() {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(ToolSet::file_tools(Arc::new(
        DirectoryAuthorizer::preauthorized(dir.path().to_path_buf()),
    )));
    let (service, mut rx) = ChatService::new(tools);

    // Missing credential is rejected synchronously, before any dispatch.
    unsafe { std::env::remove_var(API_KEY_VAR) };
    let err = service.start_turn(&[]).unwrap_err();
    assert!(matches!(err, StartError::Config(_)));

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&[
                    r#"{"choices":[{"delta":{"content":"All"}}]}"#,
                    r#"{"choices":[{"delta":{"content":" good"}}]}"#,
                    r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                ])),
        )
        .mount(&server)
        .await;

    unsafe {
        std::env::set_var(API_KEY_VAR, "sk-test");
        std::env::set_var(BASE_URL_VAR, server.uri());
        std::env::set_var(MODEL_VAR, "gpt-4.1-mini");
    }

    let mut state = ChatState::default();
    state = reduce(
        state,
        ChatAction::Submit {
            text: "ping".to_string(),
        },
        Instant::now(),
    );
    state = reduce(state, ChatAction::StartRequest, Instant::now());

    let stream_id = service.start_turn(&state.messages).unwrap();
    state = reduce(state, ChatAction::StartAck { stream_id }, Instant::now());

    while state.has_in_flight() {
        let envelope = rx.recv().await.expect("stream ended without terminal event");
        state = reduce(state, ChatAction::StreamEvent(envelope), Instant::now());
    }

    assert_eq!(state.stream_status, StreamStatus::Done);
    let assistant = state
        .messages
        .iter()
        .find(|m| m.stream_id == Some(stream_id))
        .unwrap();
    assert_eq!(assistant.text, "All good");
    assert_eq!(assistant.status, Some(MessageStatus::Done));
    assert!(state.error_text.is_none());

    unsafe {
        std::env::remove_var(API_KEY_VAR);
        std::env::remove_var(BASE_URL_VAR);
        std::env::remove_var(MODEL_VAR);
    }
}
