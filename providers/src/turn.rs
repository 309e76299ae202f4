//! Multi-step turn driver.
//!
//! One turn is a bounded loop of model requests: stream a response, run any
//! requested tool calls, feed the results back, repeat. The driver owns the
//! public event contract: every turn emits `Start` first and exactly one of
//! `Done` or `Error` last, with deltas and tool events in between.

use std::sync::Arc;

use parley_config::ModelConfig;
use parley_tools::{ToolError, ToolSet};
use parley_types::{
    ChatMessage, ChatRole, MessageStatus, StreamEnvelope, StreamEventKind, StreamId,
};
use serde_json::{Value, json};

use crate::{ProviderEvent, mpsc, openai};

/// Upper bound on model requests per turn. A model still asking for tools
/// on the final request gets a normal completion, not an error.
pub const FILE_TOOL_MAX_STEPS: usize = 5;

/// Result text surfaced to the model for a tool it was never offered.
pub const DENIED_TOOL_OUTPUT: &str = "Tool output denied";

/// Instructions sent with every turn.
pub const MODEL_SYSTEM_PROMPT: &str = "You are a desktop chat assistant with access to the \
user's files through the read_file and write_file tools, confined to one folder the user \
authorizes. Use the tools whenever the user asks about file contents or asks you to save \
something. Never claim file access unless a tool call succeeds.";

const INNER_CHANNEL_CAPACITY: usize = 64;

/// One tool call accumulated across streamed fragments.
#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Build the wire transcript for a new turn from the conversation so far.
///
/// Streaming, failed, and empty assistant messages are not replayed; the
/// model only sees completed exchanges plus the standing instructions.
#[must_use]
pub fn initial_transcript(history: &[ChatMessage]) -> Vec<Value> {
    let mut transcript = vec![json!({"role": "system", "content": MODEL_SYSTEM_PROMPT})];
    for message in history {
        match message.role {
            ChatRole::User => {
                transcript.push(json!({"role": "user", "content": message.text}));
            }
            ChatRole::Assistant => {
                if message.status == Some(MessageStatus::Done) && !message.text.trim().is_empty() {
                    transcript.push(json!({"role": "assistant", "content": message.text}));
                }
            }
        }
    }
    transcript
}

async fn emit(tx: &mpsc::Sender<StreamEnvelope>, stream_id: StreamId, event: StreamEventKind) -> bool {
    if tx.send(StreamEnvelope { stream_id, event }).await.is_ok() {
        true
    } else {
        tracing::warn!(%stream_id, "stream receiver dropped, abandoning turn");
        false
    }
}

fn parse_call_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        Ok(json!({}))
    } else {
        serde_json::from_str(raw)
    }
}

/// Drive one full turn, emitting the event sequence on `tx`.
pub async fn run_turn(
    config: ModelConfig,
    mut transcript: Vec<Value>,
    tools: Arc<ToolSet>,
    stream_id: StreamId,
    tx: mpsc::Sender<StreamEnvelope>,
) {
    if !emit(&tx, stream_id, StreamEventKind::Start).await {
        return;
    }

    let definitions = tools.definitions();

    for step in 0..FILE_TOOL_MAX_STEPS {
        let (inner_tx, mut inner_rx) = mpsc::channel(INNER_CHANNEL_CAPACITY);
        let request = {
            let config = config.clone();
            let messages = transcript.clone();
            let definitions = definitions.clone();
            tokio::spawn(async move {
                openai::send_step(&config, &messages, &definitions, inner_tx).await;
            })
        };

        let mut text = String::new();
        let mut pending: Vec<PendingCall> = Vec::new();
        let mut finish_reason: Option<String> = None;

        while let Some(event) = inner_rx.recv().await {
            match event {
                ProviderEvent::TextDelta(delta) => {
                    text.push_str(&delta);
                    if !emit(&tx, stream_id, StreamEventKind::Delta { text: delta }).await {
                        request.abort();
                        return;
                    }
                }
                ProviderEvent::ToolCallStart { id, name } => {
                    let started = StreamEventKind::ToolCallStart {
                        tool_name: name.clone(),
                        call_id: id.clone(),
                    };
                    pending.push(PendingCall {
                        id,
                        name,
                        arguments: String::new(),
                    });
                    if !emit(&tx, stream_id, started).await {
                        request.abort();
                        return;
                    }
                }
                ProviderEvent::ToolCallArgsDelta { id, arguments } => {
                    if let Some(call) = pending.iter_mut().find(|call| call.id == id) {
                        call.arguments.push_str(&arguments);
                    }
                }
                ProviderEvent::FinishReason(reason) => {
                    finish_reason = Some(reason);
                }
                ProviderEvent::Done => break,
                ProviderEvent::Error(message) => {
                    let _ = emit(&tx, stream_id, StreamEventKind::Error { message }).await;
                    return;
                }
            }
        }

        if finish_reason.as_deref() == Some("content_filter") {
            let _ = emit(
                &tx,
                stream_id,
                StreamEventKind::Error {
                    message: "Response blocked by content filter".to_string(),
                },
            )
            .await;
            return;
        }

        if pending.is_empty() {
            let _ = emit(&tx, stream_id, StreamEventKind::Done).await;
            return;
        }

        tracing::debug!(%stream_id, step, calls = pending.len(), "executing tool calls");
        transcript.push(assistant_tool_call_message(&text, &pending));

        for call in &pending {
            let outcome = execute_call(&tools, stream_id, call).await;
            let result = StreamEventKind::ToolCallResult {
                tool_name: call.name.clone(),
                call_id: call.id.clone(),
                ok: outcome.ok,
                output: outcome.output.clone(),
                error: outcome.error.clone(),
            };
            if !emit(&tx, stream_id, result).await {
                return;
            }
            transcript.push(json!({
                "role": "tool",
                "tool_call_id": call.id,
                "content": outcome.wire_content,
            }));
        }
    }

    // Step cap reached with tools still pending.
    let _ = emit(&tx, stream_id, StreamEventKind::Done).await;
}

fn assistant_tool_call_message(text: &str, pending: &[PendingCall]) -> Value {
    let tool_calls: Vec<Value> = pending
        .iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": if call.arguments.is_empty() { "{}" } else { call.arguments.as_str() },
                }
            })
        })
        .collect();
    json!({
        "role": "assistant",
        "content": if text.is_empty() { Value::Null } else { Value::String(text.to_string()) },
        "tool_calls": tool_calls,
    })
}

struct CallOutcome {
    ok: bool,
    output: Option<Value>,
    error: Option<String>,
    /// Content of the `tool` role message fed back to the model.
    wire_content: String,
}

async fn execute_call(tools: &ToolSet, stream_id: StreamId, call: &PendingCall) -> CallOutcome {
    let args = match parse_call_arguments(&call.arguments) {
        Ok(args) => args,
        Err(e) => {
            let message = format!("Invalid tool arguments: {e}");
            return CallOutcome {
                ok: false,
                output: None,
                error: Some(message.clone()),
                wire_content: message,
            };
        }
    };

    match tools.invoke(&call.name, args, stream_id, &call.id).await {
        Ok(output) => {
            let wire_content =
                serde_json::to_string(&output).unwrap_or_else(|_| output.to_string());
            CallOutcome {
                ok: true,
                output: Some(output),
                error: None,
                wire_content,
            }
        }
        Err(ToolError::UnknownTool { .. }) => CallOutcome {
            ok: false,
            output: None,
            error: Some(DENIED_TOOL_OUTPUT.to_string()),
            wire_content: DENIED_TOOL_OUTPUT.to_string(),
        },
        Err(error) => {
            let message = error.to_string();
            CallOutcome {
                ok: false,
                output: None,
                error: Some(message.clone()),
                wire_content: message,
            }
        }
    }
}
