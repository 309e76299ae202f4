//! OpenAI Chat Completions wire format.
//!
//! Talks to `{base_url}/chat/completions` with `stream: true` and parses
//! the chunk stream into [`ProviderEvent`]s. Tool call fragments arrive
//! keyed by choice-local index with the call id and function name only on
//! the first fragment; the parser owns the index-to-id mapping so the rest
//! of the crate only ever sees resolved call ids.

use std::collections::{HashMap, HashSet};

use parley_config::ModelConfig;
use parley_types::ToolDefinition;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    ProviderEvent, SseParseAction, SseParser, http_client, mpsc, process_sse_stream,
    read_capped_error_body, send_event, stream_idle_timeout,
};

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: u64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Default)]
pub(crate) struct OpenAiParser {
    /// Map choice-local tool call index -> call id
    index_to_call: HashMap<u64, String>,
    /// Call ids already announced with a start event
    started: HashSet<String>,
}

impl SseParser for OpenAiParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let chunk: ChatChunk = match serde_json::from_value(json.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("Failed to parse chat completion chunk: {e}");
                return SseParseAction::Continue;
            }
        };

        if let Some(error) = chunk.error {
            let message = error.message.unwrap_or_else(|| "Unknown error".to_string());
            return SseParseAction::Error(message);
        }

        let mut events = Vec::new();

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content
                && !content.is_empty()
            {
                events.push(ProviderEvent::TextDelta(content));
            }

            for call in choice.delta.tool_calls {
                if let Some(id) = call.id.filter(|s| !s.trim().is_empty()) {
                    self.index_to_call.insert(call.index, id);
                }
                let Some(call_id) = self.index_to_call.get(&call.index).cloned() else {
                    return SseParseAction::Error(
                        "Tool call fragment arrived before its id".to_string(),
                    );
                };

                let Some(function) = call.function else {
                    continue;
                };
                if let Some(name) = function.name.filter(|s| !s.trim().is_empty())
                    && self.started.insert(call_id.clone())
                {
                    events.push(ProviderEvent::ToolCallStart {
                        id: call_id.clone(),
                        name,
                    });
                }
                if let Some(arguments) = function.arguments.filter(|s| !s.is_empty()) {
                    events.push(ProviderEvent::ToolCallArgsDelta {
                        id: call_id,
                        arguments,
                    });
                }
            }

            if let Some(reason) = choice.finish_reason {
                events.push(ProviderEvent::FinishReason(reason));
            }
        }

        if events.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(events)
        }
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI"
    }
}

fn build_request_body(model: &str, messages: &[Value], tools: &[ToolDefinition]) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert("messages".to_string(), json!(messages));
    body.insert("stream".to_string(), json!(true));

    if !tools.is_empty() {
        let tool_defs: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tool_defs));
    }

    Value::Object(body)
}

/// Issue one streaming request and pump its events into `tx`.
///
/// Transport and API failures become `ProviderEvent::Error`; the channel
/// always sees a terminal event before this returns.
pub(crate) async fn send_step(
    config: &ModelConfig,
    messages: &[Value],
    tools: &[ToolDefinition],
    tx: mpsc::Sender<ProviderEvent>,
) {
    let client = http_client();
    let body = build_request_body(config.model(), messages, tools);

    let response = client
        .post(config.chat_completions_url())
        .header(
            "Authorization",
            format!("Bearer {}", config.api_key().expose_secret()),
        )
        .header("content-type", "application/json")
        .json(&body)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            let _ = send_event(&tx, ProviderEvent::Error(format!("Request failed: {e}"))).await;
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let error_text = read_capped_error_body(response).await;
        let _ = send_event(
            &tx,
            ProviderEvent::Error(format!("API error {status}: {error_text}")),
        )
        .await;
        return;
    }

    let mut parser = OpenAiParser::default();
    if let Err(e) = process_sse_stream(response, &mut parser, &tx, stream_idle_timeout()).await {
        let _ = send_event(&tx, ProviderEvent::Error(format!("Stream failed: {e}"))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_events(json: Value, parser: &mut OpenAiParser) -> Vec<ProviderEvent> {
        match parser.parse(&json) {
            SseParseAction::Emit(events) => events,
            _ => Vec::new(),
        }
    }

    #[test]
    fn emits_text_delta_from_content() {
        let mut parser = OpenAiParser::default();
        let events = collect_events(
            json!({"choices": [{"delta": {"content": "Hello"}}]}),
            &mut parser,
        );
        assert_eq!(events, vec![ProviderEvent::TextDelta("Hello".to_string())]);
    }

    #[test]
    fn ignores_empty_content_and_role_only_chunks() {
        let mut parser = OpenAiParser::default();
        assert!(collect_events(
            json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]}),
            &mut parser,
        )
        .is_empty());
        assert!(collect_events(json!({"choices": [{"delta": {}}]}), &mut parser).is_empty());
    }

    #[test]
    fn first_tool_fragment_starts_call_and_carries_args() {
        let mut parser = OpenAiParser::default();
        let events = collect_events(
            json!({"choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "id": "call_1",
                "function": {"name": "read_file", "arguments": "{\"pa"}
            }]}}]}),
            &mut parser,
        );
        assert_eq!(
            events,
            vec![
                ProviderEvent::ToolCallStart {
                    id: "call_1".to_string(),
                    name: "read_file".to_string(),
                },
                ProviderEvent::ToolCallArgsDelta {
                    id: "call_1".to_string(),
                    arguments: "{\"pa".to_string(),
                },
            ]
        );
    }

    #[test]
    fn later_fragments_resolve_id_from_index() {
        let mut parser = OpenAiParser::default();
        let _ = collect_events(
            json!({"choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "id": "call_1",
                "function": {"name": "read_file"}
            }]}}]}),
            &mut parser,
        );
        let events = collect_events(
            json!({"choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "function": {"arguments": "th\":\"a.txt\"}"}
            }]}}]}),
            &mut parser,
        );
        assert_eq!(
            events,
            vec![ProviderEvent::ToolCallArgsDelta {
                id: "call_1".to_string(),
                arguments: "th\":\"a.txt\"}".to_string(),
            }]
        );
    }

    #[test]
    fn fragment_without_known_id_is_an_error() {
        let mut parser = OpenAiParser::default();
        let action = parser.parse(&json!({"choices": [{"delta": {"tool_calls": [{
            "index": 3,
            "function": {"arguments": "{}"}
        }]}}]}));
        assert!(matches!(action, SseParseAction::Error(_)));
    }

    #[test]
    fn finish_reason_is_forwarded() {
        let mut parser = OpenAiParser::default();
        let events = collect_events(
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
            &mut parser,
        );
        assert_eq!(
            events,
            vec![ProviderEvent::FinishReason("tool_calls".to_string())]
        );
    }

    #[test]
    fn api_error_payload_terminates_stream() {
        let mut parser = OpenAiParser::default();
        let action = parser.parse(&json!({"error": {"message": "rate limited"}}));
        assert!(matches!(action, SseParseAction::Error(msg) if msg == "rate limited"));
    }

    #[test]
    fn request_body_includes_tool_manifest() {
        let tools = vec![ToolDefinition::new(
            "read_file",
            "Read a file",
            json!({"type": "object"}),
        )];
        let body = build_request_body("gpt-4.1-mini", &[json!({"role": "user", "content": "hi"})], &tools);

        assert_eq!(body["model"], "gpt-4.1-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
    }

    #[test]
    fn request_body_omits_tools_when_empty() {
        let body = build_request_body("gpt-4.1-mini", &[], &[]);
        assert!(body.get("tools").is_none());
    }
}
