//! Streaming model client.
//!
//! The crate splits into two layers:
//!
//! - this module: transport plumbing shared by any SSE-speaking provider
//!   (hardened HTTP client, event boundary scanning, buffer limits, idle
//!   timeout, parse error threshold)
//! - [`openai`]: the Chat Completions wire format, parsed into
//!   [`ProviderEvent`]s
//! - [`turn`]: the multi-step turn driver that owns the tool loop and
//!   emits the public [`parley_types::StreamEnvelope`] sequence
//!
//! Transport and provider failures are delivered as `ProviderEvent::Error`
//! through the channel rather than `Result::Err` returns, so partial output
//! already forwarded to the UI survives the failure.

pub mod openai;
pub mod turn;

pub(crate) use tokio::sync::mpsc;

use std::sync::OnceLock;
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;

const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Normalized streaming events from one model request.
///
/// One request emits zero or more non-terminal events followed by exactly
/// one of `Done` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProviderEvent {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallArgsDelta { id: String, arguments: String },
    /// Terminal reason reported by the model for the current choice.
    FinishReason(String),
    Done,
    Error(String),
}

impl ProviderEvent {
    pub(crate) const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!(
                "Failed to build hardened HTTP client: {e}. Attempting minimal hardened fallback."
            );
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("Minimal hardened HTTP client must build; cannot proceed without one")
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
}

pub(crate) fn stream_idle_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let timeout = std::env::var("PARLEY_STREAM_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        Duration::from_secs(timeout)
    })
}

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Continue processing, no event to emit
    Continue,
    /// Emit these events and continue
    Emit(Vec<ProviderEvent>),
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;
    fn provider_name(&self) -> &'static str;
}

pub(crate) async fn send_event(tx: &mpsc::Sender<ProviderEvent>, event: ProviderEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Process an SSE stream using a provider-specific parser.
///
/// Handles the common SSE processing logic:
/// - idle timeout between chunks
/// - buffer management with size limits
/// - UTF-8 validation
/// - event boundary detection
/// - `[DONE]` marker handling
/// - parse error tracking with threshold
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<ProviderEvent>,
    idle_timeout: Duration,
) -> anyhow::Result<()> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_event(tx, ProviderEvent::Error("Stream idle timeout".to_string())).await;
            return Ok(());
        };

        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = send_event(tx, ProviderEvent::Error(format!("Stream read failed: {e}")))
                    .await;
                return Ok(());
            }
        };
        buffer.extend_from_slice(&chunk);

        // Security: prevent unbounded buffer growth
        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_event(
                tx,
                ProviderEvent::Error("SSE buffer exceeded maximum size (4 MiB)".to_string()),
            )
            .await;
            return Ok(());
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                let _ = send_event(
                    tx,
                    ProviderEvent::Error("Received invalid UTF-8 from SSE stream".to_string()),
                )
                .await;
                return Ok(());
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                let _ = send_event(tx, ProviderEvent::Done).await;
                return Ok(());
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    match parser.parse(&json) {
                        SseParseAction::Continue => {}
                        SseParseAction::Emit(events) => {
                            for event in events {
                                let is_terminal = event.is_terminal();
                                if !send_event(tx, event).await {
                                    return Ok(());
                                }
                                if is_terminal {
                                    return Ok(());
                                }
                            }
                        }
                        SseParseAction::Error(msg) => {
                            let _ = send_event(tx, ProviderEvent::Error(msg)).await;
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        provider = parser.provider_name(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        let _ = send_event(
                            tx,
                            ProviderEvent::Error(format!("Invalid stream payload: {e}")),
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }
    }

    // Premature EOF: connection closed without completion signal
    let _ = send_event(
        tx,
        ProviderEvent::Error("Connection closed before stream completed".to_string()),
    )
    .await;
    Ok(())
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::{drain_next_sse_event, extract_sse_data, find_sse_event_boundary};

    mod sse_boundary {
        use super::find_sse_event_boundary;

        #[test]
        fn finds_lf_boundary() {
            let buffer = b"data: hello\n\ndata: world";
            assert_eq!(find_sse_event_boundary(buffer), Some((11, 2)));
        }

        #[test]
        fn finds_crlf_boundary() {
            let buffer = b"data: hello\r\n\r\ndata: world";
            assert_eq!(find_sse_event_boundary(buffer), Some((11, 4)));
        }

        #[test]
        fn prefers_earlier_lf_over_crlf() {
            let buffer = b"data: a\n\ndata: b\r\n\r\n";
            assert_eq!(find_sse_event_boundary(buffer), Some((7, 2)));
        }

        #[test]
        fn prefers_earlier_crlf_over_lf() {
            let buffer = b"data: a\r\n\r\ndata: b\n\n";
            assert_eq!(find_sse_event_boundary(buffer), Some((7, 4)));
        }

        #[test]
        fn returns_none_when_no_boundary() {
            assert_eq!(find_sse_event_boundary(b"data: incomplete event\n"), None);
        }

        #[test]
        fn returns_none_for_empty_buffer() {
            assert_eq!(find_sse_event_boundary(b""), None);
        }
    }

    mod sse_drain {
        use super::drain_next_sse_event;

        #[test]
        fn drains_single_event() {
            let mut buffer = b"data: hello\n\ndata: world\n\n".to_vec();
            let event = drain_next_sse_event(&mut buffer);
            assert_eq!(event, Some(b"data: hello".to_vec()));
            assert_eq!(buffer, b"data: world\n\n");
        }

        #[test]
        fn drains_multiple_events_sequentially() {
            let mut buffer = b"event: a\n\nevent: b\n\n".to_vec();
            assert_eq!(drain_next_sse_event(&mut buffer), Some(b"event: a".to_vec()));
            assert_eq!(drain_next_sse_event(&mut buffer), Some(b"event: b".to_vec()));
            assert_eq!(drain_next_sse_event(&mut buffer), None);
        }

        #[test]
        fn returns_none_for_incomplete_event() {
            let mut buffer = b"data: incomplete".to_vec();
            assert_eq!(drain_next_sse_event(&mut buffer), None);
            assert_eq!(buffer, b"data: incomplete");
        }

        #[test]
        fn handles_crlf_events() {
            let mut buffer = b"data: crlf\r\n\r\nrest".to_vec();
            let event = drain_next_sse_event(&mut buffer);
            assert_eq!(event, Some(b"data: crlf".to_vec()));
            assert_eq!(buffer, b"rest");
        }
    }

    mod sse_extract {
        use super::extract_sse_data;

        #[test]
        fn extracts_single_data_line() {
            assert_eq!(extract_sse_data("data: hello"), Some("hello".to_string()));
        }

        #[test]
        fn extracts_data_without_space() {
            assert_eq!(extract_sse_data("data:hello"), Some("hello".to_string()));
        }

        #[test]
        fn extracts_multiline_data() {
            assert_eq!(
                extract_sse_data("data: line1\ndata: line2"),
                Some("line1\nline2".to_string())
            );
        }

        #[test]
        fn ignores_non_data_lines() {
            let event = "event: message\nid: 123\ndata: actual_data\nretry: 1000";
            assert_eq!(extract_sse_data(event), Some("actual_data".to_string()));
        }

        #[test]
        fn returns_none_for_no_data() {
            assert_eq!(extract_sse_data("event: ping\nid: 456"), None);
        }

        #[test]
        fn handles_data_with_colons() {
            assert_eq!(
                extract_sse_data("data: {\"key\": \"value\"}"),
                Some("{\"key\": \"value\"}".to_string())
            );
        }

        #[test]
        fn strips_carriage_return_suffix() {
            assert_eq!(extract_sse_data("data: windows\r"), Some("windows".to_string()));
        }

        #[test]
        fn extracts_done_marker() {
            assert_eq!(extract_sse_data("data: [DONE]"), Some("[DONE]".to_string()));
        }
    }
}
