//! Parley shell - line-based chat session over stdin/stdout.
//!
//! The shell is deliberately thin: it reads lines, dispatches actions into
//! the session reducer, and renders stream events as they arrive. All
//! conversation semantics live in `parley-session`; all model plumbing in
//! `parley-providers`. Logs go to stderr so stdout stays a clean transcript.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parley_session::{
    ChatAction, ChatService, ChatState, STREAM_TIMEOUT_TEXT, next_deadline, reduce,
    timeout_action,
};
use parley_tools::{DirectoryAuthorizer, ToolSet};
use parley_types::{StreamEnvelope, StreamEventKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Error shown when the user aborts the in-flight turn.
const ABORT_TEXT: &str = "Model stream aborted";

/// Environment variable naming the directory granted to the file tools.
const TOOLS_ROOT_VAR: &str = "PARLEY_TOOLS_ROOT";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// The tools root comes from the first argument or `PARLEY_TOOLS_ROOT`.
/// Without either, tool calls fail with a clear authorization error instead
/// of touching the filesystem.
fn resolve_authorizer() -> Result<DirectoryAuthorizer> {
    let root = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(TOOLS_ROOT_VAR).map(PathBuf::from));

    match root {
        Some(root) => {
            let root = root
                .canonicalize()
                .with_context(|| format!("cannot resolve tools root {}", root.display()))?;
            tracing::info!(root = %root.display(), "file tools enabled");
            Ok(DirectoryAuthorizer::preauthorized(root))
        }
        None => {
            tracing::info!("no tools root given; file tools will be denied");
            Ok(DirectoryAuthorizer::new(None))
        }
    }
}

fn render_event(envelope: &StreamEnvelope) {
    match &envelope.event {
        StreamEventKind::Start => {}
        StreamEventKind::Delta { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        StreamEventKind::ToolCallStart { tool_name, call_id } => {
            println!("[tool] {tool_name} started ({call_id})");
        }
        StreamEventKind::ToolCallResult {
            tool_name,
            call_id,
            ok,
            error,
            ..
        } => {
            if *ok {
                println!("[tool] {tool_name} finished ({call_id})");
            } else {
                let reason = error.as_deref().unwrap_or("unknown failure");
                println!("[tool] {tool_name} failed ({call_id}): {reason}");
            }
        }
        StreamEventKind::Done => println!(),
        StreamEventKind::Error { message } => println!("\n[error] {message}"),
    }
}

fn submit(service: &ChatService, mut state: ChatState, text: String) -> ChatState {
    state = reduce(state, ChatAction::Submit { text }, Instant::now());
    state = reduce(state, ChatAction::StartRequest, Instant::now());

    match service.start_turn(&state.messages) {
        Ok(stream_id) => reduce(state, ChatAction::StartAck { stream_id }, Instant::now()),
        Err(e) => {
            let message = e.to_string();
            println!("[error] {message} (/retry to try again)");
            reduce(state, ChatAction::StartReject { message }, Instant::now())
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    if cfg!(debug_assertions) {
        parley_config::env_file::load_local_env();
    }

    let authorizer = resolve_authorizer()?;
    let tools = Arc::new(ToolSet::file_tools(Arc::new(authorizer)));
    let (service, mut rx) = ChatService::new(tools);
    let mut state = ChatState::default();

    println!("parley - type a message, /retry, /cancel, or /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let deadline = next_deadline(&state, Instant::now());

        tokio::select! {
            maybe_line = lines.next_line() => {
                let Some(line) = maybe_line.context("reading stdin")? else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                match line.as_str() {
                    "/quit" | "/exit" => break,
                    "/retry" => {
                        if state.has_in_flight() {
                            println!("[info] a response is still streaming");
                        } else if let Some(last) = state.last_user_message.clone() {
                            state = submit(&service, state, last);
                        } else {
                            println!("[info] nothing to retry yet");
                        }
                    }
                    "/cancel" => {
                        if let Some(stream_id) = service.cancel_active_turn() {
                            println!("\n[error] {ABORT_TEXT}");
                            state = reduce(
                                state,
                                ChatAction::StreamTimeout {
                                    stream_id: Some(stream_id),
                                    message: ABORT_TEXT.to_string(),
                                },
                                Instant::now(),
                            );
                        } else {
                            println!("[info] nothing to cancel");
                        }
                    }
                    _ => {
                        if state.has_in_flight() {
                            println!("[info] a response is still streaming; wait or /cancel");
                        } else {
                            state = submit(&service, state, line);
                        }
                    }
                }
            }

            maybe_event = rx.recv() => {
                let Some(envelope) = maybe_event else { break };
                render_event(&envelope);
                state = reduce(state, ChatAction::StreamEvent(envelope), Instant::now());
            }

            () = wait_until(deadline) => {
                println!("\n[error] {STREAM_TIMEOUT_TEXT}");
                let action = timeout_action(&state);
                state = reduce(state, action, Instant::now());
            }
        }
    }

    Ok(())
}
