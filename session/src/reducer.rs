//! The conversation state machine.
//!
//! A pure reducer over stream events and local lifecycle actions. No IO, no
//! clocks of its own (callers pass `now`), no channel knowledge. Every
//! reachable `(state, action)` pair is defined; stale or unknown events are
//! explicit no-ops, never failures.
//!
//! Stream identity rules:
//! - at most one of `pending_stream_id` / `active_stream_id` is set at a time
//! - events for a stream that is neither pending nor active are dropped,
//!   except when both slots are empty (late events from a turn that already
//!   fully retired still land rather than vanish)

use std::time::Instant;

use parley_types::{
    ChatMessage, MessageId, MessageStatus, StreamEnvelope, StreamEventKind, StreamId,
    StreamStatus, ToolCallState, ToolCallStatus,
};

/// Text substituted when a stream finishes without producing any.
pub const EMPTY_DONE_TEXT: &str = "(model returned no text)";

/// One session's authoritative view of the conversation.
#[derive(Debug, Clone)]
pub struct ChatState {
    pub messages: Vec<ChatMessage>,
    pub tool_calls: Vec<ToolCallState>,
    pub active_stream_id: Option<StreamId>,
    pub pending_stream_id: Option<StreamId>,
    pub is_starting: bool,
    pub stream_status: StreamStatus,
    pub error_text: Option<String>,
    pub last_user_message: Option<String>,
    pub stream_updated_at: Option<Instant>,
    next_message_id: u64,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            tool_calls: Vec::new(),
            active_stream_id: None,
            pending_stream_id: None,
            is_starting: false,
            stream_status: StreamStatus::Idle,
            error_text: None,
            last_user_message: None,
            stream_updated_at: None,
            next_message_id: 1,
        }
    }
}

impl ChatState {
    fn mint_message_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_message_id);
        self.next_message_id += 1;
        id
    }

    /// The stream the session is currently waiting on, if any.
    #[must_use]
    pub fn in_flight_stream_id(&self) -> Option<StreamId> {
        self.active_stream_id.or(self.pending_stream_id)
    }

    /// True while a turn is anywhere between submit and terminal event.
    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        self.is_starting || self.pending_stream_id.is_some() || self.active_stream_id.is_some()
    }
}

/// Everything that can change the conversation state.
#[derive(Debug, Clone)]
pub enum ChatAction {
    /// The user submitted a message.
    Submit { text: String },
    /// A turn start is about to be requested from the service.
    StartRequest,
    /// The service accepted the turn and assigned it a stream id.
    StartAck { stream_id: StreamId },
    /// The service refused to start the turn.
    StartReject { message: String },
    /// A normalized event arrived from the stream adapter.
    StreamEvent(StreamEnvelope),
    /// The local watchdog decided the stream stalled.
    StreamTimeout {
        stream_id: Option<StreamId>,
        message: String,
    },
}

fn is_known_stream(state: &ChatState, stream_id: StreamId) -> bool {
    if state.pending_stream_id.is_none() && state.active_stream_id.is_none() {
        return true;
    }
    state.pending_stream_id == Some(stream_id) || state.active_stream_id == Some(stream_id)
}

fn find_stream_message(messages: &[ChatMessage], stream_id: StreamId) -> Option<usize> {
    messages
        .iter()
        .position(|message| message.stream_id == Some(stream_id))
}

fn ensure_streaming_message(state: &mut ChatState, stream_id: StreamId) {
    match find_stream_message(&state.messages, stream_id) {
        Some(index) => state.messages[index].status = Some(MessageStatus::Streaming),
        None => {
            let id = state.mint_message_id();
            state
                .messages
                .push(ChatMessage::assistant_placeholder(id, stream_id));
        }
    }
}

fn append_delta(state: &mut ChatState, stream_id: StreamId, text: &str) {
    match find_stream_message(&state.messages, stream_id) {
        Some(index) => {
            let message = &mut state.messages[index];
            message.status = Some(MessageStatus::Streaming);
            message.text.push_str(text);
        }
        None => {
            let id = state.mint_message_id();
            let mut message = ChatMessage::assistant_placeholder(id, stream_id);
            message.text = text.to_string();
            state.messages.push(message);
        }
    }
}

fn mark_done(state: &mut ChatState, stream_id: StreamId) {
    match find_stream_message(&state.messages, stream_id) {
        Some(index) => {
            let message = &mut state.messages[index];
            message.status = Some(MessageStatus::Done);
            if message.text.trim().is_empty() {
                message.text = EMPTY_DONE_TEXT.to_string();
            }
        }
        None => {
            let id = state.mint_message_id();
            let mut message = ChatMessage::assistant_placeholder(id, stream_id);
            message.text = EMPTY_DONE_TEXT.to_string();
            message.status = Some(MessageStatus::Done);
            state.messages.push(message);
        }
    }
}

fn mark_error(state: &mut ChatState, stream_id: StreamId, error: &str) {
    match find_stream_message(&state.messages, stream_id) {
        Some(index) => {
            let message = &mut state.messages[index];
            message.status = Some(MessageStatus::Error);
            message.error_message = Some(error.to_string());
            // Streamed text survives the failure; only an empty message gets
            // the error text as its body.
            if message.text.is_empty() {
                message.text = error.to_string();
            }
        }
        None => {
            let id = state.mint_message_id();
            let mut message = ChatMessage::assistant_error(id, error);
            message.stream_id = Some(stream_id);
            state.messages.push(message);
        }
    }
}

fn append_error_banner(state: &mut ChatState, message: &str) {
    let id = state.mint_message_id();
    state.messages.push(ChatMessage::assistant_error(id, message));
}

fn upsert_tool_call_start(state: &mut ChatState, stream_id: StreamId, call_id: &str, name: &str) {
    if let Some(existing) = state
        .tool_calls
        .iter_mut()
        .find(|call| call.stream_id == stream_id && call.call_id == call_id)
    {
        // A terminal result never regresses back to running.
        if existing.status == ToolCallStatus::Running {
            existing.tool_name = name.to_string();
        }
        return;
    }
    state.tool_calls.push(ToolCallState {
        stream_id,
        call_id: call_id.to_string(),
        tool_name: name.to_string(),
        status: ToolCallStatus::Running,
    });
}

fn upsert_tool_call_result(
    state: &mut ChatState,
    stream_id: StreamId,
    call_id: &str,
    name: &str,
    ok: bool,
) {
    let status = if ok {
        ToolCallStatus::Done
    } else {
        ToolCallStatus::Error
    };
    if let Some(existing) = state
        .tool_calls
        .iter_mut()
        .find(|call| call.stream_id == stream_id && call.call_id == call_id)
    {
        existing.status = status;
        return;
    }
    // Result with no prior start: create directly in the terminal status.
    state.tool_calls.push(ToolCallState {
        stream_id,
        call_id: call_id.to_string(),
        tool_name: name.to_string(),
        status,
    });
}

/// Fold one action into the state. `now` is the moment the action was
/// observed; it only feeds the staleness timestamp, never control flow.
#[must_use]
pub fn reduce(mut state: ChatState, action: ChatAction, now: Instant) -> ChatState {
    match action {
        ChatAction::Submit { text } => {
            state.error_text = None;
            state.last_user_message = Some(text.clone());
            let id = state.mint_message_id();
            state.messages.push(ChatMessage::user(id, text));
            state
        }

        ChatAction::StartRequest => {
            state.is_starting = true;
            state.error_text = None;
            state.stream_status = StreamStatus::Streaming;
            state.stream_updated_at = Some(now);
            state
        }

        ChatAction::StartAck { stream_id } => {
            state.is_starting = false;
            // The first stream event can beat the acknowledgment; if the id
            // is already active there is nothing left to wait for.
            state.pending_stream_id = if state.active_stream_id == Some(stream_id) {
                None
            } else {
                Some(stream_id)
            };
            state.error_text = None;
            state.stream_status = StreamStatus::Streaming;
            state.stream_updated_at = Some(now);
            state
        }

        ChatAction::StartReject { message } => {
            state.is_starting = false;
            state.pending_stream_id = None;
            state.active_stream_id = None;
            state.error_text = Some(message.clone());
            state.stream_status = StreamStatus::Error;
            state.stream_updated_at = None;
            append_error_banner(&mut state, &message);
            state
        }

        ChatAction::StreamTimeout { stream_id, message } => {
            let expected = state.in_flight_stream_id();
            if !state.is_starting && expected.is_none() {
                return state;
            }
            // A stale timer for a superseded turn must not kill the new one.
            if let (Some(fired), Some(expected_id)) = (stream_id, expected)
                && fired != expected_id
            {
                return state;
            }

            state.is_starting = false;
            state.pending_stream_id = None;
            state.active_stream_id = None;
            state.error_text = Some(message.clone());
            state.stream_status = StreamStatus::Error;
            state.stream_updated_at = None;
            match expected {
                Some(expected_id) => mark_error(&mut state, expected_id, &message),
                None => append_error_banner(&mut state, &message),
            }
            state
        }

        ChatAction::StreamEvent(envelope) => {
            let stream_id = envelope.stream_id;
            if !is_known_stream(&state, stream_id) {
                return state;
            }

            match envelope.event {
                StreamEventKind::Start => {
                    state.is_starting = false;
                    state.active_stream_id = Some(stream_id);
                    if state.pending_stream_id == Some(stream_id) {
                        state.pending_stream_id = None;
                    }
                    state.stream_status = StreamStatus::Streaming;
                    state.stream_updated_at = Some(now);
                    ensure_streaming_message(&mut state, stream_id);
                    state
                }

                StreamEventKind::Delta { text } => {
                    state.is_starting = false;
                    state.active_stream_id = Some(stream_id);
                    if state.pending_stream_id == Some(stream_id) {
                        state.pending_stream_id = None;
                    }
                    state.stream_status = StreamStatus::Streaming;
                    state.stream_updated_at = Some(now);
                    append_delta(&mut state, stream_id, &text);
                    state
                }

                StreamEventKind::ToolCallStart { tool_name, call_id } => {
                    state.stream_updated_at = Some(now);
                    upsert_tool_call_start(&mut state, stream_id, &call_id, &tool_name);
                    state
                }

                StreamEventKind::ToolCallResult {
                    tool_name,
                    call_id,
                    ok,
                    ..
                } => {
                    state.stream_updated_at = Some(now);
                    upsert_tool_call_result(&mut state, stream_id, &call_id, &tool_name, ok);
                    state
                }

                StreamEventKind::Done => {
                    let next_pending = state
                        .pending_stream_id
                        .filter(|pending| *pending != stream_id);
                    let next_active = state
                        .active_stream_id
                        .filter(|active| *active != stream_id);
                    let has_in_flight =
                        state.is_starting || next_pending.is_some() || next_active.is_some();

                    state.is_starting = false;
                    state.pending_stream_id = next_pending;
                    state.active_stream_id = next_active;
                    if !has_in_flight {
                        state.error_text = None;
                    }
                    state.stream_status = if has_in_flight {
                        StreamStatus::Streaming
                    } else {
                        StreamStatus::Done
                    };
                    state.stream_updated_at = has_in_flight.then_some(now);
                    mark_done(&mut state, stream_id);
                    state
                }

                StreamEventKind::Error { message } => {
                    let next_pending = state
                        .pending_stream_id
                        .filter(|pending| *pending != stream_id);
                    let next_active = state
                        .active_stream_id
                        .filter(|active| *active != stream_id);
                    let has_in_flight =
                        state.is_starting || next_pending.is_some() || next_active.is_some();

                    state.is_starting = false;
                    state.pending_stream_id = next_pending;
                    state.active_stream_id = next_active;
                    state.error_text = Some(message.clone());
                    state.stream_status = if has_in_flight {
                        StreamStatus::Streaming
                    } else {
                        StreamStatus::Error
                    };
                    state.stream_updated_at = has_in_flight.then_some(now);
                    mark_error(&mut state, stream_id, &message);
                    state
                }
            }
        }
    }
}
