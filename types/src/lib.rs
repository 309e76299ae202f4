//! Core domain types for Parley.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. Everything here can be used from any layer of the
//! application: the stream adapter, the session reducer, and the shell all
//! speak these types.

mod ids;
pub use ids::{MessageId, StreamId};

use serde::{Deserialize, Serialize};

// ============================================================================
// Roles & Statuses
// ============================================================================

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Session-level view of the stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Idle,
    Streaming,
    Done,
    Error,
}

/// Per-message lifecycle. `Idle` does not exist at message granularity:
/// a message either streams, finished, or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Streaming,
    Done,
    Error,
}

// ============================================================================
// Chat Messages
// ============================================================================

/// One entry in the ordered conversation transcript.
///
/// User messages are immutable once created. Assistant messages are mutable
/// accumulators: created empty on `Start`, appended to on each `Delta`, and
/// finalized on `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: ChatRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ChatMessage {
    /// A finished user message. No stream id, no status bookkeeping.
    #[must_use]
    pub fn user(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            role: ChatRole::User,
            text: text.into(),
            stream_id: None,
            status: None,
            error_message: None,
        }
    }

    /// Empty assistant accumulator for a turn that just started streaming.
    #[must_use]
    pub fn assistant_placeholder(id: MessageId, stream_id: StreamId) -> Self {
        Self {
            id,
            role: ChatRole::Assistant,
            text: String::new(),
            stream_id: Some(stream_id),
            status: Some(MessageStatus::Streaming),
            error_message: None,
        }
    }

    /// Assistant message born in the error state (start rejection, watchdog
    /// firing before any stream event was observed).
    #[must_use]
    pub fn assistant_error(id: MessageId, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            id,
            role: ChatRole::Assistant,
            text: message.clone(),
            stream_id: None,
            status: Some(MessageStatus::Error),
            error_message: Some(message),
        }
    }
}

// ============================================================================
// Tool Calls
// ============================================================================

/// Terminal-or-running status of one tool invocation within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Done,
    Error,
}

/// Client-side record of one tool invocation, keyed by `(stream_id, call_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallState {
    pub stream_id: StreamId,
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolCallStatus,
}

/// Definition of a tool exposed to the model.
///
/// Standard function-calling schema: name, human-readable description, and a
/// JSON Schema for the input object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

// ============================================================================
// Normalized Stream Events
// ============================================================================

/// The closed vocabulary of normalized turn events.
///
/// The stream adapter's whole responsibility is mapping provider-specific
/// variants onto this set. Exactly one `Done` or `Error` terminates each
/// stream id; nothing follows the terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventKind {
    /// The turn began producing output.
    Start,
    /// An incremental fragment of generated text. Never empty.
    Delta { text: String },
    /// The model requested a tool invocation.
    ToolCallStart { tool_name: String, call_id: String },
    /// A tool invocation finished, successfully or not.
    ToolCallResult {
        tool_name: String,
        call_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The turn completed normally.
    Done,
    /// The turn terminated abnormally.
    Error { message: String },
}

impl StreamEventKind {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEventKind::Done | StreamEventKind::Error { .. })
    }
}

/// A normalized event tagged with the turn it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub stream_id: StreamId,
    #[serde(flatten)]
    pub event: StreamEventKind,
}

impl StreamEnvelope {
    #[must_use]
    pub fn new(stream_id: StreamId, event: StreamEventKind) -> Self {
        Self { stream_id, event }
    }
}
