//! Client-side stall detection.
//!
//! The watchdog measures inactivity from the last accepted event and forces
//! a terminal error after a fixed budget. It is purely local: firing it
//! abandons the client-side view without touching the upstream request
//! (cancellation lives on [`crate::ChatService`] for callers that want it).

use std::time::{Duration, Instant};

use crate::reducer::{ChatAction, ChatState};

/// Inactivity budget before a stream is declared stalled.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(20);

/// Error text shown when the watchdog fires.
pub const STREAM_TIMEOUT_TEXT: &str = "Stream timed out. Please retry.";

/// When the watchdog should next fire, or `None` while nothing is in flight.
#[must_use]
pub fn next_deadline(state: &ChatState, now: Instant) -> Option<Instant> {
    if !state.is_starting && state.in_flight_stream_id().is_none() {
        return None;
    }
    Some(state.stream_updated_at.unwrap_or(now) + STREAM_TIMEOUT)
}

/// The action to dispatch when the deadline passes.
#[must_use]
pub fn timeout_action(state: &ChatState) -> ChatAction {
    ChatAction::StreamTimeout {
        stream_id: state.in_flight_stream_id(),
        message: STREAM_TIMEOUT_TEXT.to_string(),
    }
}
