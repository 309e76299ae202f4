//! Session layer: the conversation state machine, the stall watchdog, and
//! the service that dispatches turns and feeds events back.

pub mod reducer;
pub mod service;
pub mod watchdog;

pub use reducer::{ChatAction, ChatState, EMPTY_DONE_TEXT, reduce};
pub use service::{CancelHandle, ChatService, StartError};
pub use watchdog::{STREAM_TIMEOUT, STREAM_TIMEOUT_TEXT, next_deadline, timeout_action};
