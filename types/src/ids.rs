use std::fmt;

use uuid::Uuid;

/// Identifier scoping every event that belongs to one streaming model turn.
///
/// Minted when a turn is dispatched; retired when the `Done` or `Error`
/// event for it is folded, or when the client watchdog gives up on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    #[must_use]
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn value(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for one chat message within a session.
///
/// Allocated from a counter owned by the session state so the reducer stays
/// deterministic; never minted from randomness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
