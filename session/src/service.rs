//! Turn lifecycle service.
//!
//! Owns the tool set and the event channel for one session and dispatches
//! turns onto the runtime. `start_turn` does the synchronous checks (the
//! credential, a live runtime) before anything is spawned, so a returned
//! stream id means the turn is actually running.

use std::sync::{Arc, Mutex};

use futures_util::future::{AbortHandle, Abortable};
use parley_config::{ConfigError, ModelConfig};
use parley_providers::turn;
use parley_tools::ToolSet;
use parley_types::{ChatMessage, StreamEnvelope, StreamId};
use tokio::sync::mpsc;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a turn could not be dispatched. Everything here is detected before
/// any network activity.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no async runtime available to dispatch the turn")]
    NoRuntime,
}

/// Cancels the turn it was minted for. Aborting drops the in-flight request
/// without emitting a terminal event; the watchdog covers the client side.
#[derive(Debug)]
pub struct CancelHandle {
    stream_id: StreamId,
    inner: AbortHandle,
}

impl CancelHandle {
    pub fn cancel(&self) {
        tracing::info!(stream_id = %self.stream_id, "canceling in-flight turn");
        self.inner.abort();
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

/// One session's turn dispatcher.
pub struct ChatService {
    tools: Arc<ToolSet>,
    tx: mpsc::Sender<StreamEnvelope>,
    cancel: Mutex<Option<CancelHandle>>,
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService").finish_non_exhaustive()
    }
}

impl ChatService {
    /// Create the service and the receiving end of its event stream.
    #[must_use]
    pub fn new(tools: Arc<ToolSet>) -> (Self, mpsc::Receiver<StreamEnvelope>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                tools,
                tx,
                cancel: Mutex::new(None),
            },
            rx,
        )
    }

    /// Start one turn over the conversation so far.
    ///
    /// Returns the fresh stream id immediately; events for it arrive on the
    /// receiver returned by [`ChatService::new`].
    pub fn start_turn(&self, history: &[ChatMessage]) -> Result<StreamId, StartError> {
        let config = ModelConfig::from_env()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StartError::NoRuntime)?;

        let stream_id = StreamId::mint();
        let transcript = turn::initial_transcript(history);
        let (abort_handle, abort_registration) = AbortHandle::new_pair();

        let future = Abortable::new(
            turn::run_turn(
                config,
                transcript,
                self.tools.clone(),
                stream_id,
                self.tx.clone(),
            ),
            abort_registration,
        );
        runtime.spawn(async move {
            if future.await.is_err() {
                tracing::debug!(%stream_id, "turn aborted before completion");
            }
        });

        let handle = CancelHandle {
            stream_id,
            inner: abort_handle,
        };
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = Some(handle);
        }

        tracing::info!(%stream_id, "turn dispatched");
        Ok(stream_id)
    }

    /// Abort the most recently dispatched turn, if one is still held.
    pub fn cancel_active_turn(&self) -> Option<StreamId> {
        let handle = self.cancel.lock().ok()?.take()?;
        handle.cancel();
        Some(handle.stream_id())
    }

    #[must_use]
    pub fn tools(&self) -> &Arc<ToolSet> {
        &self.tools
    }
}
