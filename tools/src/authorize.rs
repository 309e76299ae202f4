//! Per-connection directory authorization.
//!
//! Every tool filesystem access is confined under one directory the user
//! granted interactively. The grant lives in a single-slot cache owned by
//! the connection's session object, so it disappears with the connection -
//! no process-global registry, no cross-reconnect leakage.
//!
//! The slot's async mutex is held across the interactive prompt. Two tool
//! calls racing before the first grant resolves therefore trigger exactly
//! one prompt: the second caller parks on the lock and observes the cached
//! grant once the first prompt succeeds.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum AuthorizeError {
    #[error("cannot locate a host surface for directory authorization")]
    NoHostSurface,
    #[error("directory authorization was canceled by user")]
    Canceled,
}

/// Future returned by a [`DirectoryPrompt`].
pub type PromptFut<'a> = Pin<Box<dyn Future<Output = Option<PathBuf>> + Send + 'a>>;

/// A live UI surface able to host the "choose a folder" dialog.
///
/// Returns `None` when the user cancels or selects nothing; that outcome is
/// surfaced to the caller synchronously, never silently defaulted.
pub trait DirectoryPrompt: Send + Sync {
    fn choose_directory(&self) -> PromptFut<'_>;
}

/// One connection's authorized-directory cache.
pub struct DirectoryAuthorizer {
    prompt: Option<Arc<dyn DirectoryPrompt>>,
    slot: Mutex<Option<PathBuf>>,
}

impl std::fmt::Debug for DirectoryAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryAuthorizer")
            .field("has_prompt", &self.prompt.is_some())
            .finish_non_exhaustive()
    }
}

impl DirectoryAuthorizer {
    /// Authorizer backed by an interactive prompt. `None` models a
    /// connection with no live UI surface.
    #[must_use]
    pub fn new(prompt: Option<Arc<dyn DirectoryPrompt>>) -> Self {
        Self {
            prompt,
            slot: Mutex::new(None),
        }
    }

    /// Authorizer whose grant is decided up front (shells that take the
    /// root as a startup argument, tests).
    #[must_use]
    pub fn preauthorized(directory: PathBuf) -> Self {
        Self {
            prompt: None,
            slot: Mutex::new(Some(directory)),
        }
    }

    /// Return the authorized directory, prompting on first use.
    pub async fn ensure_authorized(&self) -> Result<PathBuf, AuthorizeError> {
        let mut slot = self.slot.lock().await;
        if let Some(directory) = slot.as_ref() {
            return Ok(directory.clone());
        }

        let prompt = self.prompt.as_ref().ok_or(AuthorizeError::NoHostSurface)?;
        let chosen = prompt
            .choose_directory()
            .await
            .ok_or(AuthorizeError::Canceled)?;

        // Pin the grant to the canonical form when the directory exists;
        // the lexical confinement layer depends on a stable root.
        let directory = tokio::fs::canonicalize(&chosen).await.unwrap_or(chosen);
        tracing::info!(directory = %directory.display(), "directory authorized for file tools");
        *slot = Some(directory.clone());
        Ok(directory)
    }

    /// Peek at the grant without prompting.
    pub async fn authorized(&self) -> Option<PathBuf> {
        self.slot.lock().await.clone()
    }
}
