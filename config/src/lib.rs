//! Provider configuration for Parley.
//!
//! One credential, an optional base endpoint override, and an optional model
//! override, each read from the environment. Absence of the credential is
//! the only externally observable configuration error; everything else has a
//! defined default.

pub mod env_file;

use std::fmt;

use thiserror::Error;

/// Environment variable holding the provider credential.
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
/// Environment variable overriding the endpoint base URL.
pub const BASE_URL_VAR: &str = "OPENAI_BASE_URL";
/// Environment variable overriding the model identifier.
pub const MODEL_VAR: &str = "OPENAI_MODEL";

/// Default OpenAI-compatible endpoint base.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// Default model identifier.
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{API_KEY_VAR} is not set")]
    MissingCredential,
}

/// A provider API key. The secret never appears in `Debug` output or logs.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(secret: impl Into<String>) -> Result<Self, ConfigError> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(ConfigError::MissingCredential);
        }
        Ok(Self(secret))
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Resolved provider configuration for one turn.
///
/// Construction requires a credential, so a `ModelConfig` in hand is proof
/// that the missing-credential check already ran - the adapter never has to
/// re-check before dispatching a request.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    api_key: ApiKey,
    base_url: String,
    model: String,
}

impl ModelConfig {
    #[must_use]
    pub fn new(api_key: ApiKey, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            api_key,
            base_url,
            model: model.into(),
        }
    }

    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var(API_KEY_VAR)
            .ok()
            .ok_or(ConfigError::MissingCredential)
            .and_then(ApiKey::new)?;
        let base_url =
            std::env::var(BASE_URL_VAR).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var(MODEL_VAR).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(api_key, base_url, model))
    }

    #[must_use]
    pub fn api_key(&self) -> &ApiKey {
        &self.api_key
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Full URL of the streaming chat-completions endpoint.
    #[must_use]
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}
