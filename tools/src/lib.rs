//! File tool framework for Parley.
//!
//! Two fixed tools - `read_file` and `write_file` - confined to one
//! user-authorized directory per connection. The executor trait, the tool
//! set handed to the stream adapter, and schema validation live here;
//! path confinement and the authorization cache are submodules.

pub mod authorize;
pub mod builtins;
pub mod confine;

pub use authorize::{AuthorizeError, DirectoryAuthorizer, DirectoryPrompt, PromptFut};
pub use confine::ConfineError;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parley_types::{StreamId, ToolDefinition};
use serde_json::Value;

/// Name of the read tool as exposed to the model.
pub const FILE_TOOL_READ_NAME: &str = "read_file";
/// Name of the write tool as exposed to the model.
pub const FILE_TOOL_WRITE_NAME: &str = "write_file";

/// Tool execution future type alias.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// Error types for tool execution.
///
/// Every variant is scoped to one tool call; none of these aborts the turn.
/// The adapter reports them as failed tool results and keeps streaming.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("bad tool args: {message}")]
    BadArgs { message: String },
    #[error(transparent)]
    Confine(#[from] ConfineError),
    #[error(transparent)]
    Authorize(#[from] AuthorizeError),
    #[error("file not found: {path}")]
    NotFound { path: String },
    #[error("{tool} failed for {path}: {message}")]
    Io {
        tool: &'static str,
        path: String,
        message: String,
    },
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },
}

/// Per-call tool context: the connection's directory grant plus the ids
/// needed to reconstruct causality from the logs.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub authorizer: Arc<DirectoryAuthorizer>,
    pub stream_id: StreamId,
    pub call_id: String,
}

/// A sandboxed capability the model may invoke.
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON Schema for the tool's input object.
    fn schema(&self) -> Value;
    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a>;
}

pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::BadArgs {
        message: e.to_string(),
    })
}

/// Validate arguments against a tool's declared JSON schema.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let validator = jsonschema::validator_for(schema).map_err(|e| ToolError::BadArgs {
        message: format!("invalid tool schema: {e}"),
    })?;
    if let Err(err) = validator.validate(args) {
        return Err(ToolError::BadArgs {
            message: err.to_string(),
        });
    }
    Ok(())
}

/// The fixed set of tools exposed to the model for one connection.
pub struct ToolSet {
    executors: HashMap<&'static str, Box<dyn ToolExecutor>>,
    authorizer: Arc<DirectoryAuthorizer>,
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.executors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ToolSet {
    /// The two file tools over the given connection's authorization cache.
    #[must_use]
    pub fn file_tools(authorizer: Arc<DirectoryAuthorizer>) -> Self {
        let mut set = Self {
            executors: HashMap::new(),
            authorizer,
        };
        set.register(Box::new(builtins::ReadFileTool::default()));
        set.register(Box::new(builtins::WriteFileTool::default()));
        set
    }

    fn register(&mut self, executor: Box<dyn ToolExecutor>) {
        self.executors.insert(executor.name(), executor);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Tool manifest sent to the model, sorted by name for stable requests.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .executors
            .values()
            .map(|exec| ToolDefinition::new(exec.name(), exec.description(), exec.schema()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Validate and execute one tool call.
    ///
    /// Failures are returned, never swallowed; the caller decides how to
    /// report them (the adapter turns them into failed tool results).
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        stream_id: StreamId,
        call_id: &str,
    ) -> Result<Value, ToolError> {
        let executor = self
            .executors
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool {
                name: name.to_string(),
            })?;

        validate_args(&executor.schema(), &args)?;

        let ctx = ToolCtx {
            authorizer: self.authorizer.clone(),
            stream_id,
            call_id: call_id.to_string(),
        };
        tracing::debug!(%stream_id, call_id, tool = name, "tool invocation started");
        match executor.execute(args, &ctx).await {
            Ok(output) => {
                tracing::info!(%stream_id, call_id, tool = name, ok = true, "tool invocation finished");
                Ok(output)
            }
            Err(error) => {
                tracing::warn!(%stream_id, call_id, tool = name, %error, "tool invocation failed");
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definitions_are_sorted_and_complete() {
        let set = ToolSet::file_tools(Arc::new(DirectoryAuthorizer::new(None)));
        let defs = set.definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![FILE_TOOL_READ_NAME, FILE_TOOL_WRITE_NAME]);
        assert!(defs.iter().all(|d| !d.description.is_empty()));
    }

    #[test]
    fn validate_args_rejects_wrong_shape() {
        let set = ToolSet::file_tools(Arc::new(DirectoryAuthorizer::new(None)));
        let schema = set
            .definitions()
            .into_iter()
            .find(|d| d.name == FILE_TOOL_READ_NAME)
            .unwrap()
            .parameters;
        assert!(validate_args(&schema, &json!({"path": "a.txt"})).is_ok());
        assert!(validate_args(&schema, &json!({"path": 7})).is_err());
        assert!(validate_args(&schema, &json!({})).is_err());
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let set = ToolSet::file_tools(Arc::new(DirectoryAuthorizer::new(None)));
        let err = set
            .invoke("shell", json!({}), StreamId::mint(), "call_1")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool { .. }));
    }
}
