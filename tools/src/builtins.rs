//! Built-in tool executors: `read_file` and `write_file`.

use std::io::ErrorKind;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    FILE_TOOL_READ_NAME, FILE_TOOL_WRITE_NAME, ToolCtx, ToolError, ToolExecutor, ToolFut,
    parse_args,
};
use crate::confine;

/// Upper bound on file content returned to the model.
const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct ReadFileTool;

#[derive(Debug, Default)]
pub struct WriteFileTool;

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

fn io_error(tool: &'static str, path: &Path, error: &std::io::Error) -> ToolError {
    if error.kind() == ErrorKind::NotFound {
        ToolError::NotFound {
            path: path.to_string_lossy().into_owned(),
        }
    } else {
        ToolError::Io {
            tool,
            path: path.to_string_lossy().into_owned(),
            message: error.to_string(),
        }
    }
}

impl ToolExecutor for ReadFileTool {
    fn name(&self) -> &'static str {
        FILE_TOOL_READ_NAME
    }

    fn description(&self) -> &'static str {
        "Read UTF-8 text from a file inside the authorized directory"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path. Can be relative to the authorized directory."
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: ReadFileArgs = parse_args(&args)?;
            let root = ctx.authorizer.ensure_authorized().await?;
            let resolved = confine::resolve_within(&root, &typed.path)?;

            let meta = tokio::fs::metadata(&resolved)
                .await
                .map_err(|e| io_error(FILE_TOOL_READ_NAME, &resolved, &e))?;
            if meta.is_dir() {
                return Err(ToolError::Io {
                    tool: FILE_TOOL_READ_NAME,
                    path: resolved.to_string_lossy().into_owned(),
                    message: "path is a directory".to_string(),
                });
            }
            if meta.len() > MAX_READ_BYTES {
                return Err(ToolError::Io {
                    tool: FILE_TOOL_READ_NAME,
                    path: resolved.to_string_lossy().into_owned(),
                    message: format!("file exceeds {MAX_READ_BYTES} byte read limit"),
                });
            }

            let content = tokio::fs::read_to_string(&resolved)
                .await
                .map_err(|e| io_error(FILE_TOOL_READ_NAME, &resolved, &e))?;

            Ok(json!({
                "path": confine::display_relative(&resolved, &root),
                "content": content,
            }))
        })
    }
}

impl ToolExecutor for WriteFileTool {
    fn name(&self) -> &'static str {
        FILE_TOOL_WRITE_NAME
    }

    fn description(&self) -> &'static str {
        "Write UTF-8 text to a file inside the authorized directory"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Target file path. Can be relative to the authorized directory."
                },
                "content": {
                    "type": "string",
                    "description": "UTF-8 text content to write."
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: WriteFileArgs = parse_args(&args)?;
            let root = ctx.authorizer.ensure_authorized().await?;
            let resolved = confine::resolve_within(&root, &typed.path)?;

            if let Some(parent) = resolved.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(FILE_TOOL_WRITE_NAME, &resolved, &e))?;
            }
            tokio::fs::write(&resolved, &typed.content)
                .await
                .map_err(|e| io_error(FILE_TOOL_WRITE_NAME, &resolved, &e))?;

            Ok(json!({
                "path": confine::display_relative(&resolved, &root),
                "bytes_written": typed.content.len(),
            }))
        })
    }
}
