use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::Tool;
use flotilla_core::types::ToolContext;

use super::{parse_input, resolve_path};

pub struct WriteTool;

#[derive(Deserialize)]
struct WriteInput {
    path: String,
    content: String,
}

impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file and parent directories if they don't exist. Overwrites existing content."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory or absolute"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn execute(&self, input: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let params: WriteInput = parse_input("write", input)?;
            if params.path.is_empty() {
                return Err(FlotillaError::invalid_input("write: path is required"));
            }
            let path = resolve_path(&params.path, &ctx.work_dir);
            debug!(path = %path.display(), bytes = params.content.len(), "Writing file");

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    FlotillaError::tool_failed("write", format!("failed to create directories: {}", e))
                })?;
            }

            tokio::fs::write(&path, &params.content).await.map_err(|e| {
                FlotillaError::tool_failed("write", format!("{}: {}", path.display(), e))
            })?;

            Ok(format!("File written successfully: {}", path.display()))
        })
    }

    fn mutates_files(&self) -> bool {
        true
    }
}
