use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::Tool;
use flotilla_core::types::ToolContext;

use super::{parse_input, resolve_path};

pub struct EditTool;

#[derive(Deserialize)]
struct EditInput {
    path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit an existing file by replacing a specific string with new content. \
         The old_string must match exactly (including whitespace and indentation) \
         and be unique unless replace_all is true."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory or absolute"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact text to find and replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default: false)",
                    "default": false
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    fn execute(&self, input: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let params: EditInput = parse_input("edit", input)?;
            if params.old_string.is_empty() {
                return Err(FlotillaError::invalid_input("edit: old_string is required"));
            }
            let path = resolve_path(&params.path, &ctx.work_dir);
            debug!(path = %path.display(), replace_all = params.replace_all, "Editing file");

            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                FlotillaError::tool_failed("edit", format!("failed to read file: {}", e))
            })?;

            let count = content.matches(&params.old_string).count();
            if count == 0 {
                return Err(FlotillaError::tool_failed("edit", "old_string not found in file"));
            }
            if count > 1 && !params.replace_all {
                return Err(FlotillaError::tool_failed(
                    "edit",
                    format!(
                        "old_string found {} times, must be unique (add more context or set replace_all)",
                        count
                    ),
                ));
            }

            let updated = if params.replace_all {
                content.replace(&params.old_string, &params.new_string)
            } else {
                content.replacen(&params.old_string, &params.new_string, 1)
            };

            tokio::fs::write(&path, updated).await.map_err(|e| {
                FlotillaError::tool_failed("edit", format!("failed to write file: {}", e))
            })?;

            Ok(if params.replace_all {
                format!("Replaced {} occurrences in {}", count, path.display())
            } else {
                format!("Successfully edited {}", path.display())
            })
        })
    }

    fn mutates_files(&self) -> bool {
        true
    }
}
