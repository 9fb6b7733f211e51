use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::Tool;
use flotilla_core::types::ToolContext;

use super::{parse_input, resolve_path};

const MAX_LINE: usize = 2000;

pub struct ReadTool;

#[derive(Deserialize)]
struct ReadInput {
    path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Supports a 1-indexed line offset and a line limit for large files."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the working directory or absolute"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read (default: 2000)"
                }
            },
            "required": ["path"]
        })
    }

    fn execute(&self, input: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let params: ReadInput = parse_input("read", input)?;
            let path = resolve_path(&params.path, &ctx.work_dir);
            debug!(path = %path.display(), "Reading file");

            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                FlotillaError::tool_failed("read", format!("{}: {}", path.display(), e))
            })?;

            let lines: Vec<&str> = content.lines().collect();
            let total = lines.len();
            let start = params.offset.unwrap_or(1).max(1) - 1;
            let end = start.saturating_add(params.limit.unwrap_or(2000)).min(total);

            let mut output = String::new();
            for (i, line) in lines.iter().enumerate().take(end).skip(start) {
                let shown = match line.char_indices().nth(MAX_LINE) {
                    Some((cut, _)) => &line[..cut],
                    None => line,
                };
                output.push_str(&format!("{:>6}\t{}\n", i + 1, shown));
            }

            if output.is_empty() {
                output = "(empty file)".to_string();
            }
            Ok(output)
        })
    }
}
