use std::path::PathBuf;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::Tool;
use flotilla_core::types::ToolContext;

use super::{parse_input, resolve_path};

const MAX_RESULTS: usize = 1000;

pub struct GlobTool;

#[derive(Deserialize)]
struct GlobInput {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern (e.g. \"**/*.md\"). \
         Returns matching paths relative to the working directory, newest first."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern to match files (e.g. \"**/*.rs\", \"docs/*.md\")"
                },
                "path": {
                    "type": "string",
                    "description": "Base directory to search from (default: working directory)"
                }
            },
            "required": ["pattern"]
        })
    }

    fn execute(&self, input: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let params: GlobInput = parse_input("glob", input)?;

            let base = match params.path.as_deref().filter(|p| !p.is_empty()) {
                Some(p) => resolve_path(p, &ctx.work_dir),
                None => ctx.work_dir.clone(),
            };
            let full_pattern = base.join(&params.pattern).to_string_lossy().to_string();
            debug!(pattern = %full_pattern, "Glob search");

            let entries = glob::glob(&full_pattern).map_err(|e| {
                FlotillaError::invalid_input(format!("glob: invalid pattern: {}", e))
            })?;
            let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).collect();

            paths.sort_by(|a, b| {
                let mtime_a = a.metadata().and_then(|m| m.modified()).ok();
                let mtime_b = b.metadata().and_then(|m| m.modified()).ok();
                mtime_b.cmp(&mtime_a).then_with(|| a.cmp(b))
            });
            paths.truncate(MAX_RESULTS);

            if paths.is_empty() {
                return Ok(format!("No files found matching pattern: {}", params.pattern));
            }

            let listing = paths
                .iter()
                .map(|p| {
                    p.strip_prefix(&ctx.work_dir)
                        .unwrap_or(p)
                        .display()
                        .to_string()
                })
                .collect::<Vec<_>>()
                .join("\n");
            Ok(listing)
        })
    }
}
