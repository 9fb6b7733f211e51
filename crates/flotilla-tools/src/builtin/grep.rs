use std::io::Read;
use std::path::Path;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::Tool;
use flotilla_core::types::ToolContext;

use super::{parse_input, resolve_path};

const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "vendor",
    "target",
    ".idea",
    ".vscode",
    "__pycache__",
    "dist",
    "build",
];

pub struct GrepTool;

#[derive(Deserialize)]
struct GrepInput {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    include: Option<String>,
    #[serde(default)]
    max_results: Option<usize>,
}

impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regex. Returns matching lines with file paths and line numbers."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search in (default: working directory)"
                },
                "include": {
                    "type": "string",
                    "description": "Only search files whose name matches this glob (e.g. \"*.md\")"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of matching lines to return (default: 100)"
                }
            },
            "required": ["pattern"]
        })
    }

    fn execute(&self, input: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let params: GrepInput = parse_input("grep", input)?;
            let re = Regex::new(&params.pattern)
                .map_err(|e| FlotillaError::invalid_input(format!("grep: invalid regex: {}", e)))?;
            let include = params
                .include
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(glob::Pattern::new)
                .transpose()
                .map_err(|e| FlotillaError::invalid_input(format!("grep: invalid include: {}", e)))?;

            let base = match params.path.as_deref().filter(|p| !p.is_empty()) {
                Some(p) => resolve_path(p, &ctx.work_dir),
                None => ctx.work_dir.clone(),
            };
            if !base.exists() {
                return Err(FlotillaError::tool_failed(
                    "grep",
                    format!("path not found: {}", base.display()),
                ));
            }
            let max_results = params.max_results.unwrap_or(100);
            debug!(pattern = %params.pattern, path = %base.display(), "Grep search");

            let mut matches = Vec::new();
            let walker = walkdir::WalkDir::new(&base)
                .into_iter()
                .filter_entry(|e| {
                    !(e.file_type().is_dir()
                        && e.depth() > 0
                        && SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
                })
                .filter_map(|e| e.ok());

            for entry in walker {
                if matches.len() >= max_results {
                    break;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if let Some(pattern) = &include {
                    if !pattern.matches(&entry.file_name().to_string_lossy()) {
                        continue;
                    }
                }
                if is_likely_binary(path) {
                    continue;
                }
                let display = path.strip_prefix(&ctx.work_dir).unwrap_or(path);
                search_file(path, display, &re, max_results, &mut matches);
            }

            if matches.is_empty() {
                return Ok(format!("No matches found for pattern: {}", params.pattern));
            }
            Ok(matches.join("\n"))
        })
    }
}

fn search_file(path: &Path, display: &Path, re: &Regex, max_results: usize, out: &mut Vec<String>) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    for (i, line) in content.lines().enumerate() {
        if out.len() >= max_results {
            return;
        }
        if re.is_match(line) {
            out.push(format!("{}:{}: {}", display.display(), i + 1, line.trim()));
        }
    }
}

fn is_likely_binary(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return true;
    };
    let mut buf = [0u8; 512];
    match file.read(&mut buf) {
        Ok(n) => buf[..n].contains(&0),
        Err(_) => true,
    }
}
