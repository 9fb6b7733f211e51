use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::Tool;
use flotilla_core::types::ToolContext;

use super::parse_input;

const MAX_OUTPUT: usize = 30_000;

pub struct BashTool;

#[derive(Deserialize)]
struct BashInput {
    command: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn default_timeout() -> u64 {
    120
}

impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command in the working directory. Returns stdout and stderr. \
         Use for running scripts, builds, or other shell operations."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 120)",
                    "default": 120
                }
            },
            "required": ["command"]
        })
    }

    fn execute(&self, input: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let params: BashInput = parse_input("bash", input)?;
            if params.command.trim().is_empty() {
                return Err(FlotillaError::invalid_input("bash: command is required"));
            }

            debug!(command = %params.command, work_dir = %ctx.work_dir.display(), "Executing bash command");

            let child = tokio::process::Command::new("bash")
                .arg("-c")
                .arg(&params.command)
                .current_dir(&ctx.work_dir)
                .kill_on_drop(true)
                .output();

            let timeout = Duration::from_secs(params.timeout);
            let output = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(FlotillaError::Cancelled),
                r = tokio::time::timeout(timeout, child) => match r {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return Err(FlotillaError::tool_failed("bash", e)),
                    Err(_) => {
                        return Err(FlotillaError::timeout(format!(
                            "bash command after {}s",
                            params.timeout
                        )))
                    }
                },
            };

            let content = combine_output(&output.stdout, &output.stderr);
            if output.status.success() {
                Ok(content)
            } else {
                let code = output.status.code().unwrap_or(-1);
                Err(FlotillaError::tool_failed(
                    "bash",
                    format!("exit code {}\n{}", code, content),
                ))
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        // The per-command timeout governs; this is the outer ceiling.
        600
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);

    let mut content = String::new();
    content.push_str(&stdout);
    if !stderr.is_empty() {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str("STDERR:\n");
        content.push_str(&stderr);
    }

    if content.len() > MAX_OUTPUT {
        let mut cut = MAX_OUTPUT;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
        content.push_str("\n... (output truncated)");
    }

    if content.is_empty() {
        content = "(no output)".to_string();
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::error::ErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_runs_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = BashTool
            .execute(json!({"command": "ls"}), ToolContext::new(dir.path()))
            .await
            .unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = BashTool
            .execute(
                json!({"command": "echo oops >&2; exit 3"}),
                ToolContext::new(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::ToolFailed));
        assert!(err.to_string().contains("exit code 3"));
        assert!(err.to_string().contains("STDERR:\noops"));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let err = BashTool
            .execute(
                json!({"command": "sleep 5", "timeout": 1}),
                ToolContext::new(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::Timeout));
    }

    #[test]
    fn test_empty_output_placeholder() {
        assert_eq!(combine_output(b"", b""), "(no output)");
        assert_eq!(combine_output(b"a\n", b"b"), "a\n\nSTDERR:\nb");
    }
}
