use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::Tool;
use flotilla_core::types::ToolContext;

use super::parse_input;

pub struct WebFetchTool;

#[derive(Deserialize)]
struct WebFetchInput {
    url: String,
    #[serde(default)]
    max_length: Option<usize>,
}

impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch content from a URL. HTML is reduced to plain text; output is truncated to max_length characters."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to fetch"
                },
                "max_length": {
                    "type": "integer",
                    "description": "Maximum characters to return (default: 30000)"
                }
            },
            "required": ["url"]
        })
    }

    fn execute(&self, input: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let params: WebFetchInput = parse_input("web_fetch", input)?;
            if !(params.url.starts_with("http://") || params.url.starts_with("https://")) {
                return Err(FlotillaError::invalid_input(
                    "web_fetch: url must start with http:// or https://",
                ));
            }
            let max_length = params.max_length.unwrap_or(30_000);
            debug!(url = %params.url, "Fetching URL");

            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent(concat!("flotilla/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| FlotillaError::tool_failed("web_fetch", e))?;

            let resp = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(FlotillaError::Cancelled),
                r = client.get(&params.url).send() => {
                    r.map_err(|e| FlotillaError::tool_failed("web_fetch", format!("request failed: {}", e)))?
                }
            };

            let status = resp.status();
            if !status.is_success() {
                return Err(FlotillaError::tool_failed(
                    "web_fetch",
                    format!(
                        "HTTP {} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Unknown")
                    ),
                ));
            }

            let is_html = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.contains("html"));

            let body = resp.text().await.map_err(|e| {
                FlotillaError::tool_failed("web_fetch", format!("failed to read body: {}", e))
            })?;

            let text = if is_html { strip_html(&body)? } else { body };
            Ok(truncate_chars(text, max_length))
        })
    }

    fn timeout_secs(&self) -> u64 {
        60
    }
}

fn strip_html(html: &str) -> Result<String> {
    let compile = |p: &str| {
        Regex::new(p).map_err(|e| FlotillaError::tool_failed("web_fetch", e))
    };
    let cleaned = compile(r"(?is)<(script|style)[^>]*>.*?</(script|style)>")?.replace_all(html, "");
    let text = compile(r"<[^>]+>")?.replace_all(&cleaned, "");
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    let text = compile(r"\n{3,}")?.replace_all(&text, "\n\n");
    Ok(text.trim().to_string())
}

fn truncate_chars(text: String, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}\n\n[truncated at {} chars]", &text[..cut], max),
        None => text,
    }
}
