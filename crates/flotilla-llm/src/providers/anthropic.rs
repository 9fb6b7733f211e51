use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::{InferenceStream, Provider};
use flotilla_core::types::*;

use crate::decoder::StreamDecoder;
use crate::registry::ProviderOptions;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: u32 = 8192;
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl AnthropicProvider {
    /// Build from options; the API key falls back to `ANTHROPIC_API_KEY`.
    pub fn new(opts: &ProviderOptions) -> Result<Self> {
        let api_key = opts
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| FlotillaError::Config("Anthropic API key not set".into()))?;

        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| FlotillaError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            base_url: opts
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_API_URL.to_string()),
            model: opts
                .model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: opts.temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request<'a>(&'a self, req: &'a InferenceRequest, stream: bool) -> ApiRequest<'a> {
        ApiRequest {
            model: &self.model,
            max_tokens: req.max_tokens.filter(|m| *m > 0).unwrap_or(self.max_tokens),
            temperature: req.temperature.or(self.temperature),
            system: req.instructions.as_deref().filter(|s| !s.is_empty()),
            messages: &req.messages,
            tools: &req.tools,
            output_config: req.output_schema.as_ref().map(|schema| OutputConfig {
                format: OutputFormat {
                    format_type: "json_schema",
                    schema,
                },
            }),
            stream,
        }
    }

    async fn send(
        &self,
        body: &ApiRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let request = self
            .http
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FlotillaError::Cancelled),
            r = request => r.map_err(classify_transport)?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            warn!(status = status.as_u16(), model = %self.model, "Anthropic request rejected");
            return Err(classify_status(status, &body));
        }

        Ok(response)
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "is_empty_slice")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    output_config: Option<OutputConfig<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

fn is_empty_slice<T>(s: &&[T]) -> bool {
    s.is_empty()
}

#[derive(Serialize)]
struct OutputConfig<'a> {
    format: OutputFormat<'a>,
}

#[derive(Serialize)]
struct OutputFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    schema: &'a serde_json::Value,
}

// Anthropic API response type
#[derive(Deserialize)]
struct ApiResponse {
    id: String,
    #[serde(default)]
    content: Vec<serde_json::Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

impl From<ApiResponse> for InferenceResponse {
    fn from(resp: ApiResponse) -> Self {
        let content = resp
            .content
            .into_iter()
            // Block types outside the conversation model (e.g. thinking) are dropped
            .filter_map(|v| serde_json::from_value::<ContentBlock>(v).ok())
            .collect();
        InferenceResponse {
            id: resp.id,
            content,
            stop_reason: resp.stop_reason.map(StopReason::from),
            usage: resp.usage,
        }
    }
}

/// Map a rejected HTTP response onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> FlotillaError {
    let message = format!("HTTP {}: {}", status.as_u16(), body);
    match status.as_u16() {
        429 => FlotillaError::rate_limit(message),
        413 => FlotillaError::context_too_long(message),
        401 | 403 => FlotillaError::permission_denied(message),
        529 => FlotillaError::provider_unavailable(message),
        _ if status.is_server_error() => FlotillaError::provider_unavailable(message),
        _ if body.contains("prompt is too long") => FlotillaError::context_too_long(message),
        _ => FlotillaError::invalid_input(message),
    }
}

fn classify_transport(e: reqwest::Error) -> FlotillaError {
    if e.is_timeout() {
        FlotillaError::timeout("inference request")
    } else {
        FlotillaError::provider_unavailable(format!("request failed: {}", e))
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn run_inference(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<InferenceResponse>> {
        Box::pin(async move {
            let body = self.build_request(&request, false);
            let response = self.send(&body, &cancel).await?;

            let parsed: ApiResponse = tokio::select! {
                _ = cancel.cancelled() => return Err(FlotillaError::Cancelled),
                r = response.json() => r.map_err(|e| {
                    FlotillaError::provider_unavailable(format!("failed to parse response: {}", e))
                })?,
            };

            let response = InferenceResponse::from(parsed);
            debug!(
                id = %response.id,
                stop_reason = ?response.stop_reason,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "Inference complete"
            );
            Ok(response)
        })
    }

    fn stream_inference(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn InferenceStream>>> {
        Box::pin(async move {
            let body = self.build_request(&request, true);
            let response = self.send(&body, &cancel).await?;
            debug!(model = %self.model, "Stream opened");
            let decoder = StreamDecoder::from_response(response).with_cancel(cancel);
            Ok(Box::new(decoder) as Box<dyn InferenceStream>)
        })
    }
}
