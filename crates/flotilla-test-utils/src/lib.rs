//! Mocks and fixtures shared by the flotilla test suites.
//!
//! [`ScriptedProvider`] replays canned responses. Streaming calls render the
//! response as an `event:`/`data:` feed and run it through the real
//! [`StreamDecoder`], so session code under test sees exactly the events a
//! live provider would produce.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::{InferenceStream, Provider, Tool};
use flotilla_core::types::*;
use flotilla_llm::streaming::encode_event;
use flotilla_llm::StreamDecoder;

type Responder = Arc<dyn Fn(&InferenceRequest) -> Result<InferenceResponse> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<Result<InferenceResponse>>>),
    Func(Responder),
}

/// A provider that answers from a script instead of the network.
pub struct ScriptedProvider {
    script: Script,
    requests: Mutex<Vec<InferenceRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    /// Answer calls with `responses` in order; later calls fail.
    pub fn new(responses: Vec<InferenceResponse>) -> Self {
        Self::from_results(responses.into_iter().map(Ok).collect())
    }

    pub fn from_results(results: Vec<Result<InferenceResponse>>) -> Self {
        Self::with_script(Script::Queue(Mutex::new(results.into())))
    }

    /// Answer every call by applying `f` to the request.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&InferenceRequest) -> Result<InferenceResponse> + Send + Sync + 'static,
    {
        Self::with_script(Script::Func(Arc::new(f)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Hold every call for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn answer(&self, request: InferenceRequest, cancel: &CancellationToken) -> Result<InferenceResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = async {
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FlotillaError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let answer = match &self.script {
                Script::Queue(queue) => queue.lock().unwrap().pop_front().unwrap_or_else(|| {
                    Err(FlotillaError::invalid_input("scripted provider exhausted"))
                }),
                Script::Func(f) => f(&request),
            };
            self.requests.lock().unwrap().push(request);
            answer
        }
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run_inference(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<InferenceResponse>> {
        Box::pin(async move { self.answer(request, &cancel).await })
    }

    fn stream_inference(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn InferenceStream>>> {
        Box::pin(async move {
            let response = self.answer(request, &cancel).await?;
            let decoder = StreamDecoder::from_chunks(render_sse(&response)).with_cancel(cancel);
            Ok(Box::new(decoder) as Box<dyn InferenceStream>)
        })
    }
}

/// Render a response as the wire feed a streaming provider would send.
///
/// Tool input JSON is split in two deltas to exercise partial accumulation.
pub fn render_sse(response: &InferenceResponse) -> Vec<Bytes> {
    let mut out = Vec::new();
    let mut push = |name: &str, data: Value| {
        out.push(Bytes::from(encode_event(name, &data.to_string())));
    };

    push(
        "message_start",
        json!({"type": "message_start", "message": {
            "id": response.id,
            "usage": {"input_tokens": response.usage.input_tokens, "output_tokens": 0}
        }}),
    );

    for (index, block) in response.content.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => {
                push(
                    "content_block_start",
                    json!({"type": "content_block_start", "index": index,
                           "content_block": {"type": "text", "text": ""}}),
                );
                push(
                    "content_block_delta",
                    json!({"type": "content_block_delta", "index": index,
                           "delta": {"type": "text_delta", "text": text}}),
                );
            }
            ContentBlock::ToolUse { id, name, input } => {
                push(
                    "content_block_start",
                    json!({"type": "content_block_start", "index": index,
                           "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}}),
                );
                let raw = input.to_string();
                let mid = raw
                    .char_indices()
                    .map(|(i, _)| i)
                    .nth(raw.chars().count() / 2)
                    .unwrap_or(0);
                for part in [&raw[..mid], &raw[mid..]] {
                    push(
                        "content_block_delta",
                        json!({"type": "content_block_delta", "index": index,
                               "delta": {"type": "input_json_delta", "partial_json": part}}),
                    );
                }
            }
            ContentBlock::ToolResult { .. } => continue,
        }
        push(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        );
    }

    let stop_reason = response.stop_reason.as_ref().map(|r| r.as_str().to_string());
    push(
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": stop_reason},
               "usage": {"output_tokens": response.usage.output_tokens}}),
    );
    push("message_stop", json!({"type": "message_stop"}));
    out
}

/// A final answer consisting of one text block.
pub fn text_response(text: impl Into<String>) -> InferenceResponse {
    InferenceResponse {
        id: "msg_text".into(),
        content: vec![ContentBlock::text(text)],
        stop_reason: Some(StopReason::EndTurn),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

/// A final answer whose text is `value` serialized as JSON.
pub fn json_response(value: Value) -> InferenceResponse {
    text_response(value.to_string())
}

/// A turn requesting the given `(id, tool, input)` calls.
pub fn tool_response(calls: Vec<(&str, &str, Value)>) -> InferenceResponse {
    InferenceResponse {
        id: "msg_tools".into(),
        content: calls
            .into_iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            })
            .collect(),
        stop_reason: Some(StopReason::ToolUse),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

/// The text of the last user message in a request.
pub fn last_user_text(request: &InferenceRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User && !m.text().is_empty())
        .map(|m| m.text())
        .unwrap_or_default()
}

/// Returns its input as JSON text.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Ok(input.to_string()) })
    }
}

/// Always fails with `tool_failed`.
pub struct FailingTool(pub &'static str);

impl Tool for FailingTool {
    fn name(&self) -> &str {
        self.0
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn execute(&self, _input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Err(FlotillaError::tool_failed(self.0, "scripted failure")) })
    }
}
