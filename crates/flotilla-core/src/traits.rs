use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{FlotillaError, Result};
use crate::types::*;

/// Model provider: one synchronous and one streaming entry point.
pub trait Provider: Send + Sync + 'static {
    /// Provider id (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Run one model turn and wait for the complete response.
    fn run_inference(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<InferenceResponse>>;

    /// Start one model turn and return a pull-based event stream.
    fn stream_inference(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Box<dyn InferenceStream>>>;
}

/// Pull-based cursor over a streamed model turn.
///
/// `next` advances to the following event and returns false once the stream
/// has terminated (normally or with an error). After that `err` reports the
/// failure, if any, and `response` holds the accumulated turn.
pub trait InferenceStream: Send {
    fn next(&mut self) -> BoxFuture<'_, bool>;

    /// The event produced by the latest successful `next`.
    fn event(&self) -> Option<&StreamEvent>;

    fn err(&self) -> Option<&FlotillaError>;

    /// Move the terminal error out of the stream.
    fn take_err(&mut self) -> Option<FlotillaError>;

    /// The response accumulated so far.
    fn response(&self) -> &InferenceResponse;

    /// Release the underlying transport. Safe to call more than once.
    fn close(&mut self);
}

/// Tool: uniform `execute(input, work_dir)` contract.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }

    /// Execute the tool with given input and context.
    fn execute(&self, input: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, Result<String>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Whether this tool writes to files in the working directory.
    fn mutates_files(&self) -> bool {
        false
    }
}
