use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::trace;

use flotilla_core::error::Result;
use flotilla_core::traits::Tool;
use flotilla_core::types::{ToolContext, ToolDefinition};

/// Shared lock serializing file-mutating tool calls.
///
/// One lock is created per runtime and cloned into every registry it builds, so
/// concurrent workers sharing a working directory never interleave edits.
#[derive(Clone, Default)]
pub struct EditLock(Arc<Mutex<()>>);

impl EditLock {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Wraps a tool so each execution holds the [`EditLock`].
pub struct SerializedTool {
    inner: Arc<dyn Tool>,
    lock: EditLock,
}

impl SerializedTool {
    pub fn new(inner: Arc<dyn Tool>, lock: EditLock) -> Self {
        Self { inner, lock }
    }
}

impl Tool for SerializedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_schema(&self) -> serde_json::Value {
        self.inner.input_schema()
    }

    fn definition(&self) -> ToolDefinition {
        self.inner.definition()
    }

    fn execute(&self, input: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let _guard = self.lock.0.lock().await;
            trace!(tool = %self.inner.name(), "Acquired edit lock");
            self.inner.execute(input, ctx).await
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.inner.timeout_secs()
    }

    fn mutates_files(&self) -> bool {
        self.inner.mutates_files()
    }
}
