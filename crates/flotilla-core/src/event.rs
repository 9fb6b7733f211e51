use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a formation observability event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormationEventKind {
    RunStart,
    RunEnd,
    NodeStart,
    NodeOutput,
    NodeEnd,
    NodeError,
    EdgeEmit,
    ToolCall,
}

/// A timestamped event emitted while a formation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormationEvent {
    #[serde(rename = "type")]
    pub kind: FormationEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub ts: String,
}

impl FormationEvent {
    /// New event stamped with the current UTC time (RFC 3339).
    pub fn new(kind: FormationEventKind) -> Self {
        Self {
            kind,
            node_id: None,
            from: None,
            to: None,
            count: None,
            worker: None,
            tool: None,
            call_id: None,
            path: None,
            output: None,
            error: None,
            status: None,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self.to = Some(to.into());
        self.count = Some(1);
        self
    }

    /// Worker names are only attached when non-empty.
    pub fn worker(mut self, worker: Option<&str>) -> Self {
        self.worker = worker.filter(|w| !w.is_empty()).map(str::to_string);
        self
    }

    pub fn tool(mut self, tool: impl Into<String>, call_id: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self.call_id = Some(call_id.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        if !path.is_empty() {
            self.path = Some(path);
        }
        self
    }

    pub fn output(mut self, output: serde_json::Map<String, serde_json::Value>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// Callback receiving formation events. Purely observational.
pub type EventSink = Arc<dyn Fn(FormationEvent) + Send + Sync>;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FormationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FormationEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FormationEvent> {
        self.tx.subscribe()
    }

    /// A sink that publishes every event on this bus.
    pub fn sink(self: &Arc<Self>) -> EventSink {
        let bus = Arc::clone(self);
        Arc::new(move |event| bus.publish(event))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
