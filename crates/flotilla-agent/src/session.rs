use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::types::{
    ContentBlock, InferenceResponse, Message, SessionId, StreamEvent, ToolContext, Usage,
};

use crate::agent::Agent;
use crate::structured::{parse_structured_object, structured_output_error, JSON_RETRY_PROMPT};

/// Default buffer of the streaming observer channel.
pub const DEFAULT_OBSERVER_CAPACITY: usize = 100;

/// Outcome of one executed tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallOutcome {
    pub call_id: String,
    pub tool: String,
    pub input: Value,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The `path` parameter of the call, if it has one.
    pub fn path(&self) -> Option<&str> {
        self.input.get("path").and_then(Value::as_str)
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunResult {
    /// Final answer text.
    pub response: String,
    /// Every tool call executed during the run, in execution order.
    pub tool_calls: Vec<ToolCallOutcome>,
    pub usage: Usage,
    pub steps: usize,
}

/// Structured answer plus the run that produced it.
#[derive(Debug, Clone)]
pub struct StructuredRun {
    pub output: Map<String, Value>,
    pub result: RunResult,
}

/// Progress of a streaming run.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A decoded provider event, forwarded as it arrives.
    Stream(StreamEvent),
    ToolStarted {
        call_id: String,
        tool: String,
        input: Value,
    },
    ToolFinished(ToolCallOutcome),
}

/// One conversation with an agent.
///
/// History is append-only apart from [`Session::clear`]. Clones share the same
/// history.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    agent: Arc<Agent>,
    work_dir: PathBuf,
    history: Arc<RwLock<Vec<Message>>>,
    observer_capacity: usize,
}

impl Session {
    pub fn new(agent: Arc<Agent>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: SessionId::new(),
            agent,
            work_dir: work_dir.into(),
            history: Arc::new(RwLock::new(Vec::new())),
            observer_capacity: DEFAULT_OBSERVER_CAPACITY,
        }
    }

    pub fn with_observer_capacity(mut self, capacity: usize) -> Self {
        self.observer_capacity = capacity.max(1);
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// A copy of the history.
    pub async fn history(&self) -> Vec<Message> {
        self.history.read().await.clone()
    }

    /// Append a message without running, e.g. to replay stored history.
    pub async fn add_message(&self, message: Message) {
        self.history.write().await.push(message);
    }

    pub async fn clear(&self) {
        self.history.write().await.clear();
    }

    /// Run the agent loop to a final answer using blocking inference calls.
    pub async fn run(&self, prompt: &str, cancel: CancellationToken) -> Result<RunResult> {
        self.drive(prompt, &cancel, None).await
    }

    /// Run the agent loop using streaming inference.
    ///
    /// The loop runs on a background task; every decoded event and tool call
    /// is forwarded to the returned [`SessionStream`] as it happens.
    pub fn run_stream(&self, prompt: &str, cancel: CancellationToken) -> SessionStream {
        let (tx, rx) = mpsc::channel(self.observer_capacity);
        let session = self.clone();
        let prompt = prompt.to_string();
        let handle =
            tokio::spawn(async move { session.drive(&prompt, &cancel, Some(&tx)).await });
        SessionStream {
            rx,
            handle: Some(handle),
            current: None,
            outcome: None,
        }
    }

    /// Run and parse the answer as a JSON object, retrying once with a
    /// corrective prompt if it does not parse.
    pub async fn run_structured(&self, prompt: &str, cancel: CancellationToken) -> Result<StructuredRun> {
        let first = self.run(prompt, cancel.clone()).await?;
        if let Ok(output) = parse_structured_object(&first.response) {
            return Ok(StructuredRun { output, result: first });
        }

        debug!(session_id = %self.id, "Answer is not a JSON object, retrying");
        let retry = self.run(JSON_RETRY_PROMPT, cancel).await?;
        match parse_structured_object(&retry.response) {
            Ok(output) => Ok(StructuredRun { output, result: retry }),
            Err(e) => Err(structured_output_error(
                &format!("agent {:?}", self.agent.name()),
                &e,
                &retry.response,
            )),
        }
    }

    async fn drive(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        observer: Option<&mpsc::Sender<SessionEvent>>,
    ) -> Result<RunResult> {
        self.add_message(Message::user(prompt)).await;

        let max_steps = self.agent.max_steps();
        let mut usage = Usage::default();
        let mut tool_calls = Vec::new();

        for step in 1..=max_steps {
            if cancel.is_cancelled() {
                return Err(FlotillaError::Cancelled);
            }
            debug!(session_id = %self.id, agent = %self.agent.name(), step, "Starting step");

            let request = self.agent.request(self.history().await);
            let response = match observer {
                Some(tx) => self.stream_turn(request, cancel, tx).await?,
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(FlotillaError::Cancelled),
                        r = self.agent.provider().run_inference(request, cancel.clone()) => r?,
                    }
                }
            };

            usage.add(&response.usage);
            self.add_message(Message::assistant(response.content.clone())).await;

            if !response.has_tool_calls() {
                info!(
                    session_id = %self.id,
                    agent = %self.agent.name(),
                    steps = step,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Run complete"
                );
                return Ok(RunResult {
                    response: response.text(),
                    tool_calls,
                    usage,
                    steps: step,
                });
            }

            let mut results = Vec::new();
            for (call_id, name, input) in response.tool_calls() {
                let outcome = self.execute_tool(call_id, name, input, cancel, observer).await;
                if cancel.is_cancelled() {
                    return Err(FlotillaError::Cancelled);
                }
                results.push(match &outcome.error {
                    Some(error) => ContentBlock::tool_result(call_id, error.as_str(), true),
                    None => ContentBlock::tool_result(call_id, outcome.output.as_str(), false),
                });
                tool_calls.push(outcome);
            }
            self.add_message(Message::tool_results(results)).await;
        }

        warn!(session_id = %self.id, agent = %self.agent.name(), max_steps, "Step budget exhausted");
        Err(FlotillaError::max_steps_exceeded(max_steps))
    }

    async fn stream_turn(
        &self,
        request: flotilla_core::types::InferenceRequest,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> Result<InferenceResponse> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FlotillaError::Cancelled),
            r = self.agent.provider().stream_inference(request, cancel.clone()) => r?,
        };

        while stream.next().await {
            if let Some(event) = stream.event() {
                forward(tx, SessionEvent::Stream(event.clone()), cancel).await;
            }
        }

        let outcome = match stream.take_err() {
            Some(err) => Err(err),
            None => Ok(stream.response().clone()),
        };
        stream.close();
        outcome
    }

    async fn execute_tool(
        &self,
        call_id: &str,
        name: &str,
        input: &Value,
        cancel: &CancellationToken,
        observer: Option<&mpsc::Sender<SessionEvent>>,
    ) -> ToolCallOutcome {
        if let Some(tx) = observer {
            let started = SessionEvent::ToolStarted {
                call_id: call_id.to_string(),
                tool: name.to_string(),
                input: input.clone(),
            };
            forward(tx, started, cancel).await;
        }

        let ctx = ToolContext::new(&self.work_dir).with_cancel(cancel.clone());
        let result = self.agent.tools().execute(name, input.clone(), ctx).await;
        let (output, error) = match result {
            Ok(output) => (output, None),
            Err(e) => {
                warn!(session_id = %self.id, tool = %name, error = %e, "Tool execution failed");
                (String::new(), Some(e.to_string()))
            }
        };

        let outcome = ToolCallOutcome {
            call_id: call_id.to_string(),
            tool: name.to_string(),
            input: input.clone(),
            output,
            error,
        };
        if let Some(tx) = observer {
            forward(tx, SessionEvent::ToolFinished(outcome.clone()), cancel).await;
        }
        outcome
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("agent", &self.agent.name())
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

/// Send to the observer, waiting for room. A dropped receiver is not an error.
async fn forward(tx: &mpsc::Sender<SessionEvent>, event: SessionEvent, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tx.send(event) => {}
    }
}

/// Cursor over a streaming run.
///
/// `next` returns false once the run has finished; `err` and `result` then
/// report how it ended.
pub struct SessionStream {
    rx: mpsc::Receiver<SessionEvent>,
    handle: Option<JoinHandle<Result<RunResult>>>,
    current: Option<SessionEvent>,
    outcome: Option<Result<RunResult>>,
}

impl SessionStream {
    pub async fn next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(event) => {
                self.current = Some(event);
                true
            }
            None => {
                self.current = None;
                self.finish().await;
                false
            }
        }
    }

    /// The event produced by the latest `next`.
    pub fn event(&self) -> Option<&SessionEvent> {
        self.current.as_ref()
    }

    pub fn err(&self) -> Option<&FlotillaError> {
        self.outcome.as_ref().and_then(|o| o.as_ref().err())
    }

    pub fn result(&self) -> Option<&RunResult> {
        self.outcome.as_ref().and_then(|o| o.as_ref().ok())
    }

    /// Drain the remaining events and return the outcome of the run.
    pub async fn into_result(mut self) -> Result<RunResult> {
        while self.next().await {}
        self.outcome
            .take()
            .unwrap_or_else(|| Err(FlotillaError::streaming_failed("session stream has no outcome")))
    }

    async fn finish(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.outcome = Some(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(FlotillaError::streaming_failed(format!("session task failed: {}", e))),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::error::ErrorKind;
    use flotilla_test_utils::{
        json_response, text_response, tool_response, EchoTool, FailingTool, ScriptedProvider,
    };
    use flotilla_tools::builtin::ReadTool;
    use serde_json::json;

    fn agent(provider: ScriptedProvider) -> Arc<Agent> {
        Arc::new(
            Agent::builder("tester")
                .provider(Arc::new(provider))
                .tool(EchoTool)
                .tool(FailingTool("broken"))
                .tool(ReadTool)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_run_without_tools() {
        let session = Session::new(agent(ScriptedProvider::new(vec![text_response("hello")])), ".");
        let result = session.run("hi", CancellationToken::new()).await.unwrap();
        assert_eq!(result.response, "hello");
        assert_eq!(result.steps, 1);
        assert!(result.tool_calls.is_empty());
        assert_eq!(session.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_tool_calls_run_in_order_and_errors_are_fed_back() {
        let provider = ScriptedProvider::new(vec![
            tool_response(vec![
                ("c1", "echo", json!({"n": 1})),
                ("c2", "broken", json!({})),
                ("c3", "missing", json!({})),
            ]),
            text_response("done"),
        ]);
        let session = Session::new(agent(provider), ".");
        let result = session.run("go", CancellationToken::new()).await.unwrap();

        assert_eq!(result.steps, 2);
        let ids: Vec<&str> = result.tool_calls.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert_eq!(result.tool_calls[0].output, r#"{"n":1}"#);
        assert!(result.tool_calls[1].error.as_deref().unwrap().contains("scripted failure"));
        assert!(result.tool_calls[2].error.as_deref().unwrap().contains("not found"));
        assert_eq!(result.usage.input_tokens, 20);

        let history = session.history().await;
        assert_eq!(history.len(), 4);
        match &history[2].content[1] {
            ContentBlock::ToolResult { tool_use_id, is_error, .. } => {
                assert_eq!(tool_use_id, "c2");
                assert!(is_error);
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_steps_exceeded() {
        let provider = ScriptedProvider::from_fn(|_| {
            Ok(tool_response(vec![("c", "echo", json!({}))]))
        });
        let agent = Agent::builder("looper")
            .provider(Arc::new(provider))
            .tool(EchoTool)
            .max_steps(3)
            .build()
            .unwrap();
        let session = Session::new(Arc::new(agent), ".");
        let err = session.run("spin", CancellationToken::new()).await.unwrap_err();
        assert!(err.is(ErrorKind::MaxStepsExceeded));
        assert_eq!(err.to_string(), "max_steps_exceeded: exceeded maximum steps (3)");
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let provider = ScriptedProvider::from_results(vec![Err(FlotillaError::rate_limit("429"))]);
        let session = Session::new(agent(provider), ".");
        let err = session.run("hi", CancellationToken::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let session = Session::new(agent(ScriptedProvider::new(vec![text_response("x")])), ".");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = session.run("hi", cancel).await.unwrap_err();
        assert!(matches!(err, FlotillaError::Cancelled));
    }

    #[tokio::test]
    async fn test_stream_forwards_events_and_tools() {
        let provider = ScriptedProvider::new(vec![
            tool_response(vec![("c1", "echo", json!({"q": "x"}))]),
            text_response("final"),
        ]);
        let session = Session::new(agent(provider), ".");
        let mut stream = session.run_stream("go", CancellationToken::new());

        let mut stream_events = 0;
        let mut started = Vec::new();
        let mut finished = Vec::new();
        while stream.next().await {
            match stream.event().unwrap() {
                SessionEvent::Stream(_) => stream_events += 1,
                SessionEvent::ToolStarted { tool, .. } => started.push(tool.clone()),
                SessionEvent::ToolFinished(outcome) => finished.push(outcome.output.clone()),
            }
        }

        assert!(stream.err().is_none());
        assert_eq!(stream.result().unwrap().response, "final");
        assert_eq!(started, vec!["echo"]);
        assert_eq!(finished, vec![r#"{"q":"x"}"#]);
        assert!(stream_events >= 10);
    }

    #[tokio::test]
    async fn test_stream_reports_error() {
        let provider = ScriptedProvider::from_results(vec![Err(FlotillaError::provider_unavailable("503"))]);
        let session = Session::new(agent(provider), ".");
        let mut stream = session.run_stream("go", CancellationToken::new());
        while stream.next().await {}
        assert!(stream.err().unwrap().is(ErrorKind::ProviderUnavailable));
        assert!(stream.result().is_none());
    }

    #[tokio::test]
    async fn test_structured_retry() {
        let provider = ScriptedProvider::new(vec![
            text_response("Sure! Here it is."),
            json_response(json!({"ok": true})),
        ]);
        let session = Session::new(agent(provider), ".");
        let run = session.run_structured("answer", CancellationToken::new()).await.unwrap();
        assert_eq!(run.output["ok"], json!(true));
        let history = session.history().await;
        assert_eq!(history[2].text(), JSON_RETRY_PROMPT);
    }

    #[tokio::test]
    async fn test_structured_failure_has_preview() {
        let provider = ScriptedProvider::new(vec![text_response("nope"), text_response("still nope")]);
        let session = Session::new(agent(provider), ".");
        let err = session.run_structured("answer", CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("response preview: still nope"));
    }

    #[tokio::test]
    async fn test_clear_and_replay() {
        let session = Session::new(agent(ScriptedProvider::new(vec![])), ".");
        session.add_message(Message::user("earlier")).await;
        assert_eq!(session.history().await.len(), 1);
        session.clear().await;
        assert!(session.history().await.is_empty());
    }
}
