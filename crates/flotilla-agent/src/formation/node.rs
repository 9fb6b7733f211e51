use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flotilla_core::config::RuntimeConfig;
use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::event::{EventSink, FormationEvent, FormationEventKind};
use flotilla_core::types::StreamEvent;

use crate::agent::Agent;
use crate::pool::{PoolConfig, PoolTask, SessionRunner, TaskRunner, WorkerPool};
use crate::session::{RunResult, Session, SessionEvent};
use crate::structured::{parse_structured_object, structured_output_error, JSON_RETRY_PROMPT};

use super::definition::{FleetSpec, NodeSpec};
use super::expr::{eval_item_expr, message_for, resolve_fanout_items, NodeOutputs};

const WRITE: &str = "write";
const EDIT: &str = "edit";

/// Forwards formation events to an optional sink.
#[derive(Clone, Default)]
pub(crate) struct Emitter(Option<EventSink>);

impl Emitter {
    pub(crate) fn new(sink: Option<EventSink>) -> Self {
        Self(sink)
    }

    pub(crate) fn emit(&self, event: FormationEvent) {
        if let Some(sink) = &self.0 {
            sink(event);
        }
    }
}

/// What a node execution needs from the runtime.
pub(crate) struct NodeScope<'a> {
    pub node: &'a NodeSpec,
    pub work_dir: &'a Path,
    pub emitter: &'a Emitter,
    pub config: &'a RuntimeConfig,
    pub cancel: &'a CancellationToken,
}

/// A session run plus what was observed about file writes along the way.
#[derive(Debug, Default)]
struct TrackedRun {
    result: RunResult,
    write_started: bool,
    write_completed: bool,
    write_executed: bool,
}

impl TrackedRun {
    /// Combine with a follow-up run on the same session.
    fn merge(mut self, later: TrackedRun) -> TrackedRun {
        self.result.tool_calls.extend(later.result.tool_calls);
        self.result.usage.add(&later.result.usage);
        TrackedRun {
            result: RunResult {
                response: later.result.response,
                tool_calls: self.result.tool_calls,
                usage: self.result.usage,
                steps: self.result.steps + later.result.steps,
            },
            write_started: self.write_started || later.write_started,
            write_completed: self.write_completed || later.write_completed,
            write_executed: self.write_executed || later.write_executed,
        }
    }

    /// `path (ok)` / `path (error: ...)` for every write call, or `none`.
    fn write_attempts(&self) -> String {
        let attempts: Vec<String> = self
            .result
            .tool_calls
            .iter()
            .filter(|c| c.tool == WRITE)
            .map(|c| {
                let path = c.path().filter(|p| !p.is_empty()).unwrap_or("<no-path>");
                match &c.error {
                    Some(e) => format!("{} (error: {})", path, e),
                    None => format!("{} (ok)", path),
                }
            })
            .collect();
        if attempts.is_empty() {
            "none".to_string()
        } else {
            attempts.join("; ")
        }
    }
}

fn tool_event(node_id: &str, worker: Option<&str>, tool: &str, call_id: &str) -> FormationEvent {
    FormationEvent::new(FormationEventKind::ToolCall)
        .node(node_id)
        .worker(worker)
        .tool(tool, call_id)
}

/// Run the session in streaming mode, emitting `tool_call` events for tool
/// blocks as they stream and for write/edit executions as they finish.
async fn run_tracked(
    session: &Session,
    message: &str,
    node_id: &str,
    worker: Option<&str>,
    emitter: &Emitter,
    cancel: &CancellationToken,
) -> Result<TrackedRun> {
    let mut stream = session.run_stream(message, cancel.clone());
    let mut pending: HashMap<usize, (String, String)> = HashMap::new();
    let mut tracked = TrackedRun::default();

    while stream.next().await {
        match stream.event() {
            Some(SessionEvent::Stream(StreamEvent::ContentBlockStart { index, block }))
                if block.is_tool_use() =>
            {
                if block.name == WRITE {
                    tracked.write_started = true;
                }
                emitter.emit(tool_event(node_id, worker, &block.name, &block.id).status("started"));
                pending.insert(*index, (block.id.clone(), block.name.clone()));
            }
            Some(SessionEvent::Stream(StreamEvent::ContentBlockStop { index })) => {
                if let Some((call_id, tool)) = pending.remove(index) {
                    if tool == WRITE {
                        tracked.write_completed = true;
                    }
                    emitter.emit(tool_event(node_id, worker, &tool, &call_id).status("done"));
                }
            }
            Some(SessionEvent::ToolFinished(call)) if call.tool == WRITE || call.tool == EDIT => {
                if call.tool == WRITE && !call.is_error() {
                    tracked.write_executed = true;
                }
                let mut event = tool_event(node_id, worker, &call.tool, &call.call_id)
                    .path(call.path().unwrap_or_default());
                event = match &call.error {
                    Some(e) => event.status("error").error(e.as_str()),
                    None => event.status("done"),
                };
                emitter.emit(event);
            }
            _ => {}
        }
    }

    tracked.result = stream.into_result().await?;

    if let Some(call) = tracked.result.tool_calls.iter().find(|c| c.tool == EDIT && c.is_error()) {
        return Err(FlotillaError::tool_failed(
            EDIT,
            format!(
                "path={}: {}",
                call.path().unwrap_or_default(),
                call.error.as_deref().unwrap_or_default()
            ),
        ));
    }
    Ok(tracked)
}

/// Parse the answer as a JSON object, giving the session one corrective retry.
async fn parse_or_retry(
    session: &Session,
    run: TrackedRun,
    owner: &str,
    node_id: &str,
    worker: Option<&str>,
    emitter: &Emitter,
    cancel: &CancellationToken,
) -> Result<Map<String, Value>> {
    if let Ok(parsed) = parse_structured_object(&run.result.response) {
        return Ok(parsed);
    }
    debug!(node_id = %node_id, worker = ?worker, "Answer is not a JSON object, retrying");
    let retry = run_tracked(session, JSON_RETRY_PROMPT, node_id, worker, emitter, cancel).await?;
    let run = run.merge(retry);
    parse_structured_object(&run.result.response)
        .map_err(|e| structured_output_error(owner, &e, &run.result.response))
}

fn write_retry_prompt(artifact: &str) -> String {
    format!(
        "You must call the write tool now.\n\
         Write non-empty markdown to ./{} (title, table of contents, and section stubs), then return structured JSON only.\n\
         Do not skip the write tool call.",
        artifact
    )
}

/// The planner must have written a non-empty artifact.
fn check_planner_artifact(run: &TrackedRun, work_dir: &Path, artifact: &str) -> Result<()> {
    let fail = |message: String| Err(FlotillaError::invalid_input(message));
    if !run.write_started {
        return fail(format!("planner must call write to create {}", artifact));
    }
    if !run.write_completed {
        return fail(format!(
            "planner started write tool call but did not complete it (likely truncated tool input or token limit). write attempts: {}",
            run.write_attempts()
        ));
    }
    if !run.write_executed {
        return fail(format!(
            "planner completed write tool block but write did not execute successfully. write attempts: {}",
            run.write_attempts()
        ));
    }

    let path = work_dir.join(artifact);
    match std::fs::read_to_string(&path) {
        Err(e) => fail(format!(
            "planner did not produce {} at {}: {} (write attempts: {})",
            artifact,
            path.display(),
            e,
            run.write_attempts()
        )),
        Ok(text) if text.trim().is_empty() => fail(format!(
            "planner produced empty {} at {} (write attempts: {})",
            artifact,
            path.display(),
            run.write_attempts()
        )),
        Ok(_) => Ok(()),
    }
}

/// One streaming session turn with structured output, plus the planner
/// artifact check when the node is a planner.
pub(crate) async fn run_agent_node(
    scope: &NodeScope<'_>,
    agent: Arc<Agent>,
    input: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let node = scope.node;
    let session = Session::new(agent, scope.work_dir).with_observer_capacity(scope.config.observer_capacity);
    let message = message_for(input);

    let mut run = run_tracked(&session, &message, &node.id, None, scope.emitter, scope.cancel).await?;

    if node.is_planner() {
        if !run.write_started {
            info!(node_id = %node.id, "Planner skipped write, asking again");
            let prompt = write_retry_prompt(node.artifact());
            let retry = run_tracked(&session, &prompt, &node.id, None, scope.emitter, scope.cancel).await?;
            run = run.merge(retry);
        }
        check_planner_artifact(&run, scope.work_dir, node.artifact())?;
    }

    let owner = format!("node {:?}", node.id);
    parse_or_retry(&session, run, &owner, &node.id, None, scope.emitter, scope.cancel).await
}

/// Runs one fan-out task as a structured streaming session.
struct FleetRunner {
    node_id: String,
    sessions: SessionRunner,
    emitter: Emitter,
    observer_capacity: usize,
}

impl TaskRunner for FleetRunner {
    type Output = Map<String, Value>;

    fn run<'a>(
        &'a self,
        task: PoolTask,
        worker: &'a str,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Map<String, Value>>> {
        Box::pin(async move {
            let session = self
                .sessions
                .session_for(&task)
                .with_observer_capacity(self.observer_capacity);
            let worker = Some(worker);
            let run = run_tracked(&session, &task.message, &self.node_id, worker, &self.emitter, &cancel).await?;
            let owner = format!("fleet node {:?}", self.node_id);
            parse_or_retry(&session, run, &owner, &self.node_id, worker, &self.emitter, &cancel).await
        })
    }
}

/// Prompt for one fan-out item.
fn task_message(mapping: &BTreeMap<String, String>, item: &Value) -> String {
    let mut payload: Map<String, Value> = mapping
        .iter()
        .map(|(key, expr)| (key.clone(), eval_item_expr(expr, item)))
        .collect();
    if payload.is_empty() {
        payload.insert("item".into(), item.clone());
    }
    message_for(&payload)
}

fn fleet_output(results: Vec<Value>) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("completed".into(), json!(results.len()));
    out.insert("results".into(), Value::Array(results));
    out.insert("all_workers_done".into(), Value::Bool(true));
    out
}

/// Fan the resolved items out over a fail-fast worker pool.
///
/// Worker count is the configured count (node, then runtime default) capped
/// at the number of tasks. The first task failure, in completion order,
/// cancels its siblings and becomes the node's error.
pub(crate) async fn run_fleet_node(
    scope: &NodeScope<'_>,
    fleet: &FleetSpec,
    agent: Arc<Agent>,
    input: &Map<String, Value>,
    outputs: &NodeOutputs,
) -> Result<Map<String, Value>> {
    let node_id = &scope.node.id;
    let items = resolve_fanout_items(&fleet.fanout_from, input, outputs)?;
    if items.is_empty() {
        return Ok(fleet_output(Vec::new()));
    }

    let messages: Vec<String> = items.iter().map(|item| task_message(&fleet.task_mapping, item)).collect();
    let configured = fleet
        .worker_count
        .filter(|n| *n > 0)
        .unwrap_or(scope.config.default_worker_count);
    let worker_count = match configured {
        0 => messages.len(),
        n => n.min(messages.len()),
    };

    let runner = FleetRunner {
        node_id: node_id.clone(),
        sessions: SessionRunner::new(agent, scope.work_dir.to_path_buf()),
        emitter: scope.emitter.clone(),
        observer_capacity: scope.config.observer_capacity,
    };
    let pool_config = PoolConfig {
        worker_count,
        mailbox_capacity: scope.config.mailbox_capacity.max(messages.len()),
        fail_fast: true,
    };
    info!(node_id = %node_id, tasks = messages.len(), workers = worker_count, "Fanning out");
    let pool = WorkerPool::new(pool_config, runner, scope.cancel.clone()).await?;

    let mut submitted = Ok(());
    for (index, message) in messages.into_iter().enumerate() {
        if let Err(e) = pool.submit(PoolTask::new(message).with_data(json!({ "index": index }))).await {
            submitted = Err(e);
            break;
        }
    }
    let results = match submitted {
        Ok(()) => pool.await_all().await,
        Err(e) => Err(e),
    };
    pool.shutdown().await;

    let mut parsed = Vec::new();
    let mut first_failure: Option<(usize, FlotillaError)> = None;
    let mut cancelled = false;
    for result in results? {
        match result.outcome {
            Ok(output) => parsed.push(Value::Object(output)),
            Err(FlotillaError::Cancelled) => cancelled = true,
            Err(e) => {
                if first_failure.as_ref().map_or(true, |(seq, _)| result.sequence < *seq) {
                    first_failure = Some((result.sequence, e));
                }
            }
        }
    }
    if let Some((_, e)) = first_failure {
        return Err(e);
    }
    if cancelled {
        return Err(FlotillaError::Cancelled);
    }
    Ok(fleet_output(parsed))
}

pub(crate) fn join_output() -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("status".into(), json!("joined"));
    out
}

/// Working directory of a formation run. A blank or `.` definition value
/// defers to the runtime's configured directory.
pub(crate) fn resolve_work_dir(configured: &str, fallback: &str) -> PathBuf {
    let dir = configured.trim();
    if dir.is_empty() || dir == "." {
        PathBuf::from(if fallback.trim().is_empty() { "." } else { fallback })
    } else {
        PathBuf::from(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolCallOutcome;

    fn call(tool: &str, path: Option<&str>, error: Option<&str>) -> ToolCallOutcome {
        ToolCallOutcome {
            call_id: "c".into(),
            tool: tool.into(),
            input: path.map(|p| json!({"path": p})).unwrap_or(json!({})),
            output: String::new(),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_write_attempts_summary() {
        let mut run = TrackedRun::default();
        assert_eq!(run.write_attempts(), "none");
        run.result.tool_calls = vec![
            call("write", Some("report.md"), None),
            call("read", Some("x"), None),
            call("write", None, Some("denied")),
        ];
        assert_eq!(run.write_attempts(), "report.md (ok); <no-path> (error: denied)");
    }

    #[test]
    fn test_merge_keeps_flags_and_calls() {
        let first = TrackedRun {
            result: RunResult {
                response: "prose".into(),
                tool_calls: vec![call("write", Some("a"), None)],
                steps: 2,
                ..RunResult::default()
            },
            write_started: true,
            write_completed: true,
            ..TrackedRun::default()
        };
        let second = TrackedRun {
            result: RunResult {
                response: "{}".into(),
                steps: 1,
                ..RunResult::default()
            },
            write_executed: true,
            ..TrackedRun::default()
        };
        let merged = first.merge(second);
        assert_eq!(merged.result.response, "{}");
        assert_eq!(merged.result.steps, 3);
        assert_eq!(merged.result.tool_calls.len(), 1);
        assert!(merged.write_started && merged.write_completed && merged.write_executed);
    }

    #[test]
    fn test_task_message() {
        let mut mapping = BTreeMap::new();
        assert_eq!(task_message(&mapping, &json!("a")), r#"{"item":"a"}"#);
        mapping.insert("message".to_string(), "item.prompt".to_string());
        assert_eq!(task_message(&mapping, &json!({"prompt": "Research X"})), "Research X");
        mapping.insert("extra".to_string(), "item".to_string());
        assert_eq!(task_message(&mapping, &json!({"prompt": ""})), r#"{"extra":{"prompt":""},"message":""}"#);
    }

    #[test]
    fn test_resolve_work_dir() {
        assert_eq!(resolve_work_dir("", "/srv"), PathBuf::from("/srv"));
        assert_eq!(resolve_work_dir(" ", ""), PathBuf::from("."));
        assert_eq!(resolve_work_dir("/tmp/x ", "/srv"), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_planner_artifact_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = TrackedRun::default();
        let err = check_planner_artifact(&run, dir.path(), "report.md").unwrap_err();
        assert!(err.to_string().contains("planner must call write to create report.md"));

        run.write_started = true;
        let err = check_planner_artifact(&run, dir.path(), "report.md").unwrap_err();
        assert!(err.to_string().contains("did not complete it"));

        run.write_completed = true;
        let err = check_planner_artifact(&run, dir.path(), "report.md").unwrap_err();
        assert!(err.to_string().contains("did not execute successfully. write attempts: none"));

        run.write_executed = true;
        let err = check_planner_artifact(&run, dir.path(), "report.md").unwrap_err();
        assert!(err.to_string().contains("planner did not produce report.md"));

        std::fs::write(dir.path().join("report.md"), "  \n").unwrap();
        let err = check_planner_artifact(&run, dir.path(), "report.md").unwrap_err();
        assert!(err.to_string().contains("planner produced empty report.md"));

        std::fs::write(dir.path().join("report.md"), "# Report\n").unwrap();
        check_planner_artifact(&run, dir.path(), "report.md").unwrap();
    }
}
