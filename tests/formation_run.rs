use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;

use flotilla_agent::formation::{validate, FormationDefinition};
use flotilla_agent::FormationRuntime;
use flotilla_core::config::RuntimeConfig;
use flotilla_core::error::FlotillaError;
use flotilla_core::event::{EventBus, FormationEvent, FormationEventKind};
use flotilla_core::traits::Provider;
use flotilla_llm::{ProviderFactory, ProviderOptions, ProviderRegistry};
use flotilla_test_utils::{json_response, last_user_text, tool_response, ScriptedProvider};

const RESEARCH: &str = r#"
name: research
nodes:
  - id: planner
    kind: agent
    agent:
      provider: scripted
      model: m
      tools: [write]
      output_schema: {type: object}
  - id: researchers
    kind: fleet
    fleet:
      worker_count: 2
      fanout_from: planner.topics
      task_mapping:
        message: item.prompt
      agent:
        provider: scripted
        model: m
        output_schema: {type: object}
  - id: done
    kind: join
edges:
  - from: planner
    to: researchers
  - from: researchers
    to: done
    when: all_workers_done
"#;

fn registry(provider: Arc<ScriptedProvider>) -> Arc<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    let factory: ProviderFactory =
        Arc::new(move |_opts: &ProviderOptions| Ok(provider.clone() as Arc<dyn Provider>));
    registry.register("scripted", factory);
    Arc::new(registry)
}

/// Planner writes its report then lists topics; workers echo their prompt.
fn research_provider() -> ScriptedProvider {
    ScriptedProvider::from_fn(|req| {
        let is_planner = req.tools.iter().any(|t| t.name == "write");
        if !is_planner {
            return Ok(json_response(json!({"finding": last_user_text(req)})));
        }
        if req.messages.len() == 1 {
            Ok(tool_response(vec![(
                "call_write",
                "write",
                json!({"path": "report.md", "content": "# Research\n\n## Contents\n"}),
            )]))
        } else {
            Ok(json_response(json!({
                "topics": [{"prompt": "Research A"}, {"prompt": "Research B"}, {"prompt": "Research C"}]
            })))
        }
    })
    .with_delay(Duration::from_millis(20))
}

fn research_definition(work_dir: &std::path::Path) -> FormationDefinition {
    let mut def = FormationDefinition::parse(RESEARCH).expect("parse research formation");
    def.defaults.work_dir = Some(work_dir.to_string_lossy().into_owned());
    def
}

#[tokio::test]
async fn test_research_formation_end_to_end() {
    let dir = tempfile::tempdir().expect("temp dir");
    let provider = Arc::new(research_provider());
    let bus = Arc::new(EventBus::new(256));
    let mut rx = bus.subscribe();

    let runtime = FormationRuntime::new(registry(provider.clone()), RuntimeConfig::default()).with_sink(bus.sink());
    let def = research_definition(dir.path());

    let outcome = runtime
        .run(&def, Map::new(), CancellationToken::new())
        .await
        .expect("formation run");

    assert_eq!(outcome.stats.nodes_executed, 3);
    assert!(outcome.stats.stalled.is_empty());

    let fleet = &outcome.outputs["researchers"];
    assert_eq!(fleet["completed"], json!(3));
    assert_eq!(
        fleet["results"],
        json!([{"finding": "Research A"}, {"finding": "Research B"}, {"finding": "Research C"}])
    );
    assert_eq!(outcome.outputs["done"]["status"], json!("joined"));
    assert!(provider.peak_concurrency() <= 2);

    let report = std::fs::read_to_string(dir.path().join("report.md")).expect("report written");
    assert!(report.starts_with("# Research"));

    let mut events: Vec<FormationEvent> = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.first().map(|e| e.kind), Some(FormationEventKind::RunStart));
    assert_eq!(events.last().map(|e| e.kind), Some(FormationEventKind::RunEnd));

    let edges: Vec<(String, String)> = events
        .iter()
        .filter(|e| e.kind == FormationEventKind::EdgeEmit)
        .filter_map(|e| Some((e.from.clone()?, e.to.clone()?)))
        .collect();
    assert_eq!(
        edges,
        vec![
            ("planner".to_string(), "researchers".to_string()),
            ("researchers".to_string(), "done".to_string())
        ]
    );

    let write_done = events.iter().any(|e| {
        e.kind == FormationEventKind::ToolCall
            && e.tool.as_deref() == Some("write")
            && e.path.as_deref() == Some("report.md")
            && e.status.as_deref() == Some("done")
    });
    assert!(write_done);
}

#[tokio::test]
async fn test_failed_worker_stops_formation() {
    let dir = tempfile::tempdir().expect("temp dir");
    let provider = Arc::new(ScriptedProvider::from_fn(|req| {
        if req.tools.iter().any(|t| t.name == "write") {
            return if req.messages.len() == 1 {
                Ok(tool_response(vec![("w", "write", json!({"path": "report.md", "content": "# R"}))]))
            } else {
                Ok(json_response(json!({"topics": [{"prompt": "ok"}, {"prompt": "bad"}]})))
            };
        }
        if last_user_text(req) == "bad" {
            Err(FlotillaError::permission_denied("no access to source"))
        } else {
            Ok(json_response(json!({"finding": "fine"})))
        }
    }));
    let runtime = FormationRuntime::new(registry(provider), RuntimeConfig::default());
    let def = research_definition(dir.path());

    let err = runtime
        .run(&def, Map::new(), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        FlotillaError::NodeFailed { node_id, source } => {
            assert_eq!(node_id, "researchers");
            assert!(source.to_string().contains("no access to source"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_definition_files_validate() {
    let dir = tempfile::tempdir().expect("temp dir");

    let good = dir.path().join("research.yaml");
    std::fs::write(&good, RESEARCH).expect("write yaml");
    validate(&FormationDefinition::load(&good).expect("load yaml")).expect("valid");

    let cyclic = dir.path().join("cyclic.json");
    std::fs::write(
        &cyclic,
        r#"{"name": "c", "nodes": [{"id": "a", "kind": "join"}, {"id": "b", "kind": "join"}],
            "edges": [{"from": "a", "to": "b"}, {"from": "b", "to": "a"}]}"#,
    )
    .expect("write json");
    let err = validate(&FormationDefinition::load(&cyclic).expect("load json")).unwrap_err();
    assert!(matches!(err, FlotillaError::CyclicGraph));
}
