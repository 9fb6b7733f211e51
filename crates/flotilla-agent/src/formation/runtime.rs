use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flotilla_core::config::RuntimeConfig;
use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::event::{EventSink, FormationEvent, FormationEventKind};
use flotilla_llm::{ProviderOptions, ProviderRegistry};
use flotilla_tools::{EditLock, ToolRegistry};

use crate::agent::{Agent, AgentConfig};

use super::definition::{AgentSpec, EdgeSpec, FormationDefinition, NodeKind, NodeSpec};
use super::expr::{map_edge_payload, NodeOutputs};
use super::node::{join_output, resolve_work_dir, run_agent_node, run_fleet_node, Emitter, NodeScope};
use super::validate::validate;

/// Counters for a finished run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub nodes_executed: usize,
    pub duration_ms: u64,
    /// Nodes that never became ready because a guard held back an input.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stalled: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOutcome {
    pub outputs: NodeOutputs,
    pub stats: RunStats,
}

/// Executes formation definitions.
///
/// A node runs once every predecessor has completed and at least one
/// incoming edge delivered a payload. Ready nodes run one at a time in
/// queue order; parallelism lives inside fleet nodes.
pub struct FormationRuntime {
    providers: Arc<ProviderRegistry>,
    tools: ToolRegistry,
    edit_lock: EditLock,
    config: RuntimeConfig,
    emitter: Emitter,
}

impl FormationRuntime {
    pub fn new(providers: Arc<ProviderRegistry>, config: RuntimeConfig) -> Self {
        Self {
            providers,
            tools: ToolRegistry::with_builtins(),
            edit_lock: EditLock::new(),
            config,
            emitter: Emitter::default(),
        }
    }

    /// Replace the tools agents may select from.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.emitter = Emitter::new(Some(sink));
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Validate and execute `def`, seeding root nodes with `inputs`.
    pub async fn run(
        &self,
        def: &FormationDefinition,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        validate(def)?;

        let start = Instant::now();
        let work_dir = resolve_work_dir(def.work_dir(), &self.config.work_dir);
        info!(formation = %def.name, nodes = def.nodes.len(), work_dir = %work_dir.display(), "Formation run starting");
        self.emitter.emit(FormationEvent::new(FormationEventKind::RunStart));

        let nodes: HashMap<&str, &NodeSpec> = def.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut outgoing: HashMap<&str, Vec<&EdgeSpec>> = HashMap::new();
        let mut remaining: HashMap<&str, usize> = nodes.keys().map(|id| (*id, 0)).collect();
        for edge in &def.edges {
            outgoing.entry(edge.from.as_str()).or_default().push(edge);
            *remaining.entry(edge.to.as_str()).or_default() += 1;
        }

        let mut roots: Vec<&str> = remaining.iter().filter(|(_, n)| **n == 0).map(|(id, _)| *id).collect();
        roots.sort_unstable();

        let mut pending: HashMap<&str, Map<String, Value>> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::with_capacity(nodes.len());
        for id in roots {
            pending.insert(id, inputs.clone());
            queue.push_back(id);
        }

        let mut outputs = NodeOutputs::new();
        let mut executed = 0usize;

        while let Some(id) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(FlotillaError::Cancelled);
            }
            let node = nodes[id];
            let input = pending.remove(id).unwrap_or_default();

            self.emitter.emit(FormationEvent::new(FormationEventKind::NodeStart).node(id));
            let node_start = Instant::now();
            let output = match self.execute_node(node, &input, &outputs, &work_dir, &cancel).await {
                Ok(output) => output,
                Err(e) => {
                    error!(node_id = %id, error = %e, "Formation node failed");
                    self.emitter.emit(
                        FormationEvent::new(FormationEventKind::NodeError)
                            .node(id)
                            .error(e.to_string()),
                    );
                    return Err(FlotillaError::node_failed(id, e));
                }
            };
            executed += 1;
            debug!(node_id = %id, elapsed_ms = node_start.elapsed().as_millis() as u64, "Node complete");

            self.emitter.emit(
                FormationEvent::new(FormationEventKind::NodeOutput)
                    .node(id)
                    .output(output.clone()),
            );
            self.emitter.emit(FormationEvent::new(FormationEventKind::NodeEnd).node(id).status("ok"));
            outputs.insert(id.to_string(), output);

            for edge in outgoing.get(id).map(Vec::as_slice).unwrap_or_default() {
                let to = edge.to.as_str();
                let payload = map_edge_payload(edge, &input, &outputs[id], &outputs);

                let left = remaining.get_mut(to).map(|n| {
                    *n = n.saturating_sub(1);
                    *n
                });

                match payload {
                    Some(payload) => {
                        pending.entry(to).or_insert_with(|| inputs.clone()).extend(payload);
                        self.emitter.emit(FormationEvent::new(FormationEventKind::EdgeEmit).edge(id, to));
                    }
                    None => debug!(from = %id, to = %to, guard = %edge.guard(), "Edge guard did not fire"),
                }

                if left == Some(0) && pending.contains_key(to) {
                    queue.push_back(to);
                }
            }
        }

        let stalled: Vec<String> = def
            .nodes
            .iter()
            .filter(|n| !outputs.contains_key(&n.id))
            .map(|n| n.id.clone())
            .collect();
        for id in &stalled {
            warn!(node_id = %id, "Node never received input and did not run");
        }

        let stats = RunStats {
            nodes_executed: executed,
            duration_ms: start.elapsed().as_millis() as u64,
            stalled,
        };
        info!(formation = %def.name, nodes_executed = stats.nodes_executed, duration_ms = stats.duration_ms, "Formation run finished");

        let mut summary = Map::new();
        summary.insert("nodes_executed".into(), json!(stats.nodes_executed));
        summary.insert("duration_ms".into(), json!(stats.duration_ms));
        self.emitter.emit(
            FormationEvent::new(FormationEventKind::RunEnd)
                .output(summary)
                .status("ok"),
        );

        Ok(RunOutcome { outputs, stats })
    }

    async fn execute_node(
        &self,
        node: &NodeSpec,
        input: &Map<String, Value>,
        outputs: &NodeOutputs,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Map<String, Value>> {
        let scope = NodeScope {
            node,
            work_dir,
            emitter: &self.emitter,
            config: &self.config,
            cancel,
        };
        let missing = |what: &str| FlotillaError::InvalidFormation(format!("node {:?} requires {}", node.id, what));

        match node.node_kind() {
            Some(NodeKind::Agent) => {
                let spec = node.agent.as_ref().ok_or_else(|| missing("agent config"))?;
                let agent = self.build_agent(spec, &node.id)?;
                run_agent_node(&scope, agent, input).await
            }
            Some(NodeKind::Fleet) => {
                let fleet = node.fleet.as_ref().ok_or_else(|| missing("fleet config"))?;
                let spec = fleet.agent.as_ref().ok_or_else(|| missing("fleet agent config"))?;
                let agent = self.build_agent(spec, &node.id)?;
                run_fleet_node(&scope, fleet, agent, input, outputs).await
            }
            Some(NodeKind::Join) => Ok(join_output()),
            None => Err(FlotillaError::InvalidFormation(format!(
                "node {:?} has unsupported kind {:?}",
                node.id, node.kind
            ))),
        }
    }

    fn build_agent(&self, spec: &AgentSpec, node_id: &str) -> Result<Arc<Agent>> {
        let options = ProviderOptions::from_map(&spec.options).with_model(spec.model.clone());
        let provider = self.providers.create(&spec.provider, options)?;
        let tools = self.tools.subset(&spec.tools)?.serialize_mutations(&self.edit_lock);

        let config = AgentConfig {
            name: spec.name.clone().unwrap_or_else(|| node_id.to_string()),
            instructions: spec.instructions.clone(),
            max_tokens: None,
            temperature: None,
            max_steps: self.config.max_steps,
            output_schema: spec.output_schema.clone(),
        };
        Ok(Arc::new(Agent::new(config, provider, tools)?))
    }
}
