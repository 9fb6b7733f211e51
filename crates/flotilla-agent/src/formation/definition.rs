use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use flotilla_core::error::{FlotillaError, Result};

/// Artifact the planner node must leave in the working directory.
pub const DEFAULT_ARTIFACT: &str = "report.md";

fn default_version() -> u32 {
    1
}

/// A declarative workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormationDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub defaults: FormationDefaults,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormationDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

/// Node kinds understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Agent,
    Fleet,
    Join,
}

impl NodeKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "agent" => Some(Self::Agent),
            "fleet" => Some(Self::Fleet),
            "join" => Some(Self::Join),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    /// Kept as text so unsupported kinds can be reported by name.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet: Option<FleetSpec>,
    /// Artifact checked for planner nodes, relative to the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl NodeSpec {
    pub fn node_kind(&self) -> Option<NodeKind> {
        NodeKind::parse(&self.kind)
    }

    /// Planner nodes must write their artifact before answering.
    pub fn is_planner(&self) -> bool {
        self.role.as_deref() == Some("planner") || self.id == "planner"
    }

    pub fn artifact(&self) -> &str {
        self.artifact.as_deref().unwrap_or(DEFAULT_ARTIFACT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSpec {
    /// Upper bound on concurrent workers; unset or 0 means one per task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub fanout_from: String,
    /// Task field -> item expression.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub task_mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    /// Guard; the edge fires only when it holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Downstream key -> edge expression. Empty passes the whole output.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map: BTreeMap<String, String>,
}

impl EdgeSpec {
    pub fn guard(&self) -> &str {
        self.when.as_deref().map(str::trim).unwrap_or("")
    }
}

impl FormationDefinition {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| FlotillaError::InvalidFormation(format!("invalid json definition: {}", e)))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| FlotillaError::InvalidFormation(format!("invalid yaml definition: {}", e)))
    }

    /// Parse JSON or YAML, sniffing the format from the first character.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim_start();
        if trimmed.is_empty() {
            return Err(FlotillaError::InvalidFormation("definition is empty".into()));
        }
        if trimmed.starts_with('{') {
            Self::from_json(text)
        } else {
            Self::from_yaml(text)
        }
    }

    /// Load from a file; `.json`, `.yaml` and `.yml` pick the format, anything
    /// else is sniffed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            _ => Self::parse(&text),
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Configured working directory, `"."` when unset or blank.
    pub fn work_dir(&self) -> &str {
        match self.defaults.work_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => dir,
            _ => ".",
        }
    }
}
