use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::Tool;
use flotilla_core::types::{ToolContext, ToolDefinition};

use crate::builtin;
use crate::serialized::{EditLock, SerializedTool};

/// Registry of available tools, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the inference request, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// A registry holding only the named tools. Unknown names are an error.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut tools = HashMap::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let tool = self.get(name).ok_or_else(|| FlotillaError::tool_not_found(name))?;
            tools.insert(name.to_string(), tool);
        }
        Ok(Self { tools })
    }

    /// Wrap every file-mutating tool so its executions hold `lock`.
    pub fn serialize_mutations(mut self, lock: &EditLock) -> Self {
        for tool in self.tools.values_mut() {
            if tool.mutates_files() {
                let wrapped: Arc<dyn Tool> =
                    Arc::new(SerializedTool::new(Arc::clone(tool), lock.clone()));
                *tool = wrapped;
            }
        }
        self
    }

    /// Execute a tool by name, bounded by its timeout and the context's cancellation.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| FlotillaError::tool_not_found(name))?;

        let timeout_secs = tool.timeout_secs();
        let cancel = ctx.cancel.clone();
        debug!(tool = %name, timeout_secs, "Executing tool");

        tokio::select! {
            _ = cancel.cancelled() => Err(FlotillaError::Cancelled),
            r = tokio::time::timeout(Duration::from_secs(timeout_secs), tool.execute(input, ctx)) => {
                match r {
                    Ok(result) => result,
                    Err(_) => Err(FlotillaError::timeout(format!(
                        "tool '{}' after {}s",
                        name, timeout_secs
                    ))),
                }
            }
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::BashTool);
        registry.register(builtin::ReadTool);
        registry.register(builtin::WriteTool);
        registry.register(builtin::EditTool);
        registry.register(builtin::GlobTool);
        registry.register(builtin::GrepTool);
        registry.register(builtin::WebFetchTool);
        registry
    }
}
