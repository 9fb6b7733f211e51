use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::{Provider, Tool};
use flotilla_core::types::InferenceRequest;
use flotilla_tools::ToolRegistry;

fn default_max_steps() -> usize {
    50
}

/// Static configuration of an agent. Immutable once the agent is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// JSON Schema the final answer must satisfy.
    #[serde(default)]
    pub output_schema: Option<Value>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: None,
            max_tokens: None,
            temperature: None,
            max_steps: default_max_steps(),
            output_schema: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FlotillaError::invalid_input("agent name is required"));
        }
        if self.max_steps == 0 {
            return Err(FlotillaError::invalid_input(format!(
                "agent {} must allow at least one step",
                self.name
            )));
        }
        Ok(())
    }
}

/// A provider, a tool set and a configuration bound together.
#[derive(Clone)]
pub struct Agent {
    config: AgentConfig,
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
}

impl Agent {
    pub fn new(config: AgentConfig, provider: Arc<dyn Provider>, tools: ToolRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            tools,
        })
    }

    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn instructions(&self) -> Option<&str> {
        self.config.instructions.as_deref()
    }

    pub fn output_schema(&self) -> Option<&Value> {
        self.config.output_schema.as_ref()
    }

    pub fn max_steps(&self) -> usize {
        self.config.max_steps
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// A copy sharing provider and tools but with different instructions.
    pub fn with_instructions(&self, instructions: impl Into<String>) -> Self {
        let mut agent = self.clone();
        agent.config.instructions = Some(instructions.into());
        agent
    }

    /// A copy with its tool registry replaced.
    pub fn with_tools(&self, tools: ToolRegistry) -> Self {
        let mut agent = self.clone();
        agent.tools = tools;
        agent
    }

    /// Inference request for the given history.
    pub(crate) fn request(&self, messages: Vec<flotilla_core::types::Message>) -> InferenceRequest {
        InferenceRequest {
            messages,
            tools: self.tools.definitions(),
            instructions: self.config.instructions.clone(),
            output_schema: self.config.output_schema.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("provider", &self.provider.name())
            .field("tools", &self.tools.list())
            .finish()
    }
}

/// Convenience layer over [`AgentConfig`].
pub struct AgentBuilder {
    config: AgentConfig,
    provider: Option<Arc<dyn Provider>>,
    tools: ToolRegistry,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: AgentConfig::new(name),
            provider: None,
            tools: ToolRegistry::new(),
        }
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.instructions = Some(instructions.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool(mut self, tool: impl Tool) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.config.output_schema = Some(schema);
        self
    }

    pub fn max_steps(mut self, steps: usize) -> Self {
        self.config.max_steps = steps;
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.max_tokens = Some(tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = Some(temperature);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self.provider.ok_or_else(|| {
            FlotillaError::Config(format!("agent {} has no provider configured", self.config.name))
        })?;
        Agent::new(self.config, provider, self.tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_test_utils::ScriptedProvider;
    use flotilla_tools::builtin::ReadTool;
    use serde_json::json;

    #[test]
    fn test_builder_requires_provider() {
        let err = Agent::builder("writer").build().unwrap_err();
        assert!(err.to_string().contains("no provider configured"));
    }

    #[test]
    fn test_zero_steps_rejected() {
        let err = Agent::builder("writer")
            .provider(Arc::new(ScriptedProvider::new(vec![])))
            .max_steps(0)
            .build()
            .unwrap_err();
        assert!(err.is(flotilla_core::error::ErrorKind::InvalidInput));
    }

    #[test]
    fn test_request_carries_config() {
        let agent = Agent::builder("writer")
            .provider(Arc::new(ScriptedProvider::new(vec![])))
            .instructions("Be terse.")
            .tool(ReadTool)
            .output_schema(json!({"type": "object"}))
            .max_tokens(512)
            .build()
            .unwrap();
        let req = agent.request(vec![]);
        assert_eq!(req.instructions.as_deref(), Some("Be terse."));
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.max_tokens, Some(512));
        assert!(req.output_schema.is_some());
        assert_eq!(agent.max_steps(), 50);
    }

    #[test]
    fn test_with_instructions_keeps_tools() {
        let agent = Agent::builder("w")
            .provider(Arc::new(ScriptedProvider::new(vec![])))
            .tool(ReadTool)
            .build()
            .unwrap();
        let other = agent.with_instructions("Focus on src/");
        assert_eq!(other.instructions(), Some("Focus on src/"));
        assert_eq!(other.tools().list(), vec!["read"]);
        assert_eq!(agent.instructions(), None);
    }
}
