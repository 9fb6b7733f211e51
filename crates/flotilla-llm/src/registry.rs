use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use flotilla_core::config::{AppConfig, ProviderConfig, RetryConfig};
use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::Provider;

use crate::providers::AnthropicProvider;
use crate::retry::RetryingProvider;

/// Options handed to a provider factory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderOptions {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Keys the typed fields do not cover.
    pub extra: Map<String, Value>,
}

impl ProviderOptions {
    /// Read options from a loosely typed map (e.g. a formation's `options`).
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut opts = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "model" => opts.model = value.as_str().map(str::to_string),
                "api_key" => opts.api_key = value.as_str().map(str::to_string),
                "base_url" => opts.base_url = value.as_str().map(str::to_string),
                "max_tokens" => {
                    opts.max_tokens = value.as_u64().map(|v| u32::try_from(v).unwrap_or(u32::MAX))
                }
                "temperature" => opts.temperature = value.as_f64().map(|v| v as f32),
                _ => {
                    opts.extra.insert(key.clone(), value.clone());
                }
            }
        }
        opts
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Fill unset fields from a configured provider section.
    pub fn with_fallback(mut self, config: &ProviderConfig) -> Self {
        if self.api_key.is_none() {
            self.api_key = config.api_key.clone();
        }
        if self.base_url.is_none() {
            self.base_url = config.base_url.clone();
        }
        if self.max_tokens.is_none() {
            self.max_tokens = Some(config.max_tokens);
        }
        if self.temperature.is_none() {
            self.temperature = config.temperature;
        }
        self
    }
}

/// Constructs a provider from options.
pub type ProviderFactory = Arc<dyn Fn(&ProviderOptions) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Explicit provider registry, built once and shared by reference.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
    configs: HashMap<String, ProviderConfig>,
    retry: Option<RetryConfig>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers (`anthropic`, alias `claude`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let anthropic: ProviderFactory = Arc::new(|opts: &ProviderOptions| {
            Ok(Arc::new(AnthropicProvider::new(opts)?) as Arc<dyn Provider>)
        });
        registry.register("anthropic", Arc::clone(&anthropic));
        registry.register("claude", anthropic);
        registry
    }

    /// Built-in providers plus the retry policy and provider sections of `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::with_defaults();
        registry.configs = config.providers.clone();
        registry.retry = Some(config.retry.clone());
        registry
    }

    /// Add or replace a provider factory.
    pub fn register(&mut self, id: impl Into<String>, factory: ProviderFactory) {
        self.factories.insert(id.into(), factory);
    }

    /// Wrap every created provider in a [`RetryingProvider`].
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Construct a provider by id.
    pub fn create(&self, id: &str, opts: ProviderOptions) -> Result<Arc<dyn Provider>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| FlotillaError::Config(format!("provider not found: {}", id)))?;

        let opts = match self.configs.get(id) {
            Some(config) => opts.with_fallback(config),
            None => opts,
        };

        debug!(provider = %id, model = ?opts.model, "Creating provider");
        let provider = factory(&opts)?;

        Ok(match &self.retry {
            Some(retry) => Arc::new(RetryingProvider::new(provider, retry.clone())),
            None => provider,
        })
    }
}
