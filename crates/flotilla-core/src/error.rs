use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of agent-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderUnavailable,
    RateLimit,
    ContextTooLong,
    ToolFailed,
    ToolNotFound,
    PermissionDenied,
    Timeout,
    InvalidInput,
    MaxStepsExceeded,
    StreamingFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable => "provider_unavailable",
            Self::RateLimit => "rate_limit",
            Self::ContextTooLong => "context_too_long",
            Self::ToolFailed => "tool_failed",
            Self::ToolNotFound => "tool_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::InvalidInput => "invalid_input",
            Self::MaxStepsExceeded => "max_steps_exceeded",
            Self::StreamingFailed => "streaming_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FlotillaError {
    /// A classified agent failure. `retryable` is fixed by the constructor.
    #[error("{kind}: {message}")]
    Agent {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },

    // Actor errors
    #[error("mailbox full for actor: {0}")]
    MailboxFull(String),

    #[error("actor {0} is not running")]
    ActorStopped(String),

    #[error("actor not found: {0}")]
    ActorNotFound(String),

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("task panicked on {worker}: {message}")]
    TaskPanicked { worker: String, message: String },

    // Formation errors
    #[error("invalid formation: {0}")]
    InvalidFormation(String),

    #[error("graph must be acyclic")]
    CyclicGraph,

    #[error("node {node_id} failed: {source}")]
    NodeFailed {
        node_id: String,
        #[source]
        source: Box<FlotillaError>,
    },

    #[error("Cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FlotillaError {
    fn agent(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self::Agent {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::agent(ErrorKind::ProviderUnavailable, message, true)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::agent(ErrorKind::RateLimit, message, true)
    }

    pub fn context_too_long(message: impl Into<String>) -> Self {
        Self::agent(ErrorKind::ContextTooLong, message, false)
    }

    pub fn tool_failed(tool: &str, message: impl fmt::Display) -> Self {
        Self::agent(
            ErrorKind::ToolFailed,
            format!("tool '{}' failed: {}", tool, message),
            false,
        )
    }

    pub fn tool_not_found(tool: &str) -> Self {
        Self::agent(
            ErrorKind::ToolNotFound,
            format!("tool '{}' not found", tool),
            false,
        )
    }

    pub fn permission_denied(action: impl fmt::Display) -> Self {
        Self::agent(
            ErrorKind::PermissionDenied,
            format!("permission denied: {}", action),
            false,
        )
    }

    pub fn timeout(operation: impl fmt::Display) -> Self {
        Self::agent(
            ErrorKind::Timeout,
            format!("timeout during {}", operation),
            true,
        )
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::agent(ErrorKind::InvalidInput, message, false)
    }

    pub fn max_steps_exceeded(steps: usize) -> Self {
        Self::agent(
            ErrorKind::MaxStepsExceeded,
            format!("exceeded maximum steps ({})", steps),
            false,
        )
    }

    pub fn streaming_failed(message: impl Into<String>) -> Self {
        Self::agent(ErrorKind::StreamingFailed, message, false)
    }

    /// Override the retry classification chosen by the constructor.
    pub fn with_retryable(self, value: bool) -> Self {
        match self {
            Self::Agent { kind, message, .. } => Self::Agent {
                kind,
                message,
                retryable: value,
            },
            other => other,
        }
    }

    /// Wrap a node failure with the id of the node that produced it.
    pub fn node_failed(node_id: impl Into<String>, source: FlotillaError) -> Self {
        Self::NodeFailed {
            node_id: node_id.into(),
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Agent { kind, .. } => Some(*kind),
            Self::NodeFailed { source, .. } => source.kind(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Agent { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == Some(kind)
    }
}

pub type Result<T> = std::result::Result<T, FlotillaError>;
