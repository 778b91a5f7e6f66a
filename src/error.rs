//! Error types for Steward.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Duplicate registration: {kind} '{name}'")]
    DuplicateRegistration { kind: &'static str, name: String },

    #[error("Unknown {kind} '{name}' referenced by {referrer}")]
    UnknownReference {
        kind: &'static str,
        name: String,
        referrer: String,
    },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Task {id} is {actual}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        actual: String,
        target: &'static str,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Model interface errors.
///
/// `is_recoverable()` drives the worker's retry classification: transport
/// hiccups, rate limits, and timeouts are retried with backoff; protocol
/// errors are terminal.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Model call timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether retrying the same call later could succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LlmError::Transport { .. } | LlmError::RateLimited { .. } | LlmError::Timeout { .. }
        )
    }
}

/// Tool resolution and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid arguments for tool {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} requires confirmation (token {token})")]
    ConfirmationRequired {
        name: String,
        token: Uuid,
        preview: String,
    },

    #[error("Tool {name} confirmation failed: {reason}")]
    ConfirmationFailed { name: String, reason: String },

    #[error("No pending confirmation for token {token}")]
    UnknownConfirmation { token: Uuid },
}

/// Conversation loop errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Turn exceeded the round ceiling of {limit} model calls")]
    TurnLimitExceeded { limit: usize },

    #[error("Unknown processing profile: {name}")]
    UnknownProfile { name: String },

    #[error("Profile {from} (trust {from_trust}) may not delegate to {to} (trust {to_trust})")]
    DelegationRefused {
        from: String,
        from_trust: String,
        to: String,
        to_trust: String,
    },

    #[error("No suspended turn for confirmation token {token}")]
    UnknownSuspension { token: Uuid },
}

/// Notification channel errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Notification channel closed")]
    Closed,

    #[error("Delivery failed: {reason}")]
    Failed { reason: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
