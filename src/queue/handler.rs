//! Task handlers: the code a dequeued task dispatches to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ConfigError;
use crate::store::Task;

/// A handler failure, classified by whether the task should be retried.
#[derive(Debug)]
pub enum TaskError {
    /// Transient failure. The task goes back to pending with backoff
    /// until its attempt budget runs out.
    Recoverable(anyhow::Error),
    /// Permanent failure. The task is marked failed immediately.
    Fatal(anyhow::Error),
}

impl TaskError {
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self::Recoverable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn message(&self) -> String {
        match self {
            Self::Recoverable(e) | Self::Fatal(e) => format!("{e:#}"),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recoverable(e) => write!(f, "recoverable: {e:#}"),
            Self::Fatal(e) => write!(f, "fatal: {e:#}"),
        }
    }
}

/// Executes tasks of a single `task_type`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The `task_type` this handler owns.
    fn task_type(&self) -> &str;

    async fn run(&self, task: &Task) -> Result<(), TaskError>;
}

/// Maps `task_type` strings to handlers. Built once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), ConfigError> {
        let task_type = handler.task_type().to_string();
        if self.handlers.contains_key(&task_type) {
            return Err(ConfigError::DuplicateRegistration {
                kind: "task handler",
                name: task_type,
            });
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }
}
