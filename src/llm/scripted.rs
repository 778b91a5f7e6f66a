//! Deterministic model provider for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::types::{ModelRequest, ModelResponse};
use crate::llm::ModelProvider;

enum Script {
    /// Responses are consumed in order; an exhausted script is a protocol error.
    Sequence(Mutex<VecDeque<ModelResponse>>),
    /// The same response is returned on every call.
    Repeating(ModelResponse),
    /// Every call fails with a transport error.
    FailingTransport,
}

/// A model that replays a canned script and records what it was asked.
pub struct ScriptedModel {
    script: Script,
    calls: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self {
            script: Script::Sequence(Mutex::new(responses.into_iter().collect())),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model that returns `response` on every call, e.g. a tool call
    /// forever, to exercise the round ceiling.
    pub fn repeating(response: ModelResponse) -> Self {
        Self {
            script: Script::Repeating(response),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model whose every call fails with a recoverable transport error.
    pub fn failing_transport() -> Self {
        Self {
            script: Script::FailingTransport,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// How many times `generate` has been called.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent request, for asserting on prompts and tool lists.
    pub fn last_request(&self) -> Option<ModelRequest> {
        self.requests
            .lock()
            .expect("request log poisoned")
            .last()
            .cloned()
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("request log poisoned")
            .push(request);
        match &self.script {
            Script::Sequence(queue) => queue
                .lock()
                .expect("script mutex poisoned")
                .pop_front()
                .ok_or_else(|| LlmError::Protocol {
                    reason: "scripted model exhausted".to_string(),
                }),
            Script::Repeating(response) => Ok(response.clone()),
            Script::FailingTransport => Err(LlmError::Transport {
                reason: "scripted transport failure".to_string(),
            }),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_is_consumed_in_order_then_errors() {
        let model = ScriptedModel::new(vec![
            ModelResponse::text("one"),
            ModelResponse::text("two"),
        ]);

        let first = model.generate(ModelRequest::default()).await.unwrap();
        assert_eq!(first.content.as_deref(), Some("one"));
        let second = model.generate(ModelRequest::default()).await.unwrap();
        assert_eq!(second.content.as_deref(), Some("two"));

        let exhausted = model.generate(ModelRequest::default()).await;
        assert!(matches!(exhausted, Err(LlmError::Protocol { .. })));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn repeating_never_exhausts() {
        let model = ScriptedModel::repeating(ModelResponse::text("again"));
        for _ in 0..20 {
            assert!(model.generate(ModelRequest::default()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn failing_transport_is_recoverable() {
        let model = ScriptedModel::failing_transport();
        let err = model.generate(ModelRequest::default()).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
