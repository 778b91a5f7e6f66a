//! The `llm_callback` task: a scheduled message injected back into a
//! conversation, e.g. a reminder the model set for itself.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::{ProcessOutcome, Processor};
use crate::error::Error;
use crate::notify::{Notification, Notifier};
use crate::queue::handler::{TaskError, TaskHandler};
use crate::store::{Store, Task};

pub const LLM_CALLBACK_TASK_TYPE: &str = "llm_callback";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallbackPayload {
    pub conversation_id: String,
    /// Injected into the conversation as a user-role message.
    pub message: String,
    pub profile: String,
    /// When the callback was scheduled, for staleness comparison.
    pub scheduling_timestamp: DateTime<Utc>,
    /// Skip the callback if the user has written anything since it was
    /// scheduled ("remind me unless I get back to you first").
    #[serde(default)]
    pub skip_if_user_responded: bool,
}

pub struct LlmCallbackHandler {
    store: Arc<dyn Store>,
    processor: Arc<Processor>,
    notifier: Arc<dyn Notifier>,
}

impl LlmCallbackHandler {
    pub fn new(
        store: Arc<dyn Store>,
        processor: Arc<Processor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            processor,
            notifier,
        }
    }
}

#[async_trait]
impl TaskHandler for LlmCallbackHandler {
    fn task_type(&self) -> &str {
        LLM_CALLBACK_TASK_TYPE
    }

    async fn run(&self, task: &Task) -> Result<(), TaskError> {
        // A payload that does not parse will never parse.
        let payload: LlmCallbackPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskError::fatal(anyhow::anyhow!("invalid llm_callback payload: {e}")))?;

        if payload.skip_if_user_responded {
            let latest = self
                .store
                .latest_user_message_at(&payload.conversation_id)
                .await
                .map_err(TaskError::recoverable)?;
            if latest.is_some_and(|at| at > payload.scheduling_timestamp) {
                info!(
                    task_id = %task.id,
                    conversation_id = %payload.conversation_id,
                    "Skipping callback, user responded after it was scheduled"
                );
                return Ok(());
            }
        }

        let outcome = self
            .processor
            .process_injected_message(&payload.conversation_id, &payload.profile, &payload.message)
            .await
            .map_err(classify)?;

        match outcome {
            ProcessOutcome::Reply(text) => {
                if let Err(e) = self
                    .notifier
                    .send(Notification {
                        conversation_id: payload.conversation_id.clone(),
                        text,
                    })
                    .await
                {
                    // The turn itself is durably recorded; a dropped
                    // delivery is not worth re-running the model.
                    warn!(
                        conversation_id = %payload.conversation_id,
                        error = %e,
                        "Failed to deliver callback reply"
                    );
                }
            }
            ProcessOutcome::AwaitingConfirmation { token, .. } => {
                // The processor has already notified with the preview.
                info!(
                    conversation_id = %payload.conversation_id,
                    token = %token,
                    "Callback turn suspended awaiting confirmation"
                );
            }
        }
        Ok(())
    }
}

/// Retry classification for a failed turn: transport-level model errors
/// and store errors are worth retrying, everything else is not.
fn classify(err: Error) -> TaskError {
    let recoverable = match &err {
        Error::Llm(e) => e.is_recoverable(),
        Error::Database(_) => true,
        _ => false,
    };
    if recoverable {
        TaskError::recoverable(err)
    } else {
        TaskError::fatal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use std::time::Duration;

    #[test]
    fn transport_errors_are_recoverable() {
        let err = Error::Llm(LlmError::Timeout {
            timeout: Duration::from_secs(120),
        });
        assert!(matches!(classify(err), TaskError::Recoverable(_)));
    }

    #[test]
    fn protocol_errors_are_fatal() {
        let err = Error::Llm(LlmError::Protocol {
            reason: "malformed tool call".into(),
        });
        assert!(matches!(classify(err), TaskError::Fatal(_)));
    }

    #[test]
    fn payload_defaults_skip_flag_to_false() {
        let payload: LlmCallbackPayload = serde_json::from_value(serde_json::json!({
            "conversation_id": "c1",
            "message": "check the oven",
            "profile": "default",
            "scheduling_timestamp": "2026-03-01T12:00:00Z",
        }))
        .unwrap();
        assert!(!payload.skip_if_user_responded);
    }
}
