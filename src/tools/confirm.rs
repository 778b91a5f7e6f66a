//! Confirmation gate for sensitive tool calls.
//!
//! A gated call is not executed when the model requests it. Instead the
//! gate parks the fully-bound call under a one-time token and the user
//! is shown a preview; the call only runs if the token is accepted
//! before its TTL lapses.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext};

const PREVIEW_MAX_CHARS: usize = 600;

/// A gated call waiting for a verdict. Arguments are bound at request
/// time; acceptance runs exactly this call, not a re-resolution.
pub struct PendingCall {
    pub tool: Arc<dyn Tool>,
    pub args: Value,
    pub ctx: ToolContext,
    pub preview: String,
    pub expires_at: DateTime<Utc>,
}

pub struct ConfirmationGate {
    /// Tool names gated by deployment policy, on top of tools that gate
    /// themselves via `requires_confirmation`.
    sensitive: HashSet<String>,
    pending: Mutex<HashMap<Uuid, PendingCall>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ConfirmationGate {
    pub fn new(sensitive: HashSet<String>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            sensitive,
            pending: Mutex::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_gated(&self, tool: &dyn Tool) -> bool {
        tool.requires_confirmation() || self.sensitive.contains(tool.name())
    }

    /// Park a gated call and hand back the error the caller surfaces to
    /// the user (token plus preview).
    pub fn park(
        &self,
        tool: Arc<dyn Tool>,
        args: Value,
        ctx: ToolContext,
    ) -> ToolError {
        let token = Uuid::new_v4();
        let name = tool.name().to_string();
        let preview = render_preview(&name, &args);
        let now = self.clock.now();
        let expires_at = now
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());

        let mut pending = self.pending.lock().expect("confirmation gate lock");
        pending.retain(|_, call| call.expires_at > now);
        pending.insert(
            token,
            PendingCall {
                tool,
                args,
                ctx,
                preview: preview.clone(),
                expires_at,
            },
        );

        debug!(tool = %name, token = %token, "Tool call parked for confirmation");
        ToolError::ConfirmationRequired {
            name,
            token,
            preview,
        }
    }

    /// Take a pending call out of the gate. The token is single-use:
    /// whatever the verdict, a second resolve of the same token fails.
    pub fn take(&self, token: Uuid) -> Result<PendingCall, ToolError> {
        let call = {
            let mut pending = self.pending.lock().expect("confirmation gate lock");
            pending
                .remove(&token)
                .ok_or(ToolError::UnknownConfirmation { token })?
        };

        if call.expires_at <= self.clock.now() {
            return Err(ToolError::ConfirmationFailed {
                name: call.tool.name().to_string(),
                reason: "confirmation expired".to_string(),
            });
        }
        Ok(call)
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("confirmation gate lock").len()
    }
}

/// Human-readable one-screen summary of a gated call.
pub fn render_preview(tool_name: &str, args: &Value) -> String {
    let rendered = match args {
        Value::Object(map) if map.is_empty() => "(no arguments)".to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    format!("{tool_name}\n{}", truncate_chars(&rendered, PREVIEW_MAX_CHARS))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}… [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::TrustLevel;
    use crate::clock::ManualClock;
    use crate::tools::tool::ToolOutput;
    use async_trait::async_trait;
    use serde_json::json;

    struct GatedTool;

    #[async_trait]
    impl Tool for GatedTool {
        fn name(&self) -> &str {
            "wipe_everything"
        }

        fn description(&self) -> &str {
            "destructive"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn requires_confirmation(&self) -> bool {
            true
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("wiped"))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            conversation_id: "c1".into(),
            profile: "default".into(),
            trust: TrustLevel::Standard,
        }
    }

    fn gate(clock: Arc<ManualClock>) -> ConfirmationGate {
        ConfirmationGate::new(HashSet::new(), clock, Duration::from_secs(900))
    }

    #[test]
    fn park_then_take_is_single_use() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let gate = gate(clock);

        let err = gate.park(Arc::new(GatedTool), json!({"target": "all"}), ctx());
        let token = match err {
            ToolError::ConfirmationRequired { token, ref preview, .. } => {
                assert!(preview.contains("wipe_everything"));
                assert!(preview.contains("target"));
                token
            }
            other => panic!("expected ConfirmationRequired, got {other:?}"),
        };

        let call = gate.take(token).unwrap();
        assert_eq!(call.tool.name(), "wipe_everything");
        assert!(matches!(
            gate.take(token),
            Err(ToolError::UnknownConfirmation { .. })
        ));
    }

    #[test]
    fn expired_tokens_are_refused() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let gate = gate(clock.clone());

        let err = gate.park(Arc::new(GatedTool), json!({}), ctx());
        let ToolError::ConfirmationRequired { token, .. } = err else {
            panic!("expected ConfirmationRequired");
        };

        clock.advance(Duration::from_secs(901));
        assert!(matches!(
            gate.take(token),
            Err(ToolError::ConfirmationFailed { .. })
        ));
    }

    #[test]
    fn expired_entries_are_swept_on_park() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let gate = gate(clock.clone());

        gate.park(Arc::new(GatedTool), json!({}), ctx());
        assert_eq!(gate.pending_count(), 1);

        clock.advance(Duration::from_secs(901));
        gate.park(Arc::new(GatedTool), json!({}), ctx());
        assert_eq!(gate.pending_count(), 1);
    }

    #[test]
    fn policy_list_gates_tools_that_do_not_gate_themselves() {
        struct PlainTool;

        #[async_trait]
        impl Tool for PlainTool {
            fn name(&self) -> &str {
                "plain"
            }
            fn description(&self) -> &str {
                "harmless"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(
                &self,
                _args: Value,
                _ctx: &ToolContext,
            ) -> Result<ToolOutput, ToolError> {
                Ok(ToolOutput::text("ok"))
            }
        }

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let gate = ConfirmationGate::new(
            HashSet::from(["plain".to_string()]),
            clock,
            Duration::from_secs(900),
        );
        assert!(gate.is_gated(&PlainTool));
        assert!(gate.is_gated(&GatedTool));
    }

    #[test]
    fn long_arguments_are_truncated_in_previews() {
        let args = json!({"body": "x".repeat(2000)});
        let preview = render_preview("send_mail", &args);
        assert!(preview.len() < 700);
        assert!(preview.ends_with("[truncated]"));
    }
}
