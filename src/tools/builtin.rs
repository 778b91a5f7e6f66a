//! Builtin tools: notes, time, scheduling, and delegation.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::info;

use crate::agent::{ProcessOutcome, Processor, ProfileRegistry};
use crate::clock::Clock;
use crate::error::ToolError;
use crate::queue::callback::{LlmCallbackPayload, LLM_CALLBACK_TASK_TYPE};
use crate::queue::recurrence::RecurrenceRule;
use crate::store::{NewTask, Store};
use crate::tools::registry::ToolSource;
use crate::tools::tool::{Tool, ToolContext, ToolOutput};

fn required_str(args: &Value, key: &str, tool: &'static str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidArguments {
            name: tool.to_string(),
            reason: format!("missing or empty string field {key:?}"),
        })
}

// ── current_time ────────────────────────────────────────────────────

pub struct CurrentTimeTool {
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time (UTC, RFC 3339)."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text(self.clock.now().to_rfc3339()))
    }
}

// ── save_note / delete_note ─────────────────────────────────────────

pub struct SaveNoteTool {
    store: Arc<dyn Store>,
}

#[async_trait]
impl Tool for SaveNoteTool {
    fn name(&self) -> &str {
        "save_note"
    }

    fn description(&self) -> &str {
        "Save or overwrite a named note in persistent storage."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Unique note name"},
                "content": {"type": "string", "description": "Note body"}
            },
            "required": ["name", "content"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let name = required_str(&args, "name", "save_note")?;
        let content = required_str(&args, "content", "save_note")?;
        self.store
            .upsert_note(&name, &content)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: "save_note".to_string(),
                reason: e.to_string(),
            })?;
        Ok(ToolOutput::text(format!("Saved note {name:?}.")))
    }
}

pub struct DeleteNoteTool {
    store: Arc<dyn Store>,
}

#[async_trait]
impl Tool for DeleteNoteTool {
    fn name(&self) -> &str {
        "delete_note"
    }

    fn description(&self) -> &str {
        "Permanently delete a named note."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Name of the note to delete"}
            },
            "required": ["name"]
        })
    }

    // Deletion is irreversible, so the user confirms each call.
    fn requires_confirmation(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let name = required_str(&args, "name", "delete_note")?;
        let deleted = self
            .store
            .delete_note(&name)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: "delete_note".to_string(),
                reason: e.to_string(),
            })?;
        Ok(ToolOutput::text(if deleted {
            format!("Deleted note {name:?}.")
        } else {
            format!("No note named {name:?} exists.")
        }))
    }
}

pub struct ListNotesTool {
    store: Arc<dyn Store>,
}

#[async_trait]
impl Tool for ListNotesTool {
    fn name(&self) -> &str {
        "list_notes"
    }

    fn description(&self) -> &str {
        "List all saved notes with their content."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let notes = self
            .store
            .list_notes()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: "list_notes".to_string(),
                reason: e.to_string(),
            })?;
        if notes.is_empty() {
            return Ok(ToolOutput::text("No notes saved."));
        }
        let rendered: Vec<String> = notes
            .iter()
            .map(|n| format!("- {}: {}", n.name, n.content))
            .collect();
        Ok(ToolOutput::text(rendered.join("\n")))
    }
}

// ── schedule_callback ───────────────────────────────────────────────

pub struct ScheduleCallbackTool {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
}

#[async_trait]
impl Tool for ScheduleCallbackTool {
    fn name(&self) -> &str {
        "schedule_callback"
    }

    fn description(&self) -> &str {
        "Schedule a message to be injected back into this conversation at a \
         future time, optionally recurring. Use this for reminders and \
         follow-ups."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to inject when the callback fires"
                },
                "in_seconds": {
                    "type": "integer",
                    "description": "Delay from now, in seconds. Use this or 'at'."
                },
                "at": {
                    "type": "string",
                    "description": "Absolute fire time, RFC 3339. Use this or 'in_seconds'."
                },
                "recurrence": {
                    "type": "string",
                    "description": "Optional recurrence rule: 'every:<secs>s' or 'cron:<expr>'"
                },
                "skip_if_user_responded": {
                    "type": "boolean",
                    "description": "Skip the callback if the user writes before it fires"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let message = required_str(&args, "message", "schedule_callback")?;
        let now = self.clock.now();

        let fire_at = match (args.get("in_seconds"), args.get("at")) {
            (Some(secs), None) => {
                let secs = secs.as_u64().ok_or_else(|| ToolError::InvalidArguments {
                    name: "schedule_callback".to_string(),
                    reason: "'in_seconds' must be a non-negative integer".to_string(),
                })?;
                // Model-supplied, so range-check instead of trusting it.
                i64::try_from(secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|delta| now.checked_add_signed(delta))
                    .ok_or_else(|| ToolError::InvalidArguments {
                        name: "schedule_callback".to_string(),
                        reason: format!("'in_seconds' is out of range: {secs}"),
                    })?
            }
            (None, Some(at)) => {
                let at = at.as_str().ok_or_else(|| ToolError::InvalidArguments {
                    name: "schedule_callback".to_string(),
                    reason: "'at' must be an RFC 3339 string".to_string(),
                })?;
                DateTime::parse_from_rfc3339(at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| ToolError::InvalidArguments {
                        name: "schedule_callback".to_string(),
                        reason: format!("'at' is not valid RFC 3339: {e}"),
                    })?
            }
            _ => {
                return Err(ToolError::InvalidArguments {
                    name: "schedule_callback".to_string(),
                    reason: "provide exactly one of 'in_seconds' or 'at'".to_string(),
                })
            }
        };

        let recurrence = match args.get("recurrence").and_then(Value::as_str) {
            Some(rule) => Some(rule.parse::<RecurrenceRule>().map_err(|e| {
                ToolError::InvalidArguments {
                    name: "schedule_callback".to_string(),
                    reason: e,
                }
            })?),
            None => None,
        };

        let payload = LlmCallbackPayload {
            conversation_id: ctx.conversation_id.clone(),
            message,
            profile: ctx.profile.clone(),
            scheduling_timestamp: now,
            skip_if_user_responded: args
                .get("skip_if_user_responded")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };
        let payload_json =
            serde_json::to_value(&payload).map_err(|e| ToolError::ExecutionFailed {
                name: "schedule_callback".to_string(),
                reason: format!("payload serialization: {e}"),
            })?;

        let mut spec = NewTask::new(LLM_CALLBACK_TASK_TYPE, payload_json).at(fire_at);
        if let Some(rule) = recurrence {
            spec = spec.recurring(rule);
        }
        let task_id = self
            .store
            .enqueue(spec)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: "schedule_callback".to_string(),
                reason: e.to_string(),
            })?;
        self.wake.notify_one();

        info!(task_id = %task_id, fire_at = %fire_at, conversation_id = %ctx.conversation_id, "Callback scheduled");
        Ok(ToolOutput::text(format!(
            "Callback {task_id} scheduled for {}.",
            fire_at.to_rfc3339()
        )))
    }
}

// ── delegate ────────────────────────────────────────────────────────

/// Runs a sub-turn under another profile. Holds the processor weakly
/// and is bound after construction, since the processor owns the tool
/// registry this tool lives in.
pub struct DelegateTool {
    profiles: Arc<ProfileRegistry>,
    processor: OnceLock<Weak<Processor>>,
}

impl DelegateTool {
    pub fn new(profiles: Arc<ProfileRegistry>) -> Self {
        Self {
            profiles,
            processor: OnceLock::new(),
        }
    }

    pub fn bind(&self, processor: &Arc<Processor>) {
        let _ = self.processor.set(Arc::downgrade(processor));
    }

    fn processor(&self) -> Result<Arc<Processor>, ToolError> {
        self.processor
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ToolError::ExecutionFailed {
                name: "delegate".to_string(),
                reason: "delegation target is not available".to_string(),
            })
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Hand a sub-task to another processing profile and return its reply."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "profile": {"type": "string", "description": "Target profile name"},
                "message": {"type": "string", "description": "The sub-task to run"}
            },
            "required": ["profile", "message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let target_name = required_str(&args, "profile", "delegate")?;
        let message = required_str(&args, "message", "delegate")?;

        let target = self
            .profiles
            .get(&target_name)
            .ok_or_else(|| ToolError::InvalidArguments {
                name: "delegate".to_string(),
                reason: format!("unknown profile {target_name:?}"),
            })?;

        // A profile may only delegate level with or downward in trust.
        if target.trust > ctx.trust {
            return Err(ToolError::ExecutionFailed {
                name: "delegate".to_string(),
                reason: format!(
                    "profile {} (trust {}) may not delegate to {} (trust {})",
                    ctx.profile, ctx.trust, target_name, target.trust
                ),
            });
        }

        // Sub-turns run in a derived conversation so the histories do
        // not interleave.
        let sub_conversation = format!("{}::{}", ctx.conversation_id, target_name);
        let outcome = self
            .processor()?
            .process_injected_message(&sub_conversation, &target_name, &message)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: "delegate".to_string(),
                reason: e.to_string(),
            })?;

        match outcome {
            ProcessOutcome::Reply(text) => Ok(ToolOutput::text(text)),
            ProcessOutcome::AwaitingConfirmation { .. } => Err(ToolError::ExecutionFailed {
                name: "delegate".to_string(),
                reason: "delegated turn requested confirmation, which cannot be nested"
                    .to_string(),
            }),
        }
    }
}

/// Assemble the builtin tool source. The delegate tool is returned
/// separately so the caller can bind it to the processor once that
/// exists.
pub fn builtin_source(
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
    profiles: Arc<ProfileRegistry>,
) -> Result<(ToolSource, Arc<DelegateTool>), crate::error::ConfigError> {
    let delegate = Arc::new(DelegateTool::new(profiles));

    let mut source = ToolSource::new("builtin");
    source.register(Arc::new(CurrentTimeTool {
        clock: clock.clone(),
    }))?;
    source.register(Arc::new(SaveNoteTool {
        store: store.clone(),
    }))?;
    source.register(Arc::new(DeleteNoteTool {
        store: store.clone(),
    }))?;
    source.register(Arc::new(ListNotesTool {
        store: store.clone(),
    }))?;
    source.register(Arc::new(ScheduleCallbackTool { store, clock, wake }))?;
    source.register(delegate.clone())?;

    Ok((source, delegate))
}
