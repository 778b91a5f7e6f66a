//! The conversation loop: multi-round tool calling with durable history
//! and whole-turn suspension on gated tool calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::context::{aggregate, render_fragments, ContextProvider, ContextRequest};
use crate::agent::profile::{ProcessingProfile, ProfileRegistry};
use crate::clock::Clock;
use crate::error::{AgentError, Error, Result, ToolError};
use crate::llm::{ChatMessage, ModelProvider, ModelRequest, ToolCall};
use crate::notify::{Notification, Notifier};
use crate::store::{MessageOrigin, Store};
use crate::tools::{ConfirmationGate, ToolContext, ToolRegistry};

/// How a turn ended, from the caller's point of view.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The model produced a final text reply.
    Reply(String),
    /// The turn is parked on a gated tool call. `resume_confirmation`
    /// with the token continues it.
    AwaitingConfirmation { token: Uuid, preview: String },
}

/// A turn frozen mid-round while a confirmation is outstanding. The
/// working transcript and the not-yet-executed tool calls are kept so
/// the turn resumes exactly where it stopped.
struct PendingTurn {
    conversation_id: String,
    profile_name: String,
    messages: Vec<ChatMessage>,
    /// Tool calls from the current round still waiting to run.
    remaining: VecDeque<ToolCall>,
    /// The call id the gated call's result must be attached to.
    gated_call_id: String,
    gated_call_name: String,
    round: usize,
    /// Past this point an unanswered confirmation abandons the turn.
    expires_at: DateTime<Utc>,
}

pub struct Processor {
    store: Arc<dyn Store>,
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    gate: Arc<ConfirmationGate>,
    providers: Vec<Box<dyn ContextProvider>>,
    profiles: Arc<ProfileRegistry>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    suspended: Mutex<HashMap<Uuid, PendingTurn>>,
    max_rounds: usize,
    max_tool_output: usize,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        gate: Arc<ConfirmationGate>,
        providers: Vec<Box<dyn ContextProvider>>,
        profiles: Arc<ProfileRegistry>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        max_rounds: usize,
        max_tool_output: usize,
    ) -> Self {
        Self {
            store,
            model,
            tools,
            gate,
            providers,
            profiles,
            notifier,
            clock,
            suspended: Mutex::new(HashMap::new()),
            max_rounds,
            max_tool_output,
        }
    }

    /// Run one full turn: append the inbound message to history, rebuild
    /// the transcript, and loop model calls and tool executions until the
    /// model replies with text, a gated call suspends the turn, or the
    /// round ceiling trips.
    pub async fn process_message(
        &self,
        conversation_id: &str,
        profile_name: &str,
        message: &str,
    ) -> Result<ProcessOutcome> {
        self.run_turn(conversation_id, profile_name, message, MessageOrigin::External)
            .await
    }

    /// Like `process_message`, but for messages the engine itself injects
    /// (scheduled callbacks, delegated sub-turns). The message still enters
    /// history with the user role, but is marked so it never reads as the
    /// user actually having written something.
    pub async fn process_injected_message(
        &self,
        conversation_id: &str,
        profile_name: &str,
        message: &str,
    ) -> Result<ProcessOutcome> {
        self.run_turn(conversation_id, profile_name, message, MessageOrigin::Engine)
            .await
    }

    async fn run_turn(
        &self,
        conversation_id: &str,
        profile_name: &str,
        message: &str,
        origin: MessageOrigin,
    ) -> Result<ProcessOutcome> {
        let profile = self.profile(profile_name)?;

        let user_message = ChatMessage::user(message);
        self.store
            .add_message(conversation_id, &user_message, origin)
            .await?;

        let history = self.store.list_messages(conversation_id).await?;
        let system_prompt = self.system_prompt(&profile, conversation_id).await;

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(history);

        debug!(conversation_id, profile = profile_name, "Starting turn");
        self.drive(
            &profile,
            PendingTurn {
                conversation_id: conversation_id.to_string(),
                profile_name: profile_name.to_string(),
                messages,
                remaining: VecDeque::new(),
                gated_call_id: String::new(),
                gated_call_name: String::new(),
                round: 0,
                expires_at: self.clock.now(),
            },
        )
        .await
    }

    /// Resume a turn suspended on a confirmation token. `approved`
    /// decides whether the parked call runs; either way the turn
    /// continues so the model can react to the verdict.
    pub async fn resume_confirmation(
        &self,
        token: Uuid,
        approved: bool,
    ) -> Result<ProcessOutcome> {
        let mut turn = {
            let mut suspended = self.suspended.lock().expect("suspended turn lock");
            suspended
                .remove(&token)
                .ok_or(AgentError::UnknownSuspension { token })?
        };
        if turn.expires_at <= self.clock.now() {
            return Err(AgentError::UnknownSuspension { token }.into());
        }
        let profile = self.profile(&turn.profile_name)?;

        let verdict = if approved {
            match self.gate.take(token) {
                Ok(call) => match call.tool.execute(call.args, &call.ctx).await {
                    Ok(output) => self.clamp_output(output.content),
                    Err(e) => format!("Error: {e}"),
                },
                Err(e) => format!("Error: {e}"),
            }
        } else {
            // Consume the token so it cannot be accepted later.
            let _ = self.gate.take(token);
            "The user declined this tool call.".to_string()
        };

        info!(
            token = %token,
            tool = %turn.gated_call_name,
            approved,
            "Confirmation resolved, resuming turn"
        );
        let result = ChatMessage::tool_result(turn.gated_call_id.clone(), verdict);
        self.store
            .add_message(&turn.conversation_id, &result, MessageOrigin::Engine)
            .await?;
        turn.messages.push(result);

        self.drive(&profile, turn).await
    }

    async fn drive(
        &self,
        profile: &ProcessingProfile,
        mut turn: PendingTurn,
    ) -> Result<ProcessOutcome> {
        let tool_defs = self.tools.definitions_for(&profile.tool_names)?;
        let ctx = ToolContext {
            conversation_id: turn.conversation_id.clone(),
            profile: profile.name.clone(),
            trust: profile.trust,
        };
        let round_ceiling = profile.max_rounds.unwrap_or(self.max_rounds);

        loop {
            // Finish the current round's tool calls before calling the
            // model again.
            while let Some(call) = turn.remaining.pop_front() {
                let result_text = match self.execute_call(profile, &call, &ctx).await {
                    Ok(text) => text,
                    Err(ToolError::ConfirmationRequired {
                        name,
                        token,
                        preview,
                    }) => {
                        return self.suspend(turn, call, name, token, preview).await;
                    }
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Tool call failed");
                        format!("Error: {e}")
                    }
                };

                let result = ChatMessage::tool_result(call.id.clone(), result_text);
                self.store
                    .add_message(&turn.conversation_id, &result, MessageOrigin::Engine)
                    .await?;
                turn.messages.push(result);
            }

            if turn.round >= round_ceiling {
                warn!(
                    conversation_id = %turn.conversation_id,
                    limit = round_ceiling,
                    "Turn hit the round ceiling"
                );
                return Err(AgentError::TurnLimitExceeded {
                    limit: round_ceiling,
                }
                .into());
            }
            turn.round += 1;

            let mut request =
                ModelRequest::new(turn.messages.clone()).with_tools(tool_defs.clone());
            request.temperature = profile.temperature;
            request.max_tokens = profile.max_tokens;

            let response = self.model.generate(request).await?;
            debug!(
                conversation_id = %turn.conversation_id,
                round = turn.round,
                tool_calls = response.tool_calls.len(),
                tokens = response.usage.total(),
                "Model round complete"
            );

            if response.tool_calls.is_empty() {
                let text = response.content.unwrap_or_default();
                let reply = ChatMessage::assistant(text.clone());
                self.store
                    .add_message(&turn.conversation_id, &reply, MessageOrigin::Engine)
                    .await?;
                return Ok(ProcessOutcome::Reply(text));
            }

            let assistant =
                ChatMessage::assistant_with_tool_calls(response.content, response.tool_calls);
            self.store
                .add_message(&turn.conversation_id, &assistant, MessageOrigin::Engine)
                .await?;
            turn.remaining = assistant.tool_calls.iter().cloned().collect();
            turn.messages.push(assistant);
        }
    }

    async fn execute_call(
        &self,
        profile: &ProcessingProfile,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> std::result::Result<String, ToolError> {
        if !profile.tool_names.iter().any(|n| n == &call.name) {
            return Err(ToolError::ExecutionFailed {
                name: call.name.clone(),
                reason: format!("tool not available to profile {:?}", profile.name),
            });
        }

        let tool = self.tools.resolve(&call.name)?;
        if self.gate.is_gated(tool.as_ref()) {
            return Err(self.gate.park(tool, call.arguments.clone(), ctx.clone()));
        }

        let output = tool.execute(call.arguments.clone(), ctx).await?;
        Ok(self.clamp_output(output.content))
    }

    /// Park the turn under the confirmation token and tell the user what
    /// is waiting for them.
    async fn suspend(
        &self,
        turn: PendingTurn,
        call: ToolCall,
        name: String,
        token: Uuid,
        preview: String,
    ) -> Result<ProcessOutcome> {
        let conversation_id = turn.conversation_id.clone();
        info!(conversation_id = %conversation_id, tool = %name, token = %token, "Turn suspended for confirmation");

        {
            let now = self.clock.now();
            let expires_at = now
                + chrono::Duration::from_std(self.gate.ttl())
                    .unwrap_or_else(|_| chrono::Duration::zero());
            let mut suspended = self.suspended.lock().expect("suspended turn lock");
            // Turns whose confirmation lapsed unanswered are dropped here,
            // mirroring the gate's own sweep.
            suspended.retain(|_, t| t.expires_at > now);
            suspended.insert(
                token,
                PendingTurn {
                    gated_call_id: call.id,
                    gated_call_name: name.clone(),
                    expires_at,
                    ..turn
                },
            );
        }

        let text = format!("Confirmation required ({token}):\n{preview}");
        if let Err(e) = self
            .notifier
            .send(Notification {
                conversation_id,
                text,
            })
            .await
        {
            warn!(error = %e, "Failed to deliver confirmation preview");
        }

        Ok(ProcessOutcome::AwaitingConfirmation { token, preview })
    }

    async fn system_prompt(&self, profile: &ProcessingProfile, conversation_id: &str) -> String {
        let request = ContextRequest {
            conversation_id: conversation_id.to_string(),
            profile: profile.name.clone(),
            now: self.clock.now(),
        };
        // An empty provider list on the profile means "consult everything".
        let selected: Vec<&dyn ContextProvider> = self
            .providers
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| {
                profile.context_providers.is_empty()
                    || profile.context_providers.iter().any(|n| n == p.name())
            })
            .collect();
        let fragments = aggregate(&selected, &request).await;
        format!(
            "{}{}",
            profile.system_prompt,
            render_fragments(&fragments)
        )
    }

    fn profile(&self, name: &str) -> Result<ProcessingProfile> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::from(AgentError::UnknownProfile {
                    name: name.to_string(),
                })
            })
    }

    #[cfg(test)]
    fn suspended_count(&self) -> usize {
        self.suspended.lock().expect("suspended turn lock").len()
    }

    fn clamp_output(&self, content: String) -> String {
        if content.chars().count() <= self.max_tool_output {
            return content;
        }
        let cut: String = content.chars().take(self.max_tool_output).collect();
        format!("{cut}\n[output truncated]")
    }
}
