//! Adapter bridging rig-core's `CompletionModel` to our `ModelProvider`.

use std::time::Duration;

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionError, CompletionModel};
use rig::message::{Message, ToolResultContent, UserContent};
use rig::one_or_many::OneOrMany;

use crate::error::LlmError;
use crate::llm::types::{
    ChatMessage, ModelRequest, ModelResponse, Role, TokenUsage, ToolCall,
};
use crate::llm::ModelProvider;

/// Wraps a rig completion model behind the engine's provider trait.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
    timeout: Duration,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, timeout: Duration) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl<M: CompletionModel> ModelProvider for RigAdapter<M> {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, LlmError> {
        let (preamble, mut history) = to_rig_messages(&request.messages);

        // The last message is the prompt; everything before it is history.
        let prompt = history.pop().unwrap_or_else(|| Message::user(""));

        let mut builder = self.model.completion_request(prompt);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        builder = builder.messages(history);
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }
        let tools: Vec<rig::completion::ToolDefinition> = request
            .tools
            .iter()
            .map(|t| rig::completion::ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();
        builder = builder.tools(tools);

        let completion_request = builder.build();

        let response = tokio::time::timeout(self.timeout, self.model.completion(completion_request))
            .await
            .map_err(|_| LlmError::Timeout {
                timeout: self.timeout,
            })?
            .map_err(map_completion_error)?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for item in response.choice.iter() {
            match item {
                AssistantContent::Text(text) => content.push_str(&text.text),
                AssistantContent::ToolCall(call) => tool_calls.push(ToolCall {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                }),
                _ => {}
            }
        }

        Ok(ModelResponse {
            content: if content.is_empty() { None } else { Some(content) },
            tool_calls,
            usage: TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Convert engine messages to rig's wire shape.
///
/// System messages are folded into the preamble; tool results become user
/// tool_result content so each assistant tool call is answered in place.
fn to_rig_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Message>) {
    let mut preamble: Option<String> = None;
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::System => match preamble {
                Some(ref mut p) => {
                    p.push_str("\n\n");
                    p.push_str(&message.content);
                }
                None => preamble = Some(message.content.clone()),
            },
            Role::User => out.push(Message::user(message.content.clone())),
            Role::Assistant => {
                if message.tool_calls.is_empty() {
                    out.push(Message::assistant(message.content.clone()));
                } else {
                    let mut content: Vec<AssistantContent> = Vec::new();
                    if !message.content.is_empty() {
                        content.push(AssistantContent::text(&message.content));
                    }
                    for call in &message.tool_calls {
                        content.push(AssistantContent::ToolCall(rig::message::ToolCall {
                            id: call.id.clone(),
                            call_id: None,
                            function: rig::message::ToolFunction {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                            additional_params: None,
                            signature: None,
                        }));
                    }
                    let content = OneOrMany::many(content)
                        .unwrap_or_else(|_| OneOrMany::one(AssistantContent::text("")));
                    out.push(Message::Assistant { id: None, content });
                }
            }
            Role::Tool => {
                let call_id = message.tool_call_id.clone().unwrap_or_default();
                let content = OneOrMany::one(UserContent::tool_result(
                    call_id,
                    OneOrMany::one(ToolResultContent::text(&message.content)),
                ));
                out.push(Message::User { content });
            }
        }
    }

    (preamble, out)
}

fn map_completion_error(error: CompletionError) -> LlmError {
    match error {
        CompletionError::HttpError(e) => LlmError::Transport {
            reason: e.to_string(),
        },
        CompletionError::RequestError(e) => LlmError::Transport {
            reason: e.to_string(),
        },
        other => LlmError::Protocol {
            reason: other.to_string(),
        },
    }
}
