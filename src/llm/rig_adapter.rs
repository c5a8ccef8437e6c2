//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::OneOrMany;
use rig::completion::{AssistantContent, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split our messages into (preamble, history, prompt).
///
/// System messages are joined into the preamble. The last user message is
/// the prompt; everything before it becomes chat history.
fn split_messages(
    messages: Vec<ChatMessage>,
) -> Result<(Option<String>, Vec<Message>, Message), LlmError> {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system.push(msg.content),
            Role::User => turns.push(Message::user(msg.content)),
            Role::Assistant => turns.push(Message::assistant(msg.content)),
        }
    }

    let prompt = turns.pop().ok_or_else(|| LlmError::InvalidResponse {
        provider: "rig".to_string(),
        reason: "completion request has no user message".to_string(),
    })?;
    let preamble = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((preamble, turns, prompt))
}

fn text_of(choice: &OneOrMany<AssistantContent>) -> String {
    choice
        .iter()
        .filter_map(|c| match c {
            AssistantContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) = split_messages(request.messages)?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(t) = request.temperature {
            builder = builder.temperature(t as f64);
        }
        if let Some(n) = request.max_tokens {
            builder = builder.max_tokens(n as u64);
        }

        let response = builder.send().await.map_err(|e| {
            let reason = e.to_string();
            if reason.contains("401") || reason.to_lowercase().contains("unauthorized") {
                LlmError::AuthFailed {
                    provider: self.model_name.clone(),
                }
            } else {
                LlmError::RequestFailed {
                    provider: self.model_name.clone(),
                    reason,
                }
            }
        })?;

        let content = text_of(&response.choice);
        let output_tokens = response.usage.output_tokens as u32;
        let finish_reason = match request.max_tokens {
            Some(max) if output_tokens >= max => FinishReason::Length,
            _ if content.is_empty() => FinishReason::Unknown,
            _ => FinishReason::Stop,
        };

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_become_preamble() {
        let (preamble, history, _prompt) = split_messages(vec![
            ChatMessage::system("a"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::system("b"),
            ChatMessage::user("second"),
        ])
        .unwrap();
        assert_eq!(preamble.as_deref(), Some("a\n\nb"));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn request_without_user_message_rejected() {
        let err = split_messages(vec![ChatMessage::system("only")]).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}
