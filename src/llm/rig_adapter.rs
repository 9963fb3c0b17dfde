//! Bridges rig's `CompletionModel` to the `LlmProvider` trait.
//!
//! System messages become the rig preamble, the last message becomes the
//! prompt, and everything before it is sent as chat history.

use async_trait::async_trait;
use rig::completion::CompletionModel;
use rig::message::{AssistantContent, Message};

use super::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role};
use crate::error::LlmError;

/// `LlmProvider` backed by any rig completion model.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// A conversation split into rig's request shape.
#[derive(Debug)]
struct RigConversation {
    preamble: Option<String>,
    history: Vec<Message>,
    prompt: Message,
}

fn to_rig_message(msg: &ChatMessage) -> Message {
    match msg.role {
        Role::Assistant => Message::assistant(msg.content.clone()),
        Role::User | Role::System => Message::user(msg.content.clone()),
    }
}

fn split_conversation(messages: &[ChatMessage]) -> Result<RigConversation, LlmError> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let preamble = (!system.is_empty()).then(|| system.join("\n\n"));

    let mut turns: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(to_rig_message)
        .collect();
    let prompt = turns.pop().ok_or_else(|| LlmError::RequestFailed {
        provider: "rig".to_string(),
        reason: "completion request has no conversation turns".to_string(),
    })?;

    Ok(RigConversation {
        preamble,
        history: turns,
        prompt,
    })
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
        let conversation = split_conversation(&request.messages)?;

        let mut builder = self
            .model
            .completion_request(conversation.prompt)
            .messages(conversation.history);
        if let Some(preamble) = conversation.preamble {
            builder = builder.preamble(preamble);
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        tracing::debug!(
            model = %self.model_name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_become_preamble() {
        let messages = vec![
            ChatMessage::system("rules"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("what do you sell?"),
            ChatMessage::user("coffee"),
        ];
        let conversation = split_conversation(&messages).unwrap();
        assert_eq!(conversation.preamble.as_deref(), Some("rules"));
        assert_eq!(conversation.history.len(), 3);
        assert_eq!(conversation.prompt, Message::user("coffee"));
        assert_eq!(conversation.history[0], Message::assistant("hello"));
    }

    #[test]
    fn opening_request_has_no_history() {
        let messages = vec![ChatMessage::system("rules"), ChatMessage::user("introduce")];
        let conversation = split_conversation(&messages).unwrap();
        assert!(conversation.history.is_empty());
        assert_eq!(conversation.prompt, Message::user("introduce"));
    }

    #[test]
    fn multiple_system_messages_are_joined() {
        let messages = vec![
            ChatMessage::system("a"),
            ChatMessage::system("b"),
            ChatMessage::user("x"),
        ];
        let conversation = split_conversation(&messages).unwrap();
        assert_eq!(conversation.preamble.as_deref(), Some("a\n\nb"));
    }

    #[test]
    fn system_only_request_is_rejected() {
        let err = split_conversation(&[ChatMessage::system("rules")]).unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
    }
}
