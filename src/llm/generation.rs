//! Generation adapter: the only path from the intake flow to the LLM.
//!
//! Stateless and retry-free. Every failure (no provider configured, transport
//! error, bad status, blank body, timeout) collapses to
//! [`Generation::Unavailable`]; the cause is logged for operators and never
//! returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::error::LlmError;

/// Outcome of a generation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Text(String),
    Unavailable,
}

impl Generation {
    /// Generated text, or `fallback` when unavailable.
    pub fn or_fallback(self, fallback: &str) -> String {
        match self {
            Self::Text(text) => text,
            Self::Unavailable => fallback.to_string(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Converts conversation history into the next assistant turn.
pub struct GenerationAdapter {
    llm: Option<Arc<dyn LlmProvider>>,
    system_prompt: String,
    timeout: Duration,
}

impl GenerationAdapter {
    /// `llm` may be `None` when no API key is configured.
    pub fn new(
        llm: Option<Arc<dyn LlmProvider>>,
        system_prompt: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.to_string(),
            timeout,
        }
    }

    /// Generate the next assistant message for `history`.
    ///
    /// The fixed system instruction is prepended; `history` is sent whole,
    /// without truncation.
    pub async fn complete(&self, history: &[ChatMessage]) -> Generation {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(&self.system_prompt));
        messages.extend(history.iter().cloned());

        match self.try_complete(messages).await {
            Ok(text) => Generation::Text(text),
            Err(LlmError::NotConfigured) => {
                tracing::debug!("No LLM provider configured; using fallback text");
                Generation::Unavailable
            }
            Err(e) => {
                warn!(error = %e, "Generation unavailable");
                Generation::Unavailable
            }
        }
    }

    async fn try_complete(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError> {
        let llm = self.llm.as_ref().ok_or(LlmError::NotConfigured)?;

        let request = CompletionRequest::new(messages);
        let response = tokio::time::timeout(self.timeout, llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: llm.model_name().to_string(),
                timeout: self.timeout,
            })??;

        if response.content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: llm.model_name().to_string(),
                reason: "empty completion".to_string(),
            });
        }
        Ok(response.content)
    }
}
