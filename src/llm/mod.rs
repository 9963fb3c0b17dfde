//! LLM integration.
//!
//! `provider` defines the backend-agnostic `LlmProvider` trait, rig-core
//! handles HTTP transport behind `RigAdapter`, and `generation` wraps a
//! provider into the failure-collapsing adapter used by the intake flow.

pub mod generation;
pub mod provider;
mod rig_adapter;

pub use generation::{Generation, GenerationAdapter};
pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::config::GenerationConfig;
use crate::error::LlmError;

/// Create an LLM provider from configuration.
///
/// Returns `Ok(None)` when no API key is configured; generation then always
/// reports unavailable and the intake flow runs on fallback text.
pub fn create_provider(
    config: &GenerationConfig,
) -> Result<Option<Arc<dyn LlmProvider>>, LlmError> {
    use rig::providers::openai;

    let Some(api_key) = config.api_key.as_ref() else {
        tracing::warn!("OPENAI_API_KEY not set; generation disabled");
        return Ok(None);
    };

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::builder()
            .api_key(api_key.expose_secret())
            .base_url(&config.base_url)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            })?;

    let model = client.completion_model(&config.model);
    tracing::info!(
        "Using OpenAI (model: {}, base URL: {})",
        config.model,
        config.base_url
    );
    Ok(Some(Arc::new(RigAdapter::new(model, &config.model))))
}
