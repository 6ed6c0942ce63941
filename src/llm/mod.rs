//! LLM integration for the relay.
//!
//! The conversation loop only talks to the `LlmProvider` trait; the
//! Anthropic provider is the one concrete backend shipped with the binary.

pub mod anthropic;
pub mod provider;
pub mod reasoning;

pub use anthropic::AnthropicProvider;
pub use provider::*;
pub use reasoning::{Reasoning, ReasoningContext, RespondOutput, RespondResult, TokenUsage};

use std::sync::Arc;

use crate::config::ModelConfig;

/// Create the configured provider, or `None` when no credentials are set.
pub fn create_provider(config: &ModelConfig) -> Option<Arc<dyn LlmProvider>> {
    let api_key = config.api_key.clone()?;
    tracing::info!("Using Anthropic (model: {})", config.model);
    let mut provider = AnthropicProvider::new(api_key, &config.model);
    if let Some(base_url) = &config.base_url {
        tracing::info!(base_url = %base_url, "Using custom Anthropic endpoint");
        provider = provider.with_base_url(base_url);
    }
    Some(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_yields_no_provider() {
        let config = ModelConfig {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: None,
        };
        assert!(create_provider(&config).is_none());
    }

    #[test]
    fn provider_reports_model_name() {
        let config = ModelConfig {
            api_key: Some(secrecy::SecretString::from("sk-test")),
            model: "claude-3-5-haiku-latest".to_string(),
            base_url: Some("http://localhost:9000/v1".to_string()),
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "claude-3-5-haiku-latest");
    }
}
