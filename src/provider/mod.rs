//! Streaming provider trait and the built-in Anthropic implementation.

pub mod http;

#[cfg(feature = "anthropic")]
pub mod anthropic;

use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use futures::stream::BoxStream;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::types::{ModelMessage, StreamSignal};

/// Ordered stream of provider signals for one turn.
pub type SignalStream = BoxStream<'static, Result<StreamSignal, EngineError>>;

/// A request for one provider turn.
#[derive(Debug, Clone, Builder)]
pub struct ProviderRequest {
    #[builder(into)]
    pub model: String,
    pub messages: Vec<ModelMessage>,
    #[builder(default)]
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    #[builder(into)]
    pub system_prompt: Option<String>,
    /// Reasoning budget; `None` disables extended thinking.
    pub thinking_budget: Option<u32>,
    #[builder(default)]
    pub prompt_caching: bool,
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A language-model backend that streams one turn at a time.
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Open the stream for a turn. An `Err` here means the setup call itself
    /// failed; errors inside the returned stream are per-signal failures.
    async fn stream(&self, request: &ProviderRequest) -> Result<SignalStream, EngineError>;
}

/// Create the default provider from configuration.
pub fn create_provider(config: &EngineConfig) -> Result<Arc<dyn StreamingProvider>, EngineError> {
    #[cfg(feature = "anthropic")]
    {
        let api_key = config
            .anthropic_api_key
            .clone()
            .ok_or_else(|| EngineError::Authentication("Missing ANTHROPIC_API_KEY".into()))?;
        Ok(Arc::new(anthropic::AnthropicProvider::new(
            api_key,
            config.anthropic_base_url.clone(),
        )))
    }
    #[cfg(not(feature = "anthropic"))]
    {
        let _ = config;
        Err(EngineError::Configuration(
            "no provider enabled via feature flags".into(),
        ))
    }
}
