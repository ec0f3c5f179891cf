//! Provider registry: name to service factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use proto::LlmError;
use tracing::debug;

use crate::anthropic::{self, AnthropicChatService};
use crate::gemini::{self, GeminiChatService};
use crate::llm::{ChatService, ProviderConfig};
use crate::openai::{self, OpenAiChatService};

/// Builds a chat service from provider settings.
pub type ProviderFactory =
    Arc<dyn Fn(ProviderConfig) -> Result<Arc<dyn ChatService>, LlmError> + Send + Sync>;

/// Explicit name to factory map, built once and shared by reference.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the `openai`, `anthropic` and `gemini` back ends.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(openai::PROVIDER_ID, |config| {
            Ok(Arc::new(OpenAiChatService::new(config)?) as Arc<dyn ChatService>)
        });
        registry.register(anthropic::PROVIDER_ID, |config| {
            Ok(Arc::new(AnthropicChatService::new(config)?) as Arc<dyn ChatService>)
        });
        registry.register(gemini::PROVIDER_ID, |config| {
            Ok(Arc::new(GeminiChatService::new(config)?) as Arc<dyn ChatService>)
        });
        registry
    }

    /// Adds or replaces a factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ProviderConfig) -> Result<Arc<dyn ChatService>, LlmError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Instantiates the named provider.
    pub fn create(
        &self,
        name: &str,
        config: ProviderConfig,
    ) -> Result<Arc<dyn ChatService>, LlmError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LlmError::UnknownProvider(name.to_string()))?;
        debug!(provider = %name, model = %config.model, "Creating chat service");
        factory(config)
    }

    /// Returns `true` when a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered provider names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
