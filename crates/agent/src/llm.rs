//! Chat request model and the uniform service contract every back end implements.

use async_trait::async_trait;
use proto::{
    ContentPart, ImageData, LlmError, Message, MessageContent, Role, ToolDefinition,
    ToolResultBlock, ToolUseBlock,
};

use crate::stream::CompletionStream;

/// A message as sent to a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Semantic role of this message.
    pub role: Role,
    /// Plain text or ordered segments.
    pub content: MessageContent,
}

impl ChatMessage {
    /// Creates a system-role message with the given content.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Creates a user-role message with the given content.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Creates an assistant-role message with the given content.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Creates a user message carrying optional text followed by an image.
    pub fn vision(text: Option<&str>, image: ImageData) -> Self {
        let mut parts = Vec::new();
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            parts.push(ContentPart::Text {
                text: text.to_string(),
            });
        }
        parts.push(ContentPart::Image { image });
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    /// Creates an assistant message replaying tool calls the model made.
    pub fn assistant_tool_uses(text: &str, tool_uses: &[ToolUseBlock]) -> Self {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text {
                text: text.to_string(),
            });
        }
        parts.extend(tool_uses.iter().cloned().map(|tool_use| ContentPart::ToolUse { tool_use }));
        Self {
            role: Role::Assistant,
            content: MessageContent::Parts(parts),
        }
    }

    /// Creates a user message carrying tool results.
    pub fn tool_results(results: &[ToolResultBlock]) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(
                results
                    .iter()
                    .cloned()
                    .map(|tool_result| ContentPart::ToolResult { tool_result })
                    .collect(),
            ),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: MessageContent::Text(message.content.clone()),
        }
    }
}

/// Request to a chat service
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Full chat history including system messages.
    pub messages: Vec<ChatMessage>,
    /// Available tool schemas. Empty means the no-tool fast path.
    pub tools: Vec<ToolDefinition>,
    /// Output budget; the service default applies when `None`.
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Creates a request without tools or an explicit budget.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            max_tokens: None,
        }
    }

    /// Attaches tool schemas.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the output budget.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Settings a provider factory needs to build a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    /// API key sent with every request.
    pub api_key: String,
    /// Model used for text turns.
    pub model: String,
    /// Model used for vision turns. Vision is disabled when `None`.
    pub vision_model: Option<String>,
    /// Endpoint override (proxies, tests).
    pub base_url: Option<String>,
}

impl ProviderConfig {
    /// Creates a config for a text-only service.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            vision_model: None,
            base_url: None,
        }
    }

    /// Enables vision with the given model.
    pub fn with_vision_model(mut self, model: impl Into<String>) -> Self {
        self.vision_model = Some(model.into());
        self
    }

    /// Overrides the endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// Uniform contract over every back end.
///
/// `chat_once` / `vision_chat_once` are the tool-aware paths: they return the
/// whole completion, tool-use blocks included. `process_chat` /
/// `process_vision_chat` are streaming conveniences that refuse to end in a
/// tool call, because resolving one is the caller's decision.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Provider identifier (e.g. "openai", "anthropic", "gemini").
    fn provider_id(&self) -> &str;

    /// Model used for text turns.
    fn model(&self) -> &str;

    /// Model used for vision turns, when vision is enabled.
    fn vision_model(&self) -> Option<&str>;

    /// Output budget used when a request does not set one.
    fn default_max_tokens(&self) -> u32;

    /// Sends a request; `stream` selects incremental or one-shot decoding.
    async fn chat_once(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<CompletionStream, LlmError>;

    /// Same as [`chat_once`](Self::chat_once) but against the vision model.
    async fn vision_chat_once(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<CompletionStream, LlmError>;

    /// Streams a text answer. With tools attached the completion must end
    /// with `stop_reason == end`; a tool request becomes
    /// [`LlmError::UnexpectedToolUse`].
    async fn process_chat(&self, request: &ChatRequest) -> Result<CompletionStream, LlmError> {
        let stream = self.chat_once(request, true).await?;
        Ok(if request.tools.is_empty() {
            stream
        } else {
            stream.require_end()
        })
    }

    /// Vision counterpart of [`process_chat`](Self::process_chat).
    async fn process_vision_chat(
        &self,
        request: &ChatRequest,
    ) -> Result<CompletionStream, LlmError> {
        let stream = self.vision_chat_once(request, true).await?;
        Ok(if request.tools.is_empty() {
            stream
        } else {
            stream.require_end()
        })
    }
}

/// Rejects a configured vision model the back end cannot use.
pub(crate) fn check_vision_model(
    provider: &str,
    vision_model: Option<&str>,
    supports_vision: fn(&str) -> bool,
) -> Result<(), LlmError> {
    match vision_model {
        Some(model) if !supports_vision(model) => Err(LlmError::UnsupportedVision {
            provider: provider.to_string(),
            model: model.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Returns the vision model or explains that vision is off.
pub(crate) fn require_vision_model<'a>(
    provider: &str,
    vision_model: Option<&'a str>,
) -> Result<&'a str, LlmError> {
    vision_model.ok_or_else(|| LlmError::VisionNotConfigured(provider.to_string()))
}
