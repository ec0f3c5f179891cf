//! Chat services, stream decoders, tool executor, tiered memory, and the
//! turn orchestrator.

pub mod anthropic;
pub mod events;
pub mod gemini;
pub mod llm;
pub mod memory;
pub mod openai;
pub mod registry;
pub mod runtime;
pub mod screenplay;
pub mod stream;
pub mod summarizer;
pub mod tool_registry;

/// Claude-style Messages API service.
pub use anthropic::AnthropicChatService;
/// Typed signal bus.
pub use events::EventBus;
/// Gemini-style generateContent service.
pub use gemini::GeminiChatService;
/// Chat request model and the uniform service contract.
pub use llm::{ChatMessage, ChatRequest, ChatService, ProviderConfig};
/// Tiered memory manager and its ports.
pub use memory::{InMemoryStorage, MemoryManager, MemoryOptions, MemoryStorage};
/// OpenAI-style chat completions service.
pub use openai::OpenAiChatService;
/// Explicit provider registry.
pub use registry::ProviderRegistry;
/// Turn orchestrator.
pub use runtime::{ChatProcessor, TurnOptions, TurnOutcome};
/// Lazy fragment stream with a terminal completion.
pub use stream::{CompletionStream, StreamEvent};
/// Summarizer port and the model-backed implementation.
pub use summarizer::{LlmSummarizer, Summarizer};
/// Concurrent tool executor.
pub use tool_registry::{ToolExecutor, ToolHandler, handler_fn};
