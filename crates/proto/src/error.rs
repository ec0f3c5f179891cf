use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// LLM provider error.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Tool registration/execution error.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Memory storage error.
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Internal protocol type error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),

    /// A turn was requested while another turn is still running.
    #[error("A turn is already in progress")]
    TurnInProgress,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// LLM provider errors
#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider answered with a non-success status. The body is kept verbatim.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network failure while sending the request or reading the body.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Provider response schema/content was invalid.
    #[error("Invalid response from LLM: {0}")]
    InvalidResponse(String),

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The configured vision model cannot accept images on this back end.
    #[error("Model '{model}' does not support vision on provider '{provider}'")]
    UnsupportedVision { provider: String, model: String },

    /// A vision call was made on a service built without a vision model.
    #[error("Provider '{0}' was created without a vision model")]
    VisionNotConfigured(String),

    /// The model asked for a tool on a path that cannot resolve tool calls.
    #[error(
        "Model requested tool(s) [{0}] on the streaming convenience path; \
         use chat_once / vision_chat_once and resolve tool calls explicitly"
    )]
    UnexpectedToolUse(String),

    /// No factory is registered under this provider name.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

/// Tool execution errors
#[derive(Debug, Error)]
pub enum ToolError {
    /// A tool with this name is already registered.
    #[error("Tool '{0}' is already registered")]
    DuplicateName(String),

    /// Requested tool is unknown.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Tool exceeded its configured timeout.
    #[error("Tool '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    /// Tool handler failed.
    #[error("Tool '{name}' failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    /// Tool call arguments are invalid.
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
}

/// Memory errors
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Storage port failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Memory options are inconsistent.
    #[error("Invalid memory options: {0}")]
    InvalidOptions(String),
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid role string value.
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Invalid memory tier string value.
    #[error("Invalid memory tier: {0}")]
    InvalidTier(String),

    /// Image payload could not be interpreted.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
