//! Shared protocol types for chat services, the tool executor, memory, and
//! the turn orchestrator.
//!
//! This crate defines serializable message/block/memory/event structures and
//! strongly-typed error enums shared across the workspace.

pub mod completion;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod tool;

/// Re-export of normalized model output types.
pub use completion::{Block, Completion, StopReason};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of emitted signal types.
pub use event::{ChatEvent, Emotion, EventKind, Screenplay};
/// Re-export of memory record types.
pub use memory::{MemoryRecord, MemoryTier};
/// Re-export of conversation message types.
pub use message::{ContentPart, ImageData, ImageDetail, Message, MessageContent, Role};
/// Re-export of tool definition and block types.
pub use tool::{ToolConfig, ToolDefinition, ToolResultBlock, ToolUseBlock};
