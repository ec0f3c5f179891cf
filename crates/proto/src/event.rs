use serde::{Deserialize, Serialize};

use crate::memory::MemoryRecord;
use crate::message::Message;
use crate::tool::{ToolResultBlock, ToolUseBlock};

/// Emotion tag attached to a finalized reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    #[default]
    Neutral,
    Happy,
    Angry,
    Sad,
    Relaxed,
    Surprised,
}

impl std::str::FromStr for Emotion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "neutral" => Ok(Emotion::Neutral),
            "happy" => Ok(Emotion::Happy),
            "angry" => Ok(Emotion::Angry),
            "sad" => Ok(Emotion::Sad),
            "relaxed" => Ok(Emotion::Relaxed),
            "surprised" => Ok(Emotion::Surprised),
            other => Err(format!("unknown emotion '{other}'")),
        }
    }
}

/// Reply text paired with an emotion, handed to voice/avatar consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenplay {
    pub emotion: Emotion,
    pub text: String,
}

/// Signals emitted by the orchestrator and the memory manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A turn began.
    TurnStarted,
    /// A turn finished, successfully or not.
    TurnEnded,
    /// A streamed text fragment.
    PartialText { text: String },
    /// The assistant message was appended to the transcript.
    MessageFinalized {
        message: Message,
        screenplay: Screenplay,
    },
    /// The model asked for a tool.
    ToolUse { block: ToolUseBlock },
    /// A tool produced a result.
    ToolResult { block: ToolResultBlock },
    /// A tier record was created (replacing any previous one).
    MemoryCreated { record: MemoryRecord },
    /// A record was evicted.
    MemoryRemoved { record: MemoryRecord },
    /// Records were loaded from storage.
    MemoryLoaded { count: usize },
    /// Records were persisted.
    MemorySaved { count: usize },
    /// A turn failed.
    Error { message: String },
}

/// Discriminant of [`ChatEvent`], used to key listener lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TurnStarted,
    TurnEnded,
    PartialText,
    MessageFinalized,
    ToolUse,
    ToolResult,
    MemoryCreated,
    MemoryRemoved,
    MemoryLoaded,
    MemorySaved,
    Error,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 11] = [
        EventKind::TurnStarted,
        EventKind::TurnEnded,
        EventKind::PartialText,
        EventKind::MessageFinalized,
        EventKind::ToolUse,
        EventKind::ToolResult,
        EventKind::MemoryCreated,
        EventKind::MemoryRemoved,
        EventKind::MemoryLoaded,
        EventKind::MemorySaved,
        EventKind::Error,
    ];
}

impl ChatEvent {
    /// Returns the listener key for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            ChatEvent::TurnStarted => EventKind::TurnStarted,
            ChatEvent::TurnEnded => EventKind::TurnEnded,
            ChatEvent::PartialText { .. } => EventKind::PartialText,
            ChatEvent::MessageFinalized { .. } => EventKind::MessageFinalized,
            ChatEvent::ToolUse { .. } => EventKind::ToolUse,
            ChatEvent::ToolResult { .. } => EventKind::ToolResult,
            ChatEvent::MemoryCreated { .. } => EventKind::MemoryCreated,
            ChatEvent::MemoryRemoved { .. } => EventKind::MemoryRemoved,
            ChatEvent::MemoryLoaded { .. } => EventKind::MemoryLoaded,
            ChatEvent::MemorySaved { .. } => EventKind::MemorySaved,
            ChatEvent::Error { .. } => EventKind::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(ChatEvent::TurnStarted.kind(), EventKind::TurnStarted);
        assert_eq!(
            ChatEvent::PartialText {
                text: "a".to_string()
            }
            .kind(),
            EventKind::PartialText
        );
        assert_eq!(
            ChatEvent::MemorySaved { count: 2 }.kind(),
            EventKind::MemorySaved
        );
    }

    #[test]
    fn emotion_parse_is_case_insensitive() {
        assert_eq!(Emotion::from_str("Happy").expect("parse"), Emotion::Happy);
        assert!(Emotion::from_str("bored").is_err());
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let event = ChatEvent::Error {
            message: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["kind"], "error");
        assert_eq!(json["message"], "boom");
    }
}
