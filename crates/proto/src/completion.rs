//! Normalized result of one model call.

use serde::{Deserialize, Serialize};

use crate::tool::{ToolResultBlock, ToolUseBlock};

/// One unit of model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text { text: String },
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

/// Terminal classification of a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model finished its answer.
    End,
    /// The model wants one or more tools to run.
    ToolUse,
}

/// Blocks plus stop reason for one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub blocks: Vec<Block>,
    pub stop_reason: StopReason,
}

impl Completion {
    /// Builds a completion whose stop reason is derived from the blocks:
    /// `ToolUse` exactly when at least one tool-use block is present.
    pub fn new(blocks: Vec<Block>) -> Self {
        let stop_reason = if blocks.iter().any(|b| matches!(b, Block::ToolUse(_))) {
            StopReason::ToolUse
        } else {
            StopReason::End
        };
        Self {
            blocks,
            stop_reason,
        }
    }

    /// Convenience constructor for a single text answer.
    pub fn text_only(text: impl Into<String>) -> Self {
        Self::new(vec![Block::Text { text: text.into() }])
    }

    /// Concatenates all text blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Returns the tool-use blocks in order.
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::ToolUse(tool_use) => Some(tool_use),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_is_end_without_tool_blocks() {
        let completion = Completion::text_only("hi");
        assert_eq!(completion.stop_reason, StopReason::End);
        assert_eq!(completion.text(), "hi");
    }

    #[test]
    fn stop_reason_is_tool_use_with_any_tool_block() {
        let completion = Completion::new(vec![
            Block::Text {
                text: "checking".to_string(),
            },
            Block::ToolUse(ToolUseBlock {
                id: "t1".to_string(),
                name: "weather".to_string(),
                input: serde_json::json!({"city":"Oslo"}),
            }),
        ]);
        assert_eq!(completion.stop_reason, StopReason::ToolUse);
        assert_eq!(completion.tool_uses().len(), 1);
        assert_eq!(completion.tool_uses()[0].name, "weather");
    }

    #[test]
    fn empty_completion_ends() {
        let completion = Completion::new(Vec::new());
        assert_eq!(completion.stop_reason, StopReason::End);
        assert_eq!(completion.text(), "");
    }

    #[test]
    fn block_serializes_with_type_tag() {
        let block = Block::ToolResult(ToolResultBlock {
            tool_use_id: "t1".to_string(),
            content: "ok".to_string(),
        });
        let json = serde_json::to_value(&block).expect("serialize");
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_use_id"], "t1");
    }
}
