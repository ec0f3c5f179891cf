//! Claude-style Messages API back end.

use std::collections::BTreeMap;

use async_trait::async_trait;
use proto::{Block, Completion, ContentPart, LlmError, MessageContent, Role, ToolUseBlock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::{
    ChatMessage, ChatRequest, ChatService, ProviderConfig, check_vision_model,
    require_vision_model,
};
use crate::stream::{
    CompletionStream, LineBuffer, StreamDecoder, ensure_success, parse_tool_input, skip_malformed,
    sse_data,
};

pub const PROVIDER_ID: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

const VISION_PREFIXES: &[&str] = &[
    "claude-3",
    "claude-4",
    "claude-sonnet-4",
    "claude-opus-4",
    "claude-haiku-4",
];

/// Returns `true` when the model accepts images on this back end.
pub fn supports_vision(model: &str) -> bool {
    VISION_PREFIXES.iter().any(|p| model.starts_with(p))
}

// ── Request types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<RequestBlock>),
}

impl AnthropicContent {
    fn into_blocks(self) -> Vec<RequestBlock> {
        match self {
            AnthropicContent::Text(text) => vec![RequestBlock::Text { text }],
            AnthropicContent::Blocks(blocks) => blocks,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

// ── Response types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// One typed server-sent event.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

// ── Decoder ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum OpenBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

/// Incremental decoder for typed content-block events.
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    lines: LineBuffer,
    open: BTreeMap<usize, OpenBlock>,
    closed: BTreeMap<usize, Block>,
}

impl AnthropicDecoder {
    fn handle_line(&mut self, line: &str, out: &mut Vec<String>) {
        let Some(data) = sse_data(line) else {
            return;
        };
        if data.is_empty() {
            return;
        }
        match serde_json::from_str::<AnthropicEvent>(data) {
            Ok(event) => self.apply(event, out),
            Err(e) => skip_malformed(PROVIDER_ID, data, &e),
        }
    }

    fn apply(&mut self, event: AnthropicEvent, out: &mut Vec<String>) {
        match event {
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StartBlock::Text { text } => {
                    if !text.is_empty() {
                        out.push(text.clone());
                    }
                    self.open.insert(index, OpenBlock::Text(text));
                }
                StartBlock::ToolUse { id, name } => {
                    self.open.insert(
                        index,
                        OpenBlock::ToolUse {
                            id,
                            name,
                            json: String::new(),
                        },
                    );
                }
                StartBlock::Other => {}
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    let block = self
                        .open
                        .entry(index)
                        .or_insert_with(|| OpenBlock::Text(String::new()));
                    if let OpenBlock::Text(buf) = block {
                        buf.push_str(&text);
                        out.push(text);
                    }
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(OpenBlock::ToolUse { json, .. }) = self.open.get_mut(&index) {
                        json.push_str(&partial_json);
                    }
                }
                BlockDelta::Other => {}
            },
            AnthropicEvent::ContentBlockStop { index } => self.close(index),
            AnthropicEvent::Error { error } => {
                warn!(provider = PROVIDER_ID, message = %error.message, "Stream reported an error event");
            }
            AnthropicEvent::Other => {}
        }
    }

    fn close(&mut self, index: usize) {
        let Some(block) = self.open.remove(&index) else {
            return;
        };
        match block {
            OpenBlock::Text(text) => {
                if !text.is_empty() {
                    self.closed.insert(index, Block::Text { text });
                }
            }
            OpenBlock::ToolUse { id, name, json } => match parse_tool_input(&json) {
                Ok(input) => {
                    self.closed
                        .insert(index, Block::ToolUse(ToolUseBlock { id, name, input }));
                }
                Err(e) => skip_malformed(PROVIDER_ID, &json, &e),
            },
        }
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        for line in self.lines.push(chunk) {
            self.handle_line(&line, out);
        }
    }

    fn finish(&mut self, out: &mut Vec<String>) -> Completion {
        if let Some(line) = self.lines.flush() {
            self.handle_line(&line, out);
        }
        // Blocks the server never closed (truncated body).
        let unclosed: Vec<usize> = self.open.keys().copied().collect();
        for index in unclosed {
            self.close(index);
        }
        Completion::new(std::mem::take(&mut self.closed).into_values().collect())
    }
}

fn parse_response(body: &str) -> Result<Completion, LlmError> {
    let response: AnthropicResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::InvalidResponse(format!(
            "Deserialization error: {e}; body: {}",
            body.chars().take(200).collect::<String>()
        ))
    })?;
    let blocks = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseBlock::Text { text } if !text.is_empty() => Some(Block::Text { text }),
            ResponseBlock::ToolUse { id, name, input } => Some(Block::ToolUse(ToolUseBlock {
                id,
                name,
                input: if input.is_null() {
                    Value::Object(Default::default())
                } else {
                    input
                },
            })),
            _ => None,
        })
        .collect();
    Ok(Completion::new(blocks))
}

// ── Conversion helpers ─────────────────────────────────────────────────────────

/// Joins every system message into the top-level `system` field.
fn extract_system(messages: &[ChatMessage]) -> Option<String> {
    let parts: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.text())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

/// Converts chat messages into Anthropic format.
///
/// System messages are skipped (handled via top-level `system`). Consecutive
/// messages with the same role are merged, since the API requires
/// alternating turns.
fn convert_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
    let mut result: Vec<AnthropicMessage> = Vec::new();
    for msg in messages {
        let role = match msg.role {
            Role::System => continue,
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = convert_content(&msg.content);
        match result.last_mut() {
            Some(last) if last.role == role => {
                let previous = std::mem::replace(&mut last.content, AnthropicContent::Blocks(Vec::new()));
                let mut blocks = previous.into_blocks();
                blocks.extend(content.into_blocks());
                last.content = AnthropicContent::Blocks(blocks);
            }
            _ => result.push(AnthropicMessage { role, content }),
        }
    }
    result
}

fn convert_content(content: &MessageContent) -> AnthropicContent {
    match content {
        MessageContent::Text(text) => AnthropicContent::Text(text.clone()),
        MessageContent::Parts(parts) => AnthropicContent::Blocks(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => RequestBlock::Text { text: text.clone() },
                    ContentPart::Image { image } => RequestBlock::Image {
                        source: ImageSource {
                            kind: "base64",
                            media_type: image.media_type.clone(),
                            data: image.data.clone(),
                        },
                    },
                    ContentPart::ToolUse { tool_use } => RequestBlock::ToolUse {
                        id: tool_use.id.clone(),
                        name: tool_use.name.clone(),
                        input: tool_use.input.clone(),
                    },
                    ContentPart::ToolResult { tool_result } => RequestBlock::ToolResult {
                        tool_use_id: tool_result.tool_use_id.clone(),
                        content: tool_result.content.clone(),
                    },
                })
                .collect(),
        ),
    }
}

fn build_request(
    model: &str,
    request: &ChatRequest,
    max_tokens: u32,
    stream: bool,
) -> AnthropicRequest {
    AnthropicRequest {
        model: model.to_string(),
        max_tokens: request.max_tokens.unwrap_or(max_tokens),
        system: extract_system(&request.messages),
        messages: convert_messages(&request.messages),
        tools: request
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect(),
        stream,
    }
}

// ── Service ────────────────────────────────────────────────────────────────────

/// Anthropic Messages API chat service.
pub struct AnthropicChatService {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    vision_model: Option<String>,
}

impl AnthropicChatService {
    /// Builds a service; fails when the vision model cannot take images.
    pub fn new(config: ProviderConfig) -> Result<Self, LlmError> {
        check_vision_model(PROVIDER_ID, config.vision_model.as_deref(), supports_vision)?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key: config.api_key,
            base_url: config
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: config.model,
            vision_model: config.vision_model,
        })
    }

    async fn send(
        &self,
        model: &str,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<CompletionStream, LlmError> {
        let body = build_request(model, request, DEFAULT_MAX_TOKENS, stream);
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        debug!(
            model = %model,
            messages = %body.messages.len(),
            tools = %body.tools.len(),
            stream,
            "Sending request to Anthropic"
        );

        let response = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if stream {
            return CompletionStream::from_response(response, AnthropicDecoder::default()).await;
        }
        let text = ensure_success(response)
            .await?
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        parse_response(&text).map(CompletionStream::ready)
    }
}

#[async_trait]
impl ChatService for AnthropicChatService {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn vision_model(&self) -> Option<&str> {
        self.vision_model.as_deref()
    }

    fn default_max_tokens(&self) -> u32 {
        DEFAULT_MAX_TOKENS
    }

    async fn chat_once(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<CompletionStream, LlmError> {
        self.send(&self.model, request, stream).await
    }

    async fn vision_chat_once(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<CompletionStream, LlmError> {
        let model = require_vision_model(PROVIDER_ID, self.vision_model.as_deref())?;
        self.send(model, request, stream).await
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
