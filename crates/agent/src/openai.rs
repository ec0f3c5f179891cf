//! OpenAI-style chat completions back end.
//!
//! Streaming responses are newline-delimited `data: {json}` records ending in
//! `data: [DONE]`. Tool-call arguments arrive as indexed slices of one JSON
//! string; slices sharing an index are concatenated and parsed once the body
//! ends.

use std::collections::BTreeMap;

use async_trait::async_trait;
use proto::{Block, Completion, ContentPart, LlmError, MessageContent, Role, ToolUseBlock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::llm::{
    ChatMessage, ChatRequest, ChatService, ProviderConfig, check_vision_model,
    require_vision_model,
};
use crate::stream::{
    CompletionStream, LineBuffer, StreamDecoder, ensure_success, parse_tool_input, skip_malformed,
    sse_data,
};

pub const PROVIDER_ID: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Model prefixes that accept image input.
const VISION_PREFIXES: &[&str] = &[
    "gpt-4o",
    "chatgpt-4o",
    "gpt-4.1",
    "gpt-4.5",
    "gpt-4-turbo",
    "gpt-4-vision",
    "gpt-5",
    "o1",
    "o3",
    "o4",
];
/// Text-only models that would otherwise match a prefix above.
const VISION_EXCLUDED: &[&str] = &["o1-mini", "o1-preview", "o3-mini", "gpt-4o-audio", "gpt-4o-realtime"];

/// Returns `true` when the model accepts images on this back end.
pub fn supports_vision(model: &str) -> bool {
    VISION_PREFIXES.iter().any(|p| model.starts_with(p))
        && !VISION_EXCLUDED.iter().any(|p| model.starts_with(p))
}

// ── Request types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    stream: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System {
        content: String,
    },
    User {
        content: OpenAiUserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<OpenAiToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiUserContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Serialize)]
struct OpenAiImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: OpenAiFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAiFunctionDefinition,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
}

// ── Response types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCall>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<StreamFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionCall {
    name: Option<String>,
    arguments: Option<String>,
}

// ── Decoder ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for `data:` framed chat completion chunks.
#[derive(Debug, Default)]
pub struct OpenAiDecoder {
    lines: LineBuffer,
    text: String,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    done: bool,
}

impl OpenAiDecoder {
    fn handle_line(&mut self, line: &str, out: &mut Vec<String>) {
        if self.done {
            return;
        }
        let Some(data) = sse_data(line) else {
            return;
        };
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => self.apply(chunk, out),
            Err(e) => skip_malformed(PROVIDER_ID, data, &e),
        }
    }

    fn apply(&mut self, chunk: StreamChunk, out: &mut Vec<String>) {
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.text.push_str(&content);
                out.push(content);
            }
            for fragment in choice.delta.tool_calls {
                let call = self.tool_calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                        call.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
        }
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn decode(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        for line in self.lines.push(chunk) {
            self.handle_line(&line, out);
        }
    }

    fn finish(&mut self, out: &mut Vec<String>) -> Completion {
        if let Some(line) = self.lines.flush() {
            self.handle_line(&line, out);
        }
        let mut blocks = Vec::new();
        if !self.text.is_empty() {
            blocks.push(Block::Text {
                text: std::mem::take(&mut self.text),
            });
        }
        for (index, call) in std::mem::take(&mut self.tool_calls) {
            match parse_tool_input(&call.arguments) {
                Ok(input) => blocks.push(Block::ToolUse(ToolUseBlock {
                    id: if call.id.is_empty() {
                        format!("call_{index}")
                    } else {
                        call.id
                    },
                    name: call.name,
                    input,
                })),
                Err(e) => skip_malformed(PROVIDER_ID, &call.arguments, &e),
            }
        }
        Completion::new(blocks)
    }
}

/// Normalizes a one-shot response document.
fn parse_response(body: &str) -> Result<Completion, LlmError> {
    let response: OpenAiResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::InvalidResponse(format!(
            "Deserialization error: {e}; body: {}",
            body.chars().take(200).collect::<String>()
        ))
    })?;
    let message = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?
        .message;

    let mut blocks = Vec::new();
    if let Some(text) = message.content.filter(|t| !t.is_empty()) {
        blocks.push(Block::Text { text });
    }
    for call in message.tool_calls {
        match parse_tool_input(&call.function.arguments) {
            Ok(input) => blocks.push(Block::ToolUse(ToolUseBlock {
                id: call.id,
                name: call.function.name,
                input,
            })),
            Err(e) => skip_malformed(PROVIDER_ID, &call.function.arguments, &e),
        }
    }
    Ok(Completion::new(blocks))
}

// ── Conversion helpers ─────────────────────────────────────────────────────────

/// Maps chat messages onto the role-tagged wire vocabulary. Tool results
/// become one `tool` message each.
fn convert_messages(messages: &[ChatMessage]) -> Result<Vec<OpenAiMessage>, LlmError> {
    let mut result = Vec::with_capacity(messages.len());
    for msg in messages {
        match (&msg.role, &msg.content) {
            (Role::System, content) => result.push(OpenAiMessage::System {
                content: content.text(),
            }),
            (Role::User, MessageContent::Text(text)) => result.push(OpenAiMessage::User {
                content: OpenAiUserContent::Text(text.clone()),
            }),
            (Role::User, MessageContent::Parts(parts)) => {
                let mut user_parts = Vec::new();
                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            user_parts.push(OpenAiContentPart::Text { text: text.clone() })
                        }
                        ContentPart::Image { image } => {
                            user_parts.push(OpenAiContentPart::ImageUrl {
                                image_url: OpenAiImageUrl {
                                    url: image.to_data_url(),
                                    detail: image.detail.as_str(),
                                },
                            })
                        }
                        ContentPart::ToolResult { tool_result } => {
                            result.push(OpenAiMessage::Tool {
                                tool_call_id: tool_result.tool_use_id.clone(),
                                content: tool_result.content.clone(),
                            })
                        }
                        ContentPart::ToolUse { .. } => {}
                    }
                }
                if !user_parts.is_empty() {
                    result.push(OpenAiMessage::User {
                        content: OpenAiUserContent::Parts(user_parts),
                    });
                }
            }
            (Role::Assistant, MessageContent::Text(text)) => {
                result.push(OpenAiMessage::Assistant {
                    content: Some(text.clone()),
                    tool_calls: Vec::new(),
                })
            }
            (Role::Assistant, MessageContent::Parts(parts)) => {
                let mut tool_calls = Vec::new();
                for part in parts {
                    if let ContentPart::ToolUse { tool_use } = part {
                        tool_calls.push(OpenAiToolCall {
                            id: tool_use.id.clone(),
                            kind: function_kind(),
                            function: OpenAiFunctionCall {
                                name: tool_use.name.clone(),
                                arguments: serde_json::to_string(&tool_use.input)
                                    .map_err(|e| LlmError::Serialization(e.to_string()))?,
                            },
                        });
                    }
                }
                let text = msg.content.text();
                result.push(OpenAiMessage::Assistant {
                    content: (!text.is_empty()).then_some(text),
                    tool_calls,
                });
            }
        }
    }
    Ok(result)
}

fn build_request(
    model: &str,
    request: &ChatRequest,
    max_tokens: u32,
    stream: bool,
) -> Result<OpenAiRequest, LlmError> {
    Ok(OpenAiRequest {
        model: model.to_string(),
        messages: convert_messages(&request.messages)?,
        max_tokens: request.max_tokens.unwrap_or(max_tokens),
        tools: request
            .tools
            .iter()
            .map(|t| OpenAiTool {
                kind: "function",
                function: OpenAiFunctionDefinition {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect(),
        stream,
    })
}

// ── Service ────────────────────────────────────────────────────────────────────

/// OpenAI-compatible chat completions service.
pub struct OpenAiChatService {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    vision_model: Option<String>,
}

impl OpenAiChatService {
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
        let body = build_request(model, request, DEFAULT_MAX_TOKENS, stream)?;
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(
            model = %model,
            messages = %body.messages.len(),
            tools = %body.tools.len(),
            stream,
            "Sending request to OpenAI"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if stream {
            return CompletionStream::from_response(response, OpenAiDecoder::default()).await;
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
impl ChatService for OpenAiChatService {
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

#[cfg(test)]
mod tests {
    use proto::{ImageData, ImageDetail, StopReason, ToolDefinition, ToolResultBlock};

    use super::*;

    fn decode_all(chunks: &[&str]) -> (Vec<String>, Completion) {
        let mut decoder = OpenAiDecoder::default();
        let mut out = Vec::new();
        for chunk in chunks {
            decoder.decode(chunk.as_bytes(), &mut out);
        }
        let completion = decoder.finish(&mut out);
        (out, completion)
    }

    #[test]
    fn text_and_split_tool_call_merge_into_blocks() {
        let (fragments, completion) = decode_all(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Checking \"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"the time\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"clock\",\"arguments\":\"{\\\"tz\\\":\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"UTC\\\"}\"}}]}}]}\n",
            "data: [DONE]\n",
        ]);
        assert_eq!(fragments, vec!["Checking ", "the time"]);
        assert_eq!(completion.stop_reason, StopReason::ToolUse);
        assert_eq!(completion.blocks.len(), 2);
        assert_eq!(completion.text(), "Checking the time");
        let tool = completion.tool_uses()[0];
        assert_eq!(tool.id, "call_1");
        assert_eq!(tool.name, "clock");
        assert_eq!(tool.input, serde_json::json!({"tz": "UTC"}));
    }

    #[test]
    fn records_split_across_chunks_are_reassembled() {
        let (fragments, completion) = decode_all(&[
            "data: {\"choices\":[{\"delta\":",
            "{\"content\":\"Hel",
            "lo\"}}]}\r\ndata: [DO",
            "NE]\r\n",
        ]);
        assert_eq!(fragments, vec!["Hello"]);
        assert_eq!(completion.stop_reason, StopReason::End);
    }

    #[test]
    fn interleaved_tool_indexes_are_kept_apart() {
        let (_, completion) = decode_all(&[
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"b\",\"function\":{\"name\":\"two\",\"arguments\":\"{\\\"n\\\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"a\",\"function\":{\"name\":\"one\",\"arguments\":\"{}\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"function\":{\"arguments\":\":2}\"}}]}}]}\n",
            "data: [DONE]\n",
        ]);
        let tools = completion.tool_uses();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "one");
        assert_eq!(tools[1].input, serde_json::json!({"n": 2}));
    }

    #[test]
    fn malformed_frame_is_skipped() {
        let (fragments, completion) = decode_all(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {not json\n",
            ": keep-alive comment\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
            "data: [DONE]\n",
        ]);
        assert_eq!(fragments, vec!["a", "b"]);
        assert_eq!(completion.text(), "ab");
    }

    #[test]
    fn unparseable_tool_arguments_drop_the_call() {
        let (_, completion) = decode_all(&[
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"x\",\"function\":{\"name\":\"broken\",\"arguments\":\"{oops\"}}]}}]}\n",
            "data: [DONE]\n",
        ]);
        assert!(completion.tool_uses().is_empty());
        assert_eq!(completion.stop_reason, StopReason::End);
    }

    #[test]
    fn frames_after_done_are_ignored() {
        let (fragments, _) = decode_all(&[
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        ]);
        assert!(fragments.is_empty());
    }

    #[test]
    fn parses_one_shot_response_with_tool_call() {
        let body = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id":"c1","type":"function","function":{"name":"clock","arguments":"{}"}}]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let completion = parse_response(body).expect("parse");
        assert_eq!(completion.stop_reason, StopReason::ToolUse);
        assert_eq!(completion.tool_uses()[0].id, "c1");
    }

    #[test]
    fn one_shot_response_without_choices_is_invalid() {
        let err = parse_response(r#"{"choices":[]}"#).expect_err("no choices");
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let msgs = vec![
            ChatMessage::user("time?"),
            ChatMessage::assistant_tool_uses(
                "",
                &[ToolUseBlock {
                    id: "c1".to_string(),
                    name: "clock".to_string(),
                    input: serde_json::json!({}),
                }],
            ),
            ChatMessage::tool_results(&[ToolResultBlock {
                tool_use_id: "c1".to_string(),
                content: "noon".to_string(),
            }]),
        ];
        let converted = convert_messages(&msgs).expect("conversion");
        let json = serde_json::to_value(&converted).expect("serialize");
        assert_eq!(json[1]["role"], "assistant");
        assert_eq!(json[1]["tool_calls"][0]["function"]["arguments"], "{}");
        assert!(json[1].get("content").is_none());
        assert_eq!(json[2]["role"], "tool");
        assert_eq!(json[2]["tool_call_id"], "c1");
    }

    #[test]
    fn image_part_carries_data_url_and_detail() {
        let image = ImageData::new("image/png", "AAAA").with_detail(ImageDetail::Low);
        let msgs = vec![ChatMessage::vision(Some("look"), image)];
        let json = serde_json::to_value(convert_messages(&msgs).expect("conversion"))
            .expect("serialize");
        let parts = &json[0]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(parts[1]["image_url"]["detail"], "low");
    }

    #[test]
    fn request_uses_explicit_budget_and_tool_schema() {
        let request = ChatRequest::new(vec![ChatMessage::system("be brief"), ChatMessage::user("hi")])
            .with_tools(vec![ToolDefinition::new(
                "clock",
                "Current time",
                serde_json::json!({"type":"object"}),
            )])
            .with_max_tokens(77);
        let body = build_request("gpt-4o-mini", &request, DEFAULT_MAX_TOKENS, true).expect("build");
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["max_tokens"], 77);
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "clock");
    }

    #[test]
    fn vision_table_matches_known_models() {
        assert!(supports_vision("gpt-4o"));
        assert!(supports_vision("gpt-4o-mini"));
        assert!(supports_vision("o4-mini"));
        assert!(!supports_vision("o3-mini"));
        assert!(!supports_vision("gpt-3.5-turbo"));
    }

    #[test]
    fn constructor_rejects_text_only_vision_model() {
        let config = ProviderConfig::new("sk", "gpt-4o").with_vision_model("gpt-3.5-turbo");
        let err = OpenAiChatService::new(config).err().expect("should fail");
        assert!(matches!(err, LlmError::UnsupportedVision { .. }));
    }

    #[test]
    fn constructor_defaults_base_url() {
        let service = OpenAiChatService::new(ProviderConfig::new("sk", "gpt-4o")).expect("build");
        assert_eq!(service.base_url, DEFAULT_BASE_URL);
        assert_eq!(service.default_max_tokens(), 1024);
        assert_eq!(service.provider_id(), "openai");
    }
}
