//! Gemini-style generateContent back end.
//!
//! The streaming endpoint sends one complete JSON document per chunk, framed
//! as elements of a JSON array. Function calls arrive whole, never as
//! fragments. The wire format has no system role, so system text is folded
//! into the user role.

use std::collections::HashMap;

use async_trait::async_trait;
use proto::{Block, Completion, ContentPart, LlmError, MessageContent, Role, ToolUseBlock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::llm::{
    ChatMessage, ChatRequest, ChatService, ProviderConfig, check_vision_model,
    require_vision_model,
};
use crate::stream::{CompletionStream, StreamDecoder, ensure_success, skip_malformed};

pub const PROVIDER_ID: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MAX_TOKENS: u32 = 2048;

const VISION_PREFIXES: &[&str] = &[
    "gemini-1.5",
    "gemini-2",
    "gemini-3",
    "gemini-exp",
    "gemini-pro-vision",
    "gemini-1.0-pro-vision",
];

/// Returns `true` when the model accepts images on this back end.
pub fn supports_vision(model: &str) -> bool {
    VISION_PREFIXES.iter().any(|p| model.starts_with(p))
}

// ── Request types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum RequestPart {
    Text(String),
    InlineData(InlineData),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
struct FunctionResponse {
    id: String,
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

// ── Response types ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

// ── Decoder ────────────────────────────────────────────────────────────────────

/// Accumulates normalized blocks across response documents.
#[derive(Debug, Default)]
struct Accumulator {
    text: String,
    tool_uses: Vec<ToolUseBlock>,
}

impl Accumulator {
    fn apply(&mut self, response: GeminiResponse, out: &mut Vec<String>) {
        if let Some(error) = response.error {
            warn!(provider = PROVIDER_ID, message = %error.message, "Response carried an error");
        }
        let parts = response
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts);
        for part in parts {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                self.text.push_str(&text);
                out.push(text);
            }
            if let Some(call) = part.function_call {
                self.tool_uses.push(ToolUseBlock {
                    id: call
                        .id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                    name: call.name,
                    input: if call.args.is_null() {
                        Value::Object(Default::default())
                    } else {
                        call.args
                    },
                });
            }
        }
    }

    fn into_completion(self) -> Completion {
        let mut blocks = Vec::with_capacity(self.tool_uses.len() + 1);
        if !self.text.is_empty() {
            blocks.push(Block::Text { text: self.text });
        }
        blocks.extend(self.tool_uses.into_iter().map(Block::ToolUse));
        Completion::new(blocks)
    }
}

/// Incremental decoder for a stream of whole JSON documents.
#[derive(Debug, Default)]
pub struct GeminiDecoder {
    pending: Vec<u8>,
    acc: Accumulator,
}

impl GeminiDecoder {
    /// Drops array punctuation, whitespace and optional `data:` prefixes
    /// between documents.
    fn skip_separators(&mut self) {
        loop {
            let skip = self
                .pending
                .iter()
                .take_while(|b| b.is_ascii_whitespace() || matches!(b, b'[' | b']' | b','))
                .count();
            self.pending.drain(..skip);
            if self.pending.starts_with(b"data:") {
                self.pending.drain(..5);
                continue;
            }
            break;
        }
    }

    fn drain_documents(&mut self, out: &mut Vec<String>) {
        loop {
            self.skip_separators();
            if self.pending.is_empty() {
                return;
            }
            let (next, consumed) = {
                let mut docs =
                    serde_json::Deserializer::from_slice(&self.pending).into_iter::<Value>();
                let next = docs.next();
                (next, docs.byte_offset())
            };
            match next {
                Some(Ok(doc)) => {
                    self.pending.drain(..consumed);
                    match serde_json::from_value::<GeminiResponse>(doc) {
                        Ok(response) => self.acc.apply(response, out),
                        Err(e) => skip_malformed(PROVIDER_ID, "<document>", &e),
                    }
                }
                Some(Err(e)) if e.is_eof() => return,
                Some(Err(e)) => {
                    // Wait for the rest of the bad document before dropping it.
                    let Some(end) = malformed_span(&self.pending) else {
                        return;
                    };
                    let frame = String::from_utf8_lossy(&self.pending[..end]).into_owned();
                    skip_malformed(PROVIDER_ID, &frame, &e);
                    self.pending.drain(..end);
                }
                None => return,
            }
        }
    }
}

/// Length of the malformed document at the head of `buf`: up to its matching
/// close bracket, or up to the next top-level separator when it never opened
/// one. `None` while the document is still incomplete.
fn malformed_span(buf: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in buf.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' if depth == 0 && i > 0 => return Some(i),
            b'{' | b'[' => depth += 1,
            b'}' | b']' if depth <= 1 => return Some(i + 1),
            b'}' | b']' => depth -= 1,
            b',' if depth == 0 => return Some(i),
            _ if depth == 0 && b.is_ascii_whitespace() => return Some(i),
            _ => {}
        }
    }
    None
}

impl StreamDecoder for GeminiDecoder {
    fn decode(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        self.pending.extend_from_slice(chunk);
        self.drain_documents(out);
    }

    fn finish(&mut self, out: &mut Vec<String>) -> Completion {
        self.drain_documents(out);
        self.skip_separators();
        if !self.pending.is_empty() {
            let frame = String::from_utf8_lossy(&self.pending).into_owned();
            skip_malformed(PROVIDER_ID, &frame, &"truncated document");
            self.pending.clear();
        }
        std::mem::take(&mut self.acc).into_completion()
    }
}

fn parse_response(body: &str) -> Result<Completion, LlmError> {
    let response: GeminiResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::InvalidResponse(format!(
            "Deserialization error: {e}; body: {}",
            body.chars().take(200).collect::<String>()
        ))
    })?;
    let mut acc = Accumulator::default();
    acc.apply(response, &mut Vec::new());
    Ok(acc.into_completion())
}

// ── Conversion helpers ─────────────────────────────────────────────────────────

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System | Role::User => "user",
        Role::Assistant => "model",
    }
}

/// Maps chat messages onto `contents`, merging neighbours that share a wire
/// role.
fn convert_messages(messages: &[ChatMessage]) -> Result<Vec<GeminiContent>, LlmError> {
    let mut tool_names: HashMap<&str, &str> = HashMap::new();
    let mut result: Vec<GeminiContent> = Vec::new();

    for msg in messages {
        let role = wire_role(msg.role);
        let mut parts = Vec::new();
        match &msg.content {
            MessageContent::Text(text) => parts.push(RequestPart::Text(text.clone())),
            MessageContent::Parts(segments) => {
                for segment in segments {
                    match segment {
                        ContentPart::Text { text } => parts.push(RequestPart::Text(text.clone())),
                        ContentPart::Image { image } => {
                            parts.push(RequestPart::InlineData(InlineData {
                                mime_type: image.media_type.clone(),
                                data: image.data.clone(),
                            }))
                        }
                        ContentPart::ToolUse { tool_use } => {
                            tool_names.insert(&tool_use.id, &tool_use.name);
                            parts.push(RequestPart::FunctionCall(FunctionCall {
                                id: Some(tool_use.id.clone()),
                                name: tool_use.name.clone(),
                                args: tool_use.input.clone(),
                            }));
                        }
                        ContentPart::ToolResult { tool_result } => {
                            let name = tool_names
                                .get(tool_result.tool_use_id.as_str())
                                .copied()
                                .ok_or_else(|| {
                                    LlmError::Serialization(format!(
                                        "tool result '{}' has no matching tool call",
                                        tool_result.tool_use_id
                                    ))
                                })?;
                            parts.push(RequestPart::FunctionResponse(FunctionResponse {
                                id: tool_result.tool_use_id.clone(),
                                name: name.to_string(),
                                response: serde_json::json!({ "content": tool_result.content }),
                            }));
                        }
                    }
                }
            }
        }
        if parts.is_empty() {
            continue;
        }
        match result.last_mut() {
            Some(last) if last.role == role => last.parts.extend(parts),
            _ => result.push(GeminiContent { role, parts }),
        }
    }
    Ok(result)
}

fn build_request(
    request: &ChatRequest,
    max_tokens: u32,
) -> Result<GeminiRequest, LlmError> {
    let tools = if request.tools.is_empty() {
        Vec::new()
    } else {
        vec![GeminiTool {
            function_declarations: request
                .tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        }]
    };
    Ok(GeminiRequest {
        contents: convert_messages(&request.messages)?,
        tools,
        generation_config: GenerationConfig {
            max_output_tokens: request.max_tokens.unwrap_or(max_tokens),
        },
    })
}

// ── Service ────────────────────────────────────────────────────────────────────

/// Gemini generateContent chat service.
pub struct GeminiChatService {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    vision_model: Option<String>,
}

impl GeminiChatService {
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

    fn endpoint(&self, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!(
            "{}/v1beta/models/{model}:{method}",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn send(
        &self,
        model: &str,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<CompletionStream, LlmError> {
        let body = build_request(request, DEFAULT_MAX_TOKENS)?;
        let url = self.endpoint(model, stream);
        debug!(
            model = %model,
            contents = %body.contents.len(),
            tools = %request.tools.len(),
            stream,
            "Sending request to Gemini"
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if stream {
            return CompletionStream::from_response(response, GeminiDecoder::default()).await;
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
impl ChatService for GeminiChatService {
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
