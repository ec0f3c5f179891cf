//! Transcript summarization used by the memory tiers.

use std::sync::Arc;

use async_trait::async_trait;
use proto::Message;
use tracing::{debug, warn};

use crate::llm::{ChatMessage, ChatRequest, ChatService};

const DEFAULT_PROMPT: &str = "You condense conversations into memory notes. \
Summarize the conversation below, keeping names, preferences, decisions and open \
questions. Write plain prose without preamble.";
const TOPIC_PREVIEW_CHARS: usize = 100;
const SUMMARY_TOKEN_BUDGET: u32 = 512;

/// Produces a summary of a transcript. Never fails: implementations fall back
/// to [`fallback_summary`] instead of propagating errors.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        messages: &[Message],
        max_length: Option<usize>,
        custom_prompt: Option<&str>,
    ) -> String;
}

/// Deterministic summary used when the model is unavailable:
/// `"<n> messages. Latest topic: <truncated>..."`.
pub fn fallback_summary(messages: &[Message], max_length: Option<usize>) -> String {
    let preview_len = max_length.map_or(TOPIC_PREVIEW_CHARS, |m| m.min(TOPIC_PREVIEW_CHARS));
    let latest = messages
        .last()
        .map(|m| truncate_chars(m.content.trim(), preview_len))
        .unwrap_or_default();
    format!("{} messages. Latest topic: {latest}...", messages.len())
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Summarizer backed by any chat service, using a one-shot non-streaming call.
pub struct LlmSummarizer {
    service: Arc<dyn ChatService>,
}

impl LlmSummarizer {
    pub fn new(service: Arc<dyn ChatService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        messages: &[Message],
        max_length: Option<usize>,
        custom_prompt: Option<&str>,
    ) -> String {
        if messages.is_empty() {
            return fallback_summary(messages, max_length);
        }

        let mut prompt = custom_prompt.unwrap_or(DEFAULT_PROMPT).to_string();
        if let Some(max) = max_length {
            prompt.push_str(&format!(" Stay under {max} characters."));
        }
        let request = ChatRequest::new(vec![
            ChatMessage::system(prompt),
            ChatMessage::user(render_transcript(messages)),
        ])
        .with_max_tokens(SUMMARY_TOKEN_BUDGET);

        let result = match self.service.chat_once(&request, false).await {
            Ok(stream) => stream.completion().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(completion) => {
                let text = completion.text();
                let text = text.trim();
                if text.is_empty() {
                    warn!(provider = %self.service.provider_id(), "Empty summary; using fallback");
                    return fallback_summary(messages, max_length);
                }
                debug!(chars = text.chars().count(), "Summary produced");
                match max_length {
                    Some(max) => truncate_chars(text, max),
                    None => text.to_string(),
                }
            }
            Err(e) => {
                warn!(provider = %self.service.provider_id(), error = %e, "Summarization failed; using fallback");
                fallback_summary(messages, max_length)
            }
        }
    }
}
