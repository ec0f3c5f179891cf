//! Byte-stream framing and the lazy completion stream shared by every back end.
//!
//! A provider decoder is a synchronous state machine fed one network chunk at
//! a time. [`CompletionStream`] drives it from the response body: it only
//! suspends while waiting for the next chunk, hands out text fragments in
//! arrival order, and finishes with exactly one [`StreamEvent::Completed`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use proto::{Completion, LlmError, StopReason};
use serde_json::Value;
use tracing::{debug, warn};

/// Incremental decoder for one provider's wire framing.
pub trait StreamDecoder: Send {
    /// Consumes one chunk of the response body, pushing user-visible text
    /// fragments onto `out` in arrival order.
    fn decode(&mut self, chunk: &[u8], out: &mut Vec<String>);

    /// Flushes buffered input once the body has ended and builds the completion.
    fn finish(&mut self, out: &mut Vec<String>) -> Completion;
}

/// Item produced by a [`CompletionStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A user-visible text fragment.
    Delta(String),
    /// The terminal value. Always the last item.
    Completed(Completion),
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, LlmError>> + Send>>;

/// Finite, non-restartable sequence of text fragments followed by one
/// completion.
pub struct CompletionStream {
    source: Option<ByteStream>,
    decoder: Option<Box<dyn StreamDecoder>>,
    pending: VecDeque<Result<StreamEvent, LlmError>>,
    require_end: bool,
}

impl CompletionStream {
    /// Wraps a body stream and the decoder that understands its framing.
    pub fn new<S, D>(body: S, decoder: D) -> Self
    where
        S: Stream<Item = Result<Bytes, LlmError>> + Send + 'static,
        D: StreamDecoder + 'static,
    {
        Self {
            source: Some(Box::pin(body)),
            decoder: Some(Box::new(decoder)),
            pending: VecDeque::new(),
            require_end: false,
        }
    }

    /// Builds a stream for a response that was received in one piece.
    /// Each text block is surfaced as one fragment before the completion.
    pub fn ready(completion: Completion) -> Self {
        let mut pending: VecDeque<Result<StreamEvent, LlmError>> = VecDeque::new();
        for block in &completion.blocks {
            if let proto::Block::Text { text } = block
                && !text.is_empty()
            {
                pending.push_back(Ok(StreamEvent::Delta(text.clone())));
            }
        }
        pending.push_back(Ok(StreamEvent::Completed(completion)));
        Self {
            source: None,
            decoder: None,
            pending,
            require_end: false,
        }
    }

    /// Checks the status before any decoding starts, then streams the body.
    pub async fn from_response<D>(response: reqwest::Response, decoder: D) -> Result<Self, LlmError>
    where
        D: StreamDecoder + 'static,
    {
        let response = ensure_success(response).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| LlmError::Transport(e.to_string())));
        Ok(Self::new(body, decoder))
    }

    /// Turns a terminal `tool_use` completion into
    /// [`LlmError::UnexpectedToolUse`]. Text fragments are still delivered.
    pub fn require_end(mut self) -> Self {
        self.require_end = true;
        self
    }

    /// Drives the stream to the end, calling `on_text` for every fragment.
    pub async fn collect_with<F>(mut self, mut on_text: F) -> Result<Completion, LlmError>
    where
        F: FnMut(&str),
    {
        while let Some(item) = self.next().await {
            match item? {
                StreamEvent::Delta(text) => on_text(&text),
                StreamEvent::Completed(completion) => return Ok(completion),
            }
        }
        Err(LlmError::InvalidResponse(
            "stream ended without a completion".to_string(),
        ))
    }

    /// Drives the stream to the end, discarding fragments.
    pub async fn completion(self) -> Result<Completion, LlmError> {
        self.collect_with(|_| {}).await
    }

    fn push_fragments(&mut self, fragments: Vec<String>) {
        self.pending.extend(
            fragments
                .into_iter()
                .filter(|f| !f.is_empty())
                .map(|f| Ok(StreamEvent::Delta(f))),
        );
    }

    fn gate(&self, event: StreamEvent) -> Result<StreamEvent, LlmError> {
        match event {
            StreamEvent::Completed(completion)
                if self.require_end && completion.stop_reason == StopReason::ToolUse =>
            {
                let names = completion
                    .tool_uses()
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(LlmError::UnexpectedToolUse(names))
            }
            other => Ok(other),
        }
    }
}

impl Stream for CompletionStream {
    type Item = Result<StreamEvent, LlmError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item.and_then(|event| this.gate(event))));
            }
            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };
            match source.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    let mut out = Vec::new();
                    if let Some(decoder) = this.decoder.as_mut() {
                        decoder.decode(&chunk, &mut out);
                    }
                    this.push_fragments(out);
                }
                Poll::Ready(Some(Err(err))) => {
                    this.source = None;
                    this.decoder = None;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.source = None;
                    if let Some(mut decoder) = this.decoder.take() {
                        let mut out = Vec::new();
                        let completion = decoder.finish(&mut out);
                        debug!(
                            blocks = completion.blocks.len(),
                            stop_reason = ?completion.stop_reason,
                            "Stream decoded"
                        );
                        this.push_fragments(out);
                        this.pending
                            .push_back(Ok(StreamEvent::Completed(completion)));
                    }
                }
            }
        }
    }
}

/// Fails fast on a non-success status, surfacing the body verbatim.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    debug!(status = %status.as_u16(), "Provider response received");
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .map_err(|e| LlmError::Transport(e.to_string()))?;
    Err(LlmError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Splits a byte stream into lines. Bytes are buffered until a full line is
/// available, so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends a chunk and returns every line it completed, without the
    /// trailing `\n` / `\r\n`.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// Returns the unterminated remainder, if any.
    pub(crate) fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Extracts the payload of an SSE `data:` line.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Parses a fully accumulated tool-argument string. Empty input means no
/// arguments.
pub(crate) fn parse_tool_input(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}

/// Logs and discards a frame that failed to parse.
pub(crate) fn skip_malformed(provider: &str, frame: &str, err: &dyn std::fmt::Display) {
    let preview: String = frame.chars().take(200).collect();
    warn!(provider, error = %err, frame = %preview, "Skipping malformed stream frame");
}
