//! Turn orchestration: prompt assembly, model call, transcript and memory
//! bookkeeping.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use proto::{
    Block, ChatEvent, Completion, Error, ImageData, ImageDetail, Message, Screenplay,
    ToolResultBlock, ToolUseBlock,
};
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::llm::{ChatMessage, ChatRequest, ChatService, ProviderConfig};
use crate::memory::MemoryManager;
use crate::registry::ProviderRegistry;
use crate::screenplay;
use crate::summarizer::LlmSummarizer;
use crate::tool_registry::ToolExecutor;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a warm, attentive conversation partner. \
Begin every reply with exactly one emotion tag chosen from [neutral], [happy], [angry], \
[sad], [relaxed] or [surprised], then answer naturally and concisely.";
pub const DEFAULT_VISION_SYSTEM_PROMPT: &str = "The user has shared an image. Describe what \
matters in it and respond to their message about it, keeping the same tone and emotion tag \
format.";
const MEMORY_HEADER: &str = "What you remember about this conversation:";

/// Built-in output length presets.
pub const DEFAULT_PRESETS: [(&str, u32); 3] = [("short", 256), ("medium", 1024), ("long", 4096)];

/// Prompting and output-budget settings for turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOptions {
    pub system_prompt: String,
    pub vision_system_prompt: String,
    /// Explicit output budget; wins over everything else.
    pub max_tokens: Option<u32>,
    /// Named preset consulted when no explicit budget is set.
    pub length_preset: Option<String>,
    pub presets: BTreeMap<String, u32>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            vision_system_prompt: DEFAULT_VISION_SYSTEM_PROMPT.to_string(),
            max_tokens: None,
            length_preset: None,
            presets: DEFAULT_PRESETS
                .iter()
                .map(|(name, tokens)| (name.to_string(), *tokens))
                .collect(),
        }
    }
}

impl TurnOptions {
    /// Output budget: explicit limit, then named preset, then the provider
    /// default. An unknown preset name falls through to the provider default.
    pub fn resolve_max_tokens(&self, provider_default: u32) -> u32 {
        if let Some(explicit) = self.max_tokens {
            return explicit;
        }
        if let Some(name) = &self.length_preset {
            match self.presets.get(name) {
                Some(&tokens) => return tokens,
                None => warn!(preset = %name, "Unknown length preset; using provider default"),
            }
        }
        provider_default
    }
}

/// Result of one finalized turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The assistant message (appended to the transcript when non-empty).
    pub message: Message,
    pub screenplay: Screenplay,
    /// Tool calls the model asked for. Resolving them is up to the caller.
    pub tool_uses: Vec<ToolUseBlock>,
    pub completion: Completion,
}

#[derive(Debug, Default)]
struct Conversation {
    transcript: Vec<Message>,
    start_time: Option<DateTime<Utc>>,
}

/// Clears the in-flight flag and emits turn-end however the turn exits.
struct TurnGuard<'a> {
    busy: &'a AtomicBool,
    events: &'a EventBus,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        self.events.emit(&ChatEvent::TurnEnded);
    }
}

/// Drives one conversation: one turn at a time against the active service.
pub struct ChatProcessor {
    registry: Arc<ProviderRegistry>,
    service: RwLock<Arc<dyn ChatService>>,
    tools: Arc<ToolExecutor>,
    memory: Arc<MemoryManager>,
    events: Arc<EventBus>,
    options: RwLock<TurnOptions>,
    conversation: Mutex<Conversation>,
    busy: AtomicBool,
}

impl ChatProcessor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        service: Arc<dyn ChatService>,
        tools: Arc<ToolExecutor>,
        memory: Arc<MemoryManager>,
        events: Arc<EventBus>,
        options: TurnOptions,
    ) -> Self {
        Self {
            registry,
            service: RwLock::new(service),
            tools,
            memory,
            events,
            options: RwLock::new(options),
            conversation: Mutex::new(Conversation::default()),
            busy: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// The active chat service.
    pub fn service(&self) -> Arc<dyn ChatService> {
        Arc::clone(&*self.service.read())
    }

    pub fn options(&self) -> TurnOptions {
        self.options.read().clone()
    }

    pub fn set_options(&self, options: TurnOptions) {
        *self.options.write() = options;
    }

    /// `true` while a turn is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Copy of the transcript.
    pub fn history(&self) -> Vec<Message> {
        self.conversation.lock().transcript.clone()
    }

    /// Purges the transcript and forgets the conversation start time.
    pub fn clear_history(&self) {
        let mut conversation = self.conversation.lock();
        conversation.transcript.clear();
        conversation.start_time = None;
        info!("Conversation history cleared");
    }

    /// Loads persisted memories; call once at start-up.
    pub async fn load_memories(&self) -> Result<usize, Error> {
        Ok(self.memory.load().await?)
    }

    /// Replaces the active back end (and the summarizer with it).
    pub fn switch_provider(&self, name: &str, config: ProviderConfig) -> Result<(), Error> {
        let service = self.registry.create(name, config)?;
        self.memory
            .set_summarizer(Arc::new(LlmSummarizer::new(Arc::clone(&service))));
        info!(provider = %name, model = %service.model(), "Switched provider");
        *self.service.write() = service;
        Ok(())
    }

    /// Runs a text turn, calling `on_text` for every streamed fragment.
    ///
    /// Rejected with [`Error::TurnInProgress`] while another turn is in flight;
    /// a rejected call changes nothing.
    pub async fn process_message<F>(&self, text: &str, on_text: F) -> Result<TurnOutcome, Error>
    where
        F: FnMut(&str) + Send,
    {
        let _guard = self.begin_turn()?;
        let result = self.text_turn(text, on_text).await;
        self.report(result)
    }

    /// Runs a vision turn. The image is sent at reduced fidelity and neither
    /// it nor `text` is added to the transcript.
    pub async fn process_vision<F>(
        &self,
        image: ImageData,
        text: Option<&str>,
        on_text: F,
    ) -> Result<TurnOutcome, Error>
    where
        F: FnMut(&str) + Send,
    {
        let _guard = self.begin_turn()?;
        let result = self.vision_turn(image, text, on_text).await;
        self.report(result)
    }

    /// Executes tool-use blocks through the executor, emitting a signal per
    /// call and per result. The model is not called again.
    pub async fn run_tools(&self, blocks: &[Block]) -> Result<Vec<ToolResultBlock>, Error> {
        for block in blocks {
            if let Block::ToolUse(tool_use) = block {
                self.events.emit(&ChatEvent::ToolUse {
                    block: tool_use.clone(),
                });
            }
        }
        let results = self.tools.run(blocks).await?;
        for result in &results {
            self.events.emit(&ChatEvent::ToolResult {
                block: result.clone(),
            });
        }
        Ok(results)
    }

    fn begin_turn(&self) -> Result<TurnGuard<'_>, Error> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Turn rejected; another turn is in flight");
            return Err(Error::TurnInProgress);
        }
        self.events.emit(&ChatEvent::TurnStarted);
        Ok(TurnGuard {
            busy: &self.busy,
            events: &self.events,
        })
    }

    fn report(&self, result: Result<TurnOutcome, Error>) -> Result<TurnOutcome, Error> {
        if let Err(e) = &result {
            warn!(error = %e, "Turn failed");
            self.events.emit(&ChatEvent::Error {
                message: e.to_string(),
            });
        }
        result
    }

    /// Records the start time if unset, optionally appends a user message,
    /// and returns the transcript snapshot with the start time.
    fn enter(&self, user_text: Option<&str>) -> (Vec<Message>, DateTime<Utc>) {
        let mut conversation = self.conversation.lock();
        let start = *conversation.start_time.get_or_insert_with(Utc::now);
        if let Some(text) = user_text {
            conversation.transcript.push(Message::user(text));
        }
        (conversation.transcript.clone(), start)
    }

    async fn base_messages(&self, transcript: &[Message]) -> Vec<ChatMessage> {
        let system_prompt = self.options.read().system_prompt.clone();
        let mut messages = Vec::with_capacity(transcript.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        if let Some(memory) = self.memory.memory_for_prompt().await {
            messages.push(ChatMessage::system(format!("{MEMORY_HEADER}\n{memory}")));
        }
        messages.extend(transcript.iter().map(ChatMessage::from));
        messages
    }

    fn request(&self, messages: Vec<ChatMessage>, service: &dyn ChatService) -> ChatRequest {
        let max_tokens = self
            .options
            .read()
            .resolve_max_tokens(service.default_max_tokens());
        debug!(
            provider = %service.provider_id(),
            max_tokens,
            messages = messages.len(),
            tools = self.tools.len(),
            "Assembled request"
        );
        ChatRequest::new(messages)
            .with_tools(self.tools.definitions())
            .with_max_tokens(max_tokens)
    }

    async fn text_turn<F>(&self, text: &str, on_text: F) -> Result<TurnOutcome, Error>
    where
        F: FnMut(&str) + Send,
    {
        let (transcript, start) = self.enter(Some(text));
        self.memory.create_memory_if_needed(&transcript, start).await?;

        let service = self.service();
        let messages = self.base_messages(&transcript).await;
        let request = self.request(messages, service.as_ref());
        let stream = service.chat_once(&request, true).await?;
        let completion = stream.collect_with(self.forwarder(on_text)).await?;
        self.finalize(completion).await
    }

    async fn vision_turn<F>(
        &self,
        image: ImageData,
        text: Option<&str>,
        on_text: F,
    ) -> Result<TurnOutcome, Error>
    where
        F: FnMut(&str) + Send,
    {
        let (transcript, start) = self.enter(None);
        self.memory.create_memory_if_needed(&transcript, start).await?;

        let service = self.service();
        let mut messages = self.base_messages(&transcript).await;
        let vision_prompt = self.options.read().vision_system_prompt.clone();
        messages.push(ChatMessage::system(vision_prompt));
        messages.push(ChatMessage::vision(
            text,
            image.with_detail(ImageDetail::Low),
        ));
        let request = self.request(messages, service.as_ref());
        let stream = service.vision_chat_once(&request, true).await?;
        let completion = stream.collect_with(self.forwarder(on_text)).await?;
        self.finalize(completion).await
    }

    fn forwarder<'a, F>(&'a self, mut on_text: F) -> impl FnMut(&str) + 'a
    where
        F: FnMut(&str) + Send + 'a,
    {
        move |fragment: &str| {
            self.events.emit(&ChatEvent::PartialText {
                text: fragment.to_string(),
            });
            on_text(fragment);
        }
    }

    async fn finalize(&self, completion: Completion) -> Result<TurnOutcome, Error> {
        let text = completion.text();
        let screenplay = screenplay::parse(&text);
        let message = Message::assistant(text);
        if !message.content.is_empty() {
            self.conversation.lock().transcript.push(message.clone());
        }

        self.memory.cleanup_old_memories().await?;

        let tool_uses: Vec<ToolUseBlock> = completion.tool_uses().into_iter().cloned().collect();
        if !tool_uses.is_empty() {
            info!(count = tool_uses.len(), "Model requested tools; returning them to the caller");
        }
        self.events.emit(&ChatEvent::MessageFinalized {
            message: message.clone(),
            screenplay: screenplay.clone(),
        });
        Ok(TurnOutcome {
            message,
            screenplay,
            tool_uses,
            completion,
        })
    }
}
