//! CLI entrypoint: configuration, logging bootstrap, and the chat loop.

mod config;
mod storage;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent::{
    ChatProcessor, EventBus, LlmSummarizer, MemoryManager, ProviderRegistry, ToolExecutor,
    handler_fn,
};
use anyhow::Context;
use base64::{Engine, engine::general_purpose::STANDARD};
use clap::{Parser, Subcommand};
use proto::{Block, Emotion, ImageData, ToolDefinition};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::storage::JsonFileStorage;

/// Top-level command-line arguments.
#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Streaming multi-provider chat with tiered memory", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Also write debug logs to ~/.parley/logs/
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (default)
    Chat,
    /// Send one message and exit
    Run {
        #[arg(short = 'e', long)]
        exec: String,
    },
    /// Ask about an image file
    Vision {
        image: PathBuf,
        #[arg(short = 'm', long)]
        message: Option<String>,
    },
    /// Delete every stored memory
    Forget,
}

/// A line typed at the chat prompt.
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand<'a> {
    Say(&'a str),
    Clear,
    Forget,
    Quit,
    Empty,
}

fn parse_repl_line(line: &str) -> ReplCommand<'_> {
    match line.trim() {
        "" => ReplCommand::Empty,
        "/quit" | "/exit" => ReplCommand::Quit,
        "/clear" => ReplCommand::Clear,
        "/forget" => ReplCommand::Forget,
        text => ReplCommand::Say(text),
    }
}

fn media_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn emotion_label(emotion: Emotion) -> &'static str {
    match emotion {
        Emotion::Neutral => "neutral",
        Emotion::Happy => "happy",
        Emotion::Angry => "angry",
        Emotion::Sad => "sad",
        Emotion::Relaxed => "relaxed",
        Emotion::Surprised => "surprised",
    }
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;
    if cli.debug {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let log_dir = PathBuf::from(home).join(".parley").join("logs");
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);

        let console = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(console_filter);
        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(EnvFilter::new("debug,hyper_util=info,rustls=info,reqwest=info"));
        tracing_subscriber::registry().with(console).with(file).init();
        info!(
            version = env!("CARGO_PKG_VERSION"),
            log_level = %cli.log_level,
            "========== parley session start =========="
        );
    } else {
        _file_guard = None;
        fmt()
            .with_env_filter(console_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let processor = build_processor(&config)?;
    let loaded = processor.load_memories().await?;
    info!(loaded, "Memories ready");

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => cmd_chat(&processor).await,
        Commands::Run { exec } => cmd_run(&processor, &exec).await,
        Commands::Vision { image, message } => {
            cmd_vision(&processor, &image, message.as_deref()).await
        }
        Commands::Forget => {
            processor.memory().clear_all_memories().await?;
            println!("All memories cleared.");
            Ok(())
        }
    }
}

fn build_tools() -> anyhow::Result<ToolExecutor> {
    let mut tools = ToolExecutor::new();
    tools.register(
        ToolDefinition::new(
            "current_time",
            "Returns the current date and time in UTC (RFC 3339).",
            json!({"type": "object", "properties": {}}),
        )
        .with_timeout_ms(1000),
        handler_fn(|_| async { Ok(Value::String(chrono::Utc::now().to_rfc3339())) }),
    )?;
    Ok(tools)
}

fn build_processor(config: &Config) -> anyhow::Result<ChatProcessor> {
    if config.provider.api_key.is_empty() {
        warn!("No API key configured. Set provider.api_key or PARLEY_API_KEY.");
    }
    let registry = Arc::new(ProviderRegistry::with_builtins());
    let service = registry.create(&config.provider.name, config.provider.to_provider_config())?;
    info!(
        provider = %service.provider_id(),
        model = %service.model(),
        vision_model = ?service.vision_model(),
        "Chat service ready"
    );

    let events = Arc::new(EventBus::new());
    let memory = MemoryManager::new(
        config.memory.options(),
        Arc::new(JsonFileStorage::new(&config.memory.storage_path)),
        Arc::new(LlmSummarizer::new(Arc::clone(&service))),
        Arc::clone(&events),
    )?;

    Ok(ChatProcessor::new(
        registry,
        service,
        Arc::new(build_tools()?),
        Arc::new(memory),
        events,
        config.chat.turn_options(),
    ))
}

fn print_fragment(fragment: &str) {
    print!("{fragment}");
    std::io::stdout().flush().ok();
}

/// Runs one text turn, printing tokens as they arrive, then any tool results.
async fn say(processor: &ChatProcessor, text: &str) -> anyhow::Result<()> {
    let outcome = processor.process_message(text, print_fragment).await?;
    println!();
    println!("  ({})", emotion_label(outcome.screenplay.emotion));

    if !outcome.tool_uses.is_empty() {
        let blocks: Vec<Block> = outcome.tool_uses.into_iter().map(Block::ToolUse).collect();
        for result in processor.run_tools(&blocks).await? {
            println!("  [tool {}] {}", result.tool_use_id, result.content);
        }
    }
    Ok(())
}

async fn cmd_chat(processor: &ChatProcessor) -> anyhow::Result<()> {
    println!(
        "parley: {} / {}. Type /clear, /forget or /quit.",
        processor.service().provider_id(),
        processor.service().model()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match parse_repl_line(&line) {
            ReplCommand::Empty => continue,
            ReplCommand::Quit => break,
            ReplCommand::Clear => {
                processor.clear_history();
                println!("History cleared.");
            }
            ReplCommand::Forget => {
                processor.memory().clear_all_memories().await?;
                println!("Memories cleared.");
            }
            ReplCommand::Say(text) => {
                if let Err(e) = say(processor, text).await {
                    println!();
                    eprintln!("Error: {e}");
                }
            }
        }
    }
    Ok(())
}

async fn cmd_run(processor: &ChatProcessor, exec: &str) -> anyhow::Result<()> {
    say(processor, exec).await
}

async fn cmd_vision(
    processor: &ChatProcessor,
    path: &Path,
    message: Option<&str>,
) -> anyhow::Result<()> {
    let media_type = media_type_for(path)
        .with_context(|| format!("unsupported image type: {}", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let image = ImageData::new(media_type, STANDARD.encode(bytes));

    let outcome = processor
        .process_vision(image, message, print_fragment)
        .await?;
    println!();
    println!("  ({})", emotion_label(outcome.screenplay.emotion));
    Ok(())
}
