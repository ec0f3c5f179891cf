//! Tool registry and concurrent executor for model-requested tool calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use proto::{Block, ToolDefinition, ToolError, ToolResultBlock, ToolUseBlock};
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Error a handler may return; reported as [`ToolError::ExecutionFailed`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Async tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Runs the tool. A `Value::String` result is used verbatim; anything
    /// else is JSON-serialized.
    async fn call(&self, input: Value) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, input: Value) -> Result<Value, HandlerError> {
        (self.0)(input).await
    }
}

/// Wraps an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> impl ToolHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

/// Registry of tools, dispatching every call of a batch concurrently.
#[derive(Default)]
pub struct ToolExecutor {
    tools: Vec<RegisteredTool>,
    by_name: HashMap<String, usize>,
}

impl ToolExecutor {
    /// Creates an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. Names are unique.
    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: impl ToolHandler + 'static,
    ) -> Result<(), ToolError> {
        if self.by_name.contains_key(&definition.name) {
            return Err(ToolError::DuplicateName(definition.name));
        }
        debug!(tool = %definition.name, "Registering tool");
        self.by_name
            .insert(definition.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            definition,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Tool schemas in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    /// Registered tool names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .map(|t| t.definition.name.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Executes every tool-use block in `blocks` concurrently.
    ///
    /// Results come back in input order. An unknown tool name rejects the
    /// batch before any handler starts; a failing or timed-out handler
    /// rejects the batch with no partial results.
    pub async fn run(&self, blocks: &[Block]) -> Result<Vec<ToolResultBlock>, ToolError> {
        let calls: Vec<(&ToolUseBlock, &RegisteredTool)> = blocks
            .iter()
            .filter_map(|block| match block {
                Block::ToolUse(tool_use) => Some(tool_use),
                _ => None,
            })
            .map(|tool_use| {
                self.by_name
                    .get(&tool_use.name)
                    .map(|&i| (tool_use, &self.tools[i]))
                    .ok_or_else(|| ToolError::NotFound(tool_use.name.clone()))
            })
            .collect::<Result<_, _>>()?;

        debug!(count = calls.len(), "Dispatching tool batch");

        let spawned: Vec<_> = calls
            .into_iter()
            .map(|(tool_use, tool)| {
                let task = tokio::spawn(invoke(
                    Arc::clone(&tool.handler),
                    tool_use.name.clone(),
                    tool_use.input.clone(),
                    tool.definition.config.timeout_ms,
                ));
                (tool_use, task)
            })
            .collect();
        // A rejected (or dropped) batch takes its still-running siblings down with it.
        let _abort = AbortOnDrop(spawned.iter().map(|(_, task)| task.abort_handle()).collect());

        let tasks = spawned.into_iter().map(|(tool_use, task)| async move {
            let content = task.await.map_err(|e| ToolError::ExecutionFailed {
                name: tool_use.name.clone(),
                reason: e.to_string(),
            })??;
            Ok::<_, ToolError>(ToolResultBlock {
                tool_use_id: tool_use.id.clone(),
                content,
            })
        });

        try_join_all(tasks).await
    }
}

struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

async fn invoke(
    handler: Arc<dyn ToolHandler>,
    name: String,
    input: Value,
    timeout_ms: Option<u64>,
) -> Result<String, ToolError> {
    let call = handler.call(input);
    let result = match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
            .await
            .map_err(|_| {
                warn!(tool = %name, timeout_ms = ms, "Tool timed out");
                ToolError::Timeout {
                    name: name.clone(),
                    timeout_ms: ms,
                }
            })?,
        None => call.await,
    };

    match result {
        Ok(Value::String(text)) => Ok(text),
        Ok(other) => serde_json::to_string(&other).map_err(|e| ToolError::ExecutionFailed {
            name,
            reason: e.to_string(),
        }),
        Err(e) => {
            warn!(tool = %name, error = %e, "Tool failed");
            Err(ToolError::ExecutionFailed {
                name,
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn tool_use(id: &str, name: &str) -> Block {
        Block::ToolUse(ToolUseBlock {
            id: id.to_string(),
            name: name.to_string(),
            input: serde_json::json!({}),
        })
    }

    fn schema() -> Value {
        serde_json::json!({"type":"object"})
    }

    fn sleeper(ms: u64, reply: &'static str) -> impl ToolHandler {
        handler_fn(move |_| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::String(reply.to_string()))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_input_order_not_completion_order() {
        let mut executor = ToolExecutor::new();
        executor
            .register(ToolDefinition::new("slow", "", schema()), sleeper(500, "A"))
            .expect("register slow");
        executor
            .register(ToolDefinition::new("fast", "", schema()), sleeper(10, "B"))
            .expect("register fast");

        let results = executor
            .run(&[tool_use("1", "slow"), tool_use("2", "fast")])
            .await
            .expect("run");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tool_use_id, "1");
        assert_eq!(results[0].content, "A");
        assert_eq!(results[1].tool_use_id, "2");
        assert_eq!(results[1].content, "B");
    }

    #[tokio::test]
    async fn duplicate_registration_fails_before_any_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut executor = ToolExecutor::new();
        let counter = Arc::clone(&calls);
        executor
            .register(
                ToolDefinition::new("echo", "", schema()),
                handler_fn(move |input| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(input)
                    }
                }),
            )
            .expect("first register");
        let err = executor
            .register(
                ToolDefinition::new("echo", "", schema()),
                sleeper(0, "never"),
            )
            .expect_err("duplicate");
        assert!(matches!(err, ToolError::DuplicateName(ref n) if n == "echo"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(executor.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_past_timeout_rejects_batch() {
        let mut executor = ToolExecutor::new();
        executor
            .register(
                ToolDefinition::new("lagging", "", schema()).with_timeout_ms(1000),
                sleeper(2000, "late"),
            )
            .expect("register");

        let err = executor
            .run(&[tool_use("1", "lagging")])
            .await
            .expect_err("should time out");
        let message = err.to_string();
        assert!(message.contains("lagging"));
        assert!(message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batch_aborts_running_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&finished);
        let mut executor = ToolExecutor::new();
        executor
            .register(
                ToolDefinition::new("fast_fail", "", schema()).with_timeout_ms(10),
                sleeper(100, "late"),
            )
            .expect("register fast_fail");
        executor
            .register(
                ToolDefinition::new("slow", "", schema()),
                handler_fn(move |_| {
                    let flag = Arc::clone(&flag);
                    async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        flag.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }),
            )
            .expect("register slow");

        let err = executor
            .run(&[tool_use("1", "fast_fail"), tool_use("2", "slow")])
            .await
            .expect_err("timeout");
        assert!(matches!(err, ToolError::Timeout { ref name, .. } if name == "fast_fail"));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_inside_timeout_resolves() {
        let mut executor = ToolExecutor::new();
        executor
            .register(
                ToolDefinition::new("quick", "", schema()).with_timeout_ms(1000),
                sleeper(999, "made it"),
            )
            .expect("register");

        let results = executor
            .run(&[tool_use("1", "quick")])
            .await
            .expect("within timeout");
        assert_eq!(results[0].content, "made it");
    }

    #[tokio::test]
    async fn unknown_tool_rejects_whole_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut executor = ToolExecutor::new();
        executor
            .register(
                ToolDefinition::new("known", "", schema()),
                handler_fn(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }),
            )
            .expect("register");

        let err = executor
            .run(&[tool_use("1", "known"), tool_use("2", "ghost")])
            .await
            .expect_err("unknown");
        assert!(matches!(err, ToolError::NotFound(ref n) if n == "ghost"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_string_results_are_serialized() {
        let mut executor = ToolExecutor::new();
        executor
            .register(
                ToolDefinition::new("stats", "", schema()),
                handler_fn(|_| async { Ok(serde_json::json!({"count": 3})) }),
            )
            .expect("register");
        let results = executor.run(&[tool_use("1", "stats")]).await.expect("run");
        assert_eq!(results[0].content, r#"{"count":3}"#);
    }

    #[tokio::test]
    async fn handler_error_becomes_execution_failure() {
        let mut executor = ToolExecutor::new();
        executor
            .register(
                ToolDefinition::new("flaky", "", schema()),
                handler_fn(|_| async { Err::<Value, HandlerError>("disk full".into()) }),
            )
            .expect("register");
        let err = executor
            .run(&[tool_use("1", "flaky")])
            .await
            .expect_err("failure");
        assert!(
            matches!(err, ToolError::ExecutionFailed { ref name, ref reason } if name == "flaky" && reason == "disk full")
        );
    }

    #[tokio::test]
    async fn non_tool_blocks_are_ignored() {
        let executor = ToolExecutor::new();
        let results = executor
            .run(&[Block::Text {
                text: "hello".to_string(),
            }])
            .await
            .expect("run");
        assert!(results.is_empty());
    }

    #[test]
    fn definitions_keep_registration_order() {
        let mut executor = ToolExecutor::new();
        for name in ["b", "a", "c"] {
            executor
                .register(ToolDefinition::new(name, "", schema()), sleeper(0, ""))
                .expect("register");
        }
        assert_eq!(executor.names(), vec!["b", "a", "c"]);
        assert_eq!(executor.definitions()[1].name, "a");
    }
}
