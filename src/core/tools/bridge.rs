//! Dispatch of one model-issued tool call: loop breaking, execution and
//! model-assisted argument repair.

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use super::{Executor, RepeatingDetector, ToolContext};
use crate::core::agent::AgentRole;
use crate::core::chain::{ToolCall, ToolCallResponse};
use crate::core::config::EngineConfig;
use crate::core::error::{ChainError, is_cancelled, is_fatal};
use crate::core::llm::{LlmProvider, RetryPolicy, call_simple_retry};
use crate::core::prompts::{PromptType, Prompter};

/// Pulls a JSON payload out of model text: a fenced ```json block first,
/// then raw text starting with `{` or `[`.
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed);
    }
    None
}

pub fn repeating_message(name: &str) -> String {
    format!("tool call '{}' is repeating, please try another tool", name)
}

/// Result of one dispatch. `arguments` are the ones the tool finally ran
/// with, which differ from the model's when the fixer rewrote them.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub response: ToolCallResponse,
    pub arguments: String,
    /// False when the call was short-circuited by the repeating detector.
    pub executed: bool,
}

/// Owns the per-loop repeating-call state; one bridge per execution loop.
pub struct ToolCallBridge {
    llm: Arc<dyn LlmProvider>,
    prompter: Arc<dyn Prompter>,
    policy: RetryPolicy,
    max_tool_retries: usize,
    detector: RepeatingDetector,
}

impl ToolCallBridge {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        prompter: Arc<dyn Prompter>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            llm,
            prompter,
            policy: RetryPolicy::from(config),
            max_tool_retries: config.max_tool_retries.max(1),
            detector: RepeatingDetector::new(config.repeating_threshold),
        }
    }

    pub async fn dispatch(
        &mut self,
        ctx: &ToolContext,
        executor: &dyn Executor,
        call: &ToolCall,
        thinking: &str,
    ) -> Result<Dispatched> {
        let respond = |content: String| ToolCallResponse {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content,
        };

        if self.detector.detect(call) {
            warn!(tool = %call.name, role = %ctx.agent.current_role, "Repeating tool call detected");
            return Ok(Dispatched {
                response: respond(repeating_message(&call.name)),
                arguments: call.arguments.clone(),
                executed: false,
            });
        }

        let mut args = call.arguments.clone();
        let mut last_error = String::new();

        for attempt in 1..=self.max_tool_retries {
            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    return Err(anyhow::Error::new(ChainError::Cancelled))
                        .with_context(|| format!("tool call '{}' cancelled", call.name));
                }
                res = executor.execute(ctx, &call.name, thinking, &args) => res,
            };

            match outcome {
                Ok(content) => {
                    return Ok(Dispatched {
                        response: respond(content),
                        arguments: args,
                        executed: true,
                    });
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(
                        tool = %call.name,
                        attempt,
                        max_attempts = self.max_tool_retries,
                        "Tool call failed: {:#}",
                        e
                    );
                    last_error = format!("{:#}", e);
                }
            }

            if attempt < self.max_tool_retries {
                args = self
                    .fix_arguments(ctx, executor, call, &args, &last_error)
                    .await?;
            }
        }

        Err(ChainError::ToolRetriesExhausted {
            name: call.name.clone(),
            last_error,
        }
        .into())
    }

    async fn fix_arguments(
        &self,
        ctx: &ToolContext,
        executor: &dyn Executor,
        call: &ToolCall,
        args: &str,
        error: &str,
    ) -> Result<String> {
        let schema = executor.tool_schema(&call.name).unwrap_or(Value::Null);
        let prompt = self.prompter.render(
            PromptType::Agent(AgentRole::ToolCallFixer),
            &json!({
                "name": call.name,
                "arguments": args,
                "error": error,
                "schema": serde_json::to_string_pretty(&schema)?,
            }),
        )?;

        let reply = call_simple_retry(
            self.llm.as_ref(),
            &self.policy,
            &ctx.cancel,
            AgentRole::ToolCallFixer,
            &prompt,
        )
        .await
        .map_err(|e| {
            if is_cancelled(&e) {
                e
            } else {
                e.context(format!("failed to fix arguments of tool '{}'", call.name))
            }
        })?;

        let fixed = extract_json_block(&reply)
            .ok_or_else(|| anyhow!("tool call fixer returned no JSON for '{}'", call.name))?;
        let value: Value = serde_json::from_str(fixed)
            .map_err(|e| anyhow!("tool call fixer returned invalid JSON for '{}': {}", call.name, e))?;

        info!(tool = %call.name, "Tool call arguments rewritten");
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::AgentContext;
    use crate::core::chain::Message;
    use crate::core::llm::{ContentResponse, StreamWriter, ToolDefinition};
    use crate::core::prompts::TemplatePrompter;
    use crate::core::tools::{ExecutorHandler, FlowExecutor, RegisteredTool};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Answers every simple call with the next scripted reply.
    struct FixerLlm {
        replies: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl FixerLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for FixerLlm {
        fn name(&self) -> &str {
            "fixer"
        }

        fn model(&self, _role: AgentRole) -> String {
            "fixer-1".into()
        }

        async fn call(&self, role: AgentRole, _prompt: &str) -> Result<String> {
            assert_eq!(role, AgentRole::ToolCallFixer);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow!("no scripted reply"))
        }

        async fn call_with_tools(
            &self,
            _role: AgentRole,
            _chain: &[Message],
            _tools: &[ToolDefinition],
            _stream: Option<&StreamWriter>,
        ) -> Result<ContentResponse> {
            unreachable!("bridge never calls with tools")
        }
    }

    /// Succeeds only when `path` is present.
    struct NeedsPath {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecutorHandler for NeedsPath {
        async fn handle(&self, _ctx: &ToolContext, _name: &str, args: &Value) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match args.get("path").and_then(Value::as_str) {
                Some(path) => Ok(format!("read {path}")),
                None => Err(anyhow!("missing field `path`")),
            }
        }
    }

    struct Hangs;

    #[async_trait]
    impl ExecutorHandler for Hangs {
        async fn handle(&self, _ctx: &ToolContext, _name: &str, _args: &Value) -> Result<String> {
            std::future::pending::<()>().await;
            Ok(String::new())
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry_delay_ms: 1,
            ..EngineConfig::default()
        }
    }

    fn ctx(cancel: CancellationToken) -> ToolContext {
        ToolContext {
            cancel,
            agent: AgentContext::root(AgentRole::Coder),
            tool_call_id: "call_1".into(),
        }
    }

    fn file_tool(handler: Arc<dyn ExecutorHandler>) -> FlowExecutor {
        FlowExecutor::new().with_tool(RegisteredTool::new(
            ToolDefinition {
                name: "file".into(),
                description: "read a file".into(),
                parameters: json!({"type":"object","properties":{"path":{"type":"string"}},"required":["path"]}),
            },
            handler,
        ))
    }

    fn call(args: &str) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: "file".into(),
            arguments: args.into(),
        }
    }

    fn bridge(llm: Arc<FixerLlm>) -> ToolCallBridge {
        ToolCallBridge::new(
            llm,
            Arc::new(TemplatePrompter::with_defaults().unwrap()),
            &config(),
        )
    }

    #[test]
    fn extract_json_block_variants() {
        assert_eq!(
            extract_json_block("Here:\n```json\n{\"a\":1}\n```\nthanks"),
            Some("{\"a\":1}")
        );
        assert_eq!(extract_json_block("  {\"a\":1}  "), Some("{\"a\":1}"));
        assert_eq!(extract_json_block("[1,2]"), Some("[1,2]"));
        assert_eq!(extract_json_block("no json here"), None);
    }

    #[tokio::test]
    async fn fixer_repairs_arguments() {
        let llm = FixerLlm::new(&["```json\n{\"path\":\"/etc/hosts\"}\n```"]);
        let handler = Arc::new(NeedsPath {
            calls: AtomicUsize::new(0),
        });
        let exec = file_tool(handler.clone());
        let mut bridge = bridge(llm.clone());

        let dispatched = bridge
            .dispatch(&ctx(CancellationToken::new()), &exec, &call(r#"{"file":"/etc/hosts"}"#), "")
            .await
            .unwrap();
        assert!(dispatched.executed);
        assert_eq!(dispatched.response.content, "read /etc/hosts");
        assert_eq!(dispatched.response.tool_call_id, "call_1");
        assert_eq!(dispatched.arguments, r#"{"path":"/etc/hosts"}"#);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_names_the_tool() {
        let llm = FixerLlm::new(&["{}", "{}"]);
        let handler = Arc::new(NeedsPath {
            calls: AtomicUsize::new(0),
        });
        let exec = file_tool(handler.clone());
        let mut bridge = bridge(llm.clone());

        let err = bridge
            .dispatch(&ctx(CancellationToken::new()), &exec, &call("{}"), "")
            .await
            .unwrap_err();
        match err.downcast_ref::<ChainError>() {
            Some(ChainError::ToolRetriesExhausted { name, last_error }) => {
                assert_eq!(name, "file");
                assert!(last_error.contains("missing field"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeating_call_short_circuits() {
        let llm = FixerLlm::new(&[]);
        let handler = Arc::new(NeedsPath {
            calls: AtomicUsize::new(0),
        });
        let exec = file_tool(handler.clone());
        let mut bridge = bridge(llm);
        let c = call(r#"{"path":"/tmp"}"#);
        let cx = ctx(CancellationToken::new());

        bridge.dispatch(&cx, &exec, &c, "").await.unwrap();
        bridge.dispatch(&cx, &exec, &c, "").await.unwrap();
        let third = bridge.dispatch(&cx, &exec, &c, "").await.unwrap();
        assert!(!third.executed);
        assert_eq!(third.response.content, repeating_message("file"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_execution() {
        let cancel = CancellationToken::new();
        let exec = file_tool(Arc::new(Hangs));
        let mut bridge = bridge(FixerLlm::new(&[]));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = bridge
            .dispatch(&ctx(cancel), &exec, &call("{}"), "")
            .await
            .unwrap_err();
        assert!(is_cancelled(&err));
    }
}
