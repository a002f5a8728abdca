//! Bounded retry around a single model invocation.
//!
//! Fixed attempt ceiling, fixed delay. Cancellation is checked while the call
//! is in flight and while waiting between attempts, and always wins.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::{ContentResponse, GenerationInfo, LlmProvider, StreamWriter, ToolDefinition};
use crate::core::agent::AgentRole;
use crate::core::chain::{Message, ToolCall};
use crate::core::config::EngineConfig;
use crate::core::error::{ChainError, is_cancelled};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self::new(config.max_call_retries, config.retry_delay())
    }
}

/// All choices of one response folded into a single turn.
#[derive(Debug, Clone, Default)]
pub struct CallResult {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub generation_info: Option<GenerationInfo>,
}

impl CallResult {
    /// Joins non-empty text with newlines, unions tool calls, keeps the last
    /// generation info. Calls without an id get a generated one.
    pub fn from_response(response: ContentResponse) -> Self {
        let mut content = Vec::new();
        let mut reasoning = Vec::new();
        let mut result = CallResult::default();

        for choice in response.choices {
            if !choice.content.trim().is_empty() {
                content.push(choice.content);
            }
            if let Some(r) = choice.reasoning.filter(|r| !r.trim().is_empty()) {
                reasoning.push(r);
            }
            for mut call in choice.tool_calls {
                if call.id.is_empty() {
                    call.id = format!("call_{}", Uuid::new_v4().simple());
                }
                result.tool_calls.push(call);
            }
            if choice.generation_info.is_some() {
                result.generation_info = choice.generation_info;
            }
        }

        result.content = content.join("\n");
        if !reasoning.is_empty() {
            result.reasoning = Some(reasoning.join("\n"));
        }
        result
    }
}

fn cancelled(what: &str) -> anyhow::Error {
    anyhow::Error::new(ChainError::Cancelled).context(format!("{what} cancelled"))
}

async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = tokio::time::sleep(policy.delay);
    tokio::pin!(backoff);
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(what)),
            res = op() => res,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if is_cancelled(&e) => return Err(e),
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    "{} failed: {:#}",
                    what,
                    e
                );
                last_error = format!("{:#}", e);
            }
        }

        if attempt < policy.max_attempts {
            backoff.as_mut().reset(Instant::now() + policy.delay);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(cancelled(what).context("waiting before retry"));
                }
                _ = &mut backoff => {}
            }
        }
    }

    Err(ChainError::RetriesExhausted {
        attempts: policy.max_attempts,
        last_error,
    }
    .into())
}

/// One tool-enabled model call with retries. An empty response is a hard
/// failure and is not retried.
#[allow(clippy::too_many_arguments)]
pub async fn call_with_tools_retry(
    llm: &dyn LlmProvider,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    role: AgentRole,
    chain: &[Message],
    tools: &[ToolDefinition],
    stream: Option<&StreamWriter>,
) -> Result<CallResult> {
    let response = with_retries(policy, cancel, "agent chain call", move || {
        llm.call_with_tools(role, chain, tools, stream)
    })
    .await?;

    if response.choices.is_empty() {
        return Err(ChainError::EmptyResponse.into());
    }
    Ok(CallResult::from_response(response))
}

/// One plain model call with retries.
pub async fn call_simple_retry(
    llm: &dyn LlmProvider,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    role: AgentRole,
    prompt: &str,
) -> Result<String> {
    with_retries(policy, cancel, "simple chain call", move || {
        llm.call(role, prompt)
    })
    .await
}
