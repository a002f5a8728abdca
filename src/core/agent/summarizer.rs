use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::AgentRole;
use crate::core::chain::{Message, Part, Role};
use crate::core::config::{EngineConfig, SummarizerConfig};
use crate::core::llm::{LlmProvider, RetryPolicy, call_simple_retry};
use crate::core::prompts::{PromptType, Prompter};

pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:";

/// Compresses an overlong chain. Returning the chain unchanged is a valid
/// answer; errors are never fatal to the caller.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize_chain(
        &self,
        cancel: &CancellationToken,
        role: AgentRole,
        chain: Vec<Message>,
    ) -> Result<Vec<Message>>;
}

/// Replaces the middle of a long chain with one summary turn, keeping the
/// leading system prompt and the most recent messages verbatim.
pub struct ChainSummarizer {
    llm: Arc<dyn LlmProvider>,
    prompter: Arc<dyn Prompter>,
    policy: RetryPolicy,
    config: SummarizerConfig,
}

impl ChainSummarizer {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        prompter: Arc<dyn Prompter>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            llm,
            prompter,
            policy: RetryPolicy::from(config),
            config: config.summarizer.clone(),
        }
    }

    /// Index range `[start, end)` to summarize, or `None` if the chain is
    /// short enough. The kept tail never starts with a tool response, so
    /// every call stays next to its answers.
    fn split(&self, chain: &[Message]) -> Option<(usize, usize)> {
        if !self.config.enabled || chain.len() <= self.config.max_messages {
            return None;
        }
        let start = chain
            .iter()
            .take_while(|m| m.role == Role::System)
            .count();
        let mut end = chain.len().saturating_sub(self.config.keep_last.max(1));
        while end > start && chain[end].role == Role::Tool {
            end -= 1;
        }
        (end > start + 1).then_some((start, end))
    }
}

fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        for part in &message.parts {
            let line = match part {
                Part::Text { text } => format!("[{}] {}", message.role.as_str(), text),
                Part::ToolCall(call) => format!("[ai] call {}({})", call.name, call.arguments),
                Part::ToolCallResponse(resp) => format!("[tool] {}: {}", resp.name, resp.content),
            };
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

#[async_trait]
impl Summarizer for ChainSummarizer {
    async fn summarize_chain(
        &self,
        cancel: &CancellationToken,
        _role: AgentRole,
        chain: Vec<Message>,
    ) -> Result<Vec<Message>> {
        let Some((start, end)) = self.split(&chain) else {
            return Ok(chain);
        };

        let prompt = self.prompter.render(
            PromptType::Agent(AgentRole::Summarizer),
            &json!({ "messages": render_transcript(&chain[start..end]) }),
        )?;
        let summary = call_simple_retry(
            self.llm.as_ref(),
            &self.policy,
            cancel,
            AgentRole::Summarizer,
            &prompt,
        )
        .await
        .context("failed to summarize chain")?;

        info!(
            summarized = end - start,
            kept = chain.len() - end,
            "Chain summarized"
        );

        let mut out = Vec::with_capacity(start + 1 + chain.len() - end);
        out.extend_from_slice(&chain[..start]);
        out.push(Message::human(format!("{}\n\n{}", SUMMARY_PREFIX, summary.trim())));
        out.extend_from_slice(&chain[end..]);
        Ok(out)
    }
}
