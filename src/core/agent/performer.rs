//! The agent chain execution loop.
//!
//! call model → dispatch tool calls → stop on a barrier → maybe summarize →
//! repeat. The chain is persisted after the AI turn and after every single
//! tool response, so a crash loses at most one response.

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reflector::Reflector;
use super::summarizer::Summarizer;
use super::{AgentContext, AgentRole};
use crate::core::chain::{Message, ToolCall, ToolCallResponse};
use crate::core::config::EngineConfig;
use crate::core::error::{ChainError, is_cancelled, is_fatal};
use crate::core::llm::{
    GenerationInfo, LlmProvider, RetryPolicy, StreamSink, TokenUsage, call_with_tools_retry,
};
use crate::core::prompts::Prompter;
use crate::core::storage::FlowStore;
use crate::core::tools::{Executor, ToolCallBridge, ToolContext};

/// One loop invocation over an existing chain row.
pub struct ChainRun<'a> {
    pub agent: AgentContext,
    pub chain_id: i64,
    pub chain: Vec<Message>,
    pub executor: &'a dyn Executor,
    pub summarizer: Option<&'a dyn Summarizer>,
    /// Short description of the work, given to the reflector.
    pub execution_context: String,
}

#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub chain: Vec<Message>,
    /// The barrier call that ended the loop, with the arguments it executed with.
    pub barrier: Option<ToolCall>,
    /// Plain-text answer of an assistant loop.
    pub answer: Option<String>,
}

impl ChainOutcome {
    /// Decodes the barrier call's arguments into the role's result type.
    pub fn barrier_args<T: DeserializeOwned>(&self) -> Result<T> {
        let call = self
            .barrier
            .as_ref()
            .ok_or_else(|| anyhow!("agent chain ended without a barrier call"))?;
        serde_json::from_str(&call.arguments)
            .with_context(|| format!("invalid arguments of barrier '{}'", call.name))
    }
}

pub struct ChainPerformer {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn FlowStore>,
    prompter: Arc<dyn Prompter>,
    config: Arc<EngineConfig>,
    stream: Option<StreamSink>,
}

impl ChainPerformer {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn FlowStore>,
        prompter: Arc<dyn Prompter>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            llm,
            store,
            prompter,
            config,
            stream: None,
        }
    }

    pub fn with_stream(mut self, stream: Option<StreamSink>) -> Self {
        self.stream = stream;
        self
    }

    async fn record_usage(&self, chain_id: i64, usage: TokenUsage) -> Result<()> {
        if usage.is_empty() {
            return Ok(());
        }
        debug!(
            chain_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Recording token usage"
        );
        self.store.add_chain_usage(chain_id, usage).await
    }

    fn usage_of(&self, info: Option<&GenerationInfo>) -> TokenUsage {
        info.map(|i| self.llm.usage(i)).unwrap_or_default()
    }

    pub async fn perform(&self, cancel: &CancellationToken, run: ChainRun<'_>) -> Result<ChainOutcome> {
        let ChainRun {
            agent,
            chain_id,
            mut chain,
            executor,
            summarizer,
            execution_context,
        } = run;
        let role = agent.current_role;
        let policy = RetryPolicy::from(self.config.as_ref());
        let tools = executor.tools();
        let barrier_names = executor.barrier_tool_names();
        let reflector = Reflector::new(
            self.llm.as_ref(),
            self.prompter.as_ref(),
            policy,
            self.config.max_reflector_calls,
        );
        let mut bridge = ToolCallBridge::new(self.llm.clone(), self.prompter.clone(), &self.config);

        info!(
            chain_id,
            role = %role,
            parent = %agent.parent_role,
            tools = tools.len(),
            "Performing agent chain"
        );

        let mut iteration = 0usize;
        loop {
            iteration += 1;
            if self.config.max_iterations > 0 && iteration > self.config.max_iterations {
                return Err(ChainError::IterationLimit(self.config.max_iterations).into());
            }

            let stream = self.stream.as_ref().map(StreamSink::open);
            let mut result = call_with_tools_retry(
                self.llm.as_ref(),
                &policy,
                cancel,
                role,
                &chain,
                &tools,
                stream.as_ref(),
            )
            .await
            .with_context(|| format!("agent chain {} ({})", chain_id, role))?;
            self.record_usage(chain_id, self.usage_of(result.generation_info.as_ref()))
                .await?;

            if result.tool_calls.is_empty() {
                if role == AgentRole::Assistant {
                    let mut answer = Message::ai(result.content.clone());
                    answer.reasoning = result.reasoning.clone();
                    chain.push(answer);
                    self.store.update_chain(chain_id, &chain).await?;
                    if let Some(s) = &stream {
                        s.update(&result.content);
                    }
                    info!(chain_id, iteration, "Assistant answered");
                    return Ok(ChainOutcome {
                        chain,
                        barrier: None,
                        answer: Some(result.content),
                    });
                }

                warn!(chain_id, role = %role, "Agent answered without a tool call");
                let reflection = reflector
                    .reflect(
                        cancel,
                        role,
                        &chain,
                        &tools,
                        &barrier_names,
                        &result.content,
                        &execution_context,
                        stream.as_ref(),
                    )
                    .await
                    .with_context(|| format!("agent chain {} ({})", chain_id, role))?;
                self.record_usage(chain_id, reflection.usage).await?;
                result = reflection.result;
                self.record_usage(chain_id, self.usage_of(result.generation_info.as_ref()))
                    .await?;
            }

            if let Some(s) = &stream {
                if let Some(reasoning) = &result.reasoning {
                    s.thinking(reasoning);
                }
                s.update(&result.content);
            }

            chain.push(Message::ai_tool_calls(
                &result.content,
                &result.tool_calls,
                result.reasoning.clone(),
            ));
            self.store.update_chain(chain_id, &chain).await?;

            let mut barrier = None;
            for call in &result.tool_calls {
                let mut awaiting_input = false;
                let ctx = ToolContext {
                    cancel: cancel.clone(),
                    agent,
                    tool_call_id: call.id.clone(),
                };
                let response = match bridge.dispatch(&ctx, executor, call, &result.content).await {
                    Ok(dispatched) => {
                        if dispatched.executed && executor.is_barrier(&call.name) {
                            awaiting_input = executor.awaits_input(&call.name);
                            if barrier.is_none() {
                                barrier = Some(ToolCall {
                                    arguments: dispatched.arguments,
                                    ..call.clone()
                                });
                            }
                        }
                        dispatched.response
                    }
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => {
                        warn!(chain_id, tool = %call.name, "Tool call failed: {:#}", e);
                        ToolCallResponse {
                            tool_call_id: call.id.clone(),
                            name: call.name.clone(),
                            content: format!("failed to execute tool '{}': {:#}", call.name, e),
                        }
                    }
                };
                if awaiting_input {
                    debug!(chain_id, tool = %call.name, "Leaving tool call open for user input");
                    continue;
                }
                chain.push(Message::tool_response(response));
                self.store.update_chain(chain_id, &chain).await?;
            }

            if let Some(call) = barrier {
                info!(chain_id, iteration, barrier = %call.name, "Agent chain finished");
                return Ok(ChainOutcome {
                    chain,
                    barrier: Some(call),
                    answer: None,
                });
            }

            if let Some(summarizer) = summarizer {
                match summarizer.summarize_chain(cancel, role, chain.clone()).await {
                    Ok(summarized) if summarized != chain => {
                        chain = summarized;
                        self.store.update_chain(chain_id, &chain).await?;
                    }
                    Ok(_) => {}
                    Err(e) if is_cancelled(&e) => return Err(e),
                    Err(e) => warn!(chain_id, "Summarizer failed, keeping chain: {:#}", e),
                }
            }
        }
    }
}
