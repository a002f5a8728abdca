//! Fallback for agents that answer in plain text instead of calling a tool.

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::AgentRole;
use crate::core::chain::Message;
use crate::core::error::{ChainError, is_cancelled};
use crate::core::llm::{
    CallResult, LlmProvider, RetryPolicy, StreamWriter, TokenUsage, ToolDefinition,
    call_simple_retry, call_with_tools_retry,
};
use crate::core::prompts::{PromptType, Prompter};

/// Used when the reflector call itself fails.
pub const REFLECTOR_FALLBACK: &str =
    "You must call one of the available tools. Plain text answers are not accepted; use a tool to continue or a result tool to finish.";

/// A tool-bearing result produced by reflection, plus the usage of the
/// reflection turns that were discarded on the way.
#[derive(Debug)]
pub struct Reflection {
    pub result: CallResult,
    pub usage: TokenUsage,
    pub iterations: usize,
}

pub struct Reflector<'a> {
    llm: &'a dyn LlmProvider,
    prompter: &'a dyn Prompter,
    policy: RetryPolicy,
    max_calls: usize,
}

impl<'a> Reflector<'a> {
    pub fn new(
        llm: &'a dyn LlmProvider,
        prompter: &'a dyn Prompter,
        policy: RetryPolicy,
        max_calls: usize,
    ) -> Self {
        Self {
            llm,
            prompter,
            policy,
            max_calls,
        }
    }

    async fn advice(
        &self,
        cancel: &CancellationToken,
        content: &str,
        barrier_tools: &[String],
        execution_context: &str,
    ) -> Result<String> {
        let rendered = self.prompter.render(
            PromptType::Agent(AgentRole::Reflector),
            &json!({
                "message": content,
                "barrier_tools": barrier_tools,
                "execution_context": execution_context,
            }),
        );
        let prompt = match rendered {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Failed to render reflector prompt: {:#}", e);
                return Ok(REFLECTOR_FALLBACK.to_string());
            }
        };

        match call_simple_retry(self.llm, &self.policy, cancel, AgentRole::Reflector, &prompt).await {
            Ok(advice) if !advice.trim().is_empty() => Ok(advice),
            Ok(_) => Ok(REFLECTOR_FALLBACK.to_string()),
            Err(e) if is_cancelled(&e) => Err(e),
            Err(e) => {
                warn!("Reflector call failed, using fallback advice: {:#}", e);
                Ok(REFLECTOR_FALLBACK.to_string())
            }
        }
    }

    /// Re-invokes the model on a side chain until it produces tool calls.
    /// The side chain is never persisted; only the adopted result is.
    #[allow(clippy::too_many_arguments)]
    pub async fn reflect(
        &self,
        cancel: &CancellationToken,
        role: AgentRole,
        chain: &[Message],
        tools: &[ToolDefinition],
        barrier_tools: &[String],
        content: &str,
        execution_context: &str,
        stream: Option<&StreamWriter>,
    ) -> Result<Reflection> {
        let mut reflection_chain = chain.to_vec();
        let mut content = content.to_string();
        let mut usage = TokenUsage::default();

        for iteration in 1..=self.max_calls {
            let advice = self
                .advice(cancel, &content, barrier_tools, execution_context)
                .await?;
            info!(role = %role, iteration, "Reflecting on plain-text answer");

            reflection_chain.push(Message::ai(content.clone()));
            reflection_chain.push(Message::human(advice));

            let result = call_with_tools_retry(
                self.llm,
                &self.policy,
                cancel,
                role,
                &reflection_chain,
                tools,
                stream,
            )
            .await?;

            if !result.tool_calls.is_empty() {
                return Ok(Reflection {
                    result,
                    usage,
                    iterations: iteration,
                });
            }
            if let Some(info) = &result.generation_info {
                usage += self.llm.usage(info);
            }
            content = result.content;
        }

        Err(ChainError::ReflectorLimit(self.max_calls).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::ToolCall;
    use crate::core::llm::{ContentChoice, ContentResponse};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers in text `text_turns` times, then calls `done`.
    struct Stubborn {
        text_turns: Mutex<usize>,
        reflector_fails: bool,
        seen_chains: Mutex<Vec<usize>>,
    }

    impl Stubborn {
        fn new(text_turns: usize, reflector_fails: bool) -> Self {
            Self {
                text_turns: Mutex::new(text_turns),
                reflector_fails,
                seen_chains: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for Stubborn {
        fn name(&self) -> &str {
            "stubborn"
        }

        fn model(&self, _role: AgentRole) -> String {
            "stubborn-1".into()
        }

        async fn call(&self, role: AgentRole, _prompt: &str) -> Result<String> {
            assert_eq!(role, AgentRole::Reflector);
            if self.reflector_fails {
                anyhow::bail!("reflector model offline");
            }
            Ok("call done now".into())
        }

        async fn call_with_tools(
            &self,
            _role: AgentRole,
            chain: &[Message],
            _tools: &[ToolDefinition],
            _stream: Option<&StreamWriter>,
        ) -> Result<ContentResponse> {
            self.seen_chains.lock().unwrap().push(chain.len());
            let mut left = self.text_turns.lock().unwrap();
            let choice = if *left > 0 {
                *left -= 1;
                ContentChoice {
                    content: "still thinking".into(),
                    ..Default::default()
                }
            } else {
                ContentChoice {
                    tool_calls: vec![ToolCall {
                        id: "c1".into(),
                        name: "done".into(),
                        arguments: r#"{"result":"ok"}"#.into(),
                    }],
                    ..Default::default()
                }
            };
            Ok(ContentResponse {
                choices: vec![choice],
            })
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(1, Duration::from_millis(1))
    }

    fn chain() -> Vec<Message> {
        vec![Message::system("sys"), Message::human("go")]
    }

    #[tokio::test]
    async fn adopts_tool_calls_after_reflection() {
        let llm = Stubborn::new(1, false);
        let prompter = crate::core::prompts::TemplatePrompter::with_defaults().unwrap();
        let reflector = Reflector::new(&llm, &prompter, policy(), 3);

        let reflection = reflector
            .reflect(
                &CancellationToken::new(),
                AgentRole::Primary,
                &chain(),
                &[],
                &["done".to_string()],
                "I am done",
                "",
                None,
            )
            .await
            .unwrap();
        assert_eq!(reflection.iterations, 2);
        assert_eq!(reflection.result.tool_calls[0].name, "done");
        // Each reflection adds the plain answer and the advice.
        assert_eq!(*llm.seen_chains.lock().unwrap(), vec![4, 6]);
    }

    #[tokio::test]
    async fn limit_is_a_named_error() {
        let llm = Stubborn::new(10, false);
        let prompter = crate::core::prompts::TemplatePrompter::with_defaults().unwrap();
        let reflector = Reflector::new(&llm, &prompter, policy(), 3);

        let err = reflector
            .reflect(
                &CancellationToken::new(),
                AgentRole::Coder,
                &chain(),
                &[],
                &["code_result".to_string()],
                "here is the code",
                "",
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChainError>(),
            Some(ChainError::ReflectorLimit(3))
        ));
        assert!(err.to_string().contains("reflector limit calls reached"));
        assert_eq!(llm.seen_chains.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failing_reflector_call_uses_fallback() {
        let llm = Stubborn::new(0, true);
        let prompter = crate::core::prompts::TemplatePrompter::with_defaults().unwrap();
        let reflector = Reflector::new(&llm, &prompter, policy(), 3);

        let reflection = reflector
            .reflect(
                &CancellationToken::new(),
                AgentRole::Primary,
                &chain(),
                &[],
                &["done".to_string()],
                "text",
                "",
                None,
            )
            .await
            .unwrap();
        assert_eq!(reflection.iterations, 1);
    }
}
