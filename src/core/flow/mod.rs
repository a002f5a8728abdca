//! Per-flow entry points the host drives: seed and run the primary agent of a
//! subtask, feed user input back into it, plan and refine subtasks, report.

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::agent::handlers::AgentSpec;
use crate::core::agent::{AgentContext, AgentEnv, AgentRole, ChainRun, Scope};
use crate::core::chain::{self, Message};
use crate::core::error::{ChainError, is_fatal};
use crate::core::prompts::PromptType;
use crate::core::storage::{NewChain, Status, Subtask};
use crate::core::subtasks::{SubtaskInfo, apply_subtask_operations, validate_subtask_patch};
use crate::core::tools::definitions::{self, Done, tool_definition};
use crate::core::tools::{FlowExecutor, barrier_tool};

/// How a primary agent pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerformResult {
    /// `done` was called; the subtask result is stored.
    Done,
    /// `ask_user` was called; the chain waits for [`FlowProvider::put_input_to_agent_chain`].
    Waiting,
    /// The loop failed; the subtask is marked failed.
    Error(String),
}

pub struct FlowProvider {
    env: AgentEnv,
    flow_id: i64,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ChainError::Cancelled.into());
    }
    Ok(())
}

impl FlowProvider {
    pub fn new(env: AgentEnv, flow_id: i64) -> Self {
        Self { env, flow_id }
    }

    pub fn flow_id(&self) -> i64 {
        self.flow_id
    }

    pub fn env(&self) -> &AgentEnv {
        &self.env
    }

    fn primary_executor(&self, scope: Scope) -> Result<FlowExecutor> {
        let mut executor = self.env.executor_for(AgentSpec::PRIMARY, scope)?;
        if self.env.config.ask_user_enabled {
            let definition = tool_definition(definitions::ASK_USER)
                .ok_or_else(|| anyhow!("missing '{}' definition", definitions::ASK_USER))?;
            executor =
                executor.with_input_barrier(barrier_tool(definition, "waiting for user input"));
        }
        Ok(executor)
    }

    async fn create_chain(
        &self,
        scope: Scope,
        role: AgentRole,
        system: String,
        human: Option<String>,
    ) -> Result<i64> {
        let mut chain = vec![Message::system(system)];
        chain.extend(human.map(Message::human));
        let record = self
            .env
            .store
            .create_chain(NewChain {
                scope,
                role,
                model: self.env.llm.model(role),
                provider: self.env.llm.name().to_string(),
                chain,
            })
            .await?;
        Ok(record.id)
    }

    /// Seeds the primary agent chain of a subtask and marks the subtask running.
    pub async fn prepare_agent_chain(
        &self,
        cancel: &CancellationToken,
        task_id: i64,
        subtask_id: i64,
    ) -> Result<i64> {
        check_cancelled(cancel)?;
        let scope = Scope::subtask(self.flow_id, task_id, subtask_id);
        let work = self
            .env
            .load_context(scope)
            .await?
            .with("ask_user_enabled", self.env.config.ask_user_enabled)
            .with("barrier", definitions::DONE);
        let params = Value::Object(work.params);

        let system = self
            .env
            .prompter
            .render(PromptType::Agent(AgentRole::Primary), &params)?;
        let question = self
            .env
            .prompter
            .render(PromptType::Question(AgentRole::Primary), &params)?;

        let chain_id = self
            .create_chain(scope, AgentRole::Primary, system, Some(question))
            .await?;
        self.env
            .store
            .update_subtask_status(subtask_id, Status::Running)
            .await?;
        info!(flow_id = self.flow_id, task_id, subtask_id, chain_id, "Primary agent chain prepared");
        Ok(chain_id)
    }

    /// Runs the primary agent of a subtask until it finishes, asks the user
    /// something, or fails.
    pub async fn perform_agent_chain(
        &self,
        cancel: &CancellationToken,
        task_id: i64,
        subtask_id: i64,
        chain_id: i64,
    ) -> Result<PerformResult> {
        let scope = Scope::subtask(self.flow_id, task_id, subtask_id);
        let mut chain = self.env.store.get_chain(chain_id).await?.chain;
        if chain::ensure_chain_consistency(&mut chain) > 0 {
            self.env.store.update_chain(chain_id, &chain).await?;
        }

        let executor = self.primary_executor(scope)?;
        let work = self.env.load_context(scope).await?;
        self.env
            .store
            .update_subtask_status(subtask_id, Status::Running)
            .await?;

        let outcome = self
            .env
            .performer()
            .perform(
                cancel,
                ChainRun {
                    agent: AgentContext::root(AgentRole::Primary),
                    chain_id,
                    chain,
                    executor: &executor,
                    summarizer: self.env.summarizer.as_deref(),
                    execution_context: work.execution_context,
                },
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(chain_id, subtask_id, "Primary agent failed: {:#}", e);
                return self.fail_subtask(subtask_id, format!("{:#}", e)).await;
            }
        };

        let barrier = outcome.barrier.as_ref().map(|call| call.name.as_str());
        match barrier {
            Some(definitions::ASK_USER) => {
                self.env
                    .store
                    .update_subtask_status(subtask_id, Status::Waiting)
                    .await?;
                info!(chain_id, subtask_id, "Primary agent is waiting for user input");
                Ok(PerformResult::Waiting)
            }
            Some(definitions::DONE) => {
                let done: Done = match outcome.barrier_args() {
                    Ok(done) => done,
                    Err(e) => return self.fail_subtask(subtask_id, format!("{:#}", e)).await,
                };
                self.env
                    .store
                    .update_subtask_result(subtask_id, &done.result)
                    .await?;
                let status = if done.success {
                    Status::Finished
                } else {
                    Status::Failed
                };
                self.env
                    .store
                    .update_subtask_status(subtask_id, status)
                    .await?;
                info!(chain_id, subtask_id, success = done.success, "Subtask done");
                Ok(PerformResult::Done)
            }
            other => {
                let reason = format!("unexpected end of agent chain: {:?}", other);
                self.fail_subtask(subtask_id, reason).await
            }
        }
    }

    async fn fail_subtask(&self, subtask_id: i64, reason: String) -> Result<PerformResult> {
        self.env
            .store
            .update_subtask_status(subtask_id, Status::Failed)
            .await?;
        Ok(PerformResult::Error(reason))
    }

    /// Delivers user input to a chain, answering a pending `ask_user` call
    /// when there is one.
    pub async fn put_input_to_agent_chain(&self, chain_id: i64, input: &str) -> Result<()> {
        let mut chain = self.env.store.get_chain(chain_id).await?.chain;
        chain::add_tool_call_response_or_human(&mut chain, definitions::ASK_USER, input);
        self.env.store.update_chain(chain_id, &chain).await
    }

    /// Closes dangling tool calls of a stored chain. Returns how many
    /// responses were added; the chain is only rewritten when that is non-zero.
    pub async fn ensure_chain_consistency(&self, chain_id: i64) -> Result<usize> {
        let mut chain = self.env.store.get_chain(chain_id).await?.chain;
        let added = chain::ensure_chain_consistency(&mut chain);
        if added > 0 {
            warn!(chain_id, added, "Repaired unanswered tool calls");
            self.env.store.update_chain(chain_id, &chain).await?;
        }
        Ok(added)
    }

    /// Plans the subtasks of a task and appends them.
    pub async fn generate_subtasks(
        &self,
        cancel: &CancellationToken,
        task_id: i64,
    ) -> Result<Vec<Subtask>> {
        let scope = Scope::task(self.flow_id, task_id);
        let planned = self.env.generate_subtasks(cancel, scope).await?;
        info!(task_id, count = planned.len(), "Subtasks generated");
        self.env.store.create_subtasks(task_id, &planned).await
    }

    /// Lets the refiner patch the planned subtasks of a task in light of the
    /// finished ones. Returns the new planned list.
    pub async fn refine_subtasks(
        &self,
        cancel: &CancellationToken,
        task_id: i64,
    ) -> Result<Vec<Subtask>> {
        let scope = Scope::task(self.flow_id, task_id);
        let patch = self.env.refine_subtasks(cancel, scope).await?;
        validate_subtask_patch(&patch)?;

        let planned: Vec<SubtaskInfo> = self
            .env
            .store
            .get_task_subtasks(task_id)
            .await?
            .iter()
            .filter(|s| s.is_planned())
            .map(Subtask::info)
            .collect();
        let refined = apply_subtask_operations(&planned, &patch)
            .with_context(|| format!("failed to refine subtasks of task {}", task_id))?;
        info!(
            task_id,
            operations = patch.operations.len(),
            before = planned.len(),
            after = refined.len(),
            "Subtasks refined: {}",
            patch.message
        );
        self.env
            .store
            .replace_planned_subtasks(task_id, &refined)
            .await
    }

    /// Writes the final report of a task and stores it as the task result.
    pub async fn task_result(&self, cancel: &CancellationToken, task_id: i64) -> Result<String> {
        let scope = Scope::task(self.flow_id, task_id);
        let report = self.env.report_task(cancel, scope).await?;
        self.env.store.update_task_result(task_id, &report).await?;
        Ok(report)
    }

    pub async fn task_title(&self, cancel: &CancellationToken, input: &str) -> Result<String> {
        self.env.task_title(cancel, input).await
    }

    /// Seeds an assistant chain for this flow, optionally bound to a task or subtask.
    pub async fn prepare_assistant_chain(
        &self,
        task_id: Option<i64>,
        subtask_id: Option<i64>,
    ) -> Result<i64> {
        let scope = Scope {
            flow_id: self.flow_id,
            task_id,
            subtask_id,
        };
        let params = Value::Object(self.env.load_context(scope).await?.params);
        let system = self
            .env
            .prompter
            .render(PromptType::Agent(AgentRole::Assistant), &params)?;
        self.create_chain(scope, AgentRole::Assistant, system, None)
            .await
    }

    /// Appends `input` to an assistant chain and runs it until the assistant
    /// answers in plain text.
    pub async fn perform_assistant_chain(
        &self,
        cancel: &CancellationToken,
        chain_id: i64,
        input: &str,
    ) -> Result<String> {
        let record = self.env.store.get_chain(chain_id).await?;
        let scope = Scope {
            flow_id: record.flow_id,
            task_id: record.task_id,
            subtask_id: record.subtask_id,
        };
        let mut chain = record.chain;
        chain::ensure_chain_consistency(&mut chain);
        chain.push(Message::human(input));
        self.env.store.update_chain(chain_id, &chain).await?;

        let executor = self.env.executor_for(AgentSpec::ASSISTANT, scope)?;
        let work = self.env.load_context(scope).await?;
        let outcome = self
            .env
            .performer()
            .perform(
                cancel,
                ChainRun {
                    agent: AgentContext::root(AgentRole::Assistant),
                    chain_id,
                    chain,
                    executor: &executor,
                    summarizer: self.env.summarizer.as_deref(),
                    execution_context: work.execution_context,
                },
            )
            .await?;
        outcome
            .answer
            .ok_or_else(|| anyhow!("assistant chain {} ended without an answer", chain_id))
    }
}
