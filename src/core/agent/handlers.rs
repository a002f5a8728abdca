//! Sub-agent handlers and the environment that builds them.
//!
//! Every delegation tool (`pentester`, `coder`, `maintenance`, ...) is backed
//! by a handler that runs a full agent chain of its own. Handlers are built on
//! demand from an [`AgentEnv`], so the recursion only goes as deep as the
//! models actually delegate.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::performer::{ChainOutcome, ChainPerformer, ChainRun};
use super::summarizer::{ChainSummarizer, Summarizer};
use super::{AgentContext, AgentRole, Scope};
use crate::core::chain::Message;
use crate::core::config::EngineConfig;
use crate::core::error::is_fatal;
use crate::core::llm::{LlmProvider, RetryPolicy, StreamSink, call_simple_retry};
use crate::core::prompts::{PromptType, Prompter};
use crate::core::storage::{AgentLog, AgentLogProvider, FlowStore, NewChain, Status};
use crate::core::subtasks::{SubtaskInfo, SubtaskPatch};
use crate::core::tools::definitions::{
    self, AgentResult, AskAdvice, ComplexAsk, SubtaskList, tool_definition,
};
use crate::core::tools::{
    ExecutorHandler, FlowExecutor, NoTools, RegisteredTool, ToolContext, Toolbox, barrier_tool,
};

/// What a role may call and which tool ends its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSpec {
    pub role: AgentRole,
    pub barrier: Option<&'static str>,
    pub delegates: &'static [&'static str],
}

impl AgentSpec {
    pub const PRIMARY: AgentSpec = AgentSpec {
        role: AgentRole::Primary,
        barrier: Some(definitions::DONE),
        delegates: &[
            definitions::PENTESTER,
            definitions::CODER,
            definitions::MAINTENANCE,
            definitions::MEMORIST,
            definitions::SEARCH,
            definitions::ADVICE,
        ],
    };

    pub const ASSISTANT: AgentSpec = AgentSpec {
        role: AgentRole::Assistant,
        barrier: None,
        delegates: &[
            definitions::PENTESTER,
            definitions::CODER,
            definitions::MAINTENANCE,
            definitions::MEMORIST,
            definitions::SEARCH,
            definitions::ADVICE,
        ],
    };

    pub const PENTESTER: AgentSpec = AgentSpec {
        role: AgentRole::Pentester,
        barrier: Some(definitions::HACK_RESULT),
        delegates: &[
            definitions::ADVICE,
            definitions::CODER,
            definitions::MAINTENANCE,
            definitions::MEMORIST,
            definitions::SEARCH,
        ],
    };

    pub const CODER: AgentSpec = AgentSpec {
        role: AgentRole::Coder,
        barrier: Some(definitions::CODE_RESULT),
        delegates: &[
            definitions::ADVICE,
            definitions::MAINTENANCE,
            definitions::MEMORIST,
            definitions::SEARCH,
        ],
    };

    pub const INSTALLER: AgentSpec = AgentSpec {
        role: AgentRole::Installer,
        barrier: Some(definitions::MAINTENANCE_RESULT),
        delegates: &[definitions::ADVICE, definitions::MEMORIST, definitions::SEARCH],
    };

    pub const MEMORIST: AgentSpec = AgentSpec {
        role: AgentRole::Memorist,
        barrier: Some(definitions::MEMORIST_RESULT),
        delegates: &[],
    };

    pub const SEARCHER: AgentSpec = AgentSpec {
        role: AgentRole::Searcher,
        barrier: Some(definitions::SEARCH_RESULT),
        delegates: &[definitions::MEMORIST],
    };

    pub const ENRICHER: AgentSpec = AgentSpec {
        role: AgentRole::Enricher,
        barrier: Some(definitions::ENRICHER_RESULT),
        delegates: &[definitions::MEMORIST, definitions::SEARCH],
    };

    pub const REPORTER: AgentSpec = AgentSpec {
        role: AgentRole::Reporter,
        barrier: Some(definitions::REPORT_RESULT),
        delegates: &[definitions::MEMORIST, definitions::SEARCH],
    };

    pub const GENERATOR: AgentSpec = AgentSpec {
        role: AgentRole::Generator,
        barrier: Some(definitions::SUBTASK_LIST),
        delegates: &[definitions::MEMORIST, definitions::SEARCH],
    };

    pub const REFINER: AgentSpec = AgentSpec {
        role: AgentRole::Refiner,
        barrier: Some(definitions::SUBTASK_PATCH),
        delegates: &[definitions::MEMORIST, definitions::SEARCH],
    };
}

const BARRIER_REPLY: &str = "result accepted";

/// Template parameters describing the work at hand, plus a plain-text
/// version of the same for the reflector.
#[derive(Debug, Clone, Default)]
pub struct WorkContext {
    pub params: Map<String, Value>,
    pub execution_context: String,
}

impl WorkContext {
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Everything an agent needs to run. Cheap to clone; handlers hold a copy.
#[derive(Clone)]
pub struct AgentEnv {
    pub llm: Arc<dyn LlmProvider>,
    pub store: Arc<dyn FlowStore>,
    pub audit: Arc<dyn AgentLogProvider>,
    pub prompter: Arc<dyn Prompter>,
    pub toolbox: Arc<dyn Toolbox>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub config: Arc<EngineConfig>,
    pub stream: Option<StreamSink>,
}

impl AgentEnv {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn FlowStore>,
        audit: Arc<dyn AgentLogProvider>,
        prompter: Arc<dyn Prompter>,
        config: EngineConfig,
    ) -> Self {
        let summarizer: Option<Arc<dyn Summarizer>> = config.summarizer.enabled.then(|| {
            Arc::new(ChainSummarizer::new(llm.clone(), prompter.clone(), &config))
                as Arc<dyn Summarizer>
        });
        Self {
            llm,
            store,
            audit,
            prompter,
            toolbox: Arc::new(NoTools),
            summarizer,
            config: Arc::new(config),
            stream: None,
        }
    }

    pub fn with_toolbox(mut self, toolbox: Arc<dyn Toolbox>) -> Self {
        self.toolbox = toolbox;
        self
    }

    /// Replaces the default summarizer; `None` disables summarization.
    pub fn with_summarizer(mut self, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_stream(mut self, stream: StreamSink) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn performer(&self) -> ChainPerformer {
        ChainPerformer::new(
            self.llm.clone(),
            self.store.clone(),
            self.prompter.clone(),
            self.config.clone(),
        )
        .with_stream(self.stream.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(self.config.as_ref())
    }

    // Handler factories. Each takes the scope the sub-agent works in; the
    // calling role arrives with the tool context at dispatch time.

    pub fn pentester_handler(&self, scope: Scope) -> Arc<dyn ExecutorHandler> {
        Arc::new(WorkerHandler::new(self.clone(), scope, AgentSpec::PENTESTER))
    }

    pub fn coder_handler(&self, scope: Scope) -> Arc<dyn ExecutorHandler> {
        Arc::new(WorkerHandler::new(self.clone(), scope, AgentSpec::CODER))
    }

    pub fn installer_handler(&self, scope: Scope) -> Arc<dyn ExecutorHandler> {
        Arc::new(WorkerHandler::new(self.clone(), scope, AgentSpec::INSTALLER))
    }

    pub fn memorist_handler(&self, scope: Scope) -> Arc<dyn ExecutorHandler> {
        Arc::new(WorkerHandler::new(self.clone(), scope, AgentSpec::MEMORIST))
    }

    pub fn searcher_handler(&self, scope: Scope) -> Arc<dyn ExecutorHandler> {
        Arc::new(WorkerHandler::new(self.clone(), scope, AgentSpec::SEARCHER))
    }

    pub fn adviser_handler(&self, scope: Scope) -> Arc<dyn ExecutorHandler> {
        Arc::new(AdviserHandler {
            env: self.clone(),
            scope,
        })
    }

    /// The delegation tool called `name`, bound to `scope`.
    pub fn delegate(&self, name: &str, scope: Scope) -> Result<RegisteredTool> {
        let definition =
            tool_definition(name).ok_or_else(|| anyhow!("unknown delegation tool '{}'", name))?;
        let handler = match name {
            definitions::PENTESTER => self.pentester_handler(scope),
            definitions::CODER => self.coder_handler(scope),
            definitions::MAINTENANCE => self.installer_handler(scope),
            definitions::MEMORIST => self.memorist_handler(scope),
            definitions::SEARCH => self.searcher_handler(scope),
            definitions::ADVICE => self.adviser_handler(scope),
            _ => return Err(anyhow!("'{}' is not a delegation tool", name)),
        };
        Ok(RegisteredTool::new(definition, handler))
    }

    /// Host tools for the role, then its sub-agents, then its barrier.
    pub fn executor_for(&self, spec: AgentSpec, scope: Scope) -> Result<FlowExecutor> {
        let mut executor = FlowExecutor::new().with_tools(self.toolbox.tools(spec.role, &scope));
        for name in spec.delegates {
            executor = executor.with_tool(self.delegate(name, scope)?);
        }
        if let Some(barrier) = spec.barrier {
            let definition = tool_definition(barrier)
                .ok_or_else(|| anyhow!("unknown barrier tool '{}'", barrier))?;
            executor = executor.with_barrier(barrier_tool(definition, BARRIER_REPLY));
        }
        Ok(executor)
    }

    /// Loads the task and subtask of `scope` for prompt rendering.
    pub async fn load_context(&self, scope: Scope) -> Result<WorkContext> {
        let mut ctx = WorkContext::default().with("flow_id", scope.flow_id);
        let mut lines = Vec::new();

        if let Some(task_id) = scope.task_id {
            let task = self.store.get_task(task_id).await?;
            lines.push(format!("Task: {}", task.title));
            ctx = ctx.with("task", serde_json::to_value(&task)?);

            let subtasks = self.store.get_task_subtasks(task_id).await?;
            let completed: Vec<Value> = subtasks
                .iter()
                .filter(|s| matches!(s.status, Status::Finished | Status::Failed))
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?;
            let planned: Vec<Value> = subtasks
                .iter()
                .filter(|s| s.is_planned())
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?;
            ctx = ctx
                .with("completed_subtasks", completed)
                .with("planned_subtasks", planned)
                .with("subtasks", serde_json::to_value(&subtasks)?);
        }

        if let Some(subtask_id) = scope.subtask_id {
            let subtask = self.store.get_subtask(subtask_id).await?;
            lines.push(format!("Subtask: {}\n{}", subtask.title, subtask.description));
            ctx = ctx.with("subtask", serde_json::to_value(&subtask)?);
        }

        ctx.execution_context = lines.join("\n");
        Ok(ctx)
    }

    /// Seeds a new chain for `spec.role` and drives it to its barrier.
    pub async fn run_agent(
        &self,
        cancel: &CancellationToken,
        agent: AgentContext,
        scope: Scope,
        spec: AgentSpec,
        work: WorkContext,
    ) -> Result<ChainOutcome> {
        let WorkContext {
            params,
            execution_context,
        } = work.with("barrier", spec.barrier);
        let params = Value::Object(params);

        let system = self.prompter.render(PromptType::Agent(spec.role), &params)?;
        let question = self.prompter.render(PromptType::Question(spec.role), &params)?;
        let executor = self.executor_for(spec, scope)?;

        let record = self
            .store
            .create_chain(NewChain {
                scope,
                role: spec.role,
                model: self.llm.model(spec.role),
                provider: self.llm.name().to_string(),
                chain: vec![Message::system(system), Message::human(question)],
            })
            .await?;
        debug!(chain_id = record.id, role = %spec.role, parent = %agent.parent_role, "Agent chain created");

        self.performer()
            .perform(
                cancel,
                ChainRun {
                    agent,
                    chain_id: record.id,
                    chain: record.chain,
                    executor: &executor,
                    summarizer: self.summarizer.as_deref(),
                    execution_context,
                },
            )
            .await
    }

    /// Records a delegation. Audit is best effort.
    pub async fn audit(&self, scope: Scope, agent: AgentContext, question: &str, answer: &str) {
        let log = AgentLog {
            flow_id: scope.flow_id,
            parent_role: agent.parent_role,
            child_role: agent.current_role,
            question: question.to_string(),
            answer: answer.to_string(),
            task_id: scope.task_id,
            subtask_id: scope.subtask_id,
        };
        if let Err(e) = self.audit.put_log(log).await {
            warn!(role = %agent.current_role, "Failed to write agent log: {:#}", e);
        }
    }

    /// Runs the reporter over the task's subtasks and returns its report.
    pub async fn report_task(&self, cancel: &CancellationToken, scope: Scope) -> Result<String> {
        let work = self.load_context(scope).await?;
        let outcome = self
            .run_agent(
                cancel,
                AgentContext::root(AgentRole::Reporter),
                scope,
                AgentSpec::REPORTER,
                work,
            )
            .await?;
        Ok(outcome.barrier_args::<AgentResult>()?.result)
    }

    /// Runs the generator and returns the planned subtasks, all with id 0.
    pub async fn generate_subtasks(
        &self,
        cancel: &CancellationToken,
        scope: Scope,
    ) -> Result<Vec<SubtaskInfo>> {
        let work = self.load_context(scope).await?;
        let outcome = self
            .run_agent(
                cancel,
                AgentContext::root(AgentRole::Generator),
                scope,
                AgentSpec::GENERATOR,
                work,
            )
            .await?;
        let list: SubtaskList = outcome.barrier_args()?;
        Ok(list
            .subtasks
            .into_iter()
            .map(|s| SubtaskInfo { id: 0, ..s })
            .collect())
    }

    /// Runs the refiner and returns its patch, unvalidated.
    pub async fn refine_subtasks(
        &self,
        cancel: &CancellationToken,
        scope: Scope,
    ) -> Result<SubtaskPatch> {
        let work = self.load_context(scope).await?;
        let outcome = self
            .run_agent(
                cancel,
                AgentContext::root(AgentRole::Refiner),
                scope,
                AgentSpec::REFINER,
                work,
            )
            .await?;
        outcome.barrier_args()
    }

    pub async fn task_title(&self, cancel: &CancellationToken, input: &str) -> Result<String> {
        let prompt = self
            .prompter
            .render(PromptType::TaskTitle, &json!({ "input": input }))?;
        let title = call_simple_retry(
            self.llm.as_ref(),
            &self.retry_policy(),
            cancel,
            AgentRole::Primary,
            &prompt,
        )
        .await
        .context("failed to generate task title")?;
        Ok(title.trim().trim_matches('"').to_string())
    }
}

/// A tool-loop sub-agent: pentester, coder, installer, memorist or searcher.
pub struct WorkerHandler {
    env: AgentEnv,
    scope: Scope,
    spec: AgentSpec,
}

impl WorkerHandler {
    pub fn new(env: AgentEnv, scope: Scope, spec: AgentSpec) -> Self {
        Self { env, scope, spec }
    }
}

#[async_trait]
impl ExecutorHandler for WorkerHandler {
    async fn handle(&self, ctx: &ToolContext, name: &str, args: &Value) -> Result<String> {
        let ask: ComplexAsk = serde_json::from_value(args.clone())
            .with_context(|| format!("invalid arguments for '{}'", name))?;
        let agent = ctx.agent.child(self.spec.role);
        info!(tool = name, parent = %agent.parent_role, role = %agent.current_role, "Delegating to sub-agent");

        let work = self
            .env
            .load_context(self.scope)
            .await?
            .with("question", ask.question.clone());
        let outcome = self
            .env
            .run_agent(&ctx.cancel, agent, self.scope, self.spec, work)
            .await
            .with_context(|| format!("{} agent failed", self.spec.role))?;
        let result: AgentResult = outcome.barrier_args()?;

        self.env
            .audit(self.scope, agent, &ask.question, &result.result)
            .await;
        Ok(result.result)
    }
}

/// The `advice` tool: an enricher pass gathers context, then one simple
/// call to the adviser model answers.
pub struct AdviserHandler {
    env: AgentEnv,
    scope: Scope,
}

impl AdviserHandler {
    async fn enrich(
        &self,
        cancel: &CancellationToken,
        agent: AgentContext,
        work: WorkContext,
    ) -> Result<String> {
        let enricher = agent.child(AgentRole::Enricher);
        let question = work
            .params
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let outcome = self
            .env
            .run_agent(cancel, enricher, self.scope, AgentSpec::ENRICHER, work)
            .await?;
        let result: AgentResult = outcome.barrier_args()?;
        self.env
            .audit(self.scope, enricher, &question, &result.result)
            .await;
        Ok(result.result)
    }
}

#[async_trait]
impl ExecutorHandler for AdviserHandler {
    async fn handle(&self, ctx: &ToolContext, name: &str, args: &Value) -> Result<String> {
        let ask: AskAdvice = serde_json::from_value(args.clone())
            .with_context(|| format!("invalid arguments for '{}'", name))?;
        let agent = ctx.agent.child(AgentRole::Adviser);

        let work = self
            .env
            .load_context(self.scope)
            .await?
            .with("question", ask.question.clone())
            .with("code", ask.code.clone())
            .with("output", ask.output.clone());

        let enrichment = match self.enrich(&ctx.cancel, agent, work.clone()).await {
            Ok(enrichment) => enrichment,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!("Enricher failed, advising without context: {:#}", e);
                String::new()
            }
        };

        let params = Value::Object(work.with("enrichment", enrichment).params);
        let system = self
            .env
            .prompter
            .render(PromptType::Agent(AgentRole::Adviser), &params)?;
        let question = self
            .env
            .prompter
            .render(PromptType::Question(AgentRole::Adviser), &params)?;

        let answer = call_simple_retry(
            self.env.llm.as_ref(),
            &self.env.retry_policy(),
            &ctx.cancel,
            AgentRole::Adviser,
            &format!("{}\n\n{}", system, question),
        )
        .await
        .context("adviser call failed")?;

        self.env
            .audit(self.scope, agent, &ask.question, &answer)
            .await;
        Ok(answer)
    }
}
