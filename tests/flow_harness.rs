#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use flowrunner::core::llm::{GenerationInfo, StreamWriter};
use flowrunner::core::tools::ToolContext;
use flowrunner::{
    AgentEnv, AgentRole, ContentChoice, ContentResponse, EngineConfig, ExecutorHandler,
    FlowProvider, FlowStore, LlmProvider, MemoryStore, Message, RegisteredTool, Scope,
    SubtaskInfo, TemplatePrompter, ToolCall, ToolDefinition, Toolbox,
};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const FLOW_ID: i64 = 1;

enum Turn {
    Text(String),
    Calls(Vec<ToolCall>),
}

/// A model whose answers are queued per role ahead of time. An empty queue
/// is an error, which the engine treats like any failed model call.
#[derive(Default)]
pub struct ScriptedLlm {
    turns: Mutex<HashMap<AgentRole, VecDeque<Turn>>>,
    replies: Mutex<HashMap<AgentRole, VecDeque<String>>>,
    seen: Mutex<Vec<(AgentRole, Vec<Message>)>>,
    next_call: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_calls(&self, role: AgentRole, calls: &[(&str, Value)]) {
        let calls = calls
            .iter()
            .map(|(name, args)| ToolCall {
                id: format!("call_{}", self.next_call.fetch_add(1, Ordering::SeqCst)),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect();
        self.queue(role, Turn::Calls(calls));
    }

    pub fn push_text(&self, role: AgentRole, text: &str) {
        self.queue(role, Turn::Text(text.to_string()));
    }

    /// Queues an answer for a simple (tool-less) call.
    pub fn push_reply(&self, role: AgentRole, text: &str) {
        self.replies
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .push_back(text.to_string());
    }

    fn queue(&self, role: AgentRole, turn: Turn) {
        self.turns
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .push_back(turn);
    }

    /// Chains the model was given for `role`, in call order.
    pub fn seen_chains(&self, role: AgentRole) -> Vec<Vec<Message>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, chain)| chain.clone())
            .collect()
    }
}

fn usage_info() -> GenerationInfo {
    let mut info = GenerationInfo::new();
    info.insert("input_tokens".into(), json!(10));
    info.insert("output_tokens".into(), json!(5));
    info
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self, role: AgentRole) -> String {
        format!("scripted-{}", role)
    }

    async fn call(&self, role: AgentRole, _prompt: &str) -> Result<String> {
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&role)
            .and_then(VecDeque::pop_front);
        match (reply, role) {
            (Some(reply), _) => Ok(reply),
            (None, AgentRole::Reflector) => Ok("Call one of the tools.".into()),
            (None, role) => bail!("no scripted reply for {}", role),
        }
    }

    async fn call_with_tools(
        &self,
        role: AgentRole,
        chain: &[Message],
        _tools: &[ToolDefinition],
        stream: Option<&StreamWriter>,
    ) -> Result<ContentResponse> {
        self.seen.lock().unwrap().push((role, chain.to_vec()));
        let turn = self
            .turns
            .lock()
            .unwrap()
            .get_mut(&role)
            .and_then(VecDeque::pop_front);
        let choice = match turn {
            Some(Turn::Text(content)) => {
                if let Some(stream) = stream {
                    stream.content(&content);
                }
                ContentChoice {
                    content,
                    ..Default::default()
                }
            }
            Some(Turn::Calls(tool_calls)) => ContentChoice {
                tool_calls,
                ..Default::default()
            },
            None => bail!("no scripted turn for {}", role),
        };
        Ok(ContentResponse {
            choices: vec![ContentChoice {
                generation_info: Some(usage_info()),
                ..choice
            }],
        })
    }
}

/// A `terminal` tool that echoes the command it was given.
#[derive(Default)]
pub struct Terminal {
    pub runs: AtomicUsize,
}

#[async_trait]
impl ExecutorHandler for Terminal {
    async fn handle(&self, _ctx: &ToolContext, _name: &str, args: &Value) -> Result<String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let cmd = args.get("cmd").and_then(Value::as_str).unwrap_or_default();
        Ok(format!("$ {}\nok", cmd))
    }
}

pub struct TerminalBox(pub Arc<Terminal>);

impl Toolbox for TerminalBox {
    fn tools(&self, _role: AgentRole, _scope: &Scope) -> Vec<RegisteredTool> {
        let definition = ToolDefinition {
            name: "terminal".into(),
            description: "Run a shell command".into(),
            parameters: json!({
                "type": "object",
                "properties": { "cmd": { "type": "string" } },
                "required": ["cmd"]
            }),
        };
        vec![RegisteredTool::new(definition, self.0.clone())]
    }
}

/// Engine settings for tests: single attempts and no real waiting.
pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.max_call_retries = 1;
    config.retry_delay_ms = 1;
    config.max_tool_retries = 2;
    config
}

/// A flow with one task and three planned subtasks: recon, exploit, cleanup.
pub struct Fixture {
    pub llm: Arc<ScriptedLlm>,
    pub store: Arc<MemoryStore>,
    pub terminal: Arc<Terminal>,
    pub flow: FlowProvider,
    pub task_id: i64,
    pub subtasks: Vec<i64>,
}

impl Fixture {
    pub async fn new(config: EngineConfig) -> TestResult<Self> {
        Self::build(config, |env| env).await
    }

    pub async fn build(
        config: EngineConfig,
        customize: impl FnOnce(AgentEnv) -> AgentEnv,
    ) -> TestResult<Self> {
        let llm = ScriptedLlm::new();
        let store = Arc::new(MemoryStore::new());
        let terminal = Arc::new(Terminal::default());
        let env = AgentEnv::new(
            llm.clone(),
            store.clone(),
            store.clone(),
            Arc::new(TemplatePrompter::with_defaults()?),
            config,
        )
        .with_toolbox(Arc::new(TerminalBox(terminal.clone())));
        let flow = FlowProvider::new(customize(env), FLOW_ID);

        let task = store
            .create_task(FLOW_ID, "Audit 10.0.0.5", "Find a way into 10.0.0.5")
            .await?;
        let subtasks = store
            .create_subtasks(
                task.id,
                &[
                    info("recon", "Enumerate open services"),
                    info("exploit", "Exploit the weakest service"),
                    info("cleanup", "Remove uploaded tooling"),
                ],
            )
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        Ok(Self {
            llm,
            store,
            terminal,
            flow,
            task_id: task.id,
            subtasks,
        })
    }
}

pub fn info(title: &str, description: &str) -> SubtaskInfo {
    SubtaskInfo {
        id: 0,
        title: title.to_string(),
        description: description.to_string(),
    }
}
