//! Capability sets bound to one agent role.
//!
//! An [`Executor`] is what the execution loop sees: tool definitions, dispatch,
//! schemas for argument repair and barrier classification. [`FlowExecutor`] is
//! the one implementation; it is assembled per invocation from host tools
//! ([`Toolbox`]) and sub-agent handlers.

pub mod bridge;
pub mod definitions;
pub mod repeating;

pub use bridge::{Dispatched, ToolCallBridge};
pub use repeating::RepeatingDetector;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::agent::{AgentContext, AgentRole, Scope};
use crate::core::llm::ToolDefinition;

/// Per-dispatch context handed to a tool implementation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub cancel: CancellationToken,
    pub agent: AgentContext,
    pub tool_call_id: String,
}

/// One tool implementation. Sub-agents implement this too, which is how
/// delegation recurses without a central dispatcher.
#[async_trait]
pub trait ExecutorHandler: Send + Sync {
    async fn handle(&self, ctx: &ToolContext, name: &str, args: &Value) -> Result<String>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Runs one tool. `thinking` is the model's text accompanying the call.
    async fn execute(
        &self,
        ctx: &ToolContext,
        name: &str,
        thinking: &str,
        args: &str,
    ) -> Result<String>;

    fn tool_schema(&self, name: &str) -> Option<Value>;

    fn is_barrier(&self, name: &str) -> bool;

    /// Barriers whose answer comes from the user: their tool response is
    /// left open and filled in when the input arrives.
    fn awaits_input(&self, name: &str) -> bool;

    fn barrier_tool_names(&self) -> Vec<String>;
}

/// A definition paired with its implementation.
#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ExecutorHandler>,
}

impl RegisteredTool {
    pub fn new(definition: ToolDefinition, handler: Arc<dyn ExecutorHandler>) -> Self {
        Self {
            definition,
            handler,
        }
    }
}

/// Host-provided tools (shell, file, browser, search engines...).
pub trait Toolbox: Send + Sync {
    fn tools(&self, role: AgentRole, scope: &Scope) -> Vec<RegisteredTool>;
}

/// A toolbox with nothing in it. Agents still get their sub-agent and barrier tools.
pub struct NoTools;

impl Toolbox for NoTools {
    fn tools(&self, _role: AgentRole, _scope: &Scope) -> Vec<RegisteredTool> {
        Vec::new()
    }
}

/// Answers a barrier call. The structured result is read from the call's
/// arguments by whoever ran the loop, so the handler only checks that the
/// schema's required fields are there and acknowledges.
pub struct BarrierAck {
    reply: &'static str,
    required: Vec<String>,
}

impl BarrierAck {
    pub fn new(reply: &'static str, definition: &ToolDefinition) -> Arc<Self> {
        let required = definition
            .parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Arc::new(Self { reply, required })
    }
}

#[async_trait]
impl ExecutorHandler for BarrierAck {
    async fn handle(&self, _ctx: &ToolContext, name: &str, args: &Value) -> Result<String> {
        for field in &self.required {
            if args.get(field).is_none_or(Value::is_null) {
                bail!("missing required field '{}' in '{}' arguments", field, name);
            }
        }
        Ok(self.reply.to_string())
    }
}

/// Registers a barrier tool acknowledged with `reply`.
pub fn barrier_tool(definition: ToolDefinition, reply: &'static str) -> RegisteredTool {
    let handler = BarrierAck::new(reply, &definition);
    RegisteredTool::new(definition, handler)
}

#[derive(Default, Clone)]
pub struct FlowExecutor {
    tools: Vec<RegisteredTool>,
    barriers: HashSet<String>,
    input_barriers: HashSet<String>,
}

impl FlowExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a tool. Later registrations win so a role can
    /// override a host tool of the same name.
    pub fn with_tool(mut self, tool: RegisteredTool) -> Self {
        self.tools.retain(|t| t.definition.name != tool.definition.name);
        self.tools.push(tool);
        self
    }

    pub fn with_tools(self, tools: impl IntoIterator<Item = RegisteredTool>) -> Self {
        tools.into_iter().fold(self, |exec, tool| exec.with_tool(tool))
    }

    pub fn with_barrier(mut self, tool: RegisteredTool) -> Self {
        self.barriers.insert(tool.definition.name.clone());
        self.with_tool(tool)
    }

    pub fn with_input_barrier(mut self, tool: RegisteredTool) -> Self {
        self.input_barriers.insert(tool.definition.name.clone());
        self.with_barrier(tool)
    }

    fn find(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|t| t.definition.name == name)
    }
}

/// Empty argument strings are treated as an empty object.
fn parse_arguments(name: &str, args: &str) -> Result<Value> {
    if args.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(args).map_err(|e| anyhow!("invalid arguments for tool '{}': {}", name, e))
}

#[async_trait]
impl Executor for FlowExecutor {
    fn tools(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        name: &str,
        thinking: &str,
        args: &str,
    ) -> Result<String> {
        let Some(tool) = self.find(name) else {
            let known: Vec<&str> = self.tools.iter().map(|t| t.definition.name.as_str()).collect();
            return Ok(format!(
                "tool '{}' is not available, use one of: {}",
                name,
                known.join(", ")
            ));
        };
        if !thinking.is_empty() {
            debug!(tool = name, role = %ctx.agent.current_role, "thinking: {}", thinking);
        }
        let args = parse_arguments(name, args)?;
        tool.handler.handle(ctx, name, &args).await
    }

    fn tool_schema(&self, name: &str) -> Option<Value> {
        self.find(name).map(|t| t.definition.parameters.clone())
    }

    fn is_barrier(&self, name: &str) -> bool {
        self.barriers.contains(name)
    }

    fn awaits_input(&self, name: &str) -> bool {
        self.input_barriers.contains(name)
    }

    fn barrier_tool_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|t| self.barriers.contains(&t.definition.name))
            .map(|t| t.definition.name.clone())
            .collect()
    }
}
