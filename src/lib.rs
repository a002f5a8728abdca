//! Execution engine for trees of tool-calling LLM agents.
//!
//! A [`FlowProvider`] drives the primary agent of each subtask through
//! [`ChainPerformer`], which calls the model, dispatches tool calls (including
//! whole sub-agents) and persists the chain after every step through a
//! [`FlowStore`].

pub mod core;
pub mod logging;

pub use crate::core::agent::handlers::AgentSpec;
pub use crate::core::agent::{
    AgentContext, AgentEnv, AgentRole, ChainOutcome, ChainPerformer, ChainRun, ChainSummarizer,
    Scope, Summarizer,
};
pub use crate::core::chain::{Message, Part, Role, ToolCall, ToolCallResponse};
pub use crate::core::config::EngineConfig;
pub use crate::core::error::{ChainError, is_cancelled, is_fatal};
pub use crate::core::flow::{FlowProvider, PerformResult};
pub use crate::core::llm::{
    ContentChoice, ContentResponse, LlmProvider, StreamChunk, StreamSink, TokenUsage,
    ToolDefinition,
};
pub use crate::core::prompts::{PromptType, Prompter, TemplatePrompter};
pub use crate::core::storage::{AgentLogProvider, FlowStore, MemoryStore, SqliteStore, Status};
pub use crate::core::subtasks::{SubtaskInfo, SubtaskPatch, apply_subtask_operations};
pub use crate::core::tools::{Executor, ExecutorHandler, RegisteredTool, Toolbox};
