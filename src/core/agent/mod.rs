//! Agent roles and the execution loop that drives them.

pub mod handlers;
pub mod performer;
pub mod reflector;
pub mod summarizer;

pub use handlers::AgentEnv;
pub use performer::{ChainOutcome, ChainPerformer, ChainRun};
pub use summarizer::{ChainSummarizer, Summarizer};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Primary,
    Assistant,
    Pentester,
    Coder,
    Installer,
    Memorist,
    Searcher,
    Adviser,
    Enricher,
    Reporter,
    Generator,
    Refiner,
    Reflector,
    Summarizer,
    ToolCallFixer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Primary => "primary_agent",
            AgentRole::Assistant => "assistant",
            AgentRole::Pentester => "pentester",
            AgentRole::Coder => "coder",
            AgentRole::Installer => "installer",
            AgentRole::Memorist => "memorist",
            AgentRole::Searcher => "searcher",
            AgentRole::Adviser => "adviser",
            AgentRole::Enricher => "enricher",
            AgentRole::Reporter => "reporter",
            AgentRole::Generator => "generator",
            AgentRole::Refiner => "refiner",
            AgentRole::Reflector => "reflector",
            AgentRole::Summarizer => "summarizer",
            AgentRole::ToolCallFixer => "tool_call_fixer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            AgentRole::Primary,
            AgentRole::Assistant,
            AgentRole::Pentester,
            AgentRole::Coder,
            AgentRole::Installer,
            AgentRole::Memorist,
            AgentRole::Searcher,
            AgentRole::Adviser,
            AgentRole::Enricher,
            AgentRole::Reporter,
            AgentRole::Generator,
            AgentRole::Refiner,
            AgentRole::Reflector,
            AgentRole::Summarizer,
            AgentRole::ToolCallFixer,
        ]
        .into_iter()
        .find(|role| role.as_str() == value)
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who called whom. Threaded through every handler and tool dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentContext {
    pub parent_role: AgentRole,
    pub current_role: AgentRole,
}

impl AgentContext {
    pub fn root(role: AgentRole) -> Self {
        Self {
            parent_role: role,
            current_role: role,
        }
    }

    /// Context for a sub-agent started by the current role.
    pub fn child(&self, role: AgentRole) -> Self {
        Self {
            parent_role: self.current_role,
            current_role: role,
        }
    }
}

/// The unit of work a chain belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scope {
    pub flow_id: i64,
    pub task_id: Option<i64>,
    pub subtask_id: Option<i64>,
}

impl Scope {
    pub fn flow(flow_id: i64) -> Self {
        Self {
            flow_id,
            task_id: None,
            subtask_id: None,
        }
    }

    pub fn task(flow_id: i64, task_id: i64) -> Self {
        Self {
            flow_id,
            task_id: Some(task_id),
            subtask_id: None,
        }
    }

    pub fn subtask(flow_id: i64, task_id: i64, subtask_id: i64) -> Self {
        Self {
            flow_id,
            task_id: Some(task_id),
            subtask_id: Some(subtask_id),
        }
    }
}
