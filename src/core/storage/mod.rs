//! Persistence contracts used by the engine and the records they exchange.
//!
//! Storage is the source of truth between execution passes: chains are
//! rewritten after every model call and every tool response, so a reloaded
//! chain is always resumable.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::agent::{AgentRole, Scope};
use crate::core::chain::Message;
use crate::core::llm::TokenUsage;
use crate::core::subtasks::SubtaskInfo;

/// Lifecycle of tasks and subtasks. Only `Created` subtasks are planned and
/// may be patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Running,
    Waiting,
    Finished,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Running => "running",
            Status::Waiting => "waiting",
            Status::Finished => "finished",
            Status::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Status::Created),
            "running" => Some(Status::Running),
            "waiting" => Some(Status::Waiting),
            "finished" => Some(Status::Finished),
            "failed" => Some(Status::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub flow_id: i64,
    pub title: String,
    pub input: String,
    pub status: Status,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: i64,
    pub task_id: i64,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub result: String,
    pub context: String,
}

impl Subtask {
    pub fn info(&self) -> SubtaskInfo {
        SubtaskInfo {
            id: self.id,
            title: self.title.clone(),
            description: self.description.clone(),
        }
    }

    pub fn is_planned(&self) -> bool {
        self.status == Status::Created
    }
}

/// Seed of a chain row.
#[derive(Debug, Clone)]
pub struct NewChain {
    pub scope: Scope,
    pub role: AgentRole,
    pub model: String,
    pub provider: String,
    pub chain: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainRecord {
    pub id: i64,
    pub flow_id: i64,
    pub task_id: Option<i64>,
    pub subtask_id: Option<i64>,
    pub role: AgentRole,
    pub model: String,
    pub provider: String,
    pub chain: Vec<Message>,
    pub usage: TokenUsage,
    pub created_at: String,
    pub updated_at: String,
}

/// One delegation between agents, for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLog {
    pub flow_id: i64,
    pub parent_role: AgentRole,
    pub child_role: AgentRole,
    pub question: String,
    pub answer: String,
    pub task_id: Option<i64>,
    pub subtask_id: Option<i64>,
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn create_chain(&self, chain: NewChain) -> Result<ChainRecord>;

    async fn get_chain(&self, id: i64) -> Result<ChainRecord>;

    async fn update_chain(&self, id: i64, chain: &[Message]) -> Result<()>;

    async fn add_chain_usage(&self, id: i64, usage: TokenUsage) -> Result<()>;

    async fn create_task(&self, flow_id: i64, title: &str, input: &str) -> Result<Task>;

    async fn get_task(&self, id: i64) -> Result<Task>;

    async fn update_task_status(&self, id: i64, status: Status) -> Result<()>;

    async fn update_task_result(&self, id: i64, result: &str) -> Result<()>;

    async fn get_subtask(&self, id: i64) -> Result<Subtask>;

    /// Subtasks of a task in execution order.
    async fn get_task_subtasks(&self, task_id: i64) -> Result<Vec<Subtask>>;

    async fn update_subtask_status(&self, id: i64, status: Status) -> Result<()>;

    async fn update_subtask_result(&self, id: i64, result: &str) -> Result<()>;

    /// Appends planned subtasks after the existing ones.
    async fn create_subtasks(&self, task_id: i64, subtasks: &[SubtaskInfo]) -> Result<Vec<Subtask>>;

    /// Makes `subtasks` the planned list of the task, in that order. Items with
    /// a known id are updated, `id == 0` items are created and planned
    /// subtasks missing from the list are deleted.
    async fn replace_planned_subtasks(
        &self,
        task_id: i64,
        subtasks: &[SubtaskInfo],
    ) -> Result<Vec<Subtask>>;
}

#[async_trait]
pub trait AgentLogProvider: Send + Sync {
    async fn put_log(&self, log: AgentLog) -> Result<i64>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip() {
        for status in [
            Status::Created,
            Status::Running,
            Status::Waiting,
            Status::Finished,
            Status::Failed,
        ] {
            assert_eq!(Status::parse(status.as_str()), Some(status));
        }
        assert_eq!(Status::parse("paused"), None);
    }
}
