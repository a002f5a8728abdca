use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use super::{AgentLog, AgentLogProvider, ChainRecord, FlowStore, NewChain, Status, Subtask, Task};
use crate::core::chain::Message;
use crate::core::error::ChainError;
use crate::core::llm::TokenUsage;
use crate::core::subtasks::SubtaskInfo;

#[derive(Default)]
struct State {
    last_id: i64,
    chains: HashMap<i64, ChainRecord>,
    tasks: HashMap<i64, Task>,
    /// Global execution order; filtered per task on read.
    subtasks: Vec<Subtask>,
    logs: Vec<AgentLog>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn subtask_mut(&mut self, id: i64) -> Result<&mut Subtask> {
        self.subtasks
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ChainError::not_found("subtask", id).into())
    }

    fn new_subtask(&mut self, task_id: i64, info: &SubtaskInfo) -> Subtask {
        Subtask {
            id: self.next_id(),
            task_id,
            title: info.title.clone(),
            description: info.description.clone(),
            status: Status::Created,
            result: String::new(),
            context: String::new(),
        }
    }
}

fn now() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default()
}

/// Process-local store for tests and hosts that persist elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn agent_logs(&self) -> Vec<AgentLog> {
        self.state.lock().await.logs.clone()
    }

    pub async fn chains(&self) -> Vec<ChainRecord> {
        let state = self.state.lock().await;
        let mut chains: Vec<_> = state.chains.values().cloned().collect();
        chains.sort_by_key(|c| c.id);
        chains
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn create_chain(&self, chain: NewChain) -> Result<ChainRecord> {
        let mut state = self.state.lock().await;
        let ts = now();
        let record = ChainRecord {
            id: state.next_id(),
            flow_id: chain.scope.flow_id,
            task_id: chain.scope.task_id,
            subtask_id: chain.scope.subtask_id,
            role: chain.role,
            model: chain.model,
            provider: chain.provider,
            chain: chain.chain,
            usage: TokenUsage::default(),
            created_at: ts.clone(),
            updated_at: ts,
        };
        state.chains.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_chain(&self, id: i64) -> Result<ChainRecord> {
        let state = self.state.lock().await;
        state
            .chains
            .get(&id)
            .cloned()
            .ok_or_else(|| ChainError::not_found("chain", id).into())
    }

    async fn update_chain(&self, id: i64, chain: &[Message]) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .chains
            .get_mut(&id)
            .ok_or(ChainError::not_found("chain", id))?;
        record.chain = chain.to_vec();
        record.updated_at = now();
        Ok(())
    }

    async fn add_chain_usage(&self, id: i64, usage: TokenUsage) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .chains
            .get_mut(&id)
            .ok_or(ChainError::not_found("chain", id))?;
        record.usage += usage;
        Ok(())
    }

    async fn create_task(&self, flow_id: i64, title: &str, input: &str) -> Result<Task> {
        let mut state = self.state.lock().await;
        let task = Task {
            id: state.next_id(),
            flow_id,
            title: title.to_string(),
            input: input.to_string(),
            status: Status::Created,
            result: String::new(),
        };
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: i64) -> Result<Task> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| ChainError::not_found("task", id).into())
    }

    async fn update_task_status(&self, id: i64, status: Status) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(&id).ok_or(ChainError::not_found("task", id))?;
        task.status = status;
        Ok(())
    }

    async fn update_task_result(&self, id: i64, result: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(&id).ok_or(ChainError::not_found("task", id))?;
        task.result = result.to_string();
        Ok(())
    }

    async fn get_subtask(&self, id: i64) -> Result<Subtask> {
        let mut state = self.state.lock().await;
        let subtask = state.subtask_mut(id)?.clone();
        Ok(subtask)
    }

    async fn get_task_subtasks(&self, task_id: i64) -> Result<Vec<Subtask>> {
        let state = self.state.lock().await;
        Ok(state
            .subtasks
            .iter()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn update_subtask_status(&self, id: i64, status: Status) -> Result<()> {
        let mut state = self.state.lock().await;
        state.subtask_mut(id)?.status = status;
        Ok(())
    }

    async fn update_subtask_result(&self, id: i64, result: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.subtask_mut(id)?.result = result.to_string();
        Ok(())
    }

    async fn create_subtasks(&self, task_id: i64, subtasks: &[SubtaskInfo]) -> Result<Vec<Subtask>> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&task_id) {
            return Err(ChainError::not_found("task", task_id).into());
        }
        let mut created = Vec::with_capacity(subtasks.len());
        for info in subtasks {
            let subtask = state.new_subtask(task_id, info);
            state.subtasks.push(subtask.clone());
            created.push(subtask);
        }
        Ok(created)
    }

    async fn replace_planned_subtasks(
        &self,
        task_id: i64,
        subtasks: &[SubtaskInfo],
    ) -> Result<Vec<Subtask>> {
        let mut state = self.state.lock().await;
        let mut previous: HashMap<i64, Subtask> = HashMap::new();
        state.subtasks.retain(|s| {
            if s.task_id == task_id && s.is_planned() {
                previous.insert(s.id, s.clone());
                false
            } else {
                true
            }
        });

        let mut planned = Vec::with_capacity(subtasks.len());
        for info in subtasks {
            let subtask = match previous.remove(&info.id) {
                Some(mut existing) => {
                    existing.title = info.title.clone();
                    existing.description = info.description.clone();
                    existing
                }
                None => state.new_subtask(task_id, info),
            };
            state.subtasks.push(subtask.clone());
            planned.push(subtask);
        }
        Ok(planned)
    }
}

#[async_trait]
impl AgentLogProvider for MemoryStore {
    async fn put_log(&self, log: AgentLog) -> Result<i64> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.logs.push(log);
        Ok(id)
    }
}
