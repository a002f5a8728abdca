use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{AgentLog, AgentLogProvider, ChainRecord, FlowStore, NewChain, Status, Subtask, Task};
use crate::core::agent::AgentRole;
use crate::core::chain::{Message, deserialize_chain, serialize_chain};
use crate::core::error::ChainError;
use crate::core::llm::TokenUsage;
use crate::core::subtasks::SubtaskInfo;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        input TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'created',
        result TEXT NOT NULL DEFAULT '',
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS subtasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'created',
        result TEXT NOT NULL DEFAULT '',
        context TEXT NOT NULL DEFAULT '',
        position INTEGER NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_subtasks_task ON subtasks (task_id, position)",
    "CREATE TABLE IF NOT EXISTS chains (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id INTEGER NOT NULL,
        task_id INTEGER,
        subtask_id INTEGER,
        role TEXT NOT NULL,
        model TEXT NOT NULL,
        provider TEXT NOT NULL,
        chain_json TEXT NOT NULL,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS agent_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id INTEGER NOT NULL,
        parent_role TEXT NOT NULL,
        child_role TEXT NOT NULL,
        question TEXT NOT NULL,
        answer TEXT NOT NULL,
        task_id INTEGER,
        subtask_id INTEGER,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
];

const CHAIN_COLUMNS: &str = "id, flow_id, task_id, subtask_id, role, model, provider, chain_json, input_tokens, output_tokens, created_at, updated_at";
const TASK_COLUMNS: &str = "id, flow_id, title, input, status, result";
const SUBTASK_COLUMNS: &str = "id, task_id, title, description, status, result, context";

/// Chain row as stored; decoded outside the rusqlite row callback.
struct ChainRow {
    id: i64,
    flow_id: i64,
    task_id: Option<i64>,
    subtask_id: Option<i64>,
    role: String,
    model: String,
    provider: String,
    chain_json: String,
    input_tokens: i64,
    output_tokens: i64,
    created_at: String,
    updated_at: String,
}

impl ChainRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            flow_id: row.get(1)?,
            task_id: row.get(2)?,
            subtask_id: row.get(3)?,
            role: row.get(4)?,
            model: row.get(5)?,
            provider: row.get(6)?,
            chain_json: row.get(7)?,
            input_tokens: row.get(8)?,
            output_tokens: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<ChainRecord> {
        Ok(ChainRecord {
            id: self.id,
            flow_id: self.flow_id,
            task_id: self.task_id,
            subtask_id: self.subtask_id,
            role: parse_role(&self.role)?,
            model: self.model,
            provider: self.provider,
            chain: deserialize_chain(&self.chain_json)?,
            usage: TokenUsage {
                input_tokens: self.input_tokens.max(0) as u64,
                output_tokens: self.output_tokens.max(0) as u64,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_role(value: &str) -> Result<AgentRole> {
    AgentRole::parse(value).ok_or_else(|| anyhow!("unknown agent role '{}'", value))
}

fn parse_status(value: &str) -> Result<Status> {
    Status::parse(value).ok_or_else(|| anyhow!("unknown status '{}'", value))
}

fn task_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_task(raw: (i64, i64, String, String, String, String)) -> Result<Task> {
    let (id, flow_id, title, input, status, result) = raw;
    Ok(Task {
        id,
        flow_id,
        title,
        input,
        status: parse_status(&status)?,
        result,
    })
}

type SubtaskRow = (i64, i64, String, String, String, String, String);

fn subtask_row(row: &Row<'_>) -> rusqlite::Result<SubtaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_subtask(raw: SubtaskRow) -> Result<Subtask> {
    let (id, task_id, title, description, status, result, context) = raw;
    Ok(Subtask {
        id,
        task_id,
        title,
        description,
        status: parse_status(&status)?,
        result,
        context,
    })
}

fn load_chain(db: &Connection, id: i64) -> Result<ChainRecord> {
    let row = db
        .query_row(
            &format!("SELECT {CHAIN_COLUMNS} FROM chains WHERE id = ?1"),
            params![id],
            ChainRow::from_row,
        )
        .optional()?
        .ok_or(ChainError::not_found("chain", id))?;
    row.decode()
}

fn load_task_subtasks(db: &Connection, task_id: i64) -> Result<Vec<Subtask>> {
    let mut stmt = db.prepare(&format!(
        "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = ?1 ORDER BY position ASC, id ASC"
    ))?;
    let rows = stmt.query_map(params![task_id], subtask_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode_subtask(row?)?);
    }
    Ok(out)
}

fn expect_row(changed: usize, kind: &'static str, id: i64) -> Result<()> {
    if changed == 0 {
        return Err(ChainError::not_found(kind, id).into());
    }
    Ok(())
}

/// SQLite-backed store. One connection behind an async mutex.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(path)?;
        info!("Opened flow store at {}", path.display());
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        for statement in SCHEMA {
            db.execute(statement, [])?;
        }
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub async fn list_agent_logs(&self, flow_id: i64) -> Result<Vec<AgentLog>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT flow_id, parent_role, child_role, question, answer, task_id, subtask_id
             FROM agent_logs WHERE flow_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![flow_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<i64>>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (flow_id, parent, child, question, answer, task_id, subtask_id) = row?;
            out.push(AgentLog {
                flow_id,
                parent_role: parse_role(&parent)?,
                child_role: parse_role(&child)?,
                question,
                answer,
                task_id,
                subtask_id,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl FlowStore for SqliteStore {
    async fn create_chain(&self, chain: NewChain) -> Result<ChainRecord> {
        let json = serialize_chain(&chain.chain)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO chains (flow_id, task_id, subtask_id, role, model, provider, chain_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chain.scope.flow_id,
                chain.scope.task_id,
                chain.scope.subtask_id,
                chain.role.as_str(),
                chain.model,
                chain.provider,
                json
            ],
        )?;
        load_chain(&db, db.last_insert_rowid())
    }

    async fn get_chain(&self, id: i64) -> Result<ChainRecord> {
        let db = self.db.lock().await;
        load_chain(&db, id)
    }

    async fn update_chain(&self, id: i64, chain: &[Message]) -> Result<()> {
        let json = serialize_chain(chain)?;
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE chains SET chain_json = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![json, id],
        )?;
        expect_row(changed, "chain", id)
    }

    async fn add_chain_usage(&self, id: i64, usage: TokenUsage) -> Result<()> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE chains
             SET input_tokens = input_tokens + ?1, output_tokens = output_tokens + ?2, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3",
            params![usage.input_tokens as i64, usage.output_tokens as i64, id],
        )?;
        expect_row(changed, "chain", id)
    }

    async fn create_task(&self, flow_id: i64, title: &str, input: &str) -> Result<Task> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO tasks (flow_id, title, input) VALUES (?1, ?2, ?3)",
            params![flow_id, title, input],
        )?;
        let raw = db.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![db.last_insert_rowid()],
            task_row,
        )?;
        decode_task(raw)
    }

    async fn get_task(&self, id: i64) -> Result<Task> {
        let db = self.db.lock().await;
        let raw = db
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                task_row,
            )
            .optional()?
            .ok_or(ChainError::not_found("task", id))?;
        decode_task(raw)
    }

    async fn update_task_status(&self, id: i64, status: Status) -> Result<()> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE tasks SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        expect_row(changed, "task", id)
    }

    async fn update_task_result(&self, id: i64, result: &str) -> Result<()> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE tasks SET result = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![result, id],
        )?;
        expect_row(changed, "task", id)
    }

    async fn get_subtask(&self, id: i64) -> Result<Subtask> {
        let db = self.db.lock().await;
        let raw = db
            .query_row(
                &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1"),
                params![id],
                subtask_row,
            )
            .optional()?
            .ok_or(ChainError::not_found("subtask", id))?;
        decode_subtask(raw)
    }

    async fn get_task_subtasks(&self, task_id: i64) -> Result<Vec<Subtask>> {
        let db = self.db.lock().await;
        load_task_subtasks(&db, task_id)
    }

    async fn update_subtask_status(&self, id: i64, status: Status) -> Result<()> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE subtasks SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        expect_row(changed, "subtask", id)
    }

    async fn update_subtask_result(&self, id: i64, result: &str) -> Result<()> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE subtasks SET result = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![result, id],
        )?;
        expect_row(changed, "subtask", id)
    }

    async fn create_subtasks(&self, task_id: i64, subtasks: &[SubtaskInfo]) -> Result<Vec<Subtask>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let exists: Option<i64> = tx
            .query_row("SELECT id FROM tasks WHERE id = ?1", params![task_id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(ChainError::not_found("task", task_id).into());
        }
        let start: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM subtasks WHERE task_id = ?1",
            params![task_id],
            |r| r.get(0),
        )?;
        let mut ids = Vec::with_capacity(subtasks.len());
        for (offset, info) in subtasks.iter().enumerate() {
            tx.execute(
                "INSERT INTO subtasks (task_id, title, description, position) VALUES (?1, ?2, ?3, ?4)",
                params![task_id, info.title, info.description, start + offset as i64],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;

        let all = load_task_subtasks(&db, task_id)?;
        Ok(all.into_iter().filter(|s| ids.contains(&s.id)).collect())
    }

    async fn replace_planned_subtasks(
        &self,
        task_id: i64,
        subtasks: &[SubtaskInfo],
    ) -> Result<Vec<Subtask>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let planned: HashSet<i64> = {
            let mut stmt =
                tx.prepare("SELECT id FROM subtasks WHERE task_id = ?1 AND status = 'created'")?;
            let rows = stmt.query_map(params![task_id], |r| r.get::<_, i64>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let kept: HashSet<i64> = subtasks
            .iter()
            .map(|s| s.id)
            .filter(|id| planned.contains(id))
            .collect();
        for id in planned.difference(&kept) {
            tx.execute("DELETE FROM subtasks WHERE id = ?1", params![id])?;
        }

        let start: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM subtasks WHERE task_id = ?1 AND status != 'created'",
            params![task_id],
            |r| r.get(0),
        )?;
        let mut ids = Vec::with_capacity(subtasks.len());
        for (offset, info) in subtasks.iter().enumerate() {
            let position = start + offset as i64;
            if kept.contains(&info.id) {
                tx.execute(
                    "UPDATE subtasks SET title = ?1, description = ?2, position = ?3, updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?4",
                    params![info.title, info.description, position, info.id],
                )?;
                ids.push(info.id);
            } else {
                tx.execute(
                    "INSERT INTO subtasks (task_id, title, description, position) VALUES (?1, ?2, ?3, ?4)",
                    params![task_id, info.title, info.description, position],
                )?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;

        let all = load_task_subtasks(&db, task_id)?;
        Ok(ids
            .iter()
            .filter_map(|id| all.iter().find(|s| s.id == *id).cloned())
            .collect())
    }
}

#[async_trait]
impl AgentLogProvider for SqliteStore {
    async fn put_log(&self, log: AgentLog) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_logs (flow_id, parent_role, child_role, question, answer, task_id, subtask_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.flow_id,
                log.parent_role.as_str(),
                log.child_role.as_str(),
                log.question,
                log.answer,
                log.task_id,
                log.subtask_id
            ],
        )?;
        Ok(db.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::Scope;
    use crate::core::storage::contract;

    #[tokio::test]
    async fn chain_lifecycle() {
        contract::chain_lifecycle(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn planned_subtask_replacement() {
        contract::planned_subtask_replacement(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        contract::missing_rows_are_not_found(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn chains_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows").join("flow.db");

        let id = {
            let store = SqliteStore::open(&path).await.unwrap();
            let record = store
                .create_chain(NewChain {
                    scope: Scope::task(4, 9),
                    role: AgentRole::Reporter,
                    model: "m".into(),
                    provider: "p".into(),
                    chain: vec![Message::system("report"), Message::human("go")],
                })
                .await
                .unwrap();
            record.id
        };

        let store = SqliteStore::open(&path).await.unwrap();
        let record = store.get_chain(id).await.unwrap();
        assert_eq!(record.role, AgentRole::Reporter);
        assert_eq!(record.task_id, Some(9));
        assert_eq!(record.subtask_id, None);
        assert_eq!(record.chain[1], Message::human("go"));
    }

    #[tokio::test]
    async fn corrupt_chain_blob_is_a_serialization_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let db = store.db.lock().await;
            db.execute(
                "INSERT INTO chains (flow_id, role, model, provider, chain_json) VALUES (1, 'coder', 'm', 'p', '[{')",
                [],
            )
            .unwrap();
        }
        let err = store.get_chain(1).await.unwrap_err();
        assert!(crate::core::error::is_fatal(&err));
    }

    #[tokio::test]
    async fn agent_logs_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_log(contract::sample_log()).await.unwrap();
        let logs = store.list_agent_logs(1).await.unwrap();
        assert_eq!(logs, vec![contract::sample_log()]);
        assert!(store.list_agent_logs(2).await.unwrap().is_empty());
    }
}
