//! 会话检查点存储
//!
//! 每个 thread_id 一份检查点（完整 SessionState + 待执行阶段），每跳之后写入；
//! 支持内存与 SQLite 两种实现，进程重启后可从 SQLite 恢复会话。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{AgentError, SessionState, Stage};

/// 检查点：状态快照 + 下一步要执行的阶段（None 表示本轮已结束）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: SessionState,
    pub next_stage: Option<Stage>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(state: SessionState, next_stage: Option<Stage>) -> Self {
        Self {
            state,
            next_stage,
            updated_at: Utc::now(),
        }
    }
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError>;

    async fn save(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<(), AgentError>;

    async fn delete(&self, thread_id: &str) -> Result<(), AgentError>;
}

/// 内存实现（进程内有效）
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    inner: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Ok(self.inner.read().await.get(thread_id).cloned())
    }

    async fn save(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        self.inner
            .write()
            .await
            .insert(thread_id.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> Result<(), AgentError> {
        self.inner.write().await.remove(thread_id);
        Ok(())
    }
}

/// SQLite 实现：表 `checkpoints(thread_id PRIMARY KEY, state JSON, next_stage, updated_at)`
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

fn persistence_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Persistence(e.to_string())
}

impl SqliteSessionStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(persistence_err)?;
        }
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn db(&self) -> Result<Connection, AgentError> {
        Connection::open(&self.db_path).map_err(persistence_err)
    }

    fn init_db(&self) -> Result<(), AgentError> {
        self.db()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    thread_id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    next_stage TEXT,
                    updated_at TEXT NOT NULL
                );",
            )
            .map_err(persistence_err)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(Connection) -> Result<T, AgentError> + Send + 'static,
    {
        let conn = self.db()?;
        tokio::task::spawn_blocking(move || f(conn))
            .await
            .map_err(persistence_err)?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let thread_id = thread_id.to_string();
        self.blocking(move |conn| {
            let row: Option<(String, Option<String>, String)> = conn
                .query_row(
                    "SELECT state, next_stage, updated_at FROM checkpoints WHERE thread_id = ?1",
                    params![thread_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()
                .map_err(persistence_err)?;

            let Some((state, next_stage, updated_at)) = row else {
                return Ok(None);
            };
            let state: SessionState = serde_json::from_str(&state).map_err(persistence_err)?;
            let next_stage = next_stage
                .map(|s| serde_json::from_str::<Stage>(&s))
                .transpose()
                .map_err(persistence_err)?;
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(persistence_err)?;
            Ok(Some(Checkpoint {
                state,
                next_stage,
                updated_at,
            }))
        })
        .await
    }

    async fn save(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        let thread_id = thread_id.to_string();
        let state = serde_json::to_string(&checkpoint.state).map_err(persistence_err)?;
        let next_stage = checkpoint
            .next_stage
            .map(|s| serde_json::to_string(&s))
            .transpose()
            .map_err(persistence_err)?;
        let updated_at = checkpoint.updated_at.to_rfc3339();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints (thread_id, state, next_stage, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![thread_id, state, next_stage, updated_at],
            )
            .map_err(persistence_err)?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, thread_id: &str) -> Result<(), AgentError> {
        let thread_id = thread_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM checkpoints WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(persistence_err)?;
            Ok(())
        })
        .await
    }
}
