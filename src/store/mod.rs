//! Durable task store backed by SQLite.
//!
//! The store is the single source of truth for task state. Every status
//! change is a conditional `UPDATE` on the current status, so two workers
//! can never both move the same task out of `queued`, and nothing can write
//! to a task once it is terminal.
//!
//! All calls hop onto the blocking pool; the connection mutex is only held
//! inside those closures and never across an `.await`.

mod schema;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use thiserror::Error;

use crate::task::{
    AgentMessage, JobId, Progress, Task, TaskDetail, TaskId, TaskMetrics, TaskStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {task_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} is {status}; messages can only be appended while processing")]
    NotWritable { task_id: TaskId, status: TaskStatus },

    #[error("task {task_id}: message order {got} out of sequence (expected {expected})")]
    OutOfOrder {
        task_id: TaskId,
        expected: u32,
        got: u32,
    },

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store worker failed: {0}")]
    Join(String),

    #[error("store connection poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of trying to claim a queued task for execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller now owns the run; the task is `processing`.
    Claimed(Task),
    /// The task was not `queued`; somebody else has it or it already ended.
    NotQueued(TaskStatus),
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
    pub status: Option<TaskStatus>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub pages: u64,
}

const MAX_PER_PAGE: u32 = 100;

const TASK_COLUMNS: &str = "id, task, status, created_at, started_at, completed_at, error, \
     user_id, job_id, from_cache, progress_role, progress_turn, progress_max";

#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
    /// Claims left to fail with `SQLITE_BUSY`.
    #[cfg(test)]
    claim_faults: Arc<std::sync::atomic::AtomicU32>,
}

impl TaskStore {
    /// Open (or create) the database file and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        // Foreign keys must be enabled per connection.
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            #[cfg(test)]
            claim_faults: Default::default(),
        })
    }

    /// Make the next `n` claims fail as if the database were locked.
    #[cfg(test)]
    pub(crate) fn fail_next_claims(&self, n: u32) {
        self.claim_faults
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_claim_fault(&self) -> StoreResult<()> {
        use std::sync::atomic::Ordering;
        let taken = self
            .claim_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("database is locked".to_string()),
            )));
        }
        Ok(())
    }

    /// Shared handle for other tables living in the same database.
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    /// Insert a new `queued` task.
    pub async fn create_task(&self, task: Task) -> StoreResult<Task> {
        self.with_conn(move |conn| {
            insert_task(conn, &task)?;
            Ok(task)
        })
        .await
    }

    /// Insert a task that is already `completed`, with its messages and
    /// metrics, in one transaction. Used when a submission is answered from
    /// the result cache.
    pub async fn insert_completed(
        &self,
        mut task: Task,
        messages: Vec<AgentMessage>,
        metrics: TaskMetrics,
    ) -> StoreResult<Task> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            task.status = TaskStatus::Completed;
            task.started_at.get_or_insert(now);
            task.completed_at = Some(now);
            task.progress = None;

            let tx = conn.transaction()?;
            insert_task(&tx, &task)?;
            for (order, msg) in messages.iter().enumerate() {
                let msg = AgentMessage {
                    order: order as u32,
                    ..msg.clone()
                };
                insert_message(&tx, task.id, &msg)?;
            }
            insert_metrics(&tx, task.id, &metrics)?;
            tx.commit()?;
            Ok(task)
        })
        .await
    }

    /// Atomically move a task from `queued` to `processing`.
    pub async fn claim(&self, id: TaskId, job_id: JobId) -> StoreResult<ClaimOutcome> {
        #[cfg(test)]
        self.injected_claim_fault()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE research_tasks
                 SET status = 'processing', started_at = ?1, job_id = ?2
                 WHERE id = ?3 AND status = 'queued'",
                params![Utc::now().to_rfc3339(), job_id.to_string(), id.to_string()],
            )?;
            let outcome = if changed == 1 {
                ClaimOutcome::Claimed(fetch_task(&tx, id)?)
            } else {
                ClaimOutcome::NotQueued(current_status(&tx, id)?)
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    /// Record which turn is running. Only meaningful while processing.
    pub async fn set_progress(&self, id: TaskId, progress: Progress) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE research_tasks
                 SET progress_role = ?1, progress_turn = ?2, progress_max = ?3
                 WHERE id = ?4 AND status = 'processing'",
                params![progress.role, progress.turn, progress.max_turns, id.to_string()],
            )?;
            if changed == 0 {
                let status = current_status(conn, id)?;
                return Err(StoreError::NotWritable { task_id: id, status });
            }
            Ok(())
        })
        .await
    }

    /// Append the next message of a running task.
    ///
    /// `msg.order` must be exactly one past the last stored message.
    pub async fn append_message(&self, id: TaskId, msg: AgentMessage) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let status = current_status(&tx, id)?;
            if status != TaskStatus::Processing {
                return Err(StoreError::NotWritable { task_id: id, status });
            }
            let expected: u32 = tx.query_row(
                r#"SELECT COALESCE(MAX("order") + 1, 0) FROM agent_messages WHERE task_id = ?1"#,
                params![id.to_string()],
                |row| row.get(0),
            )?;
            if msg.order != expected {
                return Err(StoreError::OutOfOrder {
                    task_id: id,
                    expected,
                    got: msg.order,
                });
            }
            insert_message(&tx, id, &msg)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// `processing -> completed`, writing the metrics row in the same transaction.
    pub async fn complete(&self, id: TaskId, metrics: TaskMetrics) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let status = current_status(&tx, id)?;
            if !status.can_transition_to(TaskStatus::Completed) {
                return Err(StoreError::InvalidTransition {
                    task_id: id,
                    from: status,
                    to: TaskStatus::Completed,
                });
            }
            insert_metrics(&tx, id, &metrics)?;
            tx.execute(
                "UPDATE research_tasks
                 SET status = 'completed', completed_at = ?1,
                     progress_role = NULL, progress_turn = NULL, progress_max = NULL
                 WHERE id = ?2 AND status = 'processing'",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// `processing -> failed` with a human-readable reason.
    pub async fn fail(&self, id: TaskId, error: String) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE research_tasks
                 SET status = 'failed', error = ?1, completed_at = ?2,
                     progress_role = NULL, progress_turn = NULL, progress_max = NULL
                 WHERE id = ?3 AND status = 'processing'",
                params![error, Utc::now().to_rfc3339(), id.to_string()],
            )?;
            if changed == 0 {
                let from = current_status(conn, id)?;
                return Err(StoreError::InvalidTransition {
                    task_id: id,
                    from,
                    to: TaskStatus::Failed,
                });
            }
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, id: TaskId) -> StoreResult<Task> {
        self.with_conn(move |conn| fetch_task(conn, id)).await
    }

    /// Task plus ordered messages and metrics, read in one transaction.
    pub async fn get_detail(&self, id: TaskId) -> StoreResult<TaskDetail> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let task = fetch_task(&tx, id)?;
            let messages = fetch_messages(&tx, id)?;
            let metrics = fetch_metrics(&tx, id)?;
            tx.commit()?;
            Ok(TaskDetail {
                task,
                messages,
                metrics,
            })
        })
        .await
    }

    pub async fn message_count(&self, id: TaskId) -> StoreResult<u32> {
        self.with_conn(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM agent_messages WHERE task_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    /// Newest first.
    pub async fn list(&self, query: ListQuery) -> StoreResult<TaskPage> {
        self.with_conn(move |conn| {
            let per_page = query.per_page.clamp(1, MAX_PER_PAGE);
            let page = query.page.max(1);
            let status = query.status.map(|s| s.as_str().to_string());

            let filter = "WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR user_id = ?2)";
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM research_tasks {filter}"),
                params![status, query.user_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM research_tasks {filter}
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3 OFFSET ?4"
            ))?;
            let tasks = stmt
                .query_map(
                    params![
                        status,
                        query.user_id,
                        per_page,
                        (page as i64 - 1) * per_page as i64
                    ],
                    task_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let total = total as u64;
            Ok(TaskPage {
                tasks,
                page,
                per_page,
                total,
                pages: total.div_ceil(per_page as u64),
            })
        })
        .await
    }

    /// Ids of all tasks currently in `status`, oldest first.
    pub async fn ids_with_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskId>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM research_tasks WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let ids = stmt
                .query_map(params![status.as_str()], |row| {
                    let raw: String = row.get(0)?;
                    parse_id(0, &raw)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    /// Administrative removal; messages and metrics go with the task.
    pub async fn delete_task(&self, id: TaskId) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "DELETE FROM research_tasks WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}

fn insert_task(conn: &Connection, task: &Task) -> StoreResult<()> {
    let progress = task.progress.as_ref();
    conn.execute(
        "INSERT INTO research_tasks (
            id, task, status, created_at, started_at, completed_at, error,
            user_id, job_id, from_cache, progress_role, progress_turn, progress_max
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            task.id.to_string(),
            task.text,
            task.status.as_str(),
            task.created_at.to_rfc3339(),
            task.started_at.map(|dt| dt.to_rfc3339()),
            task.completed_at.map(|dt| dt.to_rfc3339()),
            task.error,
            task.user_id,
            task.job_id.map(|j| j.to_string()),
            task.from_cache,
            progress.map(|p| p.role.clone()),
            progress.map(|p| p.turn),
            progress.map(|p| p.max_turns),
        ],
    )?;
    Ok(())
}

fn insert_message(tx: &Transaction<'_>, id: TaskId, msg: &AgentMessage) -> StoreResult<()> {
    let tool_calls = if msg.tool_calls.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&msg.tool_calls)?)
    };
    tx.execute(
        r#"INSERT INTO agent_messages (task_id, agent, content, "order", token_count, tool_calls, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        params![
            id.to_string(),
            msg.agent,
            msg.content,
            msg.order,
            msg.token_count.map(|t| t as i64),
            tool_calls,
            msg.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_metrics(tx: &Transaction<'_>, id: TaskId, metrics: &TaskMetrics) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO task_metrics (
            task_id, duration, total_messages, input_tokens, output_tokens,
            total_tokens, estimated_cost, model, by_role
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id.to_string(),
            metrics.duration_secs,
            metrics.total_messages,
            metrics.input_tokens as i64,
            metrics.output_tokens as i64,
            metrics.total_tokens as i64,
            metrics.estimated_cost,
            metrics.model,
            serde_json::to_string(&metrics.by_role)?,
        ],
    )?;
    Ok(())
}

fn current_status(conn: &Connection, id: TaskId) -> StoreResult<TaskStatus> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM research_tasks WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let raw = raw.ok_or(StoreError::NotFound(id))?;
    parse_status(0, &raw).map_err(StoreError::from)
}

fn fetch_task(conn: &Connection, id: TaskId) -> StoreResult<Task> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM research_tasks WHERE id = ?1"),
        params![id.to_string()],
        task_from_row,
    )
    .optional()?
    .ok_or(StoreError::NotFound(id))
}

fn fetch_messages(conn: &Connection, id: TaskId) -> StoreResult<Vec<AgentMessage>> {
    let mut stmt = conn.prepare(
        r#"SELECT agent, content, "order", token_count, tool_calls, created_at
           FROM agent_messages WHERE task_id = ?1 ORDER BY "order" ASC"#,
    )?;
    let messages = stmt
        .query_map(params![id.to_string()], |row| {
            let tool_calls: Option<String> = row.get(4)?;
            let tool_calls = match tool_calls {
                Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
                })?,
                None => Vec::new(),
            };
            let token_count: Option<i64> = row.get(3)?;
            Ok(AgentMessage {
                agent: row.get(0)?,
                content: row.get(1)?,
                order: row.get(2)?,
                token_count: token_count.map(|t| t as u64),
                tool_calls,
                created_at: parse_ts(5, &row.get::<_, String>(5)?)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

fn fetch_metrics(conn: &Connection, id: TaskId) -> StoreResult<Option<TaskMetrics>> {
    let metrics = conn
        .query_row(
            "SELECT duration, total_messages, input_tokens, output_tokens, total_tokens,
                    estimated_cost, model, by_role
             FROM task_metrics WHERE task_id = ?1",
            params![id.to_string()],
            |row| {
                let by_role: Option<String> = row.get(7)?;
                let by_role: BTreeMap<String, u64> = match by_role {
                    Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e))
                    })?,
                    None => BTreeMap::new(),
                };
                Ok(TaskMetrics {
                    duration_secs: row.get(0)?,
                    total_messages: row.get(1)?,
                    input_tokens: row.get::<_, i64>(2)? as u64,
                    output_tokens: row.get::<_, i64>(3)? as u64,
                    total_tokens: row.get::<_, i64>(4)? as u64,
                    estimated_cost: row.get(5)?,
                    model: row.get(6)?,
                    by_role,
                })
            },
        )
        .optional()?;
    Ok(metrics)
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let started_at: Option<String> = row.get(4)?;
    let completed_at: Option<String> = row.get(5)?;
    let job_id: Option<String> = row.get(8)?;
    let progress_role: Option<String> = row.get(10)?;
    let progress = match progress_role {
        Some(role) => Some(Progress {
            role,
            turn: row.get::<_, Option<u32>>(11)?.unwrap_or(0),
            max_turns: row.get::<_, Option<u32>>(12)?.unwrap_or(0),
        }),
        None => None,
    };

    Ok(Task {
        id: parse_id(0, &row.get::<_, String>(0)?)?,
        text: row.get(1)?,
        status: parse_status(2, &row.get::<_, String>(2)?)?,
        created_at: parse_ts(3, &row.get::<_, String>(3)?)?,
        started_at: started_at.map(|s| parse_ts(4, &s)).transpose()?,
        completed_at: completed_at.map(|s| parse_ts(5, &s)).transpose()?,
        error: row.get(6)?,
        user_id: row.get(7)?,
        job_id: job_id
            .map(|s| {
                s.parse::<JobId>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e))
                })
            })
            .transpose()?,
        from_cache: row.get(9)?,
        progress,
    })
}

fn parse_id(idx: usize, raw: &str) -> rusqlite::Result<TaskId> {
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_status(idx: usize, raw: &str) -> rusqlite::Result<TaskStatus> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
