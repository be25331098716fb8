//! Durable job queue between the Dispatcher and the Worker pool.
//!
//! At-least-once: a claimed job is leased for the visibility timeout and
//! becomes claimable again if it is neither acked nor nacked in time.
//! Dead-lettered jobs stay in the table for operators.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use greeter_core::error::{GreeterError, Result};
use greeter_core::traits::Clock;
use greeter_core::MessageType;

use crate::persistence::{opt_ts, ts};
use crate::record::MessageRecord;

/// Job body published by the Dispatcher and the Recovery Sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub record_id: String,
    pub user_id: String,
    pub message_type: MessageType,
    pub scheduled_send_time_utc: DateTime<Utc>,
    pub retry_count: u32,
}

impl JobPayload {
    pub fn for_record(record: &MessageRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            user_id: record.user_id.clone(),
            message_type: record.message_type,
            scheduled_send_time_utc: record.scheduled_send_time_utc,
            retry_count: record.retry_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Job becomes claimable this long after publish.
    pub delay: Duration,
    /// Higher is claimed first.
    pub priority: i32,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            delay: Duration::zero(),
            priority: 0,
        }
    }
}

impl PublishOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: delay.max(Duration::zero()),
            ..Self::default()
        }
    }
}

/// A leased job handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: String,
    pub payload: JobPayload,
    /// Deliveries so far, including this one.
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job_id: String,
    pub payload: JobPayload,
    pub reason: Option<String>,
    pub dead_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub delayed: u64,
    pub inflight: u64,
    pub dead: u64,
}

/// Broker semantics the pipeline relies on.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, payload: &JobPayload, options: PublishOptions) -> Result<String>;

    /// Lease the next visible job, if any.
    async fn claim(&self) -> Result<Option<QueuedJob>>;

    async fn ack(&self, job_id: &str) -> Result<()>;

    /// Release a job back to the queue after `delay`.
    async fn nack(&self, job_id: &str, delay: Duration, error: &str) -> Result<()>;

    async fn dead_letter(&self, job_id: &str, reason: &str) -> Result<()>;

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    async fn depth(&self) -> Result<QueueDepth>;
}

/// SQLite-backed [`JobQueue`]. Shares nothing with the record store but the
/// database file.
pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl SqliteJobQueue {
    pub fn open(path: &Path, clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(queue_err("Queue open"))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(queue_err("Queue pragmas"))?;
        Self::from_connection(conn, clock, visibility_timeout)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(queue_err("Queue open"))?;
        Self::from_connection(conn, clock, visibility_timeout)
    }

    fn from_connection(
        conn: Connection,
        clock: Arc<dyn Clock>,
        visibility_timeout: Duration,
    ) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'ready',   -- ready | inflight | dead
                visible_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, priority DESC, visible_at);
            ",
        )
        .map_err(queue_err("Queue migration"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            visibility_timeout,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| GreeterError::Queue(format!("connection lock poisoned: {e}")))
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn publish(&self, payload: &JobPayload, options: PublishOptions) -> Result<String> {
        let now = self.clock.now();
        let id = uuid::Uuid::new_v4().to_string();
        let body = serde_json::to_string(payload)
            .map_err(|e| GreeterError::Queue(format!("Encode payload: {e}")))?;
        self.conn()?
            .execute(
                "INSERT INTO jobs (id, record_id, payload, priority, state, visible_at, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'ready', ?5, 0, ?6, ?6)",
                params![
                    id,
                    payload.record_id,
                    body,
                    options.priority,
                    ts(now + options.delay.max(Duration::zero())),
                    ts(now),
                ],
            )
            .map_err(queue_err("Publish"))?;
        tracing::debug!(
            job_id = %id,
            record_id = %payload.record_id,
            delay_secs = options.delay.num_seconds(),
            "📨 Job published"
        );
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<QueuedJob>> {
        let now = self.clock.now();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(queue_err("Claim begin"))?;

        // Ready jobs and expired leases are both claimable.
        let row = tx
            .query_row(
                "SELECT id, payload, attempts FROM jobs
                 WHERE state IN ('ready', 'inflight') AND visible_at <= ?1
                 ORDER BY priority DESC, visible_at
                 LIMIT 1",
                [ts(now)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(queue_err("Claim select"))?;

        let Some((id, body, attempts)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'inflight', visible_at = ?1, attempts = attempts + 1, updated_at = ?2
             WHERE id = ?3",
            params![ts(now + self.visibility_timeout), ts(now), id],
        )
        .map_err(queue_err("Claim lease"))?;
        tx.commit().map_err(queue_err("Claim commit"))?;

        let payload: JobPayload = serde_json::from_str(&body)
            .map_err(|e| GreeterError::Queue(format!("Decode payload for job {id}: {e}")))?;
        Ok(Some(QueuedJob {
            id,
            payload,
            attempts: attempts + 1,
        }))
    }

    async fn ack(&self, job_id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM jobs WHERE id = ?1", [job_id])
            .map_err(queue_err("Ack"))?;
        Ok(())
    }

    async fn nack(&self, job_id: &str, delay: Duration, error: &str) -> Result<()> {
        let now = self.clock.now();
        self.conn()?
            .execute(
                "UPDATE jobs SET state = 'ready', visible_at = ?1, last_error = ?2, updated_at = ?3
                 WHERE id = ?4 AND state = 'inflight'",
                params![ts(now + delay.max(Duration::zero())), error, ts(now), job_id],
            )
            .map_err(queue_err("Nack"))?;
        Ok(())
    }

    async fn dead_letter(&self, job_id: &str, reason: &str) -> Result<()> {
        let now = self.clock.now();
        self.conn()?
            .execute(
                "UPDATE jobs SET state = 'dead', last_error = ?1, updated_at = ?2 WHERE id = ?3",
                params![reason, ts(now), job_id],
            )
            .map_err(queue_err("Dead-letter"))?;
        tracing::warn!(job_id = %job_id, reason = %reason, "🪦 Job dead-lettered");
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, payload, last_error, updated_at FROM jobs
                 WHERE state = 'dead' ORDER BY updated_at DESC LIMIT ?1",
            )
            .map_err(queue_err("Dead letters"))?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    opt_ts(row, 3)?,
                ))
            })
            .map_err(queue_err("Dead letters"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(queue_err("Dead letters"))?;

        rows.into_iter()
            .map(|(job_id, body, reason, dead_at)| {
                let payload = serde_json::from_str(&body).map_err(|e| {
                    GreeterError::Queue(format!("Decode payload for job {job_id}: {e}"))
                })?;
                Ok(DeadLetter {
                    job_id,
                    payload,
                    reason,
                    dead_at,
                })
            })
            .collect()
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = ts(self.clock.now());
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT
                    SUM(CASE WHEN state = 'ready' AND visible_at <= ?1 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'ready' AND visible_at > ?1 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'inflight' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END)
                 FROM jobs",
            )
            .map_err(queue_err("Depth"))?;
        let depth = stmt
            .query_row([now], |row| {
                let count = |idx: usize| -> rusqlite::Result<u64> {
                    Ok(row.get::<_, Option<i64>>(idx)?.unwrap_or(0) as u64)
                };
                Ok(QueueDepth {
                    ready: count(0)?,
                    delayed: count(1)?,
                    inflight: count(2)?,
                    dead: count(3)?,
                })
            })
            .map_err(queue_err("Depth"))?;
        Ok(depth)
    }
}

fn queue_err(context: &'static str) -> impl Fn(rusqlite::Error) -> GreeterError {
    move |e| GreeterError::Queue(format!("{context}: {e}"))
}
