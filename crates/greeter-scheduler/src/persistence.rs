//! SQLite-backed MessageRecord store plus scheduler run bookkeeping.
//!
//! Exactly-once rests on two storage guarantees, not on locks:
//! - `idempotency_key` is UNIQUE, and inserts use `ON CONFLICT DO NOTHING`
//! - every status change is a single-row compare-and-swap on `status`
//!
//! Triggers make `scheduled_send_time_utc` immutable and forbid deletes.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use greeter_core::MessageType;
use greeter_core::error::{GreeterError, Result};

use crate::record::{MessageRecord, MessageStatus, StatusUpdate};
use crate::retry::MAX_RETRIES;
use crate::runs::{MessageCounts, RunStats, SchedulerKind};

const RECORD_COLUMNS: &str = "id, user_id, message_type, occurrence_date, idempotency_key, status, \
     scheduled_send_time_utc, retry_count, last_error, created_at, updated_at, sent_at, failed_at";

/// SQLite persistence for message records.
pub struct MessageDb {
    conn: Mutex<Connection>,
}

impl MessageDb {
    /// Open or create the message database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(db_err("DB pragmas"))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS message_records (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                message_type TEXT NOT NULL,         -- BIRTHDAY | ANNIVERSARY
                occurrence_date TEXT NOT NULL,      -- YYYY-MM-DD
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'PENDING',
                scheduled_send_time_utc TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count BETWEEN 0 AND 3),
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                sent_at TEXT,
                failed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_message_records_status_scheduled
                ON message_records (status, scheduled_send_time_utc);
            CREATE INDEX IF NOT EXISTS idx_message_records_status_updated
                ON message_records (status, updated_at);

            CREATE TRIGGER IF NOT EXISTS message_records_schedule_immutable
                BEFORE UPDATE OF scheduled_send_time_utc ON message_records
            BEGIN
                SELECT RAISE(ABORT, 'scheduled_send_time_utc is immutable');
            END;

            CREATE TRIGGER IF NOT EXISTS message_records_no_delete
                BEFORE DELETE ON message_records
            BEGIN
                SELECT RAISE(ABORT, 'message records are retained');
            END;

            -- One row per periodic trigger
            CREATE TABLE IF NOT EXISTS scheduler_runs (
                name TEXT PRIMARY KEY,
                last_run_at TEXT,
                next_run_at TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| GreeterError::Store(format!("connection lock poisoned: {e}")))
    }

    // ─── Message Records ──────────────────────────────────────

    /// Insert `record` unless its idempotency key already exists.
    /// Returns true when a row was written.
    pub fn insert_if_absent(&self, record: &MessageRecord) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "INSERT INTO message_records
                 (id, user_id, message_type, occurrence_date, idempotency_key, status,
                  scheduled_send_time_utc, retry_count, last_error, created_at, updated_at,
                  sent_at, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(idempotency_key) DO NOTHING",
                params![
                    record.id,
                    record.user_id,
                    record.message_type.as_str(),
                    record.occurrence_date.format("%Y-%m-%d").to_string(),
                    record.idempotency_key,
                    record.status.as_str(),
                    ts(record.scheduled_send_time_utc),
                    record.retry_count,
                    record.last_error,
                    ts(record.created_at),
                    ts(record.updated_at),
                    record.sent_at.map(ts),
                    record.failed_at.map(ts),
                ],
            )
            .map_err(db_err("Insert record"))?;
        Ok(changed == 1)
    }

    /// Compare-and-swap the status of one record.
    ///
    /// Returns `Ok(false)` without writing when the record is not currently in
    /// `from` (someone else already moved it). Edges outside the state machine
    /// are rejected before touching storage.
    pub fn update_status(
        &self,
        id: &str,
        from: MessageStatus,
        to: MessageStatus,
        update: &StatusUpdate,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(GreeterError::InvalidTransition {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if let Some(retry_count) = update.retry_count.filter(|n| *n > MAX_RETRIES) {
            return Err(GreeterError::Validation(format!(
                "retry_count {retry_count} exceeds max {MAX_RETRIES}"
            )));
        }

        let changed = self
            .conn()?
            .execute(
                "UPDATE message_records
                 SET status = ?1,
                     updated_at = ?2,
                     retry_count = COALESCE(?3, retry_count),
                     last_error = COALESCE(?4, last_error),
                     sent_at = CASE WHEN ?1 = 'SENT' THEN ?2 ELSE sent_at END,
                     failed_at = CASE WHEN ?1 = 'FAILED' THEN ?2 ELSE failed_at END
                 WHERE id = ?5 AND status = ?6",
                params![
                    to.as_str(),
                    ts(update.at),
                    update.retry_count,
                    update.last_error,
                    id,
                    from.as_str(),
                ],
            )
            .map_err(db_err("Update status"))?;
        Ok(changed == 1)
    }

    /// Bump `updated_at` without changing status (re-publish bookkeeping).
    pub fn touch(&self, id: &str, status: MessageStatus, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE message_records SET updated_at = ?1 WHERE id = ?2 AND status = ?3",
                params![ts(at), id, status.as_str()],
            )
            .map_err(db_err("Touch record"))?;
        Ok(changed == 1)
    }

    pub fn get(&self, id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM message_records WHERE id = ?1"),
                [id],
                map_record,
            )
            .optional()
            .map_err(db_err("Get record"))?;
        Ok(record)
    }

    pub fn get_by_key(&self, idempotency_key: &str) -> Result<Option<MessageRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM message_records WHERE idempotency_key = ?1"),
                [idempotency_key],
                map_record,
            )
            .optional()
            .map_err(db_err("Get record by key"))?;
        Ok(record)
    }

    /// Records in `status` with `from <= scheduled_send_time_utc < until`, earliest first.
    pub fn find_scheduled_between(
        &self,
        status: MessageStatus,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM message_records
                 WHERE status = ?1 AND scheduled_send_time_utc >= ?2 AND scheduled_send_time_utc < ?3
                 ORDER BY scheduled_send_time_utc LIMIT ?4"
            ),
            params![status.as_str(), ts(from), ts(until), limit as i64],
        )
    }

    /// Records in `status` scheduled strictly before `before`, earliest first.
    pub fn find_scheduled_before(
        &self,
        status: MessageStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM message_records
                 WHERE status = ?1 AND scheduled_send_time_utc < ?2
                 ORDER BY scheduled_send_time_utc LIMIT ?3"
            ),
            params![status.as_str(), ts(before), limit as i64],
        )
    }

    /// Records in `status` that have not changed since `before`.
    pub fn find_updated_before(
        &self,
        status: MessageStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM message_records
                 WHERE status = ?1 AND updated_at < ?2
                 ORDER BY updated_at LIMIT ?3"
            ),
            params![status.as_str(), ts(before), limit as i64],
        )
    }

    /// All records for one user, oldest occurrence first.
    pub fn records_for_user(&self, user_id: &str) -> Result<Vec<MessageRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM message_records
                 WHERE user_id = ?1 ORDER BY occurrence_date, message_type"
            ),
            params![user_id],
        )
    }

    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err("Prepare query"))?;
        let rows = stmt
            .query_map(params, map_record)
            .map_err(db_err("Query records"))?;
        let records = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read records"))?;
        Ok(records)
    }

    pub fn count_records(&self) -> Result<u64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM message_records", [], |r| r.get(0))
            .map_err(db_err("Count records"))?;
        Ok(count as u64)
    }

    /// Per-type counts by status.
    pub fn count_by_type(&self) -> Result<Vec<(MessageType, MessageCounts)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT message_type, status, COUNT(*) FROM message_records
                 GROUP BY message_type, status",
            )
            .map_err(db_err("Prepare counts"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(db_err("Query counts"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read counts"))?;

        let mut counts: Vec<(MessageType, MessageCounts)> = MessageType::ALL
            .iter()
            .map(|mt| (*mt, MessageCounts::default()))
            .collect();
        for (message_type, status, n) in rows {
            let message_type: MessageType = message_type.parse()?;
            let status: MessageStatus = status.parse()?;
            let Some((_, entry)) = counts.iter_mut().find(|(mt, _)| *mt == message_type) else {
                continue;
            };
            let n = n as u64;
            match status {
                MessageStatus::Pending => entry.pending += n,
                MessageStatus::Queued => entry.queued += n,
                MessageStatus::Sending => entry.sending += n,
                MessageStatus::Sent => entry.sent += n,
                MessageStatus::Failed => entry.failed += n,
            }
        }
        Ok(counts)
    }

    // ─── Scheduler Runs ──────────────────────────────────────

    /// Record one tick of a periodic trigger.
    pub fn record_run(
        &self,
        kind: SchedulerKind,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO scheduler_runs (name, last_run_at, next_run_at, run_count, error_count, last_error)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                     last_run_at = excluded.last_run_at,
                     next_run_at = excluded.next_run_at,
                     run_count = run_count + 1,
                     error_count = error_count + excluded.error_count,
                     last_error = COALESCE(excluded.last_error, last_error)",
                params![
                    kind.as_str(),
                    ts(ran_at),
                    ts(next_run_at),
                    i64::from(error.is_some()),
                    error,
                ],
            )
            .map_err(db_err("Record run"))?;
        Ok(())
    }

    /// Bookkeeping for every trigger, including ones that never ran.
    pub fn run_stats(&self) -> Result<Vec<RunStats>> {
        let conn = self.conn()?;
        let mut stats = Vec::with_capacity(SchedulerKind::ALL.len());
        for kind in SchedulerKind::ALL {
            let row = conn
                .query_row(
                    "SELECT last_run_at, next_run_at, run_count, error_count, last_error
                     FROM scheduler_runs WHERE name = ?1",
                    [kind.as_str()],
                    |row| {
                        Ok(RunStats {
                            name: kind.as_str().to_string(),
                            last_run_at: opt_ts(row, 0)?,
                            next_run_at: opt_ts(row, 1)?,
                            run_count: row.get::<_, i64>(2)? as u64,
                            error_count: row.get::<_, i64>(3)? as u64,
                            last_error: row.get(4)?,
                        })
                    },
                )
                .optional()
                .map_err(db_err("Run stats"))?;
            stats.push(row.unwrap_or(RunStats {
                name: kind.as_str().to_string(),
                last_run_at: None,
                next_run_at: None,
                run_count: 0,
                error_count: 0,
                last_error: None,
            }));
        }
        Ok(stats)
    }
}

/// Fixed-width UTC timestamp so string comparison matches time order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> GreeterError {
    move |e| GreeterError::Store(format!("{context}: {e}"))
}

fn parse_col<T, E>(row: &Row<'_>, idx: usize, parse: impl FnOnce(&str) -> std::result::Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|d| d.with_timezone(&Utc))
}

pub(crate) fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        parse_ts(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        message_type: parse_col(row, 2, |s| s.parse::<MessageType>())?,
        occurrence_date: parse_col(row, 3, |s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))?,
        idempotency_key: row.get(4)?,
        status: parse_col(row, 5, |s| s.parse::<MessageStatus>())?,
        scheduled_send_time_utc: parse_col(row, 6, parse_ts)?,
        retry_count: row.get(7)?,
        last_error: row.get(8)?,
        created_at: parse_col(row, 9, parse_ts)?,
        updated_at: parse_col(row, 10, parse_ts)?,
        sent_at: opt_ts(row, 11)?,
        failed_at: opt_ts(row, 12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap()
    }

    fn pending(user: &str, scheduled: DateTime<Utc>) -> MessageRecord {
        MessageRecord::pending(
            user,
            MessageType::Birthday,
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            scheduled,
            at(0, 0),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let db = MessageDb::open_in_memory().unwrap();
        let record = pending("u1", at(14, 0));
        assert!(db.insert_if_absent(&record).unwrap());

        let loaded = db.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded, record);
        let by_key = db.get_by_key("BIRTHDAY-u1-2025-01-15").unwrap().unwrap();
        assert_eq!(by_key.id, record.id);
    }

    #[test]
    fn test_duplicate_key_is_ignored() {
        let db = MessageDb::open_in_memory().unwrap();
        let first = pending("u1", at(14, 0));
        let second = pending("u1", at(15, 0));
        assert_ne!(first.id, second.id);

        assert!(db.insert_if_absent(&first).unwrap());
        assert!(!db.insert_if_absent(&second).unwrap());
        assert_eq!(db.count_records().unwrap(), 1);
        // The original schedule wins.
        let stored = db.get_by_key(&first.idempotency_key).unwrap().unwrap();
        assert_eq!(stored.scheduled_send_time_utc, at(14, 0));
    }

    #[test]
    fn test_conditional_update() {
        let db = MessageDb::open_in_memory().unwrap();
        let record = pending("u1", at(14, 0));
        db.insert_if_absent(&record).unwrap();

        let update = StatusUpdate::at(at(14, 1));
        assert!(db
            .update_status(&record.id, MessageStatus::Pending, MessageStatus::Queued, &update)
            .unwrap());
        // Second claimant loses the race.
        assert!(!db
            .update_status(&record.id, MessageStatus::Pending, MessageStatus::Queued, &update)
            .unwrap());

        let loaded = db.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, MessageStatus::Queued);
        assert_eq!(loaded.updated_at, at(14, 1));
    }

    #[test]
    fn test_terminal_and_invalid_transitions_rejected() {
        let db = MessageDb::open_in_memory().unwrap();
        let record = pending("u1", at(14, 0));
        db.insert_if_absent(&record).unwrap();
        let update = StatusUpdate::at(at(14, 1));

        let err = db
            .update_status(&record.id, MessageStatus::Sent, MessageStatus::Queued, &update)
            .unwrap_err();
        assert!(matches!(err, GreeterError::InvalidTransition { .. }));

        let err = db
            .update_status(&record.id, MessageStatus::Queued, MessageStatus::Pending, &update)
            .unwrap_err();
        assert!(matches!(err, GreeterError::InvalidTransition { .. }));
    }

    #[test]
    fn test_sent_and_failed_timestamps() {
        let db = MessageDb::open_in_memory().unwrap();
        let record = pending("u1", at(14, 0));
        db.insert_if_absent(&record).unwrap();
        let step = |from, to, m| {
            db.update_status(&record.id, from, to, &StatusUpdate::at(at(14, m)))
                .unwrap()
        };
        assert!(step(MessageStatus::Pending, MessageStatus::Queued, 1));
        assert!(step(MessageStatus::Queued, MessageStatus::Sending, 2));
        assert!(step(MessageStatus::Sending, MessageStatus::Sent, 3));

        let loaded = db.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded.sent_at, Some(at(14, 3)));
        assert_eq!(loaded.failed_at, None);
    }

    #[test]
    fn test_retry_count_bounds() {
        let db = MessageDb::open_in_memory().unwrap();
        let record = pending("u1", at(14, 0));
        db.insert_if_absent(&record).unwrap();
        let update = StatusUpdate::at(at(14, 1)).with_retry_count(MAX_RETRIES + 1);
        assert!(matches!(
            db.update_status(&record.id, MessageStatus::Sending, MessageStatus::Queued, &update),
            Err(GreeterError::Validation(_))
        ));

        // At the cap the write goes through to the CAS, which misses: the row is PENDING.
        let update = StatusUpdate::at(at(14, 1)).with_retry_count(MAX_RETRIES);
        assert!(!db
            .update_status(&record.id, MessageStatus::Sending, MessageStatus::Queued, &update)
            .unwrap());
    }

    #[test]
    fn test_schedule_is_immutable_and_rows_retained() {
        let db = MessageDb::open_in_memory().unwrap();
        let record = pending("u1", at(14, 0));
        db.insert_if_absent(&record).unwrap();

        let conn = db.conn().unwrap();
        assert!(conn
            .execute(
                "UPDATE message_records SET scheduled_send_time_utc = ?1 WHERE id = ?2",
                params![ts(at(15, 0)), record.id],
            )
            .is_err());
        assert!(conn
            .execute("DELETE FROM message_records WHERE id = ?1", [&record.id])
            .is_err());
    }

    #[test]
    fn test_range_queries() {
        let db = MessageDb::open_in_memory().unwrap();
        for (user, h, m) in [("a", 13, 59), ("b", 14, 0), ("c", 14, 0), ("d", 14, 1)] {
            db.insert_if_absent(&pending(user, at(h, m))).unwrap();
        }
        let due = db
            .find_scheduled_between(MessageStatus::Pending, at(14, 0), at(14, 1), 10)
            .unwrap();
        let users: Vec<_> = due.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(users.len(), 2);
        assert!(users.contains(&"b") && users.contains(&"c"));

        let overdue = db
            .find_scheduled_before(MessageStatus::Pending, at(14, 0), 10)
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].user_id, "a");

        let limited = db
            .find_scheduled_between(MessageStatus::Pending, at(0, 0), at(23, 0), 3)
            .unwrap();
        assert_eq!(limited.len(), 3);
    }

    #[test]
    fn test_find_updated_before() {
        let db = MessageDb::open_in_memory().unwrap();
        let record = pending("u1", at(14, 0));
        db.insert_if_absent(&record).unwrap();
        db.update_status(
            &record.id,
            MessageStatus::Pending,
            MessageStatus::Queued,
            &StatusUpdate::at(at(14, 0)),
        )
        .unwrap();

        let stale = db
            .find_updated_before(MessageStatus::Queued, at(14, 0) + Duration::minutes(31), 10)
            .unwrap();
        assert_eq!(stale.len(), 1);

        assert!(db.touch(&record.id, MessageStatus::Queued, at(15, 0)).unwrap());
        let stale = db
            .find_updated_before(MessageStatus::Queued, at(14, 31), 10)
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn test_counts_and_runs() {
        let db = MessageDb::open_in_memory().unwrap();
        let record = pending("u1", at(14, 0));
        db.insert_if_absent(&record).unwrap();
        db.insert_if_absent(&pending("u2", at(14, 0))).unwrap();
        db.update_status(
            &record.id,
            MessageStatus::Pending,
            MessageStatus::Queued,
            &StatusUpdate::at(at(14, 0)),
        )
        .unwrap();

        let counts = db.count_by_type().unwrap();
        let (mt, birthday) = &counts[0];
        assert_eq!(*mt, MessageType::Birthday);
        assert_eq!(birthday.pending, 1);
        assert_eq!(birthday.queued, 1);
        assert_eq!(counts[1].1, MessageCounts::default());

        db.record_run(SchedulerKind::Dispatch, at(14, 0), at(14, 1), None)
            .unwrap();
        db.record_run(SchedulerKind::Dispatch, at(14, 1), at(14, 2), Some("queue down"))
            .unwrap();
        db.record_run(SchedulerKind::Dispatch, at(14, 2), at(14, 3), None)
            .unwrap();

        let stats = db.run_stats().unwrap();
        assert_eq!(stats.len(), 3);
        let dispatch = stats.iter().find(|s| s.name == "dispatch").unwrap();
        assert_eq!(dispatch.run_count, 3);
        assert_eq!(dispatch.error_count, 1);
        assert_eq!(dispatch.last_run_at, Some(at(14, 2)));
        assert_eq!(dispatch.next_run_at, Some(at(14, 3)));
        assert_eq!(dispatch.last_error.as_deref(), Some("queue down"));
        let recovery = stats.iter().find(|s| s.name == "recovery").unwrap();
        assert_eq!(recovery.run_count, 0);
    }

    #[test]
    fn test_file_backed_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeter.db");
        let record = pending("u1", at(14, 0));
        {
            let db = MessageDb::open(&path).unwrap();
            db.insert_if_absent(&record).unwrap();
        }
        let db = MessageDb::open(&path).unwrap();
        assert_eq!(db.get(&record.id).unwrap().unwrap().user_id, "u1");
    }
}
