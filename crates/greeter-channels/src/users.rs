//! SQLite-backed user store.
//!
//! The pipeline only reads users. `upsert_user` and `soft_delete` exist for
//! imports and fixtures; the user-management API owns the data in production.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use greeter_core::error::{GreeterError, Result};
use greeter_core::traits::UserStore;
use greeter_core::{MonthDay, User};

const USER_COLUMNS: &str =
    "id, first_name, last_name, email, timezone, birthday_date, anniversary_date, deleted_at";

pub struct SqliteUserStore {
    conn: Mutex<Connection>,
}

impl SqliteUserStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn =
            Connection::open(path).map_err(|e| GreeterError::Store(format!("Users DB open: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| GreeterError::Store(format!("Users DB open: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                email TEXT NOT NULL,
                timezone TEXT NOT NULL,
                birthday_date TEXT,       -- YYYY-MM-DD
                anniversary_date TEXT,    -- YYYY-MM-DD
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_users_birthday_md ON users (substr(birthday_date, 6, 5));
            CREATE INDEX IF NOT EXISTS idx_users_anniversary_md ON users (substr(anniversary_date, 6, 5));
            ",
        )
        .map_err(|e| GreeterError::Store(format!("Users migration: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| GreeterError::Store(format!("connection lock poisoned: {e}")))
    }

    /// Insert or replace a user. Rejects unknown timezones.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        user.timezone.parse::<chrono_tz::Tz>().map_err(|e| {
            GreeterError::Validation(format!("invalid timezone '{}': {e}", user.timezone))
        })?;
        let date = |d: Option<NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string());
        self.conn()?
            .execute(
                "INSERT INTO users (id, first_name, last_name, email, timezone, birthday_date, anniversary_date, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     first_name = excluded.first_name,
                     last_name = excluded.last_name,
                     email = excluded.email,
                     timezone = excluded.timezone,
                     birthday_date = excluded.birthday_date,
                     anniversary_date = excluded.anniversary_date,
                     deleted_at = excluded.deleted_at",
                params![
                    user.id,
                    user.first_name,
                    user.last_name,
                    user.email,
                    user.timezone,
                    date(user.birthday_date),
                    date(user.anniversary_date),
                    user.deleted_at.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
                ],
            )
            .map_err(|e| GreeterError::Store(format!("Upsert user: {e}")))?;
        Ok(())
    }

    pub fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE users SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![at.to_rfc3339_opts(SecondsFormat::Millis, true), id],
            )
            .map_err(|e| GreeterError::Store(format!("Delete user: {e}")))?;
        Ok(changed == 1)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM users WHERE deleted_at IS NULL", [], |r| r.get(0))
            .map_err(|e| GreeterError::Store(format!("Count users: {e}")))?;
        Ok(n as u64)
    }
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn opt_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let deleted_at = row
        .get::<_, Option<String>>(7)?
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| conversion_err(7, e))
        })
        .transpose()?;
    Ok(User {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        timezone: row.get(4)?,
        birthday_date: opt_date(row, 5)?,
        anniversary_date: opt_date(row, 6)?,
        deleted_at,
    })
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn find_users_with_occurrence_on(&self, month_day: MonthDay) -> Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE deleted_at IS NULL
                   AND (substr(birthday_date, 6, 5) = ?1 OR substr(anniversary_date, 6, 5) = ?1)
                 ORDER BY id"
            ))
            .map_err(|e| GreeterError::Store(format!("Prepare users: {e}")))?;
        let users = stmt
            .query_map([month_day.to_string()], map_user)
            .map_err(|e| GreeterError::Store(format!("Query users: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| GreeterError::Store(format!("Read users: {e}")))?;
        Ok(users)
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [id],
                map_user,
            )
            .optional()
            .map_err(|e| GreeterError::Store(format!("Get user: {e}")))?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(id: &str, birthday: Option<(i32, u32, u32)>, anniversary: Option<(i32, u32, u32)>) -> User {
        let d = |(y, m, dd): (i32, u32, u32)| NaiveDate::from_ymd_opt(y, m, dd).unwrap();
        User {
            id: id.into(),
            first_name: "First".into(),
            last_name: id.into(),
            email: format!("{id}@example.com"),
            timezone: "America/New_York".into(),
            birthday_date: birthday.map(d),
            anniversary_date: anniversary.map(d),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_month_day_lookup() {
        let store = SqliteUserStore::open_in_memory().unwrap();
        store.upsert_user(&user("a", Some((1990, 1, 15)), None)).unwrap();
        store.upsert_user(&user("b", None, Some((2010, 1, 15)))).unwrap();
        store.upsert_user(&user("c", Some((1990, 1, 16)), None)).unwrap();

        let found = store
            .find_users_with_occurrence_on(MonthDay::new(1, 15))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_soft_deleted_users_hidden_from_lookup() {
        let store = SqliteUserStore::open_in_memory().unwrap();
        store.upsert_user(&user("a", Some((1990, 1, 15)), None)).unwrap();
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(store.soft_delete("a", at).unwrap());
        assert!(!store.soft_delete("a", at).unwrap());

        assert!(store
            .find_users_with_occurrence_on(MonthDay::new(1, 15))
            .await
            .unwrap()
            .is_empty());
        // Still readable by id, flagged as deleted.
        let loaded = store.get_user("a").await.unwrap().unwrap();
        assert_eq!(loaded.deleted_at, Some(at));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_updates_timezone() {
        let store = SqliteUserStore::open_in_memory().unwrap();
        let mut u = user("a", Some((1990, 1, 15)), None);
        store.upsert_user(&u).unwrap();
        u.timezone = "Asia/Tokyo".into();
        store.upsert_user(&u).unwrap();
        assert_eq!(store.get_user("a").await.unwrap().unwrap().timezone, "Asia/Tokyo");
        assert!(store.get_user("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let store = SqliteUserStore::open_in_memory().unwrap();
        let mut u = user("a", Some((1990, 1, 15)), None);
        u.timezone = "Moon/Base".into();
        assert!(matches!(store.upsert_user(&u), Err(GreeterError::Validation(_))));
    }

    #[tokio::test]
    async fn test_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.db");
        SqliteUserStore::open(&path)
            .unwrap()
            .upsert_user(&user("a", Some((1990, 1, 15)), None))
            .unwrap();
        let store = SqliteUserStore::open(&path).unwrap();
        assert!(store.get_user("a").await.unwrap().is_some());
    }
}
