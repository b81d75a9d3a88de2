//! `SQLite`-backed implementation of [`MessageStore`].
//!
//! Uses a single `Mutex<Connection>`; every call runs on the blocking pool.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use courier_plugin::Payload;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use super::error::{Result, StoreError};
use super::MessageStore;
use crate::message::{self, Message, Status};

/// Idempotent DDL for the message table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_id TEXT UNIQUE NOT NULL,
    status TEXT NOT NULL,
    procedure TEXT NOT NULL,
    previous_step TEXT,
    next_step TEXT,
    payload TEXT NOT NULL DEFAULT '{}',
    error TEXT,
    reception_time TEXT NOT NULL,
    last_changed_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_status_reception ON messages (status, reception_time);
";

const COLUMNS: &str = "id, correlation_id, status, procedure, previous_step, next_step, \
                       payload, error, reception_time, last_changed_time";

/// `SQLite`-backed message storage.
///
/// Create with [`SqliteMessageStore::open`] for file-backed persistence
/// or [`SqliteMessageStore::in_memory`] for tests.
#[derive(Clone)]
pub struct SqliteMessageStore {
    conn: Arc<Mutex<Connection>>,
}

/// RFC 3339 with microseconds and `Z`, so text order equals time order.
fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|at| at.with_timezone(&Utc))
}

fn parse_column<T, E>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> std::result::Result<T, E>,
) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: Some(row.get(0)?),
        correlation_id: row.get(1)?,
        status: parse_column(row, 2, Status::from_str)?,
        procedure: row.get(3)?,
        previous_step: row.get(4)?,
        next_step: row.get(5)?,
        payload: parse_column(row, 6, |raw| serde_json::from_str::<Payload>(raw))?,
        error: row.get(7)?,
        reception_time: parse_column(row, 8, parse_time)?,
        last_changed_time: parse_column(row, 9, parse_time)?,
    })
}

impl SqliteMessageStore {
    /// Open or create a message database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory can't be created,
    /// or [`StoreError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        debug!(database = %path.display(), "message store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
        conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = Self::lock_conn(&conn)?;
            f(&mut guard)
        })
        .await?
    }

    #[cfg(test)]
    fn raw_times(&self, correlation_id: &str) -> Result<(String, String)> {
        let conn = Self::lock_conn(&self.conn)?;
        Ok(conn.query_row(
            "SELECT reception_time, last_changed_time FROM messages WHERE correlation_id = ?1",
            [correlation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }
}

fn insert(conn: &Connection, message: &mut Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (correlation_id, status, procedure, previous_step, next_step, \
         payload, error, reception_time, last_changed_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.correlation_id,
            message.status.as_ref(),
            message.procedure,
            message.previous_step,
            message.next_step,
            serde_json::to_string(&message.payload)?,
            message.error,
            format_time(&message.reception_time),
            format_time(&message.last_changed_time),
        ],
    )?;
    message.id = Some(conn.last_insert_rowid());
    Ok(())
}

/// `correlation_id`, `procedure` and `reception_time` are immutable.
fn update(conn: &Connection, id: i64, message: &Message) -> Result<()> {
    let changed = conn.execute(
        "UPDATE messages SET status = ?2, previous_step = ?3, next_step = ?4, payload = ?5, \
         error = ?6, last_changed_time = ?7 WHERE id = ?1",
        params![
            id,
            message.status.as_ref(),
            message.previous_step,
            message.next_step,
            serde_json::to_string(&message.payload)?,
            message.error,
            format_time(&message.last_changed_time),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(message.correlation_id.clone()));
    }
    Ok(())
}

fn select_by_correlation_id(conn: &Connection, correlation_id: &str) -> Result<Option<Message>> {
    let sql = format!("SELECT {COLUMNS} FROM messages WHERE correlation_id = ?1");
    Ok(conn.query_row(&sql, [correlation_id], read_message).optional()?)
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn save(&self, message: Message) -> Result<Message> {
        self.with_conn(move |conn| {
            let mut message = message;
            match message.id {
                None => insert(conn, &mut message)?,
                Some(id) => update(conn, id, &message)?,
            }
            Ok(message)
        })
        .await
    }

    async fn find_top_n_by_status_order_by_reception_time_asc(
        &self,
        status: Status,
        n: usize,
    ) -> Result<Vec<Message>> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM messages WHERE status = ?1 \
                 ORDER BY reception_time ASC, id ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![status.as_ref(), limit], read_message)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<Message>> {
        let correlation_id = correlation_id.to_string();
        self.with_conn(move |conn| select_by_correlation_id(conn, &correlation_id))
            .await
    }

    async fn requeue(&self, correlation_id: &str) -> Result<bool> {
        let correlation_id = correlation_id.to_string();
        self.with_conn(move |conn| {
            let mut message = select_by_correlation_id(conn, &correlation_id)?
                .ok_or_else(|| StoreError::NotFound(correlation_id.clone()))?;
            if message.status != Status::InProcess {
                return Ok(false);
            }
            message.requeue();
            let id = message.id.ok_or_else(|| StoreError::NotFound(correlation_id.clone()))?;
            update(conn, id, &message)?;
            Ok(true)
        })
        .await
    }

    async fn requeue_in_process(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT correlation_id FROM messages WHERE status = ?1 ORDER BY reception_time ASC",
                )?;
                let rows = stmt.query_map([Status::InProcess.as_ref()], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.execute(
                "UPDATE messages SET status = ?1, last_changed_time = MAX(last_changed_time, ?2) \
                 WHERE status = ?3",
                params![
                    Status::WaitingForProcessing.as_ref(),
                    format_time(&message::now()),
                    Status::InProcess.as_ref(),
                ],
            )?;
            tx.commit()?;
            Ok(ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn message(procedure: &str) -> Message {
        let mut payload = Payload::new();
        payload.insert("body".into(), json!("hello"));
        Message::new(procedure, payload)
    }

    #[tokio::test]
    async fn insert_assigns_id_and_reads_back() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let saved = store.save(message("p")).await.unwrap();
        assert!(saved.id.is_some());

        let found = store.find_by_correlation_id(&saved.correlation_id).await.unwrap();
        assert_eq!(found, Some(saved));
        assert_eq!(store.find_by_correlation_id("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_keeps_identity_columns() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let mut saved = store.save(message("p")).await.unwrap();
        let reception = saved.reception_time;

        saved.claim();
        saved.previous_step = Some("step-1".into());
        saved.payload.insert("n".into(), json!(1));
        saved.procedure = "renamed".into();
        saved.reception_time = reception + Duration::days(1);
        store.save(saved.clone()).await.unwrap();

        let found = store.find_by_correlation_id(&saved.correlation_id).await.unwrap().unwrap();
        assert_eq!(found.status, Status::InProcess);
        assert_eq!(found.previous_step.as_deref(), Some("step-1"));
        assert_eq!(found.payload["n"], json!(1));
        assert_eq!(found.procedure, "p");
        assert_eq!(found.reception_time, reception);
    }

    #[tokio::test]
    async fn updating_unknown_id_is_not_found() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let mut m = message("p");
        m.id = Some(42);
        assert!(matches!(store.save(m).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_correlation_id_is_rejected() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let m = message("p");
        store.save(m.clone()).await.unwrap();
        assert!(matches!(store.save(m).await, Err(StoreError::Sqlite(_))));
    }

    #[tokio::test]
    async fn top_n_filters_by_status_and_orders_by_reception() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let base = message::now();
        let mut expected = Vec::new();
        for offset in [3, 1, 4, 2] {
            let mut m = message("p");
            m.reception_time = base + Duration::seconds(offset);
            m.last_changed_time = m.reception_time;
            let saved = store.save(m).await.unwrap();
            expected.push((offset, saved.correlation_id));
        }
        let mut finished = message("p");
        finished.reception_time = base;
        finished.finish();
        store.save(finished).await.unwrap();

        expected.sort();
        let top = store
            .find_top_n_by_status_order_by_reception_time_asc(Status::WaitingForProcessing, 3)
            .await
            .unwrap();
        let ids: Vec<_> = top.iter().map(|m| m.correlation_id.clone()).collect();
        let want: Vec<_> = expected.iter().take(3).map(|(_, id)| id.clone()).collect();
        assert_eq!(ids, want);
    }

    #[tokio::test]
    async fn timestamps_are_stored_with_micros_and_zulu() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let saved = store.save(message("p")).await.unwrap();
        let (reception, changed) = store.raw_times(&saved.correlation_id).unwrap();
        for raw in [reception, changed] {
            assert!(raw.ends_with('Z'), "{raw}");
            let fraction = raw.rsplit('.').next().unwrap();
            assert_eq!(fraction.len(), "123456Z".len(), "{raw}");
        }
    }

    #[tokio::test]
    async fn requeue_only_touches_in_process_messages() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let mut stuck = message("p");
        stuck.claim();
        let stuck = store.save(stuck).await.unwrap();
        let mut done = message("p");
        done.finish();
        let done = store.save(done).await.unwrap();

        assert!(!store.requeue(&done.correlation_id).await.unwrap());
        assert!(store.requeue(&stuck.correlation_id).await.unwrap());
        assert!(matches!(store.requeue("nope").await, Err(StoreError::NotFound(_))));

        let found = store.find_by_correlation_id(&stuck.correlation_id).await.unwrap().unwrap();
        assert_eq!(found.status, Status::WaitingForProcessing);
        assert!(found.last_changed_time >= stuck.last_changed_time);
    }

    #[tokio::test]
    async fn requeue_in_process_resets_all_stuck_messages() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut m = message("p");
            m.claim();
            ids.push(store.save(m).await.unwrap().correlation_id);
        }
        store.save(message("p")).await.unwrap();

        let mut requeued = store.requeue_in_process().await.unwrap();
        requeued.sort();
        ids.sort();
        assert_eq!(requeued, ids);

        let waiting = store
            .find_top_n_by_status_order_by_reception_time_asc(Status::WaitingForProcessing, 10)
            .await
            .unwrap();
        assert_eq!(waiting.len(), 4);
        assert!(store.requeue_in_process().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("courier.db");

        let saved = {
            let store = SqliteMessageStore::open(&path).unwrap();
            store.save(message("p")).await.unwrap()
        };

        let store = SqliteMessageStore::open(&path).unwrap();
        let found = store.find_by_correlation_id(&saved.correlation_id).await.unwrap();
        assert_eq!(found, Some(saved));
    }
}
