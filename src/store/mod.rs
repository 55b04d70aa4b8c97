mod logs;
mod stats;

pub use logs::{LogFilter, LogPage, RequestLogRecord};
pub use stats::{
    DailySuccessRate, HeatmapCell, HourlySuccessRate, ModelSuccessRate, SuccessRateReport,
    HourlySuccessRateReport, TrendDataset, TrendReport, TrendUnit, UsageKind,
};

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

const SCHEMA_VERSION: i64 = 1;

/// Durable persistence for keys, principals and request logs.
///
/// A single connection shared behind a mutex gives the one-writer
/// discipline SQLite wants; every call runs on the blocking pool.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("unexpected schema version {found}, expected {expected}")]
    SchemaVersion { found: i64, expected: i64 },
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// Persisted shape of an upstream key. The pool owns the authoritative
/// in-memory state; these rows are its mirror.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyRecord {
    pub identifier: String,
    pub secret: String,
    pub state: String,
    pub failure_count: u32,
    pub cooldown_entry_count: u32,
    pub current_cooldown_seconds: u64,
    pub cooldown_until: Option<f64>,
    pub in_use_since: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PrincipalRecord {
    pub api_key: String,
    pub alias: String,
    pub active: bool,
    pub created_at: f64,
}

impl Store {
    /// Opens (or creates) the database, applies pragmas, creates the
    /// schema and verifies the version marker.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let _ = conn.busy_timeout(std::time::Duration::from_secs(5));
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await?
    }

    pub async fn load_all_keys(&self) -> Result<Vec<KeyRecord>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT identifier, secret, state, failure_count, cooldown_entry_count,
                        current_cooldown_seconds, cooldown_until, in_use_since
                 FROM keys ORDER BY rowid",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(KeyRecord {
                    identifier: row.get(0)?,
                    secret: row.get(1)?,
                    state: row.get(2)?,
                    failure_count: row.get::<_, i64>(3)?.max(0) as u32,
                    cooldown_entry_count: row.get::<_, i64>(4)?.max(0) as u32,
                    current_cooldown_seconds: row.get::<_, i64>(5)?.max(0) as u64,
                    cooldown_until: row.get(6)?,
                    in_use_since: row.get(7)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn upsert_key(&self, record: KeyRecord) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO keys (identifier, secret, state, failure_count,
                                   cooldown_entry_count, current_cooldown_seconds,
                                   cooldown_until, in_use_since)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(identifier) DO UPDATE SET
                     secret = excluded.secret,
                     state = excluded.state,
                     failure_count = excluded.failure_count,
                     cooldown_entry_count = excluded.cooldown_entry_count,
                     current_cooldown_seconds = excluded.current_cooldown_seconds,
                     cooldown_until = excluded.cooldown_until,
                     in_use_since = excluded.in_use_since",
                rusqlite::params![
                    record.identifier,
                    record.secret,
                    record.state,
                    record.failure_count as i64,
                    record.cooldown_entry_count as i64,
                    record.current_cooldown_seconds as i64,
                    record.cooldown_until,
                    record.in_use_since,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_key(&self, identifier: &str) -> Result<(), StoreError> {
        let identifier = identifier.to_string();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM keys WHERE identifier = ?1",
                rusqlite::params![identifier],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_principals(&self) -> Result<Vec<PrincipalRecord>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT api_key, alias, active, created_at
                 FROM principals ORDER BY created_at, alias",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PrincipalRecord {
                    api_key: row.get(0)?,
                    alias: row.get(1)?,
                    active: row.get::<_, i64>(2)? != 0,
                    created_at: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn upsert_principal(&self, record: PrincipalRecord) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO principals (api_key, alias, active, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(api_key) DO UPDATE SET
                     alias = excluded.alias,
                     active = excluded.active",
                rusqlite::params![
                    record.api_key,
                    record.alias,
                    record.active as i64,
                    record.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_principal(&self, api_key: &str) -> Result<(), StoreError> {
        let api_key = api_key.to_string();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM principals WHERE api_key = ?1",
                rusqlite::params![api_key],
            )?;
            Ok(())
        })
        .await
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS keys (
            identifier TEXT PRIMARY KEY NOT NULL,
            secret TEXT NOT NULL,
            state TEXT NOT NULL,
            failure_count INTEGER NOT NULL DEFAULT 0,
            cooldown_entry_count INTEGER NOT NULL DEFAULT 0,
            current_cooldown_seconds INTEGER NOT NULL DEFAULT 0,
            cooldown_until REAL,
            in_use_since REAL
        );

        CREATE TABLE IF NOT EXISTS principals (
            api_key TEXT PRIMARY KEY NOT NULL,
            alias TEXT NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            created_at REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS request_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            request_time REAL NOT NULL,
            principal_alias TEXT NOT NULL,
            key_identifier TEXT NOT NULL,
            key_brief TEXT,
            model_name TEXT NOT NULL,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            total_tokens INTEGER,
            is_success INTEGER NOT NULL,
            error_kind TEXT,
            dialect TEXT NOT NULL,
            streamed INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_request_logs_request_time
            ON request_logs(request_time);
        CREATE INDEX IF NOT EXISTS idx_request_logs_principal_alias
            ON request_logs(principal_alias);",
    )?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                rusqlite::params![SCHEMA_VERSION],
            )?;
            Ok(())
        }
        Some(found) if found == SCHEMA_VERSION => Ok(()),
        Some(found) => Err(StoreError::SchemaVersion {
            found,
            expected: SCHEMA_VERSION,
        }),
    }
}

/// Wall-clock seconds since the epoch, fractional.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("rotor.sqlite")).expect("open");
        (dir, store)
    }

    #[tokio::test]
    async fn key_rows_round_trip() {
        let (_dir, store) = test_store();
        let record = KeyRecord {
            identifier: "key_sha256_aabbccdd".to_string(),
            secret: "sk-upstream-1".to_string(),
            state: "cooling".to_string(),
            failure_count: 3,
            cooldown_entry_count: 2,
            current_cooldown_seconds: 20,
            cooldown_until: Some(now_epoch() + 20.0),
            in_use_since: None,
        };
        store.upsert_key(record.clone()).await.expect("upsert");

        let loaded = store.load_all_keys().await.expect("load");
        assert_eq!(loaded, vec![record.clone()]);

        store.delete_key(&record.identifier).await.expect("delete");
        assert!(store.load_all_keys().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn upsert_key_overwrites_state() {
        let (_dir, store) = test_store();
        let mut record = KeyRecord {
            identifier: "key_sha256_00112233".to_string(),
            secret: "sk-upstream-2".to_string(),
            state: "active".to_string(),
            failure_count: 0,
            cooldown_entry_count: 0,
            current_cooldown_seconds: 0,
            cooldown_until: None,
            in_use_since: None,
        };
        store.upsert_key(record.clone()).await.expect("insert");

        record.state = "leased".to_string();
        record.in_use_since = Some(now_epoch());
        store.upsert_key(record.clone()).await.expect("update");

        let loaded = store.load_all_keys().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, "leased");
        assert!(loaded[0].in_use_since.is_some());
    }

    #[tokio::test]
    async fn principals_round_trip() {
        let (_dir, store) = test_store();
        let record = PrincipalRecord {
            api_key: "rk-test-1".to_string(),
            alias: "alice".to_string(),
            active: true,
            created_at: now_epoch(),
        };
        store.upsert_principal(record.clone()).await.expect("upsert");

        let listed = store.list_principals().await.expect("list");
        assert_eq!(listed, vec![record.clone()]);

        store
            .upsert_principal(PrincipalRecord {
                active: false,
                ..record.clone()
            })
            .await
            .expect("deactivate");
        let listed = store.list_principals().await.expect("list");
        assert!(!listed[0].active);

        store.delete_principal("rk-test-1").await.expect("delete");
        assert!(store.list_principals().await.expect("list").is_empty());
    }

    #[test]
    fn reopen_preserves_schema_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rotor.sqlite");
        drop(Store::open(&path).expect("first open"));
        drop(Store::open(&path).expect("second open"));
    }
}
