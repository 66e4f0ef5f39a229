//! Durable request store backed by libSQL.
//!
//! Indexed columns carry what queries and the CAS guard need (key, status,
//! token); the full request is stored as a JSON body column and is the
//! authoritative serialization. Migrations are version-tracked through a
//! `_migrations` table and applied sequentially.

use std::path::Path;

use async_trait::async_trait;
use libsql::Connection;
use tokio::sync::Mutex;

use crate::engine::request::{RequestStatus, ReviewRequest};
use crate::error::StoreError;
use crate::submission::SubmissionKey;

use super::traits::RequestStore;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS review_requests (
            sheet_id TEXT NOT NULL,
            row_number INTEGER NOT NULL,
            status TEXT NOT NULL,
            token TEXT,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (sheet_id, row_number)
        );
        CREATE INDEX IF NOT EXISTS idx_review_requests_status ON review_requests(status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_review_requests_token
            ON review_requests(token) WHERE token IS NOT NULL;
    "#,
}];

/// libSQL-backed request store.
pub struct LibSqlStore {
    conn: Mutex<Connection>,
}

impl LibSqlStore {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Query(format!("cannot create db dir: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Query(format!("cannot open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Query(format!("cannot connect: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, for tests.
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Query(format!("cannot open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Query(format!("cannot connect: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn encode(request: &ReviewRequest) -> Result<String, StoreError> {
        serde_json::to_string(request).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(body: &str) -> Result<ReviewRequest, StoreError> {
        serde_json::from_str(body).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl RequestStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            (),
        )
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

        let current = current_version(&conn).await?;

        for migration in MIGRATIONS {
            if migration.version > current {
                tracing::info!(
                    version = migration.version,
                    name = migration.name,
                    "Applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    StoreError::Migration(format!(
                        "Migration V{} ({}) failed: {e}",
                        migration.version, migration.name
                    ))
                })?;
                conn.execute(
                    "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
                    libsql::params![migration.version, migration.name],
                )
                .await
                .map_err(|e| {
                    StoreError::Migration(format!(
                        "Failed to record migration V{}: {e}",
                        migration.version
                    ))
                })?;
            }
        }

        Ok(())
    }

    async fn insert(&self, request: &ReviewRequest) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let body = Self::encode(request)?;
        let key = request.key();

        let result = conn
            .execute(
                "INSERT INTO review_requests
                     (sheet_id, row_number, status, token, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                libsql::params![
                    key.sheet_id.as_str(),
                    key.row_number as i64,
                    request.status.to_string(),
                    request.token.as_ref().map(|t| t.value.clone()),
                    body,
                    request.created_at.to_rfc3339(),
                    request.updated_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                Err(StoreError::AlreadyExists { key: key.clone() })
            }
            Err(e) => Err(StoreError::Query(format!("insert failed: {e}"))),
        }
    }

    async fn get(&self, key: &SubmissionKey) -> Result<Option<ReviewRequest>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT body FROM review_requests WHERE sheet_id = ?1 AND row_number = ?2",
                libsql::params![key.sheet_id.as_str(), key.row_number as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get failed: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("row read failed: {e}")))?
        {
            Some(row) => {
                let body: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("column read failed: {e}")))?;
                Ok(Some(Self::decode(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<ReviewRequest>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT body FROM review_requests WHERE token = ?1",
                libsql::params![token],
            )
            .await
            .map_err(|e| StoreError::Query(format!("token lookup failed: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("row read failed: {e}")))?
        {
            Some(row) => {
                let body: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("column read failed: {e}")))?;
                Ok(Some(Self::decode(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        request: &ReviewRequest,
        expected: RequestStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let body = Self::encode(request)?;
        let key = request.key();

        // CAS: the WHERE clause pins the status the caller read.
        let changed = conn
            .execute(
                "UPDATE review_requests
                 SET status = ?1, token = ?2, body = ?3, updated_at = ?4
                 WHERE sheet_id = ?5 AND row_number = ?6 AND status = ?7",
                libsql::params![
                    request.status.to_string(),
                    request.token.as_ref().map(|t| t.value.clone()),
                    body,
                    request.updated_at.to_rfc3339(),
                    key.sheet_id.as_str(),
                    key.row_number as i64,
                    expected.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update failed: {e}")))?;

        if changed == 0 {
            // Distinguish a missing row from a lost race.
            let mut rows = conn
                .query(
                    "SELECT 1 FROM review_requests WHERE sheet_id = ?1 AND row_number = ?2",
                    libsql::params![key.sheet_id.as_str(), key.row_number as i64],
                )
                .await
                .map_err(|e| StoreError::Query(format!("existence check failed: {e}")))?;

            return if rows
                .next()
                .await
                .map_err(|e| StoreError::Query(format!("row read failed: {e}")))?
                .is_some()
            {
                Err(StoreError::Conflict {
                    key: key.clone(),
                    expected: expected.to_string(),
                })
            } else {
                Err(StoreError::NotFound { key: key.clone() })
            };
        }

        Ok(())
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<ReviewRequest>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT body FROM review_requests WHERE status = ?1 ORDER BY created_at ASC",
                libsql::params![status.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list failed: {e}")))?;

        let mut requests = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("row read failed: {e}")))?
        {
            let body: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("column read failed: {e}")))?;
            requests.push(Self::decode(&body)?);
        }

        Ok(requests)
    }
}

async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?
    {
        Some(row) => row
            .get(0)
            .map_err(|e| StoreError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}
