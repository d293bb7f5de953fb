//! AgentStorage - durable SQLite storage owned by one agent identity
//!
//! Every agent identity gets its own database (file-backed, or in-memory for
//! tests) with four tables:
//!
//! - `state` - the state blob and the "was changed" flag, keyed by sentinel ids
//! - `schedules` - scheduled callbacks (one-off, delayed, cron)
//! - `mcp_servers` - third-party MCP servers the agent is registered against
//! - `kv` - framework slots such as the MCP transport kind
//!
//! The pool holds exactly one connection that is never recycled: the owning
//! actor is single-threaded, and an in-memory database lives only as long as
//! its connection.

mod sql;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::{McpServerInfo, ScheduleKind, ScheduledTask};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

pub use sql::{bind_json, row_to_json};

/// Sentinel id of the state blob row
pub const STATE_ROW_ID: &str = "cf_state_row_id";
/// Sentinel id of the "state was explicitly set" flag row
pub const STATE_WAS_CHANGED: &str = "cf_state_was_changed";

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt {table} row '{id}': {reason}")]
    Corrupt {
        table: &'static str,
        id: String,
        reason: String,
    },
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StorageError::Migration(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Filter for [`AgentStorage::list_schedules`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<ScheduleKind>,
    /// Inclusive lower bound on the next fire time
    #[serde(default)]
    pub time_start: Option<i64>,
    /// Inclusive upper bound on the next fire time
    #[serde(default)]
    pub time_end: Option<i64>,
}

type ScheduleRow = (
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<String>,
    i64,
);

const SCHEDULE_COLUMNS: &str =
    "id, callback, payload, type, time, delayInSeconds, cron, created_at";

fn schedule_from_row(row: ScheduleRow) -> Result<ScheduledTask, StorageError> {
    let (id, callback, payload, kind, time, delay_in_seconds, cron, created_at) = row;
    let kind = ScheduleKind::parse(&kind).ok_or_else(|| StorageError::Corrupt {
        table: "schedules",
        id: id.clone(),
        reason: format!("unknown type '{kind}'"),
    })?;
    let payload = serde_json::from_str(&payload).map_err(|e| StorageError::Corrupt {
        table: "schedules",
        id: id.clone(),
        reason: e.to_string(),
    })?;
    Ok(ScheduledTask {
        id,
        callback,
        payload,
        kind,
        time,
        delay_in_seconds,
        cron,
        created_at,
    })
}

#[derive(Debug, Clone)]
pub struct AgentStorage {
    pool: SqlitePool,
    in_memory: bool,
}

impl AgentStorage {
    /// Open (creating if missing) the database file at `path` and migrate it.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options, false).await
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options, true).await
    }

    async fn connect(options: SqliteConnectOptions, in_memory: bool) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations/agent").run(&pool).await?;
        Ok(Self { pool, in_memory })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// In-memory databases vanish when their pool closes.
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Persisted state, or `None` when state was never explicitly set.
    pub async fn load_state(&self) -> Result<Option<Value>, StorageError> {
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT id, state FROM state WHERE id IN (?, ?)")
                .bind(STATE_ROW_ID)
                .bind(STATE_WAS_CHANGED)
                .fetch_all(&self.pool)
                .await?;

        let was_changed = rows
            .iter()
            .any(|(id, value)| id == STATE_WAS_CHANGED && value.as_deref() == Some("true"));
        if !was_changed {
            return Ok(None);
        }

        let blob = rows
            .into_iter()
            .find(|(id, _)| id == STATE_ROW_ID)
            .and_then(|(_, value)| value);
        match blob {
            Some(text) => Ok(Some(serde_json::from_str(&text).map_err(|e| {
                StorageError::Corrupt {
                    table: "state",
                    id: STATE_ROW_ID.to_string(),
                    reason: e.to_string(),
                }
            })?)),
            None => Ok(Some(Value::Null)),
        }
    }

    /// Write the state blob and the dirty flag in one transaction.
    pub async fn save_state(&self, state: &Value) -> Result<(), StorageError> {
        let text = serde_json::to_string(state)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR REPLACE INTO state (id, state) VALUES (?, ?)")
            .bind(STATE_ROW_ID)
            .bind(&text)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR REPLACE INTO state (id, state) VALUES (?, ?)")
            .bind(STATE_WAS_CHANGED)
            .bind("true")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Schedules
    // ========================================================================

    pub async fn upsert_schedule(&self, task: &ScheduledTask) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&task.payload)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO schedules
                (id, callback, payload, type, time, delayInSeconds, cron, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.callback)
        .bind(payload)
        .bind(task.kind.as_str())
        .bind(task.time)
        .bind(task.delay_in_seconds)
        .bind(&task.cron)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduledTask>, StorageError> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(schedule_from_row).transpose()
    }

    pub async fn list_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> Result<Vec<ScheduledTask>, StorageError> {
        let kind = filter.kind.map(|k| k.as_str());
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM schedules
            WHERE (? IS NULL OR id = ?)
              AND (? IS NULL OR type = ?)
              AND (? IS NULL OR time >= ?)
              AND (? IS NULL OR time <= ?)
            ORDER BY time ASC, id ASC
            "#
        ))
        .bind(&filter.id)
        .bind(&filter.id)
        .bind(kind)
        .bind(kind)
        .bind(filter.time_start)
        .bind(filter.time_start)
        .bind(filter.time_end)
        .bind(filter.time_end)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(schedule_from_row).collect()
    }

    /// Rows whose fire time is at or before `now`.
    pub async fn due_schedules(&self, now: i64) -> Result<Vec<ScheduledTask>, StorageError> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE time <= ? ORDER BY time ASC, id ASC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(schedule_from_row).collect()
    }

    pub async fn update_schedule_time(&self, id: &str, time: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE schedules SET time = ? WHERE id = ?")
            .bind(time)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Earliest pending fire time across all rows.
    pub async fn next_schedule_time(&self) -> Result<Option<i64>, StorageError> {
        let (min,): (Option<i64>,) = sqlx::query_as("SELECT MIN(time) FROM schedules")
            .fetch_one(&self.pool)
            .await?;
        Ok(min)
    }

    // ========================================================================
    // Key/value slots
    // ========================================================================

    pub async fn kv_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((text,)) => Ok(Some(serde_json::from_str(&text).map_err(|e| {
                StorageError::Corrupt {
                    table: "kv",
                    id: key.to_string(),
                    reason: e.to_string(),
                }
            })?)),
            None => Ok(None),
        }
    }

    pub async fn kv_put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let text = serde_json::to_string(value)?;
        sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn kv_delete(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // MCP client servers
    // ========================================================================

    pub async fn upsert_mcp_server(&self, server: &McpServerInfo) -> Result<(), StorageError> {
        let options = server
            .server_options
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO mcp_servers
                (id, name, server_url, callback_url, client_id, auth_url, server_options)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&server.id)
        .bind(&server.name)
        .bind(&server.server_url)
        .bind(&server.callback_url)
        .bind(&server.client_id)
        .bind(&server.auth_url)
        .bind(options)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_mcp_servers(&self) -> Result<Vec<McpServerInfo>, StorageError> {
        #[allow(clippy::type_complexity)]
        let rows: Vec<(
            String,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
        )> = sqlx::query_as(
            r#"
            SELECT id, name, server_url, callback_url, client_id, auth_url, server_options
            FROM mcp_servers ORDER BY name ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, name, server_url, callback_url, client_id, auth_url, options)| {
                    let server_options = options
                        .map(|text| serde_json::from_str(&text))
                        .transpose()
                        .map_err(|e| StorageError::Corrupt {
                            table: "mcp_servers",
                            id: id.clone(),
                            reason: e.to_string(),
                        })?;
                    Ok(McpServerInfo {
                        id,
                        name,
                        server_url,
                        callback_url,
                        client_id,
                        auth_url,
                        server_options,
                    })
                },
            )
            .collect()
    }

    pub async fn remove_mcp_server(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM mcp_servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Raw SQL
    // ========================================================================

    /// Run a parameterised query and return each row as a JSON object.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, StorageError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_json(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_json).collect()
    }

    /// Run a parameterised statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, StorageError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_json(query, param);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }
}
