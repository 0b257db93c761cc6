//! SQLite implementation of `ExecutionStore`.
//!
//! One writable connection per store. Transactions are driven explicitly by
//! the unit-of-work coordinator via raw `BEGIN IMMEDIATE` / `COMMIT` /
//! `ROLLBACK`; the `in_tx` flag mirrors the connection's transaction state.

use std::str::FromStr;
use std::time::Duration;

use riverrun_core::store::ExecutionStore;
use riverrun_types::error::StorageError;
use riverrun_types::execution::{
    EventSubscriptionRecord, ExecutionRecord, ExecutionState, UserTaskRecord,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{ConnectOptions, Row, SqliteConnection};
use uuid::Uuid;

/// SQLite-backed execution store.
pub struct SqliteExecutionStore {
    conn: SqliteConnection,
    in_tx: bool,
}

impl SqliteExecutionStore {
    /// Open (creating if missing) the database at `database_url`, run
    /// migrations, and return a store ready for use.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(map_sqlx_error)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let mut conn = options.connect().await.map_err(map_sqlx_error)?;

        sqlx::migrate!("../../migrations")
            .run(&mut conn)
            .await
            .map_err(|e| StorageError::Query(format!("migration failed: {e}")))?;

        tracing::debug!(database_url, "opened execution store");
        Ok(Self { conn, in_tx: false })
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    parent_id: Option<String>,
    process_id: String,
    definition_id: String,
    state: i64,
    active_at: f64,
    node: Option<String>,
    transition: Option<String>,
    business_key: Option<String>,
    variables: Vec<u8>,
}

impl ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            parent_id: row.try_get("parent_id")?,
            process_id: row.try_get("process_id")?,
            definition_id: row.try_get("definition_id")?,
            state: row.try_get("state")?,
            active_at: row.try_get("active_at")?,
            node: row.try_get("node")?,
            transition: row.try_get("transition")?,
            business_key: row.try_get("business_key")?,
            variables: row.try_get("variables")?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord, StorageError> {
        Ok(ExecutionRecord {
            id: parse_uuid(&self.id)?,
            parent_id: self.parent_id.as_deref().map(parse_uuid).transpose()?,
            process_id: parse_uuid(&self.process_id)?,
            definition_id: parse_uuid(&self.definition_id)?,
            state: ExecutionState::new(self.state as u32),
            active_at: self.active_at,
            node: self.node,
            transition: self.transition,
            business_key: self.business_key,
            variables: self.variables,
        })
    }
}

struct UserTaskRow {
    id: String,
    execution_id: String,
    name: String,
    documentation: Option<String>,
    activity: String,
    created_at: i64,
}

impl UserTaskRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            name: row.try_get("name")?,
            documentation: row.try_get("documentation")?,
            activity: row.try_get("activity")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_record(self) -> Result<UserTaskRecord, StorageError> {
        Ok(UserTaskRecord {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            name: self.name,
            documentation: self.documentation,
            activity: self.activity,
            created_at: self.created_at,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::Query(format!("invalid uuid: {e}")))
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(db) => {
            if db.is_foreign_key_violation() || db.is_unique_violation() {
                StorageError::Conflict(db.to_string())
            } else {
                StorageError::Query(db.to_string())
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StorageError::Connection
        }
        other => StorageError::Query(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// ExecutionStore
// ---------------------------------------------------------------------------

impl ExecutionStore for SqliteExecutionStore {
    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    async fn begin(&mut self) -> Result<(), StorageError> {
        if self.in_tx {
            return Err(StorageError::Query("transaction already open".into()));
        }
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut self.conn)
            .await
            .map_err(map_sqlx_error)?;
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        if !self.in_tx {
            return Err(StorageError::Query("no open transaction".into()));
        }
        // A failed COMMIT leaves the transaction open on the connection, so
        // the flag only clears on success.
        sqlx::query("COMMIT")
            .execute(&mut self.conn)
            .await
            .map_err(map_sqlx_error)?;
        self.in_tx = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        if !self.in_tx {
            return Err(StorageError::Query("no open transaction".into()));
        }
        let result = sqlx::query("ROLLBACK").execute(&mut self.conn).await;
        self.in_tx = false;
        result.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn insert_execution(&mut self, record: &ExecutionRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO execution (id, parent_id, process_id, definition_id, state, active_at, node, transition, business_key, variables)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.parent_id.map(|p| p.to_string()))
        .bind(record.process_id.to_string())
        .bind(record.definition_id.to_string())
        .bind(record.state.bits() as i64)
        .bind(record.active_at)
        .bind(&record.node)
        .bind(&record.transition)
        .bind(&record.business_key)
        .bind(&record.variables)
        .execute(&mut self.conn)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn update_execution(&mut self, record: &ExecutionRecord) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE execution
             SET parent_id = ?, process_id = ?, definition_id = ?, state = ?,
                 active_at = ?, node = ?, transition = ?, business_key = ?, variables = ?
             WHERE id = ?",
        )
        .bind(record.parent_id.map(|p| p.to_string()))
        .bind(record.process_id.to_string())
        .bind(record.definition_id.to_string())
        .bind(record.state.bits() as i64)
        .bind(record.active_at)
        .bind(&record.node)
        .bind(&record.transition)
        .bind(&record.business_key)
        .bind(&record.variables)
        .bind(record.id.to_string())
        .execute(&mut self.conn)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn delete_execution(&mut self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM execution WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut self.conn)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn load_process_executions(
        &mut self,
        id: Uuid,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, parent_id, process_id, definition_id, state, active_at, node, transition, business_key, variables
             FROM execution
             WHERE process_id = (SELECT process_id FROM execution WHERE id = ?)
             ORDER BY id",
        )
        .bind(id.to_string())
        .fetch_all(&mut self.conn)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                ExecutionRow::from_row(row)
                    .map_err(map_sqlx_error)
                    .and_then(ExecutionRow::into_record)
            })
            .collect()
    }

    async fn insert_subscription(
        &mut self,
        record: &EventSubscriptionRecord,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO event_subscription (id, execution_id, process_id, flags, name, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.execution_id.to_string())
        .bind(record.process_id.to_string())
        .bind(record.flags as i64)
        .bind(&record.name)
        .bind(record.created_at)
        .execute(&mut self.conn)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn insert_user_task(&mut self, record: &UserTaskRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO user_task (id, execution_id, name, documentation, activity, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.execution_id.to_string())
        .bind(&record.name)
        .bind(&record.documentation)
        .bind(&record.activity)
        .bind(record.created_at)
        .execute(&mut self.conn)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn find_user_task(&mut self, id: Uuid) -> Result<Option<UserTaskRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT id, execution_id, name, documentation, activity, created_at
             FROM user_task WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&mut self.conn)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref()
            .map(|r| {
                UserTaskRow::from_row(r)
                    .map_err(map_sqlx_error)
                    .and_then(UserTaskRow::into_record)
            })
            .transpose()
    }
}

impl Drop for SqliteExecutionStore {
    fn drop(&mut self) {
        if self.in_tx {
            tracing::warn!("execution store dropped with an open transaction");
        }
    }
}
