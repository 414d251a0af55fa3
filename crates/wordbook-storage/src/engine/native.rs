//! Native engine: file-backed SQLite

use async_trait::async_trait;
use rusqlite::{Connection, DatabaseName};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    apply_schema, execute_write, query_rows, quote_identifier, run_statement, user_objects,
    BootstrapToken, ConnectionSlot, EngineAdapter, SchemaStatement, TransactionScope,
};
use crate::config::Platform;
use crate::error::StorageError;
use crate::persistence::Snapshot;
use crate::query::{Row, StatementOutput, WriteOutcome};
use crate::value::Value;
use crate::Result;

const MEMORY_PATH: &str = ":memory:";

#[derive(Debug)]
pub struct NativeEngine {
    path: PathBuf,
    conn: ConnectionSlot,
}

impl NativeEngine {
    /// Engine for the database file at `path`. `":memory:"` opens a private
    /// in-memory database.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MEMORY_PATH)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_PATH
    }

    fn open(&self) -> Result<Connection> {
        let conn = if self.is_memory() {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(&self.path)?
        };

        // Enable foreign keys
        conn.pragma_update(None, "foreign_keys", "ON")?;

        if !self.is_memory() {
            // WAL mode for better concurrent performance
            let _: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        }

        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(conn)
    }
}

#[async_trait]
impl EngineAdapter for NativeEngine {
    fn platform(&self) -> Platform {
        Platform::Native
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        *slot = Some(self.open()?);
        tracing::info!(path = %self.path.display(), "Native engine connected");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn run_read(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let slot = self.conn.lock().await;
        let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
        query_rows(conn, sql, params)
    }

    async fn run_write(&self, sql: &str, params: &[Value]) -> Result<WriteOutcome> {
        let slot = self.conn.lock().await;
        let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
        execute_write(conn, sql, params)
    }

    async fn run(&self, sql: &str, params: &[Value]) -> Result<StatementOutput> {
        let slot = self.conn.lock().await;
        let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
        run_statement(conn, sql, params)
    }

    async fn execute_schema(
        &self,
        _token: BootstrapToken,
        statements: &[SchemaStatement],
    ) -> Result<()> {
        let slot = self.conn.lock().await;
        let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;

        conn.execute_batch("BEGIN IMMEDIATE")?;
        match apply_schema(conn, statements) {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback_err, "Schema rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn wipe(&self, _token: BootstrapToken) -> Result<()> {
        let slot = self.conn.lock().await;
        let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;

        // Parent tables may be dropped before their children.
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        let result = (|| -> Result<usize> {
            let objects = user_objects(conn)?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            for (kind, name) in &objects {
                let sql = format!("DROP {} IF EXISTS {}", kind.to_uppercase(), quote_identifier(name));
                if let Err(e) = conn.execute_batch(&sql) {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(StorageError::from(e));
                }
            }
            conn.execute_batch("COMMIT")?;
            Ok(objects.len())
        })();
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let dropped = result?;
        tracing::info!(dropped, "Native engine wiped");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn TransactionScope>> {
        let slot = Arc::clone(&self.conn).lock_owned().await;
        let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;

        Ok(Box::new(NativeTransaction {
            slot,
            finished: false,
        }))
    }

    async fn export_snapshot(&self) -> Result<Snapshot> {
        let slot = self.conn.lock().await;
        let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
        let data = conn.serialize(DatabaseName::Main)?;
        Ok(Snapshot::new(data.to_vec()))
    }

    async fn close(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.take() {
            conn.close().map_err(|(_, e)| StorageError::from(e))?;
            tracing::info!(path = %self.path.display(), "Native engine closed");
        }
        Ok(())
    }
}

/// `BEGIN IMMEDIATE` / `COMMIT` scope over the exclusively held connection.
struct NativeTransaction {
    slot: OwnedMutexGuard<Option<Connection>>,
    finished: bool,
}

impl NativeTransaction {
    fn conn(&self) -> Result<&Connection> {
        if self.finished {
            return Err(StorageError::TransactionAborted(
                "transaction already finished".to_string(),
            ));
        }
        self.slot.as_ref().ok_or(StorageError::NotConnected)
    }
}

#[async_trait]
impl TransactionScope for NativeTransaction {
    async fn run_read(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        query_rows(self.conn()?, sql, params)
    }

    async fn run_write(&mut self, sql: &str, params: &[Value]) -> Result<WriteOutcome> {
        execute_write(self.conn()?, sql, params)
    }

    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutput> {
        run_statement(self.conn()?, sql, params)
    }

    async fn commit(&mut self) -> Result<()> {
        let conn = self.conn()?;
        let result = conn.execute_batch("COMMIT");
        if result.is_err() {
            // A failed COMMIT can leave the transaction open.
            let _ = conn.execute_batch("ROLLBACK");
        }
        self.finished = true;
        result.map_err(StorageError::from)
    }

    async fn rollback(&mut self) -> Result<()> {
        let conn = self.conn()?;
        let result = conn.execute_batch("ROLLBACK");
        self.finished = true;
        result.map_err(StorageError::from)
    }
}

impl Drop for NativeTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(conn) = self.slot.as_ref() {
            tracing::warn!("Transaction dropped without commit, rolling back");
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine_with_table() -> NativeEngine {
        let engine = NativeEngine::in_memory();
        engine.connect().await.unwrap();
        engine
            .execute_schema(
                BootstrapToken::new(),
                &[SchemaStatement::new(
                    "CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, x TEXT)",
                )],
            )
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_not_connected() {
        let engine = NativeEngine::in_memory();
        let err = engine.run_read("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::NotConnected));
    }

    #[tokio::test]
    async fn test_file_database_uses_wal_and_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let engine = NativeEngine::new(dir.path().join("data").join("wordbook.db"));
        engine.connect().await.unwrap();
        // Connecting twice keeps the same handle
        engine.connect().await.unwrap();

        let rows = engine.run_read("PRAGMA journal_mode", &[]).await.unwrap();
        assert_eq!(rows[0].values()[0], Value::Text("wal".to_string()));

        let rows = engine.run_read("PRAGMA foreign_keys", &[]).await.unwrap();
        assert_eq!(rows[0].values()[0], Value::Integer(1));

        engine.close().await.unwrap();
        assert!(!engine.is_connected().await);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let engine = engine_with_table().await;

        let mut tx = engine.begin().await.unwrap();
        tx.run_write("INSERT INTO t (x) VALUES ('kept')", &[]).await.unwrap();
        tx.commit().await.unwrap();
        drop(tx);

        let mut tx = engine.begin().await.unwrap();
        tx.run_write("INSERT INTO t (x) VALUES ('discarded')", &[]).await.unwrap();
        tx.rollback().await.unwrap();
        drop(tx);

        let rows = engine.run_read("SELECT x FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("x"), Some("kept"));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let engine = engine_with_table().await;

        {
            let mut tx = engine.begin().await.unwrap();
            tx.run_write("INSERT INTO t (x) VALUES ('lost')", &[]).await.unwrap();
        }

        let rows = engine.run_read("SELECT COUNT(*) AS n FROM t", &[]).await.unwrap();
        assert_eq!(rows[0].get_i64("n"), Some(0));
    }

    #[tokio::test]
    async fn test_schema_batch_is_all_or_nothing() {
        let engine = engine_with_table().await;

        let err = engine
            .execute_schema(
                BootstrapToken::new(),
                &[
                    SchemaStatement::new("CREATE TABLE partial (id INTEGER)"),
                    SchemaStatement::new("CREATE TABLE broken ("),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Sqlite(_)));

        let rows = engine
            .run_read(
                "SELECT name FROM sqlite_master WHERE name = 'partial'",
                &[],
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_wipe_drops_user_tables() {
        let engine = engine_with_table().await;
        engine
            .execute_schema(
                BootstrapToken::new(),
                &[SchemaStatement::new(
                    "CREATE TABLE child (id INTEGER, t_id INTEGER REFERENCES t(id))",
                )],
            )
            .await
            .unwrap();
        engine.run_write("INSERT INTO t (x) VALUES ('a')", &[]).await.unwrap();
        engine.run_write("INSERT INTO child (id, t_id) VALUES (1, 1)", &[]).await.unwrap();

        engine.wipe(BootstrapToken::new()).await.unwrap();

        let rows = engine
            .run_read("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table'", &[])
            .await
            .unwrap();
        assert_eq!(rows[0].get_i64("n"), Some(0));
    }

    #[tokio::test]
    async fn test_export_snapshot() {
        let engine = engine_with_table().await;
        let snapshot = engine.export_snapshot().await.unwrap();
        assert!(snapshot.as_bytes().starts_with(b"SQLite format 3\0"));
    }
}
