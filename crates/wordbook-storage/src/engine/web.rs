//! Web engine: memory-only SQLite made durable through snapshots
//!
//! The connection lives entirely in memory. On connect the engine walks its
//! load plan:
//!
//! ```text
//! persisted snapshot ─▶ Restored
//!        │ miss / unreadable
//!        ▼
//! seed image on disk ─▶ Seeded
//!        │ missing
//!        ▼
//! blank database     ─▶ Fresh
//! ```
//!
//! With no persistence configured, or when no snapshot store can be read,
//! the engine runs as `Ephemeral` and never tries to persist.
//!
//! Transactions are emulated with uniquely named savepoints. Every write
//! outside a transaction schedules a background snapshot; commits and schema
//! changes await their snapshot before returning.

use async_trait::async_trait;
use rusqlite::serialize::OwnedData;
use rusqlite::{ffi, Connection, DatabaseName};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    apply_schema, execute_write, query_rows, run_statement, BootstrapToken, ConnectionSlot,
    EngineAdapter, SchemaStatement, TransactionScope,
};
use crate::config::Platform;
use crate::error::StorageError;
use crate::persistence::{PersistReport, Snapshot, SnapshotPersistence};
use crate::query::{Row, StatementOutput, WriteOutcome};
use crate::value::Value;
use crate::Result;

/// How the in-memory database was populated on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineLoad {
    /// From a persisted snapshot
    Restored,
    /// From the pre-seeded image
    Seeded,
    /// Blank database, snapshots enabled
    Fresh,
    /// No usable persistence; nothing survives the process
    Ephemeral,
}

impl EngineLoad {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineLoad::Restored => "restored",
            EngineLoad::Seeded => "seeded",
            EngineLoad::Fresh => "fresh",
            EngineLoad::Ephemeral => "ephemeral",
        }
    }
}

impl std::fmt::Display for EngineLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub struct WebEngine {
    conn: ConnectionSlot,
    persister: Persister,
    seed_path: Option<PathBuf>,
    seed_probed: AtomicBool,
    load: parking_lot::Mutex<Option<EngineLoad>>,
    savepoints: AtomicU64,
}

impl WebEngine {
    pub fn new(persistence: Option<SnapshotPersistence>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(None)),
            persister: Persister::new(persistence),
            seed_path: None,
            seed_probed: AtomicBool::new(false),
            load: parking_lot::Mutex::new(None),
            savepoints: AtomicU64::new(0),
        }
    }

    /// Memory-only engine that never persists.
    pub fn ephemeral() -> Self {
        Self::new(None)
    }

    /// Pre-seeded database image used when no snapshot exists.
    pub fn with_seed(mut self, path: impl AsRef<Path>) -> Self {
        self.seed_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// How the database was populated, once connected.
    pub fn load(&self) -> Option<EngineLoad> {
        *self.load.lock()
    }

    pub fn persistence(&self) -> Option<&SnapshotPersistence> {
        self.persister.persistence.as_ref()
    }

    /// Whether writes are currently snapshotted.
    pub fn is_persistent(&self) -> bool {
        self.persister.is_enabled()
    }

    async fn open(&self) -> Result<(Connection, EngineLoad)> {
        let mut persistent = self.persister.persistence.is_some();

        if let Some(persistence) = &self.persister.persistence {
            match persistence.load_existing().await {
                Ok(Some(snapshot)) => match open_image(snapshot.as_bytes()) {
                    Ok(conn) => {
                        self.persister.set_enabled(true);
                        return Ok((conn, EngineLoad::Restored));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Persisted snapshot unusable, ignoring it")
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Snapshot stores unreadable, running without persistence");
                    persistent = false;
                }
            }
        }
        self.persister.set_enabled(persistent);

        if let Some(image) = self.read_seed().await {
            match open_image(&image) {
                Ok(conn) => return Ok((conn, EngineLoad::Seeded)),
                Err(e) => tracing::warn!(error = %e, "Seed database unusable, ignoring it"),
            }
        }

        let conn = Connection::open_in_memory()?;
        let load = if persistent {
            EngineLoad::Fresh
        } else {
            EngineLoad::Ephemeral
        };
        Ok((conn, load))
    }

    /// Reads the seed image. Probed at most once per engine.
    async fn read_seed(&self) -> Option<Vec<u8>> {
        let path = self.seed_path.as_ref()?;
        if self.seed_probed.swap(true, Ordering::SeqCst) {
            return None;
        }

        match tokio::fs::read(path).await {
            Ok(bytes) if !bytes.is_empty() => {
                tracing::info!(path = %path.display(), bytes = bytes.len(), "Found seed database");
                Some(bytes)
            }
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Seed database unreadable");
                None
            }
        }
    }

    fn next_savepoint(&self) -> String {
        format!("wb_tx_{}", self.savepoints.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl EngineAdapter for WebEngine {
    fn platform(&self) -> Platform {
        Platform::Web
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let (conn, load) = self.open().await?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        *slot = Some(conn);
        *self.load.lock() = Some(load);

        if load == EngineLoad::Ephemeral {
            self.persister.set_enabled(false);
        }

        tracing::info!(load = %load, persistent = self.persister.is_enabled(), "Web engine connected");
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
        let outcome = {
            let slot = self.conn.lock().await;
            let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
            execute_write(conn, sql, params)?
        };

        self.persister.spawn_persist(Arc::clone(&self.conn));
        Ok(outcome)
    }

    async fn run(&self, sql: &str, params: &[Value]) -> Result<StatementOutput> {
        let output = {
            let slot = self.conn.lock().await;
            let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
            run_statement(conn, sql, params)?
        };

        if matches!(output, StatementOutput::Write(_)) {
            self.persister.spawn_persist(Arc::clone(&self.conn));
        }
        Ok(output)
    }

    async fn execute_schema(
        &self,
        _token: BootstrapToken,
        statements: &[SchemaStatement],
    ) -> Result<()> {
        {
            let slot = self.conn.lock().await;
            let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
            let savepoint = self.next_savepoint();

            conn.execute_batch(&format!("SAVEPOINT {}", savepoint))?;
            if let Err(e) = apply_schema(conn, statements) {
                rollback_savepoint(conn, &savepoint);
                return Err(e);
            }
            conn.execute_batch(&format!("RELEASE SAVEPOINT {}", savepoint))?;
        }

        self.persister.persist_best_effort(&self.conn).await;
        Ok(())
    }

    async fn wipe(&self, _token: BootstrapToken) -> Result<()> {
        // Held throughout so an in-flight save cannot land after the clear.
        let _gate = self.persister.state.gate.lock().await;
        {
            let mut slot = self.conn.lock().await;
            if slot.is_none() {
                return Err(StorageError::NotConnected);
            }
            let conn = Connection::open_in_memory()?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            *slot = Some(conn);
        }

        if let Some(persistence) = &self.persister.persistence {
            match persistence.clear().await {
                Ok(()) => self.persister.forget_stored(),
                // Stores that could not be read at connect are not in use.
                Err(e) if !self.persister.is_enabled() => {
                    tracing::warn!(error = %e, "Could not clear unused snapshot stores")
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!("Web engine wiped");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn TransactionScope>> {
        let slot = Arc::clone(&self.conn).lock_owned().await;
        let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
        let savepoint = self.next_savepoint();
        conn.execute_batch(&format!("SAVEPOINT {}", savepoint))?;

        Ok(Box::new(SavepointTransaction {
            slot: Some(slot),
            savepoint,
            conn: Arc::clone(&self.conn),
            persister: self.persister.clone(),
            wrote: false,
        }))
    }

    async fn export_snapshot(&self) -> Result<Snapshot> {
        export(&self.conn).await
    }

    async fn flush(&self) -> Result<()> {
        if self.persister.is_enabled() {
            self.persister.persist_now(&self.conn).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.persister.persist_best_effort(&self.conn).await;

        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.take() {
            conn.close().map_err(|(_, e)| StorageError::from(e))?;
            tracing::info!("Web engine closed");
        }
        *self.load.lock() = None;
        Ok(())
    }
}

/// Savepoint scope standing in for a native transaction.
struct SavepointTransaction {
    slot: Option<OwnedMutexGuard<Option<Connection>>>,
    savepoint: String,
    conn: ConnectionSlot,
    persister: Persister,
    wrote: bool,
}

impl SavepointTransaction {
    fn conn(&self) -> Result<&Connection> {
        let slot = self.slot.as_ref().ok_or_else(|| {
            StorageError::TransactionAborted("transaction already finished".to_string())
        })?;
        slot.as_ref().ok_or(StorageError::NotConnected)
    }
}

#[async_trait]
impl TransactionScope for SavepointTransaction {
    async fn run_read(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        query_rows(self.conn()?, sql, params)
    }

    async fn run_write(&mut self, sql: &str, params: &[Value]) -> Result<WriteOutcome> {
        let outcome = execute_write(self.conn()?, sql, params)?;
        self.wrote = true;
        Ok(outcome)
    }

    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutput> {
        let output = run_statement(self.conn()?, sql, params)?;
        if matches!(output, StatementOutput::Write(_)) {
            self.wrote = true;
        }
        Ok(output)
    }

    async fn commit(&mut self) -> Result<()> {
        let release = format!("RELEASE SAVEPOINT {}", self.savepoint);
        let result = self.conn()?.execute_batch(&release);
        if let Err(e) = result {
            rollback_savepoint(self.conn()?, &self.savepoint);
            self.slot = None;
            return Err(e.into());
        }

        // The snapshot needs the connection lock back.
        self.slot = None;
        if self.wrote {
            self.persister.persist_best_effort(&self.conn).await;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        rollback_savepoint(self.conn()?, &self.savepoint);
        self.slot = None;
        Ok(())
    }
}

impl Drop for SavepointTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.slot.as_ref().and_then(|slot| slot.as_ref()) {
            tracing::warn!(savepoint = %self.savepoint, "Transaction dropped without commit, rolling back");
            rollback_savepoint(conn, &self.savepoint);
        }
    }
}

fn rollback_savepoint(conn: &Connection, savepoint: &str) {
    let sql = format!(
        "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
        savepoint
    );
    if let Err(e) = conn.execute_batch(&sql) {
        tracing::warn!(savepoint, error = %e, "Savepoint rollback failed");
    }
}

async fn export(conn: &ConnectionSlot) -> Result<Snapshot> {
    let slot = conn.lock().await;
    let conn = slot.as_ref().ok_or(StorageError::NotConnected)?;
    let data = conn.serialize(DatabaseName::Main)?;
    Ok(Snapshot::new(data.to_vec()))
}

/// Opens a database image in a fresh in-memory connection.
fn open_image(bytes: &[u8]) -> Result<Connection> {
    if bytes.len() < 100 || !bytes.starts_with(b"SQLite format 3\0") {
        return Err(StorageError::Snapshot("not a SQLite database image".to_string()));
    }

    let mut conn = Connection::open_in_memory()?;
    conn.deserialize(DatabaseName::Main, sqlite_owned_copy(bytes)?, false)?;

    // Fail here rather than on the first query.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;

    Ok(conn)
}

/// Copies `bytes` into a buffer owned by SQLite's allocator, as
/// `sqlite3_deserialize` requires.
fn sqlite_owned_copy(bytes: &[u8]) -> Result<OwnedData> {
    let len = bytes.len();
    // SAFETY: the buffer comes from `sqlite3_malloc64` with room for `len`
    // bytes, is fully initialized by the copy, and ownership passes to
    // `OwnedData`, which frees it with `sqlite3_free`.
    unsafe {
        let raw = ffi::sqlite3_malloc64(len as u64).cast::<u8>();
        let ptr = NonNull::new(raw)
            .ok_or_else(|| StorageError::Snapshot("out of memory copying snapshot".to_string()))?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), len);

        // Bytes 18/19 select the journal; a WAL image cannot open in memory.
        if len >= 20 && *ptr.as_ptr().add(18) == 2 && *ptr.as_ptr().add(19) == 2 {
            *ptr.as_ptr().add(18) = 1;
            *ptr.as_ptr().add(19) = 1;
        }

        Ok(OwnedData::from_raw_nonnull(ptr, len))
    }
}

/// Serializes snapshot writes and skips ones that are already covered.
#[derive(Debug, Clone)]
struct Persister {
    persistence: Option<SnapshotPersistence>,
    enabled: Arc<AtomicBool>,
    state: Arc<PersistState>,
}

#[derive(Debug, Default)]
struct PersistState {
    gate: Mutex<()>,
    /// Bumped on every change that should reach storage
    written: AtomicU64,
    /// Highest `written` value known to be in storage
    saved: AtomicU64,
    /// Digest of the last stored snapshot
    digest: parking_lot::Mutex<Option<String>>,
}

impl Persister {
    fn new(persistence: Option<SnapshotPersistence>) -> Self {
        let enabled = persistence.is_some();
        Self {
            persistence,
            enabled: Arc::new(AtomicBool::new(enabled)),
            state: Arc::new(PersistState::default()),
        }
    }

    fn is_enabled(&self) -> bool {
        self.persistence.is_some() && self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn forget_stored(&self) {
        *self.state.digest.lock() = None;
    }

    /// Schedules a snapshot without waiting for it.
    fn spawn_persist(&self, conn: ConnectionSlot) {
        if !self.is_enabled() {
            return;
        }
        self.state.written.fetch_add(1, Ordering::SeqCst);

        let persister = self.clone();
        tokio::spawn(async move {
            if let Err(e) = persister.persist_pending(&conn).await {
                tracing::warn!(error = %e, "Background snapshot failed");
            }
        });
    }

    async fn persist_best_effort(&self, conn: &ConnectionSlot) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = self.persist_now(conn).await {
            tracing::warn!(error = %e, "Snapshot failed");
        }
    }

    /// Snapshots the current state unless storage already holds it.
    async fn persist_now(&self, conn: &ConnectionSlot) -> Result<Option<PersistReport>> {
        self.state.written.fetch_add(1, Ordering::SeqCst);
        self.persist_pending(conn).await
    }

    /// Snapshots once per batch of changes. Callers queue on the gate in
    /// order, and each export happens after its target was read, so a later
    /// save never carries older data than an earlier one.
    async fn persist_pending(&self, conn: &ConnectionSlot) -> Result<Option<PersistReport>> {
        let Some(persistence) = &self.persistence else {
            return Ok(None);
        };

        let _gate = self.state.gate.lock().await;
        let target = self.state.written.load(Ordering::SeqCst);
        if self.state.saved.load(Ordering::SeqCst) >= target {
            return Ok(None);
        }

        let snapshot = match export(conn).await {
            Ok(snapshot) => snapshot,
            // Closed underneath us; nothing left to save.
            Err(StorageError::NotConnected) => return Ok(None),
            Err(e) => return Err(e),
        };
        let digest = snapshot.sha256_hex();
        if self.state.digest.lock().as_deref() == Some(digest.as_str()) {
            self.state.saved.fetch_max(target, Ordering::SeqCst);
            return Ok(None);
        }

        let report = persistence.save(&snapshot).await?;
        self.state.saved.fetch_max(target, Ordering::SeqCst);
        *self.state.digest.lock() = Some(digest);

        tracing::debug!(
            bytes = report.bytes,
            primary = ?report.primary,
            fallback = ?report.fallback,
            "Snapshot persisted"
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::BrokenStore;
    use crate::persistence::{KeyValueSnapshotStore, MemoryBackend};
    use crate::query::StatementKind;
    use std::time::Duration;

    async fn connected(persistence: Option<SnapshotPersistence>) -> WebEngine {
        let engine = WebEngine::new(persistence);
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

    async fn count(engine: &WebEngine) -> i64 {
        let rows = engine
            .run_read("SELECT COUNT(*) AS n FROM t", &[])
            .await
            .unwrap();
        rows[0].get_i64("n").unwrap()
    }

    /// Opens the stored snapshot, if any, and runs `sql` against it.
    async fn stored_i64(persistence: &SnapshotPersistence, sql: &str) -> Option<i64> {
        let stored = persistence.load_existing().await.unwrap()?;
        let conn = open_image(stored.as_bytes()).unwrap();
        conn.query_row(sql, [], |row| row.get(0)).ok()
    }

    async fn eventually_stored(persistence: &SnapshotPersistence, sql: &str, expected: i64) -> bool {
        for _ in 0..200 {
            if stored_i64(persistence, sql).await == Some(expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_fresh_then_restored() {
        let persistence = SnapshotPersistence::in_memory("web.db", 1 << 20);

        let engine = connected(Some(persistence.clone())).await;
        assert_eq!(engine.load(), Some(EngineLoad::Fresh));
        engine
            .run_write("INSERT INTO t (x) VALUES (?1)", &[Value::from("Haus")])
            .await
            .unwrap();
        engine.flush().await.unwrap();
        engine.close().await.unwrap();

        let reloaded = WebEngine::new(Some(persistence));
        reloaded.connect().await.unwrap();
        assert_eq!(reloaded.load(), Some(EngineLoad::Restored));
        assert_eq!(count(&reloaded).await, 1);
    }

    #[tokio::test]
    async fn test_plain_write_reaches_storage_in_background() {
        let persistence = SnapshotPersistence::in_memory("web.db", 1 << 20);
        let engine = connected(Some(persistence.clone())).await;
        assert_eq!(stored_i64(&persistence, "SELECT COUNT(*) FROM t").await, Some(0));

        engine
            .run_write("INSERT INTO t (x) VALUES (?1)", &[Value::from("Haus")])
            .await
            .unwrap();

        // No flush: only the write-triggered snapshot can get it there.
        assert!(eventually_stored(&persistence, "SELECT COUNT(*) FROM t", 1).await);
    }

    #[tokio::test]
    async fn test_cte_and_pragma_writes_are_persisted() {
        let persistence = SnapshotPersistence::in_memory("web.db", 1 << 20);
        let engine = connected(Some(persistence.clone())).await;

        let output = engine
            .run(
                "WITH v(x) AS (VALUES ('Baum')) INSERT INTO t (x) SELECT x FROM v",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(
            output,
            StatementOutput::Write(WriteOutcome {
                rows_affected: 1,
                insert_id: Some(1),
            })
        );
        assert!(eventually_stored(&persistence, "SELECT COUNT(*) FROM t", 1).await);

        let output = engine.run("PRAGMA user_version = 7", &[]).await.unwrap();
        assert_eq!(output.kind(), StatementKind::Write);
        assert!(eventually_stored(&persistence, "PRAGMA user_version", 7).await);

        let output = engine.run("SELECT x FROM t", &[]).await.unwrap();
        assert_eq!(output.kind(), StatementKind::Read);
    }

    #[tokio::test]
    async fn test_ephemeral_without_persistence() {
        let engine = connected(None).await;
        assert_eq!(engine.load(), Some(EngineLoad::Ephemeral));
        assert!(!engine.is_persistent());
    }

    #[tokio::test]
    async fn test_unreadable_stores_fall_back_to_ephemeral() {
        let persistence =
            SnapshotPersistence::new("web.db", Arc::new(BrokenStore), Arc::new(BrokenStore));
        let engine = connected(Some(persistence)).await;
        assert_eq!(engine.load(), Some(EngineLoad::Ephemeral));

        // Writes still work in memory
        engine
            .run_write("INSERT INTO t (x) VALUES ('a')", &[])
            .await
            .unwrap();
        assert_eq!(count(&engine).await, 1);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_falls_back_to_seed() {
        let dir = tempfile::tempdir().unwrap();

        // Build a seed image with one row
        let seed = connected(None).await;
        seed.run_write("INSERT INTO t (x) VALUES ('seeded')", &[])
            .await
            .unwrap();
        let image = seed.export_snapshot().await.unwrap();
        let seed_path = dir.path().join("seed.db");
        std::fs::write(&seed_path, image.as_bytes()).unwrap();

        let persistence = SnapshotPersistence::in_memory("web.db", 1 << 20);
        persistence
            .save(&Snapshot::new(vec![0xAB; 256]))
            .await
            .unwrap();

        let engine = WebEngine::new(Some(persistence)).with_seed(&seed_path);
        engine.connect().await.unwrap();
        assert_eq!(engine.load(), Some(EngineLoad::Seeded));
        assert_eq!(count(&engine).await, 1);
    }

    #[tokio::test]
    async fn test_savepoint_commit_and_rollback() {
        let persistence = SnapshotPersistence::in_memory("web.db", 1 << 20);
        let engine = connected(Some(persistence.clone())).await;

        let mut tx = engine.begin().await.unwrap();
        tx.run_write("INSERT INTO t (x) VALUES ('kept')", &[]).await.unwrap();
        tx.commit().await.unwrap();
        drop(tx);

        let mut tx = engine.begin().await.unwrap();
        tx.run_write("INSERT INTO t (x) VALUES ('discarded')", &[]).await.unwrap();
        tx.rollback().await.unwrap();
        drop(tx);

        {
            let mut tx = engine.begin().await.unwrap();
            tx.run_write("INSERT INTO t (x) VALUES ('dropped')", &[]).await.unwrap();
        }

        assert_eq!(count(&engine).await, 1);

        // The commit awaited its snapshot
        let stored = persistence.load_existing().await.unwrap().unwrap();
        let restored = open_image(stored.as_bytes()).unwrap();
        let n: i64 = restored
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn test_wipe_clears_memory_and_storage() {
        let persistence = SnapshotPersistence::new(
            "web.db",
            Arc::new(crate::persistence::MemorySnapshotStore::new()),
            Arc::new(KeyValueSnapshotStore::new(MemoryBackend::new(), 1 << 20)),
        );
        let engine = connected(Some(persistence.clone())).await;
        engine.flush().await.unwrap();
        assert!(persistence.load_existing().await.unwrap().is_some());

        engine.wipe(BootstrapToken::new()).await.unwrap();

        assert!(persistence.load_existing().await.unwrap().is_none());
        let rows = engine
            .run_read("SELECT COUNT(*) AS n FROM sqlite_master", &[])
            .await
            .unwrap();
        assert_eq!(rows[0].get_i64("n"), Some(0));
    }

    #[test]
    fn test_open_image_rejects_garbage() {
        assert!(open_image(b"definitely not sqlite").is_err());
        let mut fake = b"SQLite format 3\0".to_vec();
        fake.resize(512, 0xFF);
        assert!(open_image(&fake).is_err());
    }
}
