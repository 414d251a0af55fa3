//! Universal database facade
//!
//! One API over both engines. Every public query path waits on the
//! initialization gate first, so nothing runs against a database whose
//! schema is not ready.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::config::{DatabaseConfig, Platform};
use crate::coordinator::{InitCoordinator, InitializationState};
use crate::engine::{
    quote_identifier, BootstrapToken, EngineAdapter, NativeEngine, TransactionScope, WebEngine,
};
use crate::persistence::{AutoSaveController, Snapshot, SnapshotPersistence};
use crate::query::QueryResult;
use crate::value::{normalize, Value};
use crate::Result;

const MIGRATIONS_TABLE: &str = "schema_migrations";

/// Introspection summary; all zeros until the database is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    pub platform: Platform,
    pub table_count: u64,
    pub total_records: u64,
}

#[derive(Debug)]
pub struct UniversalDatabase {
    config: DatabaseConfig,
    coordinator: InitCoordinator,
    auto_save: Mutex<Option<AutoSaveController>>,
    /// Statements hold it shared; `reset` and `close` hold it exclusively,
    /// so the schema never disappears under a running statement.
    service: RwLock<()>,
}

impl UniversalDatabase {
    /// Picks the engine for `config.platform`.
    pub fn new(config: DatabaseConfig) -> Self {
        let engine: Arc<dyn EngineAdapter> = match config.platform {
            Platform::Native => Arc::new(NativeEngine::new(&config.database_path)),
            Platform::Web => {
                let mut engine = WebEngine::new(SnapshotPersistence::from_config(&config));
                if let Some(seed) = &config.seed_path {
                    engine = engine.with_seed(seed);
                }
                Arc::new(engine)
            }
        };
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: DatabaseConfig, engine: Arc<dyn EngineAdapter>) -> Self {
        tracing::debug!(platform = %engine.platform(), "Database created");
        Self {
            config,
            coordinator: InitCoordinator::new(engine),
            auto_save: Mutex::new(None),
            service: RwLock::new(()),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn platform(&self) -> Platform {
        self.engine().platform()
    }

    pub fn state(&self) -> InitializationState {
        self.coordinator.state()
    }

    pub fn is_ready(&self) -> bool {
        self.coordinator.is_ready()
    }

    fn engine(&self) -> &Arc<dyn EngineAdapter> {
        self.coordinator.engine()
    }

    /// Connects and bootstraps the schema once. Safe to call concurrently.
    pub async fn initialize(&self) -> Result<()> {
        self.coordinator.initialize().await?;
        self.ensure_auto_save();
        Ok(())
    }

    fn ensure_auto_save(&self) {
        if self.platform() != Platform::Web {
            return;
        }
        let Some(interval) = self.config.auto_save_interval() else {
            return;
        };

        let mut auto_save = self.auto_save.lock();
        if auto_save.as_ref().is_some_and(|c| c.is_running()) {
            return;
        }
        *auto_save = Some(AutoSaveController::start(
            Arc::clone(self.engine()),
            interval,
            self.config.save_on_shutdown,
        ));
    }

    fn stop_auto_save(&self) {
        if let Some(controller) = self.auto_save.lock().take() {
            controller.stop();
        }
    }

    /// Runs one statement, initializing first if needed.
    ///
    /// Never fails: engine and initialization errors come back as a failed
    /// [`QueryResult`]. Whether the statement reads or writes is SQLite's
    /// call on the prepared statement, so `WITH ... INSERT` and pragma
    /// assignments are writes.
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> QueryResult {
        let params = normalize(&params);
        let _service = match self.ready_service().await {
            Ok(guard) => guard,
            Err(e) => return QueryResult::failure(e),
        };

        let result: QueryResult = self.engine().run(sql, &params).await.into();
        if let Some(error) = &result.error {
            tracing::debug!(sql, error = %error, "Statement failed");
        }
        result
    }

    /// Initializes, then holds the service gate shared. A reset that slips
    /// in between leaves the database not ready, so the loop initializes
    /// again before any statement runs.
    async fn ready_service(&self) -> Result<RwLockReadGuard<'_, ()>> {
        loop {
            self.initialize().await?;
            let guard = self.service.read().await;
            if self.is_ready() {
                return Ok(guard);
            }
        }
    }

    /// Runs `f` inside one transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back and returns the original
    /// error otherwise. Unlike [`execute`](Self::execute), failures arrive
    /// as `Err`, not as a failed [`QueryResult`]; a domain service that
    /// wants the envelope can build one with [`QueryResult::failure`].
    /// While `f` runs the engine is held by the transaction, so statements
    /// must go through the [`TransactionContext`], not through
    /// [`execute`](Self::execute).
    ///
    /// ```ignore
    /// db.execute_transaction(|tx| Box::pin(async move {
    ///     tx.execute("INSERT INTO word_sets (name) VALUES (?1)", params!["A1"])
    ///         .await
    ///         .into_result()?;
    ///     Ok(())
    /// }))
    /// .await?;
    /// ```
    pub async fn execute_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut TransactionContext) -> BoxFuture<'t, Result<T>>,
    {
        let _service = self.ready_service().await?;

        let mut context = TransactionContext {
            scope: self.engine().begin().await?,
        };

        match f(&mut context).await {
            Ok(value) => {
                context.scope.commit().await?;
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Transaction callback failed, rolling back");
                if let Err(rollback_err) = context.scope.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Table and row counts of the user tables. Never initializes.
    pub async fn info(&self) -> DatabaseInfo {
        let mut info = DatabaseInfo {
            platform: self.platform(),
            table_count: 0,
            total_records: 0,
        };
        let _service = self.service.read().await;
        if !self.is_ready() {
            return info;
        }

        let tables = match self
            .engine()
            .run_read(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list tables");
                return info;
            }
        };

        for name in tables.iter().filter_map(|row| row.get_str("name")) {
            if name == MIGRATIONS_TABLE {
                continue;
            }
            info.table_count += 1;

            let sql = format!("SELECT COUNT(*) AS n FROM {}", quote_identifier(name));
            match self.engine().run_read(&sql, &[]).await {
                Ok(rows) => {
                    let count = rows.first().and_then(|row| row.get_i64("n")).unwrap_or(0);
                    info.total_records += count.max(0) as u64;
                }
                Err(e) => tracing::warn!(table = name, error = %e, "Failed to count rows"),
            }
        }

        info
    }

    /// Saves a snapshot now. No-op on engines with their own durable storage.
    pub async fn force_sync(&self) -> Result<()> {
        self.engine().flush().await
    }

    pub async fn export_snapshot(&self) -> Result<Snapshot> {
        let _service = self.ready_service().await?;
        self.engine().export_snapshot().await
    }

    /// Drops every user table and persisted snapshot. The next call
    /// bootstraps a fresh schema.
    ///
    /// Waits for running statements and transactions to finish; new ones
    /// wait for the reset and then initialize again.
    pub async fn reset(&self) -> Result<()> {
        let _service = self.service.write().await;
        self.stop_auto_save();

        let engine = self.engine();
        self.coordinator
            .reset_with(async {
                engine.connect().await?;
                engine.wipe(BootstrapToken::new()).await
            })
            .await?;
        tracing::info!(platform = %self.platform(), "Database reset");
        Ok(())
    }

    /// Final sync where applicable, then closes the engine. A later call
    /// initializes again.
    pub async fn close(&self) -> Result<()> {
        let _service = self.service.write().await;
        let auto_save = self.auto_save.lock().take();
        if let Some(controller) = auto_save {
            if let Err(e) = controller.teardown().await {
                tracing::warn!(error = %e, "Final auto-save failed");
            }
        }
        self.coordinator.reset_with(self.engine().close()).await
    }
}

/// Statement executor handed to [`UniversalDatabase::execute_transaction`].
pub struct TransactionContext {
    scope: Box<dyn TransactionScope>,
}

impl TransactionContext {
    pub async fn execute(&mut self, sql: &str, params: Vec<Value>) -> QueryResult {
        let params = normalize(&params);
        self.scope.run(sql, &params).await.into()
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext").finish_non_exhaustive()
    }
}
