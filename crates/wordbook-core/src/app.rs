//! Application service container
//!
//! The one owner of the database. Collaborators get a clone of the
//! `Arc<UniversalDatabase>` instead of reaching for a global.

use std::future::Future;
use std::sync::Arc;

use wordbook_storage::{DatabaseInfo, Platform, UniversalDatabase};

use crate::config::Config;
use crate::error::CoreError;
use crate::Result;

pub struct Wordbook {
    config: Config,
    db: Arc<UniversalDatabase>,
}

impl Wordbook {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        // Ensure data directory exists
        if config.database.platform == Platform::Native {
            if let Some(parent) = config.database.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let db = Arc::new(UniversalDatabase::new(config.database.clone()));
        Ok(Self { config, db })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connects the database and bootstraps its schema.
    pub async fn initialize(&self) -> Result<()> {
        self.db.initialize().await?;
        tracing::info!(
            platform = %self.db.platform(),
            data_dir = %self.config.data_dir.display(),
            "Wordbook initialized"
        );
        Ok(())
    }

    /// Shared handle for services issuing queries.
    pub fn database(&self) -> &Arc<UniversalDatabase> {
        &self.db
    }

    /// The database, only once it is ready. Unlike `database()`, never
    /// leads to lazy initialization.
    pub fn ready_database(&self) -> Result<&Arc<UniversalDatabase>> {
        if self.db.is_ready() {
            Ok(&self.db)
        } else {
            Err(CoreError::NotInitialized)
        }
    }

    pub async fn info(&self) -> DatabaseInfo {
        self.db.info().await
    }

    /// Final snapshot where applicable, then closes the database.
    pub async fn shutdown(&self) -> Result<()> {
        self.db.close().await?;
        tracing::info!("Wordbook shut down");
        Ok(())
    }

    /// Waits for `signal`, then shuts down. What happens to the process
    /// afterwards is up to the caller.
    pub async fn shutdown_on<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        tracing::info!("Shutdown requested");
        self.shutdown().await
    }

    /// [`shutdown_on`](Self::shutdown_on) Ctrl-C.
    ///
    /// Installs the process-wide Ctrl-C handler, which stays in place for
    /// the life of the process. Only a binary that owns process shutdown
    /// should call this.
    pub async fn shutdown_on_ctrl_c(&self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Ctrl-C received");
        self.shutdown().await
    }
}

impl std::fmt::Debug for Wordbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wordbook")
            .field("data_dir", &self.config.data_dir)
            .field("platform", &self.db.platform())
            .field("state", &self.db.state())
            .finish()
    }
}
