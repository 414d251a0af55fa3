//! Wordbook Storage Layer
//!
//! One relational API over two SQLite engines: a file-backed native engine,
//! and a memory-only web engine kept durable through binary snapshots.
//! The database is schema-ready exactly once, however many callers race to
//! initialize it.

mod config;
pub mod coordinator;
mod database;
pub mod engine;
mod error;
pub mod migrations;
pub mod persistence;
mod query;
mod value;

pub use config::{DatabaseConfig, Platform, DEFAULT_AUTO_SAVE_INTERVAL_MS, DEFAULT_MAX_BACKUP_BYTES};
pub use coordinator::{InitCoordinator, InitializationState};
pub use database::{DatabaseInfo, TransactionContext, UniversalDatabase};
pub use engine::{EngineAdapter, EngineLoad, NativeEngine, TransactionScope, WebEngine};
pub use error::{InitFailure, StorageError};
pub use migrations::{SchemaBootstrapper, SCHEMA_VERSION};
pub use persistence::{AutoSaveController, PersistReport, Snapshot, SnapshotPersistence, SnapshotStore};
pub use query::{QueryResult, Row, StatementKind, WriteOutcome};
pub use value::{normalize, Value};

pub type Result<T> = std::result::Result<T, StorageError>;
