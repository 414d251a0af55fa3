//! Wordbook Core
//!
//! Composition root: owns the configuration and the single database
//! instance, and hands the database to the services that need it.

mod app;
mod config;
mod error;

pub use app::Wordbook;
pub use config::Config;
pub use error::CoreError;

// Re-export the storage layer
pub use wordbook_storage::{
    params, DatabaseConfig, DatabaseInfo, InitializationState, Platform, QueryResult, Row,
    StorageError, TransactionContext, UniversalDatabase, Value,
};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
///
/// `RUST_LOG` wins over `default_filter`. Later calls are no-ops.
pub fn init_logging(default_filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if fmt().with_env_filter(filter).with_target(true).try_init().is_err() {
        tracing::debug!("Logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug");
        init_logging("info");
        tracing::info!("still logging");
    }
}
