//! Schema bootstrap
//!
//! Runs against the engine adapter directly, never through
//! [`UniversalDatabase::execute`](crate::UniversalDatabase::execute): the
//! public path waits for initialization, and bootstrap is part of
//! initialization.
//!
//! Vocabulary schema: dictionaries, words, examples, word sets, study
//! progress, grammar rules.

use chrono::Utc;

use crate::engine::{BootstrapToken, EngineAdapter, SchemaStatement};
use crate::value::{format_timestamp, Value};
use crate::Result;

pub const SCHEMA_VERSION: i64 = 1;

const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
)";

/// One ordered schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

pub static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial schema",
    statements: INITIAL_SCHEMA,
}];

const INITIAL_SCHEMA: &[&str] = &[
    // Dictionaries group words by language pair
    r#"
    CREATE TABLE IF NOT EXISTS dictionaries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        source_language TEXT NOT NULL,
        target_language TEXT NOT NULL,
        description TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS words (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dictionary_id INTEGER NOT NULL REFERENCES dictionaries(id) ON DELETE CASCADE,
        term TEXT NOT NULL,
        translation TEXT NOT NULL,
        part_of_speech TEXT,
        gender TEXT,
        plural TEXT,
        pronunciation TEXT,
        notes TEXT,
        frequency INTEGER,
        level TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_words_dictionary ON words(dictionary_id)",
    "CREATE INDEX IF NOT EXISTS idx_words_term ON words(term)",
    r#"
    CREATE TABLE IF NOT EXISTS word_examples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        word_id INTEGER NOT NULL REFERENCES words(id) ON DELETE CASCADE,
        sentence TEXT NOT NULL,
        translation TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_word_examples_word ON word_examples(word_id)",
    // User-curated word lists
    r#"
    CREATE TABLE IF NOT EXISTS word_sets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS word_set_items (
        set_id INTEGER NOT NULL REFERENCES word_sets(id) ON DELETE CASCADE,
        word_id INTEGER NOT NULL REFERENCES words(id) ON DELETE CASCADE,
        position INTEGER NOT NULL DEFAULT 0,
        added_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (set_id, word_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_word_set_items_word ON word_set_items(word_id)",
    // Spaced-repetition state, one row per studied word
    r#"
    CREATE TABLE IF NOT EXISTS study_progress (
        word_id INTEGER PRIMARY KEY REFERENCES words(id) ON DELETE CASCADE,
        ease_factor REAL NOT NULL DEFAULT 2.5,
        interval_days INTEGER NOT NULL DEFAULT 0,
        repetitions INTEGER NOT NULL DEFAULT 0,
        correct_count INTEGER NOT NULL DEFAULT 0,
        incorrect_count INTEGER NOT NULL DEFAULT 0,
        due_at TEXT,
        last_reviewed_at TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_study_progress_due ON study_progress(due_at)",
    r#"
    CREATE TABLE IF NOT EXISTS grammar_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        language TEXT NOT NULL,
        title TEXT NOT NULL,
        category TEXT,
        level TEXT,
        content TEXT NOT NULL,
        examples TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_grammar_rules_language ON grammar_rules(language, category)",
];

/// Applies pending migrations through the engine's bootstrap path.
#[derive(Debug, Clone, Copy)]
pub struct SchemaBootstrapper {
    migrations: &'static [Migration],
}

impl Default for SchemaBootstrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaBootstrapper {
    pub fn new() -> Self {
        Self {
            migrations: MIGRATIONS,
        }
    }

    pub(crate) fn with_migrations(migrations: &'static [Migration]) -> Self {
        Self { migrations }
    }

    /// Highest applied version, 0 for a blank database.
    pub async fn current_version(&self, engine: &dyn EngineAdapter) -> Result<i64> {
        let rows = engine
            .run_read(
                "SELECT COALESCE(MAX(version), 0) AS version FROM schema_migrations",
                &[],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get_i64("version"))
            .unwrap_or(0))
    }

    /// Runs every migration newer than the recorded version, in order.
    ///
    /// Each migration and its version row commit together. The first failing
    /// statement aborts the run. Returns the versions applied.
    pub async fn run(&self, engine: &dyn EngineAdapter) -> Result<Vec<i64>> {
        engine
            .execute_schema(
                BootstrapToken::new(),
                &[SchemaStatement::new(CREATE_MIGRATIONS_TABLE)],
            )
            .await?;

        let current = self.current_version(engine).await?;
        let mut pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|migration| migration.version > current)
            .collect();
        pending.sort_by_key(|migration| migration.version);

        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Running migration"
            );

            let mut batch: Vec<SchemaStatement> = migration
                .statements
                .iter()
                .map(|sql| SchemaStatement::new(*sql))
                .collect();
            batch.push(SchemaStatement::with_params(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                vec![
                    Value::Integer(migration.version),
                    Value::Text(format_timestamp(&Utc::now())),
                ],
            ));

            engine
                .execute_schema(BootstrapToken::new(), &batch)
                .await?;
            applied.push(migration.version);
        }

        if applied.is_empty() {
            tracing::debug!(version = current, "Schema up to date");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{NativeEngine, WebEngine};

    async fn native() -> NativeEngine {
        let engine = NativeEngine::in_memory();
        engine.connect().await.unwrap();
        engine
    }

    async fn table_names(engine: &dyn EngineAdapter) -> Vec<String> {
        engine
            .run_read(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await
            .unwrap()
            .iter()
            .filter_map(|row| row.get_str("name").map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_initial_schema() {
        let engine = native().await;
        let applied = SchemaBootstrapper::new().run(&engine).await.unwrap();
        assert_eq!(applied, vec![SCHEMA_VERSION]);

        assert_eq!(
            table_names(&engine).await,
            vec![
                "dictionaries",
                "grammar_rules",
                "schema_migrations",
                "study_progress",
                "word_examples",
                "word_set_items",
                "word_sets",
                "words",
            ]
        );
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let engine = native().await;
        let bootstrapper = SchemaBootstrapper::new();
        bootstrapper.run(&engine).await.unwrap();

        assert!(bootstrapper.run(&engine).await.unwrap().is_empty());
        assert_eq!(bootstrapper.current_version(&engine).await.unwrap(), 1);

        let rows = engine
            .run_read("SELECT COUNT(*) AS n FROM schema_migrations", &[])
            .await
            .unwrap();
        assert_eq!(rows[0].get_i64("n"), Some(1));
    }

    #[tokio::test]
    async fn test_runs_on_web_engine() {
        let engine = WebEngine::ephemeral();
        engine.connect().await.unwrap();
        SchemaBootstrapper::new().run(&engine).await.unwrap();
        assert!(table_names(&engine).await.contains(&"words".to_string()));
    }

    static BROKEN: &[Migration] = &[
        Migration {
            version: 1,
            name: "good",
            statements: &["CREATE TABLE a (id INTEGER)"],
        },
        Migration {
            version: 2,
            name: "bad",
            statements: &["CREATE TABLE b (id INTEGER)", "CREATE TABLE oops ("],
        },
    ];

    #[tokio::test]
    async fn test_failing_migration_aborts() {
        let engine = native().await;
        let bootstrapper = SchemaBootstrapper::with_migrations(BROKEN);

        assert!(bootstrapper.run(&engine).await.is_err());

        // The good step stays, the failed one leaves nothing behind
        assert_eq!(bootstrapper.current_version(&engine).await.unwrap(), 1);
        let tables = table_names(&engine).await;
        assert!(tables.contains(&"a".to_string()));
        assert!(!tables.contains(&"b".to_string()));
    }
}
