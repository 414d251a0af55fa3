//! Storage engine adapters
//!
//! Both engines are SQLite. [`NativeEngine`] owns a file-backed connection
//! with real transactions; [`WebEngine`] owns a memory-only connection,
//! emulates transactions with savepoints and snapshots itself into
//! [`SnapshotPersistence`](crate::persistence::SnapshotPersistence).
//!
//! Adapters report engine errors as `Err` values and never panic. The facade
//! turns those into failed [`QueryResult`](crate::QueryResult)s.

pub mod native;
pub mod web;

use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection, Statement};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::config::Platform;
use crate::persistence::Snapshot;
use crate::query::{reports_insert_id, Row, StatementKind, StatementOutput, WriteOutcome};
use crate::value::Value;
use crate::Result;

pub use native::NativeEngine;
pub use web::{EngineLoad, WebEngine};

/// The open connection, `None` before `connect` and after `close`.
pub(crate) type ConnectionSlot = Arc<tokio::sync::Mutex<Option<Connection>>>;

/// Capability for the schema bootstrap path.
///
/// Only this crate can construct a token, so only the schema bootstrapper
/// can reach [`EngineAdapter::execute_schema`]. Setup code never goes through
/// the initialization gate it is itself satisfying.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapToken {
    _private: (),
}

impl BootstrapToken {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// One statement of a schema batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaStatement {
    pub sql: Cow<'static, str>,
    pub params: Vec<Value>,
}

impl SchemaStatement {
    pub fn new(sql: impl Into<Cow<'static, str>>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<Cow<'static, str>>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Contract shared by every engine.
#[async_trait]
pub trait EngineAdapter: Send + Sync + fmt::Debug {
    fn platform(&self) -> Platform;

    /// Opens the engine handle. A second call is a no-op.
    async fn connect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    async fn run_read(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    async fn run_write(&self, sql: &str, params: &[Value]) -> Result<WriteOutcome>;

    /// Runs a statement of either kind. SQLite decides from the prepared
    /// statement; writes are accounted exactly as through `run_write`.
    async fn run(&self, sql: &str, params: &[Value]) -> Result<StatementOutput>;

    /// Runs `statements` in order inside one engine transaction. The first
    /// failure rolls the batch back.
    async fn execute_schema(
        &self,
        token: BootstrapToken,
        statements: &[SchemaStatement],
    ) -> Result<()>;

    /// Drops every user object so the next bootstrap starts from scratch.
    async fn wipe(&self, token: BootstrapToken) -> Result<()>;

    /// Opens a transaction scope holding the engine exclusively until it is
    /// committed, rolled back or dropped.
    async fn begin(&self) -> Result<Box<dyn TransactionScope>>;

    async fn export_snapshot(&self) -> Result<Snapshot>;

    /// Pushes pending state to durable storage, where the engine has any.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Destroys the engine handle.
    async fn close(&self) -> Result<()>;
}

/// Statement executor bound to an open transaction.
///
/// Dropping a scope that was neither committed nor rolled back rolls it back.
#[async_trait]
pub trait TransactionScope: Send {
    async fn run_read(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    async fn run_write(&mut self, sql: &str, params: &[Value]) -> Result<WriteOutcome>;

    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutput>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

pub(crate) fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    collect_rows(&mut stmt, params)
}

pub(crate) fn execute_write(conn: &Connection, sql: &str, params: &[Value]) -> Result<WriteOutcome> {
    let mut stmt = conn.prepare(sql)?;
    apply_write(conn, &mut stmt, sql, params)
}

/// Prepares `sql` once and reads or writes as SQLite classifies it.
pub(crate) fn run_statement(conn: &Connection, sql: &str, params: &[Value]) -> Result<StatementOutput> {
    let mut stmt = conn.prepare(sql)?;
    match StatementKind::of(&stmt) {
        StatementKind::Read => Ok(StatementOutput::Rows(collect_rows(&mut stmt, params)?)),
        StatementKind::Write => Ok(StatementOutput::Write(apply_write(
            conn, &mut stmt, sql, params,
        )?)),
    }
}

fn collect_rows(stmt: &mut Statement<'_>, params: &[Value]) -> Result<Vec<Row>> {
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(Value::from(row.get_ref(idx)?));
        }
        out.push(Row::new(columns.clone(), values));
    }

    Ok(out)
}

fn apply_write(
    conn: &Connection,
    stmt: &mut Statement<'_>,
    sql: &str,
    params: &[Value],
) -> Result<WriteOutcome> {
    let changed = if stmt.column_count() > 0 {
        // `INSERT ... RETURNING` and friends: drain the rows, report the changes.
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while rows.next()?.is_some() {}
        drop(rows);
        conn.changes() as u64
    } else {
        stmt.execute(params_from_iter(params.iter()))? as u64
    };

    let insert_id = (reports_insert_id(sql) && changed > 0).then(|| conn.last_insert_rowid());

    Ok(WriteOutcome {
        rows_affected: changed,
        insert_id,
    })
}

pub(crate) fn apply_schema(conn: &Connection, statements: &[SchemaStatement]) -> Result<()> {
    for statement in statements {
        if statement.params.is_empty() {
            conn.execute_batch(&statement.sql)?;
        } else {
            conn.execute(&statement.sql, params_from_iter(statement.params.iter()))?;
        }
    }
    Ok(())
}

/// Names of user tables and views, excluding SQLite internals.
pub(crate) fn user_objects(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT type, name FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY type DESC, name",
    )?;
    let objects = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(objects)
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, x TEXT)")
            .unwrap();
        conn
    }

    #[test]
    fn test_write_then_read() {
        let conn = conn();
        let outcome = execute_write(
            &conn,
            "INSERT INTO t (x) VALUES (?1)",
            &[Value::Text("a".to_string())],
        )
        .unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(outcome.insert_id, Some(1));

        let rows = query_rows(&conn, "SELECT id, x FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("x"), Some("a"));
    }

    #[test]
    fn test_update_has_no_insert_id() {
        let conn = conn();
        execute_write(&conn, "INSERT INTO t (x) VALUES ('a')", &[]).unwrap();
        let outcome = execute_write(&conn, "UPDATE t SET x = 'b'", &[]).unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(outcome.insert_id, None);
    }

    #[test]
    fn test_returning_write() {
        let conn = conn();
        let outcome =
            execute_write(&conn, "INSERT INTO t (x) VALUES ('a') RETURNING id", &[]).unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(outcome.insert_id, Some(1));
    }

    #[test]
    fn test_run_statement_routes_by_sqlite_verdict() {
        let conn = conn();

        let cte_insert = run_statement(
            &conn,
            "WITH v(x) AS (VALUES (?1)) INSERT INTO t (x) SELECT x FROM v",
            &[Value::Text("a".to_string())],
        )
        .unwrap();
        assert_eq!(
            cte_insert,
            StatementOutput::Write(WriteOutcome {
                rows_affected: 1,
                insert_id: Some(1),
            })
        );

        let pragma = run_statement(&conn, "PRAGMA user_version = 7", &[]).unwrap();
        assert_eq!(pragma.kind(), StatementKind::Write);

        match run_statement(&conn, "PRAGMA user_version", &[]).unwrap() {
            StatementOutput::Rows(rows) => assert_eq!(rows[0].get_i64("user_version"), Some(7)),
            other => panic!("expected rows, got {:?}", other),
        }

        match run_statement(&conn, "WITH c AS (SELECT COUNT(*) AS n FROM t) SELECT n FROM c", &[])
            .unwrap()
        {
            StatementOutput::Rows(rows) => assert_eq!(rows[0].get_i64("n"), Some(1)),
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn test_user_objects_and_quoting() {
        let conn = conn();
        conn.execute_batch("CREATE VIEW v AS SELECT * FROM t").unwrap();
        let objects = user_objects(&conn).unwrap();
        assert_eq!(
            objects,
            vec![
                ("view".to_string(), "v".to_string()),
                ("table".to_string(), "t".to_string()),
            ]
        );
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
