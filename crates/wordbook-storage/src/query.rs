//! Statement classification and query results

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::StorageError;
use crate::value::Value;

/// Whether a statement produces rows or a change count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

impl StatementKind {
    /// SQLite's own verdict on a prepared statement. Anything that may
    /// change the database file is a write, whatever its leading keyword
    /// (`WITH ... INSERT`, `PRAGMA user_version = 7`).
    pub(crate) fn of(stmt: &rusqlite::Statement<'_>) -> StatementKind {
        if stmt.readonly() {
            StatementKind::Read
        } else {
            StatementKind::Write
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, StatementKind::Read)
    }
}

/// Returns the first keyword of `sql`, upper-cased, skipping whitespace and
/// `--` / `/* */` comments.
pub(crate) fn leading_keyword(sql: &str) -> Option<String> {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            break;
        }
    }

    let keyword: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if keyword.is_empty() {
        None
    } else {
        Some(keyword.to_ascii_uppercase())
    }
}

/// Keyword of the statement proper, looking past a leading `WITH` clause.
pub(crate) fn main_keyword(sql: &str) -> Option<String> {
    let first = leading_keyword(sql)?;
    if first != "WITH" {
        return Some(first);
    }

    // The body keyword is the first one outside the CTE parentheses.
    let mut depth = 0u32;
    let mut quote: Option<char> = None;
    let mut word = String::new();
    for c in sql.chars().chain(std::iter::once(' ')) {
        if let Some(close) = quote {
            if c == close {
                quote = None;
            }
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c.to_ascii_uppercase());
            continue;
        }
        if depth == 0
            && matches!(
                word.as_str(),
                "SELECT" | "INSERT" | "REPLACE" | "UPDATE" | "DELETE" | "VALUES"
            )
        {
            return Some(word);
        }
        word.clear();
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '[' => quote = Some(']'),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

/// True for statements whose `last_insert_rowid()` is meaningful.
pub(crate) fn reports_insert_id(sql: &str) -> bool {
    matches!(main_keyword(sql).as_deref(), Some("INSERT" | "REPLACE"))
}

/// A single result row. Column order follows the statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Change count and insert id of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub rows_affected: u64,
    pub insert_id: Option<i64>,
}

/// What running a statement produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutput {
    Rows(Vec<Row>),
    Write(WriteOutcome),
}

impl StatementOutput {
    pub fn kind(&self) -> StatementKind {
        match self {
            StatementOutput::Rows(_) => StatementKind::Read,
            StatementOutput::Write(_) => StatementKind::Write,
        }
    }
}

/// Normalized result of a statement, as handed to domain services.
///
/// A failed result always carries `error` and never carries `rows` or
/// `insert_id`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    pub rows_affected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn read(rows: Vec<Row>) -> Self {
        Self {
            success: true,
            rows: Some(rows),
            ..Self::default()
        }
    }

    pub fn write(outcome: WriteOutcome) -> Self {
        Self {
            success: true,
            rows: None,
            rows_affected: outcome.rows_affected,
            insert_id: outcome.insert_id,
            error: None,
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    /// Rows of a successful read, empty otherwise.
    pub fn rows(&self) -> &[Row] {
        self.rows.as_deref().unwrap_or_default()
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows().first()
    }

    /// Converts a failed result into [`StorageError::Query`], so callers can
    /// use `?` inside transactions.
    pub fn into_result(self) -> Result<QueryResult, StorageError> {
        if self.success {
            Ok(self)
        } else {
            Err(StorageError::Query(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

impl From<Result<Vec<Row>, StorageError>> for QueryResult {
    fn from(result: Result<Vec<Row>, StorageError>) -> Self {
        match result {
            Ok(rows) => QueryResult::read(rows),
            Err(e) => QueryResult::failure(e),
        }
    }
}

impl From<Result<StatementOutput, StorageError>> for QueryResult {
    fn from(result: Result<StatementOutput, StorageError>) -> Self {
        match result {
            Ok(StatementOutput::Rows(rows)) => QueryResult::read(rows),
            Ok(StatementOutput::Write(outcome)) => QueryResult::write(outcome),
            Err(e) => QueryResult::failure(e),
        }
    }
}

impl From<Result<WriteOutcome, StorageError>> for QueryResult {
    fn from(result: Result<WriteOutcome, StorageError>) -> Self {
        match result {
            Ok(outcome) => QueryResult::write(outcome),
            Err(e) => QueryResult::failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_keyword_skips_comments() {
        assert_eq!(leading_keyword("  select * from words").as_deref(), Some("SELECT"));
        assert_eq!(
            leading_keyword("-- count\n/* all */ SELECT COUNT(*) FROM words").as_deref(),
            Some("SELECT")
        );
        assert_eq!(leading_keyword(""), None);
    }

    #[test]
    fn test_main_keyword_looks_past_with() {
        assert_eq!(
            main_keyword("WITH v(x) AS (VALUES ('a')) INSERT INTO t SELECT x FROM v").as_deref(),
            Some("INSERT")
        );
        assert_eq!(
            main_keyword("with recursive n(i) as (select 1 union all select i + 1 from n where i < 3) delete from t where id in n").as_deref(),
            Some("DELETE")
        );
        assert_eq!(
            main_keyword("WITH q AS (SELECT ')insert(' AS s) SELECT s FROM q").as_deref(),
            Some("SELECT")
        );
        assert_eq!(main_keyword("UPDATE t SET x = 1").as_deref(), Some("UPDATE"));
    }

    #[test]
    fn test_statement_kind_from_prepared() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x TEXT)").unwrap();

        let kind = |sql: &str| StatementKind::of(&conn.prepare(sql).unwrap());
        assert_eq!(kind("SELECT x FROM t"), StatementKind::Read);
        assert_eq!(kind("PRAGMA user_version"), StatementKind::Read);
        assert_eq!(kind("WITH v(x) AS (VALUES ('a')) SELECT x FROM v"), StatementKind::Read);
        assert_eq!(kind("PRAGMA user_version = 7"), StatementKind::Write);
        assert_eq!(
            kind("WITH v(x) AS (VALUES ('a')) INSERT INTO t SELECT x FROM v"),
            StatementKind::Write
        );
        assert_eq!(kind("DELETE FROM t"), StatementKind::Write);
    }

    #[test]
    fn test_reports_insert_id() {
        assert!(reports_insert_id("insert into t(x) values (1)"));
        assert!(reports_insert_id("REPLACE INTO t(x) VALUES (1)"));
        assert!(reports_insert_id("WITH v(x) AS (VALUES (1)) INSERT INTO t SELECT x FROM v"));
        assert!(!reports_insert_id("UPDATE t SET x = 1"));
        assert!(!reports_insert_id("WITH d AS (SELECT 1) DELETE FROM t"));
    }

    #[test]
    fn test_failure_invariant() {
        let result = QueryResult::failure("UNIQUE constraint failed");
        assert!(!result.success);
        assert!(result.rows.is_none());
        assert!(result.insert_id.is_none());
        assert_eq!(result.error.as_deref(), Some("UNIQUE constraint failed"));

        let err = result.into_result().unwrap_err();
        assert!(matches!(err, StorageError::Query(_)));
    }

    #[test]
    fn test_row_lookup_and_json() {
        let row = Row::new(
            vec!["id".to_string(), "term".to_string()],
            vec![Value::Integer(1), Value::Text("Haus".to_string())],
        );
        assert_eq!(row.get_i64("id"), Some(1));
        assert_eq!(row.get_str("term"), Some("Haus"));
        assert!(row.get("missing").is_none());

        let json = serde_json::to_string(&QueryResult::read(vec![row])).unwrap();
        assert_eq!(
            json,
            r#"{"success":true,"rows":[{"id":1,"term":"Haus"}],"rowsAffected":0}"#
        );
    }
}
