/// Database capability (SQLite).
///
/// Scripts pass SQL text plus positional [`Value`] parameters; parameter
/// values are always bound, never spliced into the SQL string. Only a
/// single statement is accepted per call.
///
/// The connection cannot reach other files: `ATTACH`, `DETACH`,
/// `VACUUM INTO` and pragmas taking a directory are refused with
/// `Denied`, so file access stays with the fs capability.
///
/// The connection and its prepared-statement cache belong to the runtime
/// host and are only touched from the single dispatch thread.
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::limits::Limit;
use rusqlite::{params_from_iter, Connection};
use tracing::{info, warn};

use super::CapError;
use crate::value::Value;

/// Default number of cached prepared statements.
pub const DEFAULT_STATEMENT_CACHE: usize = 64;

/// How long SQLite waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Fully materialized query result.
#[derive(Debug, Clone, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

fn map_sqlite_error(e: rusqlite::Error) -> CapError {
    use rusqlite::Error as E;
    match e {
        E::InvalidParameterCount(got, expected) => CapError::InvalidArgument(format!(
            "statement expects {expected} parameter(s), got {got}"
        )),
        E::MultipleStatement => {
            CapError::InvalidArgument("only one SQL statement per call is allowed".into())
        }
        E::ExecuteReturnedResults => {
            CapError::InvalidArgument("statement returns rows; use query instead".into())
        }
        E::SqliteFailure(err, msg) if err.code == rusqlite::ErrorCode::DatabaseBusy => {
            CapError::Timeout(msg.unwrap_or_else(|| err.to_string()))
        }
        E::SqliteFailure(err, msg)
            if err.code == rusqlite::ErrorCode::AuthorizationForStatementDenied =>
        {
            CapError::Denied(msg.unwrap_or_else(|| "statement not authorized".into()))
        }
        other => CapError::Io(other.to_string()),
    }
}

/// Pragmas that point SQLite at a directory of the caller's choosing.
const FILE_PRAGMAS: &[&str] = &["temp_store_directory", "data_store_directory"];

fn authorize(ctx: AuthContext<'_>) -> Authorization {
    match ctx.action {
        AuthAction::Attach { .. } | AuthAction::Detach { .. } => Authorization::Deny,
        AuthAction::Pragma { pragma_name, .. }
            if FILE_PRAGMAS
                .iter()
                .any(|p| p.eq_ignore_ascii_case(pragma_name)) =>
        {
            Authorization::Deny
        }
        _ => Authorization::Allow,
    }
}

/// Keeps the connection on its own file.
fn confine(conn: &Connection) {
    conn.set_limit(Limit::SQLITE_LIMIT_ATTACHED, 0);
    conn.authorizer(Some(authorize));
}

// ── Statement shape ──────────────────────────────────────

/// Index just past the closing `quote`, or the end of the text.
fn skip_quoted(sql: &[u8], open: usize, quote: u8) -> usize {
    match sql[open + 1..].iter().position(|&c| c == quote) {
        Some(n) => open + 1 + n + 1,
        None => sql.len(),
    }
}

/// Index just past the next `end` marker at or after `from`.
fn skip_past(sql: &[u8], from: usize, end: &[u8]) -> usize {
    match sql
        .get(from..)
        .and_then(|rest| rest.windows(end.len()).position(|w| w == end))
    {
        Some(n) => from + n + end.len(),
        None => sql.len(),
    }
}

/// True when `rest` holds only whitespace, comments and semicolons.
fn is_trivia(rest: &[u8]) -> bool {
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            b'-' if rest.get(i + 1) == Some(&b'-') => i = skip_past(rest, i + 2, b"\n"),
            b'/' if rest.get(i + 1) == Some(&b'*') => i = skip_past(rest, i + 2, b"*/"),
            c if c == b';' || c.is_ascii_whitespace() => i += 1,
            _ => return false,
        }
    }
    true
}

/// Checks that `sql` is one statement and not `VACUUM INTO`.
///
/// SQLite compiles only the first statement of a string, so anything
/// after it would be dropped silently. Literals, quoted identifiers and
/// comments are skipped. In `CREATE TRIGGER` only a `;` right after
/// `END` closes the statement.
fn check_statement(sql: &str) -> Result<(), CapError> {
    let b = sql.as_bytes();
    let mut leading: Vec<String> = Vec::with_capacity(3);
    let mut last_word = String::new();
    let mut saw_into = false;
    let mut i = 0;
    let mut end = None;

    while i < b.len() {
        match b[i] {
            q @ (b'\'' | b'"' | b'`') => {
                i = skip_quoted(b, i, q);
                last_word.clear();
            }
            b'[' => {
                i = skip_past(b, i + 1, b"]");
                last_word.clear();
            }
            b'-' if b.get(i + 1) == Some(&b'-') => i = skip_past(b, i + 2, b"\n"),
            b'/' if b.get(i + 1) == Some(&b'*') => i = skip_past(b, i + 2, b"*/"),
            b';' => {
                let trigger = leading.first().is_some_and(|w| w == "CREATE")
                    && leading[1..].iter().any(|w| w == "TRIGGER");
                i += 1;
                if !trigger || last_word == "END" {
                    end = Some(i);
                    break;
                }
                last_word.clear();
            }
            c if c.is_ascii_alphanumeric() || c == b'_' => {
                let start = i;
                while i < b.len() && (b[i].is_ascii_alphanumeric() || b[i] == b'_') {
                    i += 1;
                }
                let word = sql[start..i].to_ascii_uppercase();
                saw_into |= word == "INTO";
                if leading.len() < 3 {
                    leading.push(word.clone());
                }
                last_word = word;
            }
            c => {
                if !c.is_ascii_whitespace() {
                    last_word.clear();
                }
                i += 1;
            }
        }
    }

    if let Some(end) = end {
        if !is_trivia(&b[end..]) {
            return Err(CapError::InvalidArgument(
                "only one SQL statement per call is allowed".into(),
            ));
        }
    }
    if saw_into && leading.first().is_some_and(|w| w == "VACUUM") {
        return Err(CapError::Denied("VACUUM INTO writes outside the database".into()));
    }
    Ok(())
}

impl Database {
    /// Opens (creating if needed) the database file.
    pub fn open(path: &Path, statement_cache: usize) -> Result<Self, CapError> {
        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite_error)?;
        conn.set_prepared_statement_cache_capacity(statement_cache);
        confine(&conn);
        info!("Database opened at {}", path.display());
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, CapError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        conn.set_prepared_statement_cache_capacity(DEFAULT_STATEMENT_CACHE);
        confine(&conn);
        Ok(Self { conn, path: None })
    }

    /// Database file path, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Executes a statement and returns the number of affected rows.
    pub fn exec(&self, sql: &str, params: &[Value]) -> Result<usize, CapError> {
        check_statement(sql)?;
        let mut stmt = self.conn.prepare_cached(sql).map_err(map_sqlite_error)?;
        stmt.execute(params_from_iter(params.iter()))
            .map_err(map_sqlite_error)
    }

    /// Runs a query and streams each row to `on_row`, which may stop the
    /// iteration early by returning `ControlFlow::Break`. Returns the
    /// number of rows delivered.
    pub fn query<F>(&self, sql: &str, params: &[Value], mut on_row: F) -> Result<usize, CapError>
    where
        F: FnMut(&[String], Vec<Value>) -> ControlFlow<()>,
    {
        check_statement(sql)?;
        let mut stmt = self.conn.prepare_cached(sql).map_err(map_sqlite_error)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt
            .query(params_from_iter(params.iter()))
            .map_err(map_sqlite_error)?;

        let mut delivered = 0;
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let value = row.get_ref(i).map_err(map_sqlite_error)?;
                values.push(Value::from_sql_ref(value));
            }
            delivered += 1;
            if on_row(&columns, values).is_break() {
                break;
            }
        }
        Ok(delivered)
    }

    /// Runs a query and collects every row.
    pub fn query_all(&self, sql: &str, params: &[Value]) -> Result<Rows, CapError> {
        let mut result = Rows {
            columns: Vec::new(),
            rows: Vec::new(),
        };
        self.query(sql, params, |columns, row| {
            if result.columns.is_empty() {
                result.columns = columns.to_vec();
            }
            result.rows.push(row);
            ControlFlow::Continue(())
        })?;
        if result.columns.is_empty() {
            let stmt = self.conn.prepare_cached(sql).map_err(map_sqlite_error)?;
            result.columns = stmt.column_names().into_iter().map(String::from).collect();
        }
        Ok(result)
    }

    /// Row id of the most recent successful INSERT.
    pub fn last_id(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Rolls back a transaction left open by an earlier, abnormally
    /// terminated dispatch. Returns true if a rollback happened.
    pub fn guard_stale_transaction(&self) -> Result<bool, CapError> {
        if !self.in_transaction() {
            return Ok(false);
        }
        warn!("Rolling back transaction left open by a previous request");
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(map_sqlite_error)?;
        Ok(true)
    }
}
