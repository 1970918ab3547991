//! SQLite adapter
//!
//! Loads a `MemoryDatabase` into an in-process SQLite connection and runs the
//! generated ANSI SQL text as is; the attached plan is never consulted.
//! Fixture runs use it so the relational text itself is exercised.

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::memory::{MemoryDatabase, MemoryTable};
use super::{EngineKind, ExecutionAdapter, RowSet};
use crate::compiler::{CompiledQuery, Dialect, SqlFlavor};
use crate::error::ExecutionError;

const ENGINE: EngineKind = EngineKind::Relational;

pub struct SqliteAdapter {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAdapter {
    /// Copy every table of `db` into a fresh in-memory database.
    pub fn load(db: &MemoryDatabase) -> std::result::Result<Self, ExecutionError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        for table in &db.tables {
            create_table(&conn, table)?;
        }
        debug!("Loaded {} tables into SQLite", db.tables.len());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn create_table(conn: &Connection, table: &MemoryTable) -> std::result::Result<(), ExecutionError> {
    let q = |ident: &str| SqlFlavor::Ansi.quote(ident);
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("{} {}", q(&c.name), c.data_type))
        .collect();
    conn.execute(&format!("CREATE TABLE {} ({})", q(&table.name), columns.join(", ")), [])
        .map_err(map_sqlite_error)?;

    let placeholders: Vec<String> = (1..=table.columns.len()).map(|i| format!("?{}", i)).collect();
    let mut insert = conn
        .prepare(&format!("INSERT INTO {} VALUES ({})", q(&table.name), placeholders.join(", ")))
        .map_err(map_sqlite_error)?;
    for row in &table.rows {
        let values = (0..table.columns.len()).map(|i| row.get(i).map_or(SqlValue::Null, to_sql));
        insert.execute(params_from_iter(values)).map_err(map_sqlite_error)?;
    }
    Ok(())
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

/// Keep SQLite's message verbatim; SQLITE_ERROR covers syntax errors and
/// unknown tables or columns.
fn map_sqlite_error(e: rusqlite::Error) -> ExecutionError {
    let message = e.to_string();
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied => {
                ExecutionError::denied(ENGINE, message)
            }
            ErrorCode::OperationInterrupted => ExecutionError::timeout(ENGINE, message),
            ErrorCode::Unknown => ExecutionError::rejected(ENGINE, message),
            _ => ExecutionError::failed(ENGINE, message),
        },
        _ => ExecutionError::failed(ENGINE, message),
    }
}

fn run(conn: &Connection, sql: &str) -> std::result::Result<Vec<Vec<Value>>, ExecutionError> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let width = stmt.column_count();
    let mut rows = stmt.query([]).map_err(map_sqlite_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(to_json(row.get_ref(i).map_err(map_sqlite_error)?));
        }
        out.push(values);
    }
    Ok(out)
}

#[async_trait]
impl ExecutionAdapter for SqliteAdapter {
    fn engine(&self) -> EngineKind {
        ENGINE
    }

    fn name(&self) -> &str {
        "sqlite"
    }

    async fn execute(&self, query: &CompiledQuery) -> std::result::Result<RowSet, ExecutionError> {
        if query.dialect != Dialect::AnsiSql {
            return Err(ExecutionError::rejected(
                ENGINE,
                format!("SQLite runs ANSI SQL, got {}", query.dialect),
            ));
        }
        debug!("Executing SQL:\n{}", query.text);
        let conn = self.conn.clone();
        let text = query.text.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| ExecutionError::failed(ENGINE, "SQLite connection poisoned"))?;
            run(&conn, &text)
        })
        .await
        .map_err(|e| ExecutionError::failed(ENGINE, e.to_string()))??;
        Ok(RowSet::new(query.output_columns.clone(), rows))
    }
}
