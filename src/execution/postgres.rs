//! PostgreSQL adapter
//!
//! Rows come back as `row_to_json` text so any result shape maps onto JSON
//! values without per-type decoding.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::debug;

use super::{EngineKind, ExecutionAdapter, RowSet};
use crate::compiler::CompiledQuery;
use crate::error::ExecutionError;

const ENGINE: EngineKind = EngineKind::Relational;

pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> std::result::Result<Self, ExecutionError> {
        let pool = PgPool::connect(database_url).await.map_err(map_sqlx_error)?;
        Ok(Self::new(pool))
    }
}

fn wrap(sql: &str) -> String {
    format!("SELECT row_to_json(q)::text AS row_json FROM (\n{}\n) q", sql)
}

/// Map a driver error onto the adapter failure categories, keeping the
/// server message verbatim.
pub fn map_sqlx_error(e: sqlx::Error) -> ExecutionError {
    match &e {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            classify_sqlstate(&code, db.message())
        }
        sqlx::Error::PoolTimedOut => ExecutionError::timeout(ENGINE, e.to_string()),
        _ => ExecutionError::failed(ENGINE, e.to_string()),
    }
}

pub fn classify_sqlstate(code: &str, message: &str) -> ExecutionError {
    match code {
        // insufficient_privilege, invalid authorization
        "42501" | "28000" | "28P01" => ExecutionError::denied(ENGINE, message),
        // query_canceled (statement_timeout)
        "57014" => ExecutionError::timeout(ENGINE, message),
        // syntax error or access rule violation
        c if c.starts_with("42") => ExecutionError::rejected(ENGINE, message),
        _ => ExecutionError::failed(ENGINE, message),
    }
}

#[async_trait]
impl ExecutionAdapter for PostgresAdapter {
    fn engine(&self) -> EngineKind {
        ENGINE
    }

    fn name(&self) -> &str {
        "postgres"
    }

    async fn execute(&self, query: &CompiledQuery) -> std::result::Result<RowSet, ExecutionError> {
        debug!("Executing SQL:\n{}", query.text);
        let records: Vec<(String,)> = sqlx::query_as(&wrap(&query.text))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut objects: Vec<Map<String, Value>> = Vec::with_capacity(records.len());
        for (text,) in records {
            match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(obj)) => objects.push(obj),
                Ok(other) => {
                    let message = format!("unexpected row shape: {}", other);
                    return Err(ExecutionError::failed(ENGINE, message));
                }
                Err(e) => {
                    let message = format!("undecodable row: {}", e);
                    return Err(ExecutionError::failed(ENGINE, message));
                }
            }
        }
        Ok(RowSet::from_objects(&query.output_columns, &objects))
    }
}
