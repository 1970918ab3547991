//! Execution adapters - run each compiled query against its engine
//!
//! Adapters are not retried: a failure is reported in the `ExecutionResult`,
//! never masked. Every call carries its own timeout.

pub mod memory;
pub mod postgres;
pub mod powerbi;
pub mod sqlite;

pub use memory::{MemoryDatabase, MemoryModelAdapter, MemoryRelationalAdapter};
pub use postgres::PostgresAdapter;
pub use powerbi::PowerBiAdapter;
pub use sqlite::SqliteAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::compiler::CompiledQuery;
use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    Relational,
    Multidimensional,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Relational => write!(f, "relational"),
            EngineKind::Multidimensional => write!(f, "multidimensional"),
        }
    }
}

/// Rows as returned by an engine, column names as the engine reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Build from JSON objects, picking `columns` in order (missing keys are null).
    pub fn from_objects(columns: &[String], objects: &[serde_json::Map<String, Value>]) -> Self {
        let rows = objects
            .iter()
            .map(|obj| {
                columns
                    .iter()
                    .map(|c| obj.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self::new(columns.to_vec(), rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub engine: EngineKind,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub elapsed_ms: u64,
    pub status: ExecutionStatus,
    pub error_detail: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn success(engine: EngineKind, rows: RowSet, elapsed_ms: u64) -> Self {
        Self {
            engine,
            columns: rows.columns,
            rows: rows.rows,
            elapsed_ms,
            status: ExecutionStatus::Success,
            error_detail: None,
        }
    }

    pub fn failure(engine: EngineKind, error: ExecutionError, elapsed_ms: u64) -> Self {
        Self {
            engine,
            columns: Vec::new(),
            rows: Vec::new(),
            elapsed_ms,
            status: ExecutionStatus::Failure,
            error_detail: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row_set(&self) -> RowSet {
        RowSet::new(self.columns.clone(), self.rows.clone())
    }
}

#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    fn engine(&self) -> EngineKind;

    /// Short name for logs and reports.
    fn name(&self) -> &str;

    async fn execute(&self, query: &CompiledQuery) -> std::result::Result<RowSet, ExecutionError>;
}

/// Run one adapter call under `timeout`, capturing the outcome.
pub async fn run_adapter(
    adapter: &dyn ExecutionAdapter,
    query: &CompiledQuery,
    timeout: Duration,
) -> ExecutionResult {
    let engine = adapter.engine();
    let start = Instant::now();
    let outcome = match tokio::time::timeout(timeout, adapter.execute(query)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ExecutionError::timeout(
            engine,
            format!("{} did not answer within {:?}", adapter.name(), timeout),
        )),
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(rows) => {
            info!("{} returned {} rows in {}ms", adapter.name(), rows.len(), elapsed_ms);
            ExecutionResult::success(engine, rows, elapsed_ms)
        }
        Err(e) => {
            warn!("{} failed after {}ms: {}", adapter.name(), elapsed_ms, e);
            ExecutionResult::failure(engine, e, elapsed_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Dialect;
    use crate::error::ExecutionErrorKind;

    struct Sleepy;

    #[async_trait]
    impl ExecutionAdapter for Sleepy {
        fn engine(&self) -> EngineKind {
            EngineKind::Multidimensional
        }

        fn name(&self) -> &str {
            "sleepy"
        }

        async fn execute(
            &self,
            _query: &CompiledQuery,
        ) -> std::result::Result<RowSet, ExecutionError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(RowSet::default())
        }
    }

    #[tokio::test]
    async fn test_adapter_timeout_is_reported() {
        let text = "EVALUATE ROW(\"x\", 1)".to_string();
        let query = CompiledQuery::new(Dialect::Dax, text, vec![], vec![]);
        let result = run_adapter(&Sleepy, &query, Duration::from_millis(10)).await;
        assert!(!result.is_success());
        assert_eq!(result.error_detail.unwrap().kind, ExecutionErrorKind::Timeout);
    }

    #[test]
    fn test_row_set_from_objects() {
        let mut obj = serde_json::Map::new();
        obj.insert("customer[industry]".to_string(), Value::from("Banking"));
        let columns = vec!["customer[industry]".to_string(), "[total]".to_string()];
        let rows = RowSet::from_objects(&columns, &[obj]);
        assert_eq!(rows.rows[0], vec![Value::from("Banking"), Value::Null]);
    }
}
