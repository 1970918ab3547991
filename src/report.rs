//! Run report - one JSON audit file per pipeline run, failed runs included

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::compiler::QueryPair;
use crate::error::{QueryBridgeError, Result, Stage};
use crate::execution::ExecutionResult;
use crate::intent::Intent;
use crate::reconcile::ReconciliationReport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedError {
    pub stage: Option<Stage>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub question: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last stage entered.
    pub stage: Stage,
    pub catalog_version: Option<String>,
    pub intent: Option<Intent>,
    pub query_pair: Option<QueryPair>,
    pub relational: Option<ExecutionResult>,
    pub multidimensional: Option<ExecutionResult>,
    pub reconciliation: Option<ReconciliationReport>,
    pub error: Option<ReportedError>,
}

impl RunReport {
    pub fn new(question: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            question: question.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            stage: Stage::Catalog,
            catalog_version: None,
            intent: None,
            query_pair: None,
            relational: None,
            multidimensional: None,
            reconciliation: None,
            error: None,
        }
    }

    pub fn relational_text(&self) -> Option<String> {
        self.query_pair.as_ref().map(|p| p.relational.text.clone())
    }

    pub fn multidimensional_text(&self) -> Option<String> {
        self.query_pair.as_ref().map(|p| p.multidimensional.text.clone())
    }

    pub fn finish(&mut self, error: Option<&QueryBridgeError>) {
        self.finished_at = Some(Utc::now());
        self.error = error.map(|e| ReportedError {
            stage: e.stage(),
            message: e.to_string(),
        });
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.run_id)
    }

    /// Write `<dir>/<run_id>.json`, creating `dir` if needed.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!("Run report written to {}", path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}
