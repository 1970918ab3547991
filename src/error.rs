use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::execution::EngineKind;

#[derive(Error, Debug)]
pub enum QueryBridgeError {
    #[error("Schema discovery error: {0}")]
    SchemaDiscovery(String),

    #[error("Intent parse error: {message}")]
    IntentParse {
        message: String,
        last_response: Option<String>,
    },

    #[error("Query generation error: {0}")]
    QueryGeneration(String),

    #[error("Invalid {dialect} query: {message}")]
    InvalidQuery {
        dialect: String,
        message: String,
        query_text: String,
    },

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Reconciliation inconclusive: {0}")]
    ReconciliationInconclusive(String),

    #[error("LLM error: {0}")]
    Completion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("{0}")]
    Stage(Box<StageFailure>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueryBridgeError>;

/// Pipeline stage a fatal error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Catalog,
    Intent,
    Generation,
    Execution,
    Reconciliation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Catalog => write!(f, "catalog"),
            Stage::Intent => write!(f, "intent"),
            Stage::Generation => write!(f, "generation"),
            Stage::Execution => write!(f, "execution"),
            Stage::Reconciliation => write!(f, "reconciliation"),
        }
    }
}

/// A fatal stage error together with everything produced before it failed.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub question: String,
    pub relational_text: Option<String>,
    pub multidimensional_text: Option<String>,
    pub source: QueryBridgeError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stage failed for question \"{}\": {}",
            self.stage, self.question, self.source
        )?;
        if let Some(sql) = &self.relational_text {
            write!(f, "\n  relational query: {}", sql)?;
        }
        if let Some(dax) = &self.multidimensional_text {
            write!(f, "\n  multidimensional query: {}", dax)?;
        }
        // Queries rejected by the static check carry their own text.
        if let QueryBridgeError::InvalidQuery { query_text, .. } = &self.source {
            write!(f, "\n  rejected text: {}", query_text)?;
        }
        Ok(())
    }
}

impl QueryBridgeError {
    /// Wraps `self` with the stage and partial artifacts of a failed run.
    pub fn at_stage(
        self,
        stage: Stage,
        question: &str,
        relational_text: Option<String>,
        multidimensional_text: Option<String>,
    ) -> Self {
        QueryBridgeError::Stage(Box::new(StageFailure {
            stage,
            question: question.to_string(),
            relational_text,
            multidimensional_text,
            source: self,
        }))
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            QueryBridgeError::Stage(failure) => Some(failure.stage),
            _ => None,
        }
    }

    /// The innermost error, looking through a stage wrapper.
    pub fn root(&self) -> &QueryBridgeError {
        match self {
            QueryBridgeError::Stage(failure) => failure.source.root(),
            other => other,
        }
    }
}

/// Category of an adapter-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionErrorKind {
    Timeout,
    AuthorizationDenied,
    /// The query was well-formed but the engine refused or could not translate it.
    EngineRejectedQuery,
    Failed,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionErrorKind::Timeout => write!(f, "Timeout"),
            ExecutionErrorKind::AuthorizationDenied => write!(f, "AuthorizationDenied"),
            ExecutionErrorKind::EngineRejectedQuery => write!(f, "EngineRejectedQuery"),
            ExecutionErrorKind::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{engine} {kind}: {message}")]
pub struct ExecutionError {
    pub engine: EngineKind,
    pub kind: ExecutionErrorKind,
    /// Engine message, kept verbatim.
    pub message: String,
}

impl ExecutionError {
    pub fn new(engine: EngineKind, kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            engine,
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(engine: EngineKind, message: impl Into<String>) -> Self {
        Self::new(engine, ExecutionErrorKind::Timeout, message)
    }

    pub fn rejected(engine: EngineKind, message: impl Into<String>) -> Self {
        Self::new(engine, ExecutionErrorKind::EngineRejectedQuery, message)
    }

    pub fn denied(engine: EngineKind, message: impl Into<String>) -> Self {
        Self::new(engine, ExecutionErrorKind::AuthorizationDenied, message)
    }

    pub fn failed(engine: EngineKind, message: impl Into<String>) -> Self {
        Self::new(engine, ExecutionErrorKind::Failed, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_carries_query_text() {
        let err =
            QueryBridgeError::QueryGeneration("no join path from facility to region".to_string())
                .at_stage(
                    Stage::Generation,
                    "limit by region",
                    Some("SELECT 1".to_string()),
                    None,
                );
        assert_eq!(err.stage(), Some(Stage::Generation));
        let rendered = err.to_string();
        assert!(rendered.contains("generation stage failed"));
        assert!(rendered.contains("limit by region"));
        assert!(rendered.contains("SELECT 1"));
        assert!(matches!(err.root(), QueryBridgeError::QueryGeneration(_)));
    }

    #[test]
    fn test_execution_error_keeps_engine_message() {
        let err = ExecutionError::rejected(
            EngineKind::Multidimensional,
            "Query (3, 5) The column 'x' cannot be found.",
        );
        assert!(err.to_string().contains("Query (3, 5) The column 'x' cannot be found."));
        assert_eq!(err.kind, ExecutionErrorKind::EngineRejectedQuery);
    }
}
