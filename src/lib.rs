//! querybridge - one business question, two engines
//!
//! A natural-language question is turned into a structured `Intent` against
//! a runtime-discovered `SchemaCatalog`, compiled into a relational (SQL) and
//! a multidimensional (DAX) query, executed on both engines, and the two
//! results are reconciled.

pub mod cache;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod error;
pub mod execution;
pub mod intent;
pub mod llm;
pub mod metadata;
pub mod pipeline;
pub mod reconcile;
pub mod report;

pub use cache::ResponseCache;
pub use catalog::{CatalogStore, SchemaCatalog, SchemaCatalogBuilder};
pub use compiler::{QueryPair, QueryTemplateEngine, SqlFlavor};
pub use config::AppConfig;
pub use error::{QueryBridgeError, Result, Stage};
pub use execution::{ExecutionAdapter, ExecutionResult};
pub use intent::{Intent, IntentExtractor};
pub use llm::{CompletionService, LlmClient};
pub use pipeline::{QueryPipeline, RunOptions, RunOutcome};
pub use reconcile::{DivergenceCause, ReconciliationReport, ResultReconciler};
pub use report::RunReport;
