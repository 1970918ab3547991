//! Query Pipeline - one question through every stage
//!
//! catalog -> intent -> generation -> execution -> reconciliation
//!
//! Stages run in order; only the two adapter calls overlap. Language-model
//! and adapter calls share a bounded pool of permits across all requests.
//! Cancelling a run drops whatever is in flight, including unfinished cache
//! computations, which therefore never commit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogStore, Relationship};
use crate::compiler::{CompiledQuery, GenerationOptions, QueryPair, QueryTemplateEngine};
use crate::error::{ExecutionError, QueryBridgeError, Result, Stage};
use crate::execution::{run_adapter, ExecutionAdapter, ExecutionResult};
use crate::intent::{Intent, IntentExtractor};
use crate::reconcile::{ReconciliationReport, ResultReconciler};
use crate::report::RunReport;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Relationships the caller attests are declared and active in the model.
    pub attested: Vec<Relationship>,
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn attest(mut self, relationship: Relationship) -> Self {
        self.attested.push(relationship);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn generation_options(&self) -> GenerationOptions {
        self.attested
            .iter()
            .cloned()
            .fold(GenerationOptions::default(), GenerationOptions::attest)
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub intent: Intent,
    pub query_pair: QueryPair,
    pub relational: ExecutionResult,
    pub multidimensional: ExecutionResult,
    pub reconciliation: ReconciliationReport,
}

pub struct QueryPipeline {
    catalog: Arc<CatalogStore>,
    extractor: IntentExtractor,
    engine: QueryTemplateEngine,
    relational: Arc<dyn ExecutionAdapter>,
    multidimensional: Arc<dyn ExecutionAdapter>,
    reconciler: ResultReconciler,
    permits: Arc<Semaphore>,
    execution_timeout: Duration,
    report_dir: Option<PathBuf>,
}

impl QueryPipeline {
    pub fn new(
        catalog: Arc<CatalogStore>,
        extractor: IntentExtractor,
        engine: QueryTemplateEngine,
        relational: Arc<dyn ExecutionAdapter>,
        multidimensional: Arc<dyn ExecutionAdapter>,
    ) -> Self {
        Self {
            catalog,
            extractor,
            engine,
            relational,
            multidimensional,
            reconciler: ResultReconciler::default(),
            permits: Arc::new(Semaphore::new(8)),
            execution_timeout: Duration::from_secs(120),
            report_dir: None,
        }
    }

    /// Bound on outstanding language-model and adapter calls.
    pub fn with_max_outstanding(mut self, permits: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_reconciler(mut self, reconciler: ResultReconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    pub fn catalog_store(&self) -> &Arc<CatalogStore> {
        &self.catalog
    }

    pub async fn run(&self, question: &str, options: RunOptions) -> Result<RunOutcome> {
        let mut report = RunReport::new(question);
        info!("Run {} started: {}", report.run_id, question);
        let cancel = options.cancel.clone().unwrap_or_default();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueryBridgeError::Cancelled),
            result = self.run_stages(question, &options, &mut report) => result,
        };
        let result = result.map_err(|e| match e {
            QueryBridgeError::Stage(_) => e,
            other => other.at_stage(
                report.stage,
                question,
                report.relational_text(),
                report.multidimensional_text(),
            ),
        });

        report.finish(result.as_ref().err());
        if let Some(dir) = &self.report_dir {
            if let Err(e) = report.write(dir) {
                warn!("Could not write run report {}: {}", report.run_id, e);
            }
        }
        match &result {
            Ok(_) => info!("Run {} finished", report.run_id),
            Err(e) => warn!("Run {} failed: {}", report.run_id, e),
        }
        result
    }

    async fn run_stages(
        &self,
        question: &str,
        options: &RunOptions,
        report: &mut RunReport,
    ) -> Result<RunOutcome> {
        report.stage = Stage::Catalog;
        let catalog = self.catalog.catalog().await?;
        report.catalog_version = Some(catalog.version.clone());

        report.stage = Stage::Intent;
        let intent = {
            let _permit = self.permits.acquire().await.map_err(|_| QueryBridgeError::Cancelled)?;
            self.extractor.extract(question, &catalog).await?
        };
        report.intent = Some(intent.clone());

        report.stage = Stage::Generation;
        let pair = self.engine.generate(&intent, &catalog, &options.generation_options())?;
        info!("Generated queries with pattern {}", pair.pattern_used);
        report.query_pair = Some(pair.clone());

        report.stage = Stage::Execution;
        let (relational, multidimensional) = tokio::join!(
            self.execute(self.relational.as_ref(), &pair.relational),
            self.execute(self.multidimensional.as_ref(), &pair.multidimensional),
        );
        report.relational = Some(relational.clone());
        report.multidimensional = Some(multidimensional.clone());

        report.stage = Stage::Reconciliation;
        let reconciliation = self.reconciler.reconcile(&pair, &relational, &multidimensional);
        report.reconciliation = Some(reconciliation.clone());

        Ok(RunOutcome {
            run_id: report.run_id,
            intent,
            query_pair: pair,
            relational,
            multidimensional,
            reconciliation,
        })
    }

    async fn execute(
        &self,
        adapter: &dyn ExecutionAdapter,
        query: &CompiledQuery,
    ) -> ExecutionResult {
        match self.permits.acquire().await {
            Ok(_permit) => run_adapter(adapter, query, self.execution_timeout).await,
            Err(_) => ExecutionResult::failure(
                adapter.engine(),
                ExecutionError::failed(adapter.engine(), "worker pool closed"),
                0,
            ),
        }
    }
}
