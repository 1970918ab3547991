#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use querybridge::catalog::{CatalogStore, SchemaCatalogBuilder};
use querybridge::compiler::{CompiledQuery, GenerationOptions, QueryTemplateEngine, SqlFlavor};
use querybridge::error::ExecutionError;
use querybridge::execution::{
    run_adapter, EngineKind, ExecutionAdapter, MemoryDatabase, MemoryModelAdapter,
    MemoryRelationalAdapter, RowSet, SqliteAdapter,
};
use querybridge::intent::{Intent, IntentExtractor};
use querybridge::llm::{ChatMessage, CompletionError, CompletionService};
use querybridge::metadata::MetadataProvider;
use querybridge::pipeline::QueryPipeline;
use querybridge::{
    ExecutionResult, QueryPair, ReconciliationReport, ResponseCache, ResultReconciler,
};

pub const SCHEMA_TTL: Duration = Duration::from_secs(3600);

pub fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/credit.json")
}

/// Facilities, customers, countries and currencies of a small lending book.
pub fn credit_fixture() -> MemoryDatabase {
    MemoryDatabase::from_json_file(&fixture_path()).unwrap()
}

/// Answers by question fragment and counts every call.
pub struct ScriptedLlm {
    answers: Vec<(String, String)>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            answers: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn answer(mut self, fragment: &str, reply: Value) -> Self {
        self.answers.push((fragment.to_lowercase(), reply.to_string()));
        self
    }

    pub fn answer_text(mut self, fragment: &str, reply: &str) -> Self {
        self.answers.push((fragment.to_lowercase(), reply.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let question = messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.to_lowercase())
            .unwrap_or_default();
        self.answers
            .iter()
            .find(|(fragment, _)| question.contains(fragment))
            .map(|(_, reply)| reply.clone())
            .ok_or_else(|| {
                CompletionError::Transport(format!("no scripted answer for '{}'", question))
            })
    }
}

/// Adapter that refuses every query with a fixed engine message.
pub struct RejectingAdapter {
    pub engine: EngineKind,
    pub message: String,
}

#[async_trait]
impl ExecutionAdapter for RejectingAdapter {
    fn engine(&self) -> EngineKind {
        self.engine
    }

    fn name(&self) -> &str {
        "rejecting"
    }

    async fn execute(&self, _query: &CompiledQuery) -> Result<RowSet, ExecutionError> {
        Err(ExecutionError::rejected(self.engine, self.message.clone()))
    }
}

pub struct IntentRun {
    pub pair: QueryPair,
    pub relational: ExecutionResult,
    /// The relational plan evaluated directly, without the SQL text.
    pub planned: ExecutionResult,
    pub multidimensional: ExecutionResult,
    pub report: ReconciliationReport,
}

pub struct Harness {
    pub db: Arc<MemoryDatabase>,
    pub llm: Arc<ScriptedLlm>,
    pub cache: Arc<ResponseCache>,
}

impl Harness {
    pub fn new(db: MemoryDatabase, llm: ScriptedLlm) -> Self {
        Self::with_cache(db, llm, Arc::new(ResponseCache::new(SCHEMA_TTL)))
    }

    pub fn with_cache(db: MemoryDatabase, llm: ScriptedLlm, cache: Arc<ResponseCache>) -> Self {
        Self {
            db: Arc::new(db),
            llm: Arc::new(llm),
            cache,
        }
    }

    /// Runs the generated SQL text on SQLite.
    pub fn relational(&self) -> Arc<dyn ExecutionAdapter> {
        Arc::new(SqliteAdapter::load(&self.db).unwrap())
    }

    pub fn model(&self) -> Arc<dyn ExecutionAdapter> {
        Arc::new(MemoryModelAdapter::new(self.db.clone()))
    }

    /// Generate `intent` without the model and run the SQL text on SQLite
    /// and the DAX on the memory model.
    pub async fn run_intent(&self, intent: &Intent) -> IntentRun {
        let snapshot = self.db.fetch().await.unwrap();
        let catalog = SchemaCatalogBuilder::new()
            .build_from_snapshot(&self.db.name, &snapshot)
            .unwrap();
        let pair = QueryTemplateEngine::new(SqlFlavor::Ansi)
            .generate(intent, &catalog, &GenerationOptions::default())
            .unwrap();
        let timeout = Duration::from_secs(5);
        let relational = run_adapter(self.relational().as_ref(), &pair.relational, timeout).await;
        let planned = MemoryRelationalAdapter::new(self.db.clone());
        let planned = run_adapter(&planned, &pair.relational, timeout).await;
        let multidimensional =
            run_adapter(self.model().as_ref(), &pair.multidimensional, timeout).await;
        let report = ResultReconciler::default().reconcile(&pair, &relational, &multidimensional);
        IntentRun {
            pair,
            relational,
            planned,
            multidimensional,
            report,
        }
    }

    /// SQLite on the relational side, the memory model on the other.
    pub fn pipeline(&self) -> QueryPipeline {
        self.pipeline_with(self.relational(), self.model())
    }

    pub fn pipeline_with(
        &self,
        relational: Arc<dyn ExecutionAdapter>,
        multidimensional: Arc<dyn ExecutionAdapter>,
    ) -> QueryPipeline {
        let store = Arc::new(CatalogStore::new(
            self.db.clone(),
            SchemaCatalogBuilder::new(),
            self.cache.clone(),
            SCHEMA_TTL,
        ));
        let extractor = IntentExtractor::new(self.llm.clone(), self.cache.clone());
        QueryPipeline::new(
            store,
            extractor,
            QueryTemplateEngine::new(SqlFlavor::Ansi),
            relational,
            multidimensional,
        )
    }
}

pub const COUNTRY_QUESTION: &str = "How many customers are there in each country?";
pub const INDUSTRY_QUESTION: &str = "What is the total facility limit by industry?";

pub fn country_reply() -> Value {
    serde_json::json!({
        "measure": null,
        "aggregation": "count",
        "group_by": ["country.country_name"],
        "filters": [],
        "subject": "customer"
    })
}

pub fn industry_reply() -> Value {
    serde_json::json!({
        "measure": "facility.limit_amount",
        "aggregation": "sum",
        "group_by": ["customer.industry"],
        "filters": []
    })
}

/// Both reference questions scripted.
pub fn credit_llm() -> ScriptedLlm {
    ScriptedLlm::new()
        .answer("customers are there in each country", country_reply())
        .answer("total facility limit by industry", industry_reply())
}

/// Rows as sorted text, numbers compared by value.
pub fn canonical(rows: &[Vec<Value>]) -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|v| match v.as_f64() {
                    Some(n) => format!("{:.6}", n),
                    None => v.to_string(),
                })
                .collect()
        })
        .collect();
    out.sort();
    out
}

/// Row with `key` in its first cell.
pub fn row_for<'a>(rows: &'a [Vec<Value>], key: &str) -> Option<&'a Vec<Value>> {
    rows.iter().find(|r| r.first().and_then(|v| v.as_str()) == Some(key))
}
