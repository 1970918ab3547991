use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use querybridge::catalog::{CatalogStore, Relationship, SchemaCatalogBuilder};
use querybridge::compiler::QueryTemplateEngine;
use querybridge::config::AppConfig;
use querybridge::execution::{
    ExecutionAdapter, MemoryDatabase, MemoryModelAdapter, PostgresAdapter, PowerBiAdapter,
    SqliteAdapter,
};
use querybridge::intent::{EntityResolver, IntentExtractor};
use querybridge::llm::LlmClient;
use querybridge::metadata::{MetadataProvider, PostgresMetadataProvider};
use querybridge::pipeline::{QueryPipeline, RunOptions};
use querybridge::ResponseCache;

#[derive(Parser)]
#[command(name = "querybridge")]
#[command(
    about = "Natural-language questions compiled to SQL and DAX, executed on both engines and reconciled"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question on both engines and reconcile the results
    Ask {
        question: String,

        /// JSON fixture database: metadata, SQLite for the SQL text, the
        /// in-memory model for DAX
        #[arg(long)]
        fixture: Option<PathBuf>,

        /// Relationship declared active in the model, as from_table.col=to_table.col
        #[arg(long = "attest", value_parser = parse_relationship)]
        attested: Vec<Relationship>,

        /// Directory for the run report (overrides QUERYBRIDGE_REPORT_DIR)
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
    /// Print the discovered schema catalog
    Schema {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
}

fn parse_relationship(raw: &str) -> std::result::Result<Relationship, String> {
    let (from, to) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected from_table.col=to_table.col, got '{}'", raw))?;
    let split = |side: &str| {
        side.trim()
            .split_once('.')
            .map(|(t, c)| (t.to_string(), c.to_string()))
            .ok_or_else(|| format!("expected table.column, got '{}'", side))
    };
    let (from_table, from_column) = split(from)?;
    let (to_table, to_column) = split(to)?;
    Ok(Relationship::new(from_table, from_column, to_table, to_column))
}

struct Sources {
    metadata: Arc<dyn MetadataProvider>,
    relational: Arc<dyn ExecutionAdapter>,
    multidimensional: Arc<dyn ExecutionAdapter>,
}

fn load_fixture(path: &Path) -> Result<MemoryDatabase> {
    MemoryDatabase::from_json_file(path)
        .with_context(|| format!("loading fixture {}", path.display()))
}

async fn metadata_source(
    config: &AppConfig,
    fixture: Option<&PathBuf>,
) -> Result<Arc<dyn MetadataProvider>> {
    if let Some(path) = fixture {
        return Ok(Arc::new(load_fixture(path)?));
    }
    let url = config.require("DATABASE_URL", &config.database_url)?;
    Ok(Arc::new(
        PostgresMetadataProvider::connect(url, config.database_schema.clone()).await?,
    ))
}

async fn sources(config: &AppConfig, fixture: Option<&PathBuf>) -> Result<Sources> {
    if let Some(path) = fixture {
        let db = Arc::new(load_fixture(path)?);
        return Ok(Sources {
            metadata: db.clone(),
            relational: Arc::new(SqliteAdapter::load(&db)?),
            multidimensional: Arc::new(MemoryModelAdapter::new(db)),
        });
    }
    let url = config.require("DATABASE_URL", &config.database_url)?;
    let dataset = config.require("POWERBI_DATASET_ID", &config.powerbi_dataset_id)?;
    let token = config.require("POWERBI_ACCESS_TOKEN", &config.powerbi_access_token)?;
    Ok(Sources {
        metadata: metadata_source(config, None).await?,
        relational: Arc::new(PostgresAdapter::connect(url).await?),
        multidimensional: Arc::new(
            PowerBiAdapter::new(dataset, token)
                .with_api_base(config.powerbi_api_base.clone())
                .with_timeout(config.execution_timeout),
        ),
    })
}

fn catalog_store(
    config: &AppConfig,
    metadata: Arc<dyn MetadataProvider>,
    cache: Arc<ResponseCache>,
) -> Arc<CatalogStore> {
    let builder = SchemaCatalogBuilder::new()
        .with_retries(config.metadata_retries, Duration::from_millis(250));
    Arc::new(CatalogStore::new(metadata, builder, cache, config.schema_ttl))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::from_env()?;

    let cache = Arc::new(ResponseCache::new(config.schema_ttl));
    let snapshot = config.cache_snapshot_path();
    if let Some(path) = &snapshot {
        cache.seed_from_snapshot(path);
    }

    match args.command {
        Command::Schema { fixture } => {
            let metadata = metadata_source(&config, fixture.as_ref()).await?;
            let store = catalog_store(&config, metadata, cache.clone());
            let catalog = store.catalog().await?;
            println!(
                "Source {} (version {}, {:?} schema)",
                catalog.source_id,
                catalog.version,
                catalog.schema_shape()
            );
            for table in &catalog.tables {
                println!(
                    "  {:<24} {:<10} {:?} confidence, rows {}",
                    table.name,
                    table.classification.to_string(),
                    table.confidence,
                    table.row_count.map_or("?".to_string(), |n| n.to_string())
                );
            }
            for rel in &catalog.relationships {
                println!("  {}", rel);
            }
            let areas = catalog.business_areas();
            if !areas.is_empty() {
                println!("Business areas: {}", areas.join(", "));
            }
            for pattern in catalog.suggested_patterns() {
                println!("  * {}", pattern);
            }
        }
        Command::Ask {
            question,
            fixture,
            attested,
            report_dir,
        } => {
            let flavor = config.relational_flavor()?;
            let sources = sources(&config, fixture.as_ref()).await?;
            let api_key = config.require("OPENAI_API_KEY", &config.openai_api_key)?;
            let llm = LlmClient::new(api_key.to_string())
                .with_base_url(config.openai_base_url.clone())
                .with_model(config.openai_model.clone())
                .with_temperature(config.llm_temperature)
                .with_timeout(config.llm_timeout);
            let extractor = IntentExtractor::new(Arc::new(llm), cache.clone())
                .with_resolver(EntityResolver::new(config.similarity_threshold))
                .with_timeout(config.llm_timeout);

            let mut pipeline = QueryPipeline::new(
                catalog_store(&config, sources.metadata, cache.clone()),
                extractor,
                QueryTemplateEngine::new(flavor),
                sources.relational,
                sources.multidimensional,
            )
            .with_max_outstanding(config.max_outstanding_calls)
            .with_execution_timeout(config.execution_timeout);
            if let Some(dir) = report_dir.or_else(|| config.report_dir.clone()) {
                pipeline = pipeline.with_report_dir(dir);
            }

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling the run");
                    on_ctrl_c.cancel();
                }
            });

            let options = attested
                .into_iter()
                .fold(RunOptions::default().with_cancel(cancel), RunOptions::attest);
            let outcome = pipeline.run(&question, options).await;
            save_snapshot(&cache, snapshot.as_ref());
            let outcome = outcome?;

            println!("Pattern: {}", outcome.query_pair.pattern_used);
            for query in [&outcome.query_pair.relational, &outcome.query_pair.multidimensional] {
                println!("\n--- {} ---\n{}", query.dialect, query.text);
            }
            for result in [&outcome.relational, &outcome.multidimensional] {
                match &result.error_detail {
                    None => println!(
                        "\n{}: {} rows in {}ms",
                        result.engine,
                        result.row_count(),
                        result.elapsed_ms
                    ),
                    Some(e) => println!(
                        "\n{}: failed after {}ms: {}",
                        result.engine, result.elapsed_ms, e
                    ),
                }
            }
            println!("\n=== Reconciliation ===");
            println!("{}", serde_json::to_string_pretty(&outcome.reconciliation)?);
            if !outcome.reconciliation.is_match() {
                return Err(anyhow!(
                    "results diverge: {:?}",
                    outcome.reconciliation.divergence_cause
                ));
            }
        }
    }
    Ok(())
}

fn save_snapshot(cache: &ResponseCache, path: Option<&PathBuf>) {
    if let Some(path) = path {
        if let Err(e) = cache.save_snapshot(path) {
            warn!("Could not save cache snapshot: {}", e);
        }
    }
}
