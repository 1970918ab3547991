//! Environment configuration
//!
//! Values come from the process environment after `.env` is loaded. Unset
//! keys fall back to defaults; set-but-invalid keys are an error.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::compiler::SqlFlavor;
use crate::error::{QueryBridgeError, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub llm_temperature: f32,
    pub database_url: Option<String>,
    pub database_schema: String,
    pub powerbi_api_base: String,
    pub powerbi_dataset_id: Option<String>,
    pub powerbi_access_token: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
    pub schema_ttl: Duration,
    pub similarity_threshold: f64,
    pub max_outstanding_calls: usize,
    pub llm_timeout: Duration,
    pub execution_timeout: Duration,
    pub metadata_retries: u32,
    pub sql_flavor: SqlFlavor,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            llm_temperature: 0.0,
            database_url: None,
            database_schema: "public".to_string(),
            powerbi_api_base: "https://api.powerbi.com/v1.0/myorg".to_string(),
            powerbi_dataset_id: None,
            powerbi_access_token: None,
            cache_dir: None,
            report_dir: None,
            schema_ttl: Duration::from_secs(24 * 60 * 60),
            similarity_threshold: 0.85,
            max_outstanding_calls: 8,
            llm_timeout: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(120),
            metadata_retries: 3,
            sql_flavor: SqlFlavor::Ansi,
        }
    }
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let similarity_threshold = match get("QUERYBRIDGE_SIMILARITY_THRESHOLD") {
            Some(raw) => parse::<f64>("QUERYBRIDGE_SIMILARITY_THRESHOLD", &raw)?,
            None => defaults.similarity_threshold,
        };
        if !(similarity_threshold > 0.0 && similarity_threshold <= 1.0) {
            return Err(QueryBridgeError::Config(format!(
                "QUERYBRIDGE_SIMILARITY_THRESHOLD must be in (0, 1], got {}",
                similarity_threshold
            )));
        }
        let max_outstanding_calls = match get("QUERYBRIDGE_MAX_OUTSTANDING_CALLS") {
            Some(raw) => parse::<usize>("QUERYBRIDGE_MAX_OUTSTANDING_CALLS", &raw)?,
            None => defaults.max_outstanding_calls,
        };
        if max_outstanding_calls == 0 {
            return Err(QueryBridgeError::Config(
                "QUERYBRIDGE_MAX_OUTSTANDING_CALLS must be at least 1".to_string(),
            ));
        }
        let llm_temperature = match get("LLM_TEMPERATURE") {
            Some(raw) => parse::<f32>("LLM_TEMPERATURE", &raw)?,
            None => defaults.llm_temperature,
        };
        if llm_temperature < 0.0 {
            return Err(QueryBridgeError::Config(
                "LLM_TEMPERATURE must not be negative".to_string(),
            ));
        }
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match get(key) {
                Some(raw) => Ok(Duration::from_secs(parse::<u64>(key, &raw)?)),
                None => Ok(default),
            }
        };

        Ok(Self {
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: get("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            llm_temperature,
            database_url: get("DATABASE_URL"),
            database_schema: get("DATABASE_SCHEMA").unwrap_or(defaults.database_schema),
            powerbi_api_base: get("POWERBI_API_BASE").unwrap_or(defaults.powerbi_api_base),
            powerbi_dataset_id: get("POWERBI_DATASET_ID"),
            powerbi_access_token: get("POWERBI_ACCESS_TOKEN"),
            cache_dir: get("QUERYBRIDGE_CACHE_DIR").map(PathBuf::from),
            report_dir: get("QUERYBRIDGE_REPORT_DIR").map(PathBuf::from),
            schema_ttl: secs("QUERYBRIDGE_SCHEMA_TTL_SECS", defaults.schema_ttl)?,
            similarity_threshold,
            max_outstanding_calls,
            llm_timeout: secs("QUERYBRIDGE_LLM_TIMEOUT_SECS", defaults.llm_timeout)?,
            execution_timeout: secs(
                "QUERYBRIDGE_EXECUTION_TIMEOUT_SECS",
                defaults.execution_timeout,
            )?,
            metadata_retries: match get("QUERYBRIDGE_METADATA_RETRIES") {
                Some(raw) => parse::<u32>("QUERYBRIDGE_METADATA_RETRIES", &raw)?,
                None => defaults.metadata_retries,
            },
            sql_flavor: match get("QUERYBRIDGE_SQL_FLAVOR") {
                Some(raw) => raw.parse()?,
                None => defaults.sql_flavor,
            },
        })
    }

    /// Where the response cache snapshot lives, if caching to disk is on.
    pub fn cache_snapshot_path(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join("response_cache.json"))
    }

    /// Flavor for the relational adapters in this build. PostgreSQL (and
    /// SQLite for fixtures) only run ANSI SQL; T-SQL text is compiled but
    /// has nowhere to run.
    pub fn relational_flavor(&self) -> Result<SqlFlavor> {
        match self.sql_flavor {
            SqlFlavor::Ansi => Ok(SqlFlavor::Ansi),
            other => Err(QueryBridgeError::Config(format!(
                "QUERYBRIDGE_SQL_FLAVOR={} has no relational adapter; \
                 PostgreSQL and SQLite run ansi",
                other
            ))),
        }
    }

    pub fn require<'a>(&self, key: &str, value: &'a Option<String>) -> Result<&'a str> {
        value
            .as_deref()
            .ok_or_else(|| QueryBridgeError::Config(format!("{} is not set", key)))
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| QueryBridgeError::Config(format!("invalid {} '{}': {}", key, raw, e)))
}
