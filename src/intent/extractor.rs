//! Intent Extractor - question text to a validated `Intent`
//!
//! 1. Prompt the completion service with the catalog summary
//! 2. Parse the reply into a strict `RawIntent` (unknown fields rejected)
//! 3. On a structural failure, retry once with the error as corrective context
//! 4. Resolve every name against the catalog; misses go to `unresolved_entities`
//!
//! Results are cached per (question, schema version).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Aggregation, Filter, FilterOp, FilterValue, Intent, Sort, SortTarget};
use super::resolver::EntityResolver;
use crate::cache::{CacheKey, CacheKind, ResponseCache};
use crate::catalog::SchemaCatalog;
use crate::error::{QueryBridgeError, Result};
use crate::llm::{ChatMessage, CompletionError, CompletionService};

/// Reply shape demanded from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawIntent {
    pub measure: Option<String>,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub filters: Vec<RawFilter>,
    #[serde(default)]
    pub sort: Option<RawSort>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub subject: Option<String>,
    /// Terms the model itself could not map to the schema.
    #[serde(default)]
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSort {
    /// `"measure"` or a column name.
    pub by: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Intent(RawIntent),
    Failure(String),
}

impl RawIntent {
    fn validate(&self) -> std::result::Result<(), String> {
        match self.aggregation {
            Aggregation::Sum | Aggregation::Avg if self.measure.is_none() => {
                return Err(format!("aggregation '{}' requires a measure column", self.aggregation));
            }
            Aggregation::None if self.measure.is_none() && self.group_by.is_empty() => {
                return Err("a row listing needs at least one column in group_by".to_string());
            }
            _ => {}
        }
        if self.limit == Some(0) {
            return Err("limit must be positive".to_string());
        }
        for filter in &self.filters {
            let is_list = matches!(filter.value, FilterValue::List(_));
            if filter.op == FilterOp::In && !is_list {
                return Err(format!("filter on '{}' uses 'in' without a list value", filter.column));
            }
            if filter.op != FilterOp::In && is_list {
                return Err(format!(
                    "filter on '{}' has a list value but op is not 'in'",
                    filter.column
                ));
            }
            if filter.column.trim().is_empty() {
                return Err("filter column must not be empty".to_string());
            }
        }
        if let Some(sort) = &self.sort {
            if sort.by.trim().is_empty() {
                return Err("sort.by must not be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Parse a model reply. Markdown code fences are tolerated, anything else
/// that is not exactly a `RawIntent` is a failure.
pub fn parse_response(text: &str) -> ParseOutcome {
    let body = strip_code_fence(text);
    match serde_json::from_str::<RawIntent>(body) {
        Ok(raw) => match raw.validate() {
            Ok(()) => ParseOutcome::Intent(raw),
            Err(message) => ParseOutcome::Failure(message),
        },
        Err(e) => ParseOutcome::Failure(format!("response is not a valid intent object: {}", e)),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub struct IntentExtractor {
    llm: Arc<dyn CompletionService>,
    cache: Arc<ResponseCache>,
    resolver: EntityResolver,
    call_timeout: Duration,
}

impl IntentExtractor {
    pub fn new(llm: Arc<dyn CompletionService>, cache: Arc<ResponseCache>) -> Self {
        Self {
            llm,
            cache,
            resolver: EntityResolver::default(),
            call_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_resolver(mut self, resolver: EntityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub async fn extract(&self, question: &str, catalog: &SchemaCatalog) -> Result<Intent> {
        let key = CacheKey::new(CacheKind::IntentExtraction, question, &catalog.version);
        let intent: Intent = self
            .cache
            .get_or_try_insert_with(&key, || self.extract_uncached(question, catalog))
            .await?;
        if !intent.is_resolved() {
            info!("Intent has unresolved entities: {:?}", intent.unresolved_entities);
        }
        Ok(intent)
    }

    async fn extract_uncached(&self, question: &str, catalog: &SchemaCatalog) -> Result<Intent> {
        let mut messages = vec![
            ChatMessage::system(build_prompt(catalog)),
            ChatMessage::user(question.to_string()),
        ];
        let first = self.call(&messages).await?;
        let raw = match parse_response(&first) {
            ParseOutcome::Intent(raw) => raw,
            ParseOutcome::Failure(message) => {
                warn!("Intent response failed validation ({}), retrying once", message);
                messages.push(ChatMessage::assistant(first));
                messages.push(ChatMessage::user(format!(
                    "Your previous reply was rejected: {}. \
                     Reply again with only the JSON object in the required format.",
                    message
                )));
                let second = self.call(&messages).await?;
                match parse_response(&second) {
                    ParseOutcome::Intent(raw) => raw,
                    ParseOutcome::Failure(message) => {
                        return Err(QueryBridgeError::IntentParse {
                            message,
                            last_response: Some(second),
                        });
                    }
                }
            }
        };
        let intent = self.resolve(raw, catalog);
        debug!("Extracted intent: {:?}", intent);
        Ok(intent)
    }

    async fn call(&self, messages: &[ChatMessage]) -> Result<String> {
        match tokio::time::timeout(self.call_timeout, self.llm.complete(messages)).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(CompletionError::Timeout(format!(
                "no reply from {} within {:?}",
                self.llm.model(),
                self.call_timeout
            ))
            .into()),
        }
    }

    /// Map raw names onto catalog columns. Nothing below the similarity
    /// threshold is guessed; it is reported instead.
    pub fn resolve(&self, raw: RawIntent, catalog: &SchemaCatalog) -> Intent {
        let mut unresolved: Vec<String> = raw.unresolved.clone();
        let mut column = |name: &str| match self.resolver.resolve_column(catalog, name) {
            Some(c) => Some(c),
            None => {
                if !unresolved.iter().any(|u| u == name) {
                    unresolved.push(name.to_string());
                }
                None
            }
        };

        let measure = match raw.measure.as_deref() {
            None | Some("*") => None,
            Some(name) => column(name),
        };
        let group_by = raw.group_by.iter().filter_map(|g| column(g.as_str())).collect();
        let filters = raw
            .filters
            .into_iter()
            .filter_map(|f| {
                column(f.column.as_str()).map(|c| Filter {
                    column: c,
                    op: f.op,
                    value: f.value,
                })
            })
            .collect();
        let sort = raw.sort.and_then(|s| {
            let by = if s.by.eq_ignore_ascii_case("measure") {
                SortTarget::Measure
            } else {
                SortTarget::Column(column(s.by.as_str())?)
            };
            Some(Sort {
                by,
                descending: s.descending,
            })
        });
        let subject = raw.subject.as_deref().and_then(|name| {
            match self.resolver.resolve_table(catalog, name) {
                Some(table) => Some(table.name.clone()),
                None => {
                    unresolved.push(name.to_string());
                    None
                }
            }
        });

        Intent {
            measure,
            aggregation: raw.aggregation,
            group_by,
            filters,
            sort,
            limit: raw.limit,
            subject,
            unresolved_entities: unresolved,
        }
    }
}

pub fn build_prompt(catalog: &SchemaCatalog) -> String {
    format!(
        r#"You translate business questions into a structured query intent over this schema:

{}
Return ONLY a JSON object with exactly these fields:
{{
  "measure": "table.column" or null,
  "aggregation": "sum" | "count" | "avg" | "none",
  "group_by": ["table.column", ...],
  "filters": [{{"column": "table.column", "op": "=" | "!=" | ">" | ">=" | "<" | "<=" | "in" | "contains", "value": <string, number, boolean, or list for "in">}}],
  "sort": {{"by": "measure" or "table.column", "descending": true}} or null,
  "limit": <positive integer> or null,
  "subject": "table whose rows are counted or listed" or null,
  "unresolved": ["terms from the question that match nothing in the schema"]
}}

Use only tables and columns listed above. Never invent a column: put the term in "unresolved" instead.
For "none" aggregation, group_by lists the columns to return."#,
        catalog.prompt_summary()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::credit_catalog;
    use crate::catalog::ColumnKey;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedLlm {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
        ) -> std::result::Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CompletionError::Transport("script exhausted".to_string()))
        }
    }

    const SUM_BY_INDUSTRY: &str = r#"{
        "measure": "facility.limit_amount",
        "aggregation": "sum",
        "group_by": ["customer.industry"]
    }"#;

    #[test]
    fn test_parse_rejects_unknown_fields_and_bad_shapes() {
        assert!(matches!(parse_response(SUM_BY_INDUSTRY), ParseOutcome::Intent(_)));
        assert!(matches!(
            parse_response(r#"{"measure": "x", "aggregation": "sum", "sql": "SELECT 1"}"#),
            ParseOutcome::Failure(_)
        ));
        assert!(matches!(
            parse_response(r#"{"measure": null, "aggregation": "sum"}"#),
            ParseOutcome::Failure(_)
        ));
        assert!(matches!(parse_response("Sure! Here is the intent."), ParseOutcome::Failure(_)));
        let fenced = format!("```json\n{}\n```", SUM_BY_INDUSTRY);
        assert!(matches!(parse_response(&fenced), ParseOutcome::Intent(_)));
    }

    #[tokio::test]
    async fn test_extracts_and_resolves_intent() {
        let llm = ScriptedLlm::new(&[SUM_BY_INDUSTRY]);
        let extractor = IntentExtractor::new(llm.clone(), Arc::new(ResponseCache::default()));
        let intent = extractor
            .extract("Total limit by industry", &credit_catalog())
            .await
            .unwrap();
        assert_eq!(intent.measure, Some(ColumnKey::new("facility", "limit_amount")));
        assert_eq!(intent.group_by, vec![ColumnKey::new("customer", "industry")]);
        assert!(intent.is_resolved());
    }

    #[tokio::test]
    async fn test_one_corrective_retry() {
        let llm = ScriptedLlm::new(&["not json", SUM_BY_INDUSTRY]);
        let extractor = IntentExtractor::new(llm.clone(), Arc::new(ResponseCache::default()));
        let intent = extractor.extract("Total limit by industry", &credit_catalog()).await;
        assert!(intent.is_ok());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_failure_is_intent_parse_error() {
        let llm = ScriptedLlm::new(&["not json", "{\"still\": \"wrong\"}", SUM_BY_INDUSTRY]);
        let extractor = IntentExtractor::new(llm.clone(), Arc::new(ResponseCache::default()));
        let err = extractor
            .extract("Total limit by industry", &credit_catalog())
            .await
            .unwrap_err();
        match err {
            QueryBridgeError::IntentParse { last_response, .. } => {
                assert_eq!(last_response.as_deref(), Some("{\"still\": \"wrong\"}"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_question_hits_cache() {
        let llm = ScriptedLlm::new(&[SUM_BY_INDUSTRY]);
        let extractor = IntentExtractor::new(llm.clone(), Arc::new(ResponseCache::default()));
        let catalog = credit_catalog();
        let a = extractor.extract("Total limit by industry", &catalog).await.unwrap();
        let b = extractor.extract("total limit by  industry", &catalog).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_column_is_reported_not_guessed() {
        let llm = ScriptedLlm::new(&[
            r#"{
                "measure": "facility.revenue_growth",
                "aggregation": "sum",
                "group_by": ["customer.industry"]
            }"#,
        ]);
        let extractor = IntentExtractor::new(llm, Arc::new(ResponseCache::default()));
        let intent = extractor
            .extract("Total revenue growth by industry", &credit_catalog())
            .await
            .unwrap();
        assert_eq!(intent.measure, None);
        assert_eq!(intent.unresolved_entities, vec!["facility.revenue_growth".to_string()]);
    }

    #[tokio::test]
    async fn test_slow_model_times_out() {
        struct SlowLlm;

        #[async_trait]
        impl CompletionService for SlowLlm {
            fn model(&self) -> &str {
                "slow"
            }

            async fn complete(
                &self,
                _messages: &[ChatMessage],
            ) -> std::result::Result<String, CompletionError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(String::new())
            }
        }

        let extractor = IntentExtractor::new(Arc::new(SlowLlm), Arc::new(ResponseCache::default()))
            .with_timeout(Duration::from_millis(20));
        let err = extractor.extract("anything", &credit_catalog()).await.unwrap_err();
        assert!(matches!(err, QueryBridgeError::Completion(ref m) if m.contains("timed out")));
    }
}
