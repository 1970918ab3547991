//! Power BI `executeQueries` adapter
//!
//! Posts DAX to the dataset REST endpoint. Errors can come back as an HTTP
//! status or inside a 200 body; both keep the service message verbatim.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use super::{EngineKind, ExecutionAdapter, RowSet};
use crate::compiler::CompiledQuery;
use crate::error::ExecutionError;

const ENGINE: EngineKind = EngineKind::Multidimensional;

pub struct PowerBiAdapter {
    http: reqwest::Client,
    api_base: String,
    dataset_id: String,
    access_token: String,
    timeout: Duration,
}

impl PowerBiAdapter {
    pub fn new(dataset_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: "https://api.powerbi.com/v1.0/myorg".to_string(),
            dataset_id: dataset_id.into(),
            access_token: access_token.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/datasets/{}/executeQueries", self.api_base, self.dataset_id)
    }
}

fn request_body(dax: &str) -> Value {
    json!({
        "queries": [{"query": dax}],
        "serializerSettings": {"includeNulls": true}
    })
}

/// Maps a non-success HTTP status.
pub fn classify_status(status: StatusCode, body: &str) -> ExecutionError {
    let message = format!("HTTP {}: {}", status.as_u16(), body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExecutionError::denied(ENGINE, message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ExecutionError::timeout(ENGINE, message)
        }
        StatusCode::BAD_REQUEST => ExecutionError::rejected(ENGINE, message),
        _ => ExecutionError::failed(ENGINE, message),
    }
}

/// Extract the first table of the first result, or the error it carries.
pub fn parse_execute_queries(
    body: &Value,
    columns: &[String],
) -> std::result::Result<RowSet, ExecutionError> {
    if let Some(error) = body.get("error") {
        return Err(ExecutionError::rejected(ENGINE, error.to_string()));
    }
    let result = &body["results"][0];
    if let Some(error) = result.get("error") {
        return Err(ExecutionError::rejected(ENGINE, error.to_string()));
    }
    let Some(rows) = result["tables"][0]["rows"].as_array() else {
        let message = format!("no result table in response: {}", body);
        return Err(ExecutionError::failed(ENGINE, message));
    };
    let objects: Vec<Map<String, Value>> = rows
        .iter()
        .filter_map(|r| r.as_object().cloned())
        .collect();
    Ok(RowSet::from_objects(columns, &objects))
}

#[async_trait]
impl ExecutionAdapter for PowerBiAdapter {
    fn engine(&self) -> EngineKind {
        ENGINE
    }

    fn name(&self) -> &str {
        "powerbi"
    }

    async fn execute(&self, query: &CompiledQuery) -> std::result::Result<RowSet, ExecutionError> {
        debug!("Executing DAX against dataset {}:\n{}", self.dataset_id, query.text);
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.access_token)
            .timeout(self.timeout)
            .json(&request_body(&query.text))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutionError::timeout(ENGINE, e.to_string())
                } else {
                    ExecutionError::failed(ENGINE, e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutionError::failed(ENGINE, e.to_string()))?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        let body: Value = serde_json::from_str(text.trim_start_matches('\u{feff}'))
            .map_err(|e| ExecutionError::failed(ENGINE, format!("undecodable response: {}", e)))?;
        parse_execute_queries(&body, &query.output_columns)
    }
}
