//! Metadata providers - structural metadata consumed by the catalog builder

pub mod postgres;

pub use postgres::PostgresMetadataProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::catalog::ColumnKey;

/// One column as reported by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRow {
    pub table: String,
    pub column: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    #[serde(default)]
    pub foreign_key_refs: Vec<ColumnKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub rows: Vec<MetadataRow>,
    /// Row counts or estimates; tables missing here have an unknown count.
    #[serde(default)]
    pub row_counts: BTreeMap<String, u64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetadataError {
    #[error("metadata source unreachable: {0}")]
    Unreachable(String),

    #[error("metadata access denied: {0}")]
    AccessDenied(String),

    #[error("malformed metadata: {0}")]
    Malformed(String),
}

impl MetadataError {
    /// Only connectivity failures are worth retrying; reads are idempotent.
    pub fn is_transient(&self) -> bool {
        matches!(self, MetadataError::Unreachable(_))
    }
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Stable identifier of the source, used in cache keys.
    fn source_id(&self) -> String;

    async fn fetch(&self) -> std::result::Result<MetadataSnapshot, MetadataError>;
}
