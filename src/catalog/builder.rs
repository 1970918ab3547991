//! Schema Catalog Builder
//!
//! Turns raw provider metadata into a classified `SchemaCatalog`:
//! 1. Group columns per table, merge FK annotations
//! 2. Keep only relationships whose endpoints exist (dangling ones degrade confidence)
//! 3. Classify each table exactly once (Fact / Lookup / Dimension / Unknown)
//! 4. Tag business concepts from the keyword table
//! 5. Derive a content-hash version

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{info, warn};

use super::concepts::concepts_for;
use super::{
    Classification, ColumnInfo, ColumnKey, Confidence, DataType, Relationship, SchemaCatalog,
    TableInfo,
};
use crate::error::{QueryBridgeError, Result};
use crate::metadata::{MetadataProvider, MetadataSnapshot};

pub struct SchemaCatalogBuilder {
    /// Upper bound (inclusive) for a table to count as "small" for Lookup.
    pub lookup_max_rows: u64,
    pub metadata_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for SchemaCatalogBuilder {
    fn default() -> Self {
        Self {
            lookup_max_rows: 1_000,
            metadata_retries: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl SchemaCatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.metadata_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    /// Fetch metadata (retrying transient failures) and build the catalog.
    pub async fn build(&self, provider: &dyn MetadataProvider) -> Result<SchemaCatalog> {
        let source_id = provider.source_id();
        let mut attempt = 0;
        let snapshot = loop {
            match provider.fetch().await {
                Ok(snapshot) => break snapshot,
                Err(e) if e.is_transient() && attempt < self.metadata_retries => {
                    attempt += 1;
                    warn!(
                        "Metadata fetch for {} failed ({}), retry {}/{}",
                        source_id, e, attempt, self.metadata_retries
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(QueryBridgeError::SchemaDiscovery(e.to_string())),
            }
        };
        self.build_from_snapshot(&source_id, &snapshot)
    }

    pub fn build_from_snapshot(
        &self,
        source_id: &str,
        snapshot: &MetadataSnapshot,
    ) -> Result<SchemaCatalog> {
        if snapshot.rows.is_empty() {
            return Err(QueryBridgeError::SchemaDiscovery(format!(
                "source '{}' returned no tables",
                source_id
            )));
        }

        // table -> ordered columns; repeated rows for one column merge FK refs
        let mut order: Vec<String> = Vec::new();
        let mut grouped: BTreeMap<String, Vec<ColumnInfo>> = BTreeMap::new();
        for row in &snapshot.rows {
            let columns = grouped.entry(row.table.clone()).or_insert_with(|| {
                order.push(row.table.clone());
                Vec::new()
            });
            let reference = row.foreign_key_refs.first().cloned();
            match columns.iter_mut().find(|c| c.name == row.column) {
                Some(existing) => {
                    existing.is_key |= row.is_primary_key;
                    if existing.references.is_none() {
                        existing.references = reference;
                    }
                }
                None => columns.push(ColumnInfo {
                    name: row.column.clone(),
                    data_type: DataType::from_sql(&row.data_type),
                    nullable: row.nullable,
                    is_key: row.is_primary_key,
                    references: reference,
                    business_concepts: concepts_for(&row.column),
                }),
            }
        }

        let mut relationships = BTreeSet::new();
        let mut dangling = 0usize;
        for (table, columns) in grouped.iter_mut() {
            for column in columns.iter_mut() {
                let Some(target) = column.references.clone() else {
                    continue;
                };
                let exists = snapshot
                    .rows
                    .iter()
                    .any(|r| r.table == target.table && r.column == target.column);
                if exists {
                    relationships.insert(Relationship::new(
                        table.clone(),
                        column.name.clone(),
                        target.table,
                        target.column,
                    ));
                } else {
                    warn!("Dropping dangling foreign key {}.{} -> {}", table, column.name, target);
                    column.references = None;
                    dangling += 1;
                }
            }
        }
        let has_fk_metadata = !relationships.is_empty();

        let tables: Vec<TableInfo> = order
            .into_iter()
            .filter_map(|name| grouped.remove(&name).map(|cols| (name, cols)))
            .map(|(name, columns)| {
                let row_count = snapshot.row_counts.get(&name).copied();
                let classification = self.classify(&columns, row_count);
                let confidence = if classification == Classification::Unknown
                    || row_count.is_none()
                    || !has_fk_metadata
                    || dangling > 0
                {
                    Confidence::Low
                } else {
                    Confidence::High
                };
                let mut business_concepts = concepts_for(&name);
                for column in &columns {
                    business_concepts.extend(column.business_concepts.iter().cloned());
                }
                TableInfo {
                    name,
                    columns,
                    classification,
                    confidence,
                    business_concepts,
                    row_count,
                }
            })
            .collect();

        let relationships: Vec<Relationship> = relationships.into_iter().collect();
        let version = catalog_version(&tables, &relationships);
        info!(
            "Built schema catalog for {}: {} tables, {} relationships (version {})",
            source_id,
            tables.len(),
            relationships.len(),
            version
        );

        Ok(SchemaCatalog {
            source_id: source_id.to_string(),
            tables,
            relationships,
            version,
            fetched_at: Utc::now(),
        })
    }

    /// Structural classification. Lookup is tested before Dimension because
    /// a key/value table also satisfies the dimension rule.
    pub fn classify(&self, columns: &[ColumnInfo], row_count: Option<u64>) -> Classification {
        let primary_key = columns.iter().filter(|c| c.is_key).count();
        let foreign_keys = columns.iter().filter(|c| c.references.is_some()).count();
        let value_columns: Vec<&ColumnInfo> = columns
            .iter()
            .filter(|c| !c.is_key && c.references.is_none())
            .collect();

        if foreign_keys >= 2 && value_columns.iter().any(|c| c.data_type.is_numeric()) {
            return Classification::Fact;
        }

        let small = row_count.map_or(false, |n| n <= self.lookup_max_rows);
        if primary_key == 1 && foreign_keys == 0 && value_columns.len() == 1 && small {
            return Classification::Lookup;
        }

        let descriptive = value_columns.iter().filter(|c| c.data_type.is_descriptive()).count();
        if primary_key == 1 && !value_columns.is_empty() && descriptive * 2 >= value_columns.len() {
            return Classification::Dimension;
        }

        Classification::Unknown
    }
}

fn catalog_version(tables: &[TableInfo], relationships: &[Relationship]) -> String {
    let mut hasher = Sha256::new();
    let mut sorted: Vec<&TableInfo> = tables.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for table in sorted {
        hasher.update(table.name.as_bytes());
        hasher.update([0u8]);
        for column in &table.columns {
            hasher.update(column.name.as_bytes());
            let shape = format!("{:?}|{}|{}", column.data_type, column.is_key, column.nullable);
            hasher.update(shape.as_bytes());
            if let Some(ColumnKey { table, column }) = &column.references {
                hasher.update(format!("->{}.{}", table, column).as_bytes());
            }
            hasher.update([1u8]);
        }
    }
    for rel in relationships {
        hasher.update(rel.to_string().as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::credit_snapshot;
    use crate::metadata::{MetadataError, MetadataRow};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_every_table_classified_once() {
        let catalog = SchemaCatalogBuilder::new()
            .build_from_snapshot("test", &credit_snapshot())
            .unwrap();
        let classes: BTreeMap<&str, Classification> = catalog
            .tables
            .iter()
            .map(|t| (t.name.as_str(), t.classification))
            .collect();
        assert_eq!(classes.len(), catalog.tables.len());
        assert_eq!(classes["facility"], Classification::Fact);
        assert_eq!(classes["customer"], Classification::Dimension);
        assert_eq!(classes["country"], Classification::Lookup);
        assert_eq!(classes["currency"], Classification::Lookup);
    }

    #[test]
    fn test_relationships_reference_existing_columns() {
        let catalog = SchemaCatalogBuilder::new()
            .build_from_snapshot("test", &credit_snapshot())
            .unwrap();
        for rel in &catalog.relationships {
            assert!(catalog.has_column(&rel.from_table, &rel.from_column), "{}", rel);
            assert!(catalog.has_column(&rel.to_table, &rel.to_column), "{}", rel);
        }
        assert_eq!(catalog.relationships.len(), 3);
    }

    #[test]
    fn test_dangling_foreign_key_degrades_confidence() {
        let mut snapshot = credit_snapshot();
        snapshot.rows.push(MetadataRow {
            table: "facility".to_string(),
            column: "branch_key".to_string(),
            data_type: "int".to_string(),
            nullable: true,
            is_primary_key: false,
            foreign_key_refs: vec![ColumnKey::new("branch", "branch_key")],
        });
        let catalog = SchemaCatalogBuilder::new().build_from_snapshot("test", &snapshot).unwrap();
        assert_eq!(catalog.relationships.len(), 3);
        assert!(catalog.tables.iter().all(|t| t.confidence == Confidence::Low));
        assert!(catalog.column("facility", "branch_key").unwrap().references.is_none());
    }

    #[test]
    fn test_missing_fk_annotations_still_builds() {
        let mut snapshot = credit_snapshot();
        for row in snapshot.rows.iter_mut() {
            row.foreign_key_refs.clear();
        }
        let catalog = SchemaCatalogBuilder::new().build_from_snapshot("test", &snapshot).unwrap();
        assert!(catalog.relationships.is_empty());
        // No FKs means no fact; the table is still usable, only unclassified.
        assert_eq!(catalog.table("facility").unwrap().classification, Classification::Unknown);
    }

    #[test]
    fn test_version_stable_for_unchanged_schema() {
        let builder = SchemaCatalogBuilder::new();
        let a = builder.build_from_snapshot("test", &credit_snapshot()).unwrap();
        let b = builder.build_from_snapshot("test", &credit_snapshot()).unwrap();
        assert_eq!(a.version, b.version);

        let mut changed = credit_snapshot();
        changed.rows.pop();
        let c = builder.build_from_snapshot("test", &changed).unwrap();
        assert_ne!(a.version, c.version);
    }

    #[test]
    fn test_business_concepts_tagged() {
        let catalog = SchemaCatalogBuilder::new()
            .build_from_snapshot("test", &credit_snapshot())
            .unwrap();
        let customer = catalog.table("customer").unwrap();
        assert!(customer.business_concepts.contains("customer"));
        assert!(customer.business_concepts.contains("industry"));
        assert!(catalog.table("country").unwrap().business_concepts.contains("geography"));
    }

    struct FlakyProvider {
        failures_left: AtomicU32,
        error: MetadataError,
    }

    #[async_trait]
    impl MetadataProvider for FlakyProvider {
        fn source_id(&self) -> String {
            "flaky".to_string()
        }

        async fn fetch(&self) -> std::result::Result<MetadataSnapshot, MetadataError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(credit_snapshot())
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = FlakyProvider {
            failures_left: AtomicU32::new(2),
            error: MetadataError::Unreachable("connection reset".to_string()),
        };
        let builder = SchemaCatalogBuilder::new().with_retries(3, Duration::from_millis(1));
        let catalog = builder.build(&provider).await.unwrap();
        assert_eq!(catalog.source_id, "flaky");
    }

    #[tokio::test]
    async fn test_access_denied_is_fatal() {
        let provider = FlakyProvider {
            failures_left: AtomicU32::new(1),
            error: MetadataError::AccessDenied("permission denied for schema sales".to_string()),
        };
        let builder = SchemaCatalogBuilder::new().with_retries(3, Duration::from_millis(1));
        let err = builder.build(&provider).await.unwrap_err();
        assert!(matches!(
            err,
            QueryBridgeError::SchemaDiscovery(ref m) if m.contains("permission denied")
        ));
    }
}
