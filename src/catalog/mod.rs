//! Schema Catalog - runtime-discovered, classified view of a data source
//!
//! The catalog is the only source of identifiers the compilers may emit.
//! Tables are classified (Fact / Dimension / Lookup / Unknown), tagged with
//! approximate business concepts, and linked by foreign-key relationships.

pub mod builder;
pub mod concepts;
pub mod graph;
pub mod store;

pub use builder::SchemaCatalogBuilder;
pub use graph::{JoinPath, RelationshipGraph};
pub use store::CatalogStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Fact,
    Dimension,
    Lookup,
    Unknown,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Fact => write!(f, "Fact"),
            Classification::Dimension => write!(f, "Dimension"),
            Classification::Lookup => write!(f, "Lookup"),
            Classification::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How much the classification can be trusted. Missing FK annotations or
/// row counts degrade it to `Low`, they never fail the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Decimal,
    Float,
    Text,
    Boolean,
    Date,
    Timestamp,
    Other(String),
}

impl DataType {
    /// Map a vendor type name (information_schema style) onto a portable type.
    pub fn from_sql(type_name: &str) -> Self {
        let lower = type_name.trim().to_lowercase();
        let base = lower.split('(').next().unwrap_or("").trim();
        match base {
            "int" | "integer" | "bigint" | "smallint" | "tinyint" | "int2" | "int4" | "int8"
            | "serial" | "bigserial" | "int64" => DataType::Integer,
            "decimal" | "numeric" | "money" | "smallmoney" => DataType::Decimal,
            "float" | "float4" | "float8" | "real" | "double" | "double precision"
            | "double_precision" => DataType::Float,
            "varchar" | "nvarchar" | "char" | "nchar" | "text" | "ntext" | "string"
            | "character varying" | "character" | "citext" => DataType::Text,
            "bit" | "bool" | "boolean" => DataType::Boolean,
            "date" => DataType::Date,
            _ if base.starts_with("timestamp") || base.starts_with("datetime") => {
                DataType::Timestamp
            }
            _ => DataType::Other(type_name.to_string()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Decimal | DataType::Float)
    }

    pub fn is_descriptive(&self) -> bool {
        matches!(self, DataType::Text | DataType::Boolean | DataType::Date | DataType::Timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnKey {
    pub table: String,
    pub column: String,
}

impl ColumnKey {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub is_key: bool,
    /// Target of a foreign key annotation, if any.
    #[serde(default)]
    pub references: Option<ColumnKey>,
    #[serde(default)]
    pub business_concepts: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub classification: Classification,
    pub confidence: Confidence,
    pub business_concepts: BTreeSet<String>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Vec<&ColumnInfo> {
        self.columns.iter().filter(|c| c.is_key).collect()
    }

    pub fn foreign_keys(&self) -> Vec<&ColumnInfo> {
        self.columns.iter().filter(|c| c.references.is_some()).collect()
    }
}

/// A foreign key edge: `from_table.from_column` references `to_table.to_column`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

impl Relationship {
    pub fn new(
        from_table: impl Into<String>,
        from_column: impl Into<String>,
        to_table: impl Into<String>,
        to_column: impl Into<String>,
    ) -> Self {
        Self {
            from_table: from_table.into(),
            from_column: from_column.into(),
            to_table: to_table.into(),
            to_column: to_column.into(),
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.from_table, self.from_column, self.to_table, self.to_column
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaShape {
    Star,
    Snowflake,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub source_id: String,
    pub tables: Vec<TableInfo>,
    pub relationships: Vec<Relationship>,
    pub version: String,
    pub fetched_at: DateTime<Utc>,
}

impl SchemaCatalog {
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Case-insensitive table lookup returning the canonical name.
    pub fn find_table(&self, name: &str) -> Option<&TableInfo> {
        self.table(name)
            .or_else(|| self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name)))
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnInfo> {
        self.table(table).and_then(|t| t.column(column))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column(table, column).is_some()
    }

    pub fn tables_of(&self, classification: Classification) -> Vec<&TableInfo> {
        self.tables
            .iter()
            .filter(|t| t.classification == classification)
            .collect()
    }

    pub fn relationships_from<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a Relationship> + 'a {
        self.relationships.iter().filter(move |r| r.from_table == table)
    }

    pub fn graph(&self) -> RelationshipGraph {
        RelationshipGraph::from_catalog(self)
    }

    /// Star when every relationship goes fact -> non-fact and no dimension
    /// references another; Snowflake when dimensions chain; Generic otherwise.
    pub fn schema_shape(&self) -> SchemaShape {
        let facts: BTreeSet<&str> = self
            .tables_of(Classification::Fact)
            .into_iter()
            .map(|t| t.name.as_str())
            .collect();
        if facts.is_empty() || self.relationships.is_empty() {
            return SchemaShape::Generic;
        }
        let dimension_chains = self
            .relationships
            .iter()
            .any(|r| {
                !facts.contains(r.from_table.as_str()) && !facts.contains(r.to_table.as_str())
            });
        let fact_to_fact = self
            .relationships
            .iter()
            .any(|r| facts.contains(r.from_table.as_str()) && facts.contains(r.to_table.as_str()));
        if fact_to_fact {
            SchemaShape::Generic
        } else if dimension_chains {
            SchemaShape::Snowflake
        } else {
            SchemaShape::Star
        }
    }

    /// Business concepts ranked by how many tables carry them.
    pub fn business_areas(&self) -> Vec<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for table in &self.tables {
            for concept in &table.business_concepts {
                *counts.entry(concept.as_str()).or_default() += 1;
            }
        }
        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked.into_iter().map(|(c, _)| c.to_string()).collect()
    }

    pub fn suggested_patterns(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        let areas = self.business_areas();
        if !self.tables_of(Classification::Fact).is_empty()
            && !self.tables_of(Classification::Dimension).is_empty()
        {
            patterns.push(
                "Fact-dimension analysis: aggregate fact measures by dimension attributes".to_string(),
            );
        }
        for (concept, text) in [
            ("customer", "Customer analysis: counts and exposure per customer attribute"),
            ("geography", "Geographic analysis: distribution by country or region"),
            ("currency", "Currency exposure: totals per currency"),
            ("risk", "Risk analysis: exposure by rating or risk class"),
        ] {
            if areas.iter().any(|a| a == concept) {
                patterns.push(text.to_string());
            }
        }
        patterns
    }

    /// Compact textual summary handed to the language model.
    pub fn prompt_summary(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            let concepts = if table.business_concepts.is_empty() {
                String::new()
            } else {
                format!(
                    " [{}]",
                    table.business_concepts.iter().cloned().collect::<Vec<_>>().join(", ")
                )
            };
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    let ty = match &c.data_type {
                        DataType::Other(raw) => raw.to_lowercase(),
                        other => format!("{:?}", other).to_lowercase(),
                    };
                    format!("{} {}", c.name, ty)
                })
                .collect();
            out.push_str(&format!(
                "{} ({}){}: {}\n",
                table.name,
                table.classification,
                concepts,
                columns.join(", ")
            ));
        }
        if !self.relationships.is_empty() {
            out.push_str("Relationships:\n");
            for rel in &self.relationships {
                out.push_str(&format!("- {}\n", rel));
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::metadata::{MetadataRow, MetadataSnapshot};

    fn row(table: &str, column: &str, ty: &str, pk: bool, fk: Option<(&str, &str)>) -> MetadataRow {
        MetadataRow {
            table: table.to_string(),
            column: column.to_string(),
            data_type: ty.to_string(),
            nullable: !pk,
            is_primary_key: pk,
            foreign_key_refs: fk.map(|(t, c)| ColumnKey::new(t, c)).into_iter().collect(),
        }
    }

    /// facility -> customer -> country, facility -> currency
    pub(crate) fn credit_snapshot() -> MetadataSnapshot {
        let rows = vec![
            row("facility", "facility_key", "int", true, None),
            row("facility", "customer_key", "int", false, Some(("customer", "customer_key"))),
            row("facility", "currency_key", "int", false, Some(("currency", "currency_key"))),
            row("facility", "limit_amount", "decimal(18,2)", false, None),
            row("facility", "status", "varchar", false, None),
            row("customer", "customer_key", "int", true, None),
            row("customer", "customer_name", "varchar", false, None),
            row("customer", "industry", "varchar", false, None),
            row("customer", "country_key", "int", false, Some(("country", "country_key"))),
            row("country", "country_key", "int", true, None),
            row("country", "country_name", "varchar", false, None),
            row("currency", "currency_key", "int", true, None),
            row("currency", "currency_code", "char(3)", false, None),
        ];
        let mut row_counts = BTreeMap::new();
        row_counts.insert("facility".to_string(), 5000);
        row_counts.insert("customer".to_string(), 1200);
        row_counts.insert("country".to_string(), 40);
        row_counts.insert("currency".to_string(), 12);
        MetadataSnapshot { rows, row_counts }
    }

    pub(crate) fn credit_catalog() -> SchemaCatalog {
        SchemaCatalogBuilder::new()
            .build_from_snapshot("test", &credit_snapshot())
            .expect("fixture catalog builds")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::credit_catalog;
    use super::*;

    #[test]
    fn test_data_type_from_sql() {
        assert_eq!(DataType::from_sql("decimal(18,2)"), DataType::Decimal);
        assert_eq!(DataType::from_sql("character varying"), DataType::Text);
        assert_eq!(DataType::from_sql("timestamp with time zone"), DataType::Timestamp);
        assert!(DataType::from_sql("BIGINT").is_numeric());
        assert_eq!(DataType::from_sql("geography"), DataType::Other("geography".to_string()));
    }

    #[test]
    fn test_snowflake_shape_detected() {
        let catalog = credit_catalog();
        assert_eq!(catalog.schema_shape(), SchemaShape::Snowflake);
    }

    #[test]
    fn test_prompt_summary_lists_tables_and_relationships() {
        let catalog = credit_catalog();
        let summary = catalog.prompt_summary();
        assert!(summary.contains("facility (Fact)"));
        assert!(summary.contains("customer.country_key -> country.country_key"));
    }
}
