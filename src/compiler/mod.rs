//! Query Template Engine - one intent, two dialects
//!
//! An `Intent` is planned once into a dialect-neutral `QueryPlan` (base
//! table, join tree, aliases, pattern). Each backend `Compiler` renders the
//! same plan; adding a target dialect means adding a compiler.
//!
//! Pattern selection:
//! - DirectFilter: every column lives on the base table
//! - RelationshipLookup: any cross-table need; values are resolved by
//!   explicit key lookups, so model relationships are never relied on
//! - RelationshipDeclared: only when the caller attests every relationship
//!   on every used path as active in the model
//!
//! Both texts pass a static check before they leave this module.

pub mod dax;
pub mod planner;
pub mod sql;
pub mod validate;

pub use dax::MultidimensionalCompiler;
pub use planner::{plan, PlanColumn, PlanFilter, PlanMeasure, PlanSort, QueryPlan, SortKey};
pub use sql::{RelationalCompiler, SqlFlavor};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::catalog::{Relationship, SchemaCatalog};
use crate::error::{QueryBridgeError, Result};
use crate::intent::Intent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pattern {
    DirectFilter,
    RelationshipLookup,
    RelationshipDeclared,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::DirectFilter => write!(f, "DirectFilter"),
            Pattern::RelationshipLookup => write!(f, "RelationshipLookup"),
            Pattern::RelationshipDeclared => write!(f, "RelationshipDeclared"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    AnsiSql,
    TSql,
    Dax,
}

impl Dialect {
    pub fn is_relational(&self) -> bool {
        matches!(self, Dialect::AnsiSql | Dialect::TSql)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::AnsiSql => write!(f, "ANSI SQL"),
            Dialect::TSql => write!(f, "T-SQL"),
            Dialect::Dax => write!(f, "DAX"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnRole {
    Group,
    Measure,
    Projection,
}

/// One logical output column and its name in each engine's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub logical: String,
    pub relational: String,
    pub multidimensional: String,
    pub role: ColumnRole,
}

/// A rendered query plus what the validator and adapters need to know about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub dialect: Dialect,
    pub text: String,
    /// Result column names, in plan output order.
    pub output_columns: Vec<String>,
    /// Names the query itself introduces (computed columns, measures).
    pub aliases: Vec<String>,
    #[serde(skip)]
    pub plan: Option<Arc<QueryPlan>>,
}

impl CompiledQuery {
    pub fn new(
        dialect: Dialect,
        text: String,
        output_columns: Vec<String>,
        aliases: Vec<String>,
    ) -> Self {
        Self {
            dialect,
            text,
            output_columns,
            aliases,
            plan: None,
        }
    }
}

/// Backend strategy: renders a plan in one dialect.
pub trait Compiler: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn compile(&self, plan: &QueryPlan) -> Result<CompiledQuery>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPair {
    pub relational: CompiledQuery,
    pub multidimensional: CompiledQuery,
    pub pattern_used: Pattern,
    pub column_mapping: Vec<ColumnMapping>,
    pub catalog_version: String,
    pub plan: Arc<QueryPlan>,
}

impl QueryPair {
    pub fn relational_text(&self) -> &str {
        &self.relational.text
    }

    pub fn multidimensional_text(&self) -> &str {
        &self.multidimensional.text
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// Relationships the caller attests are declared and active in the model.
    pub attested_relationships: BTreeSet<Relationship>,
}

impl GenerationOptions {
    pub fn attest(mut self, relationship: Relationship) -> Self {
        self.attested_relationships.insert(relationship);
        self
    }
}

pub struct QueryTemplateEngine {
    relational: Box<dyn Compiler>,
    multidimensional: Box<dyn Compiler>,
}

impl QueryTemplateEngine {
    pub fn new(flavor: SqlFlavor) -> Self {
        Self::with_compilers(
            Box::new(RelationalCompiler::new(flavor)),
            Box::new(MultidimensionalCompiler::new()),
        )
    }

    pub fn with_compilers(
        relational: Box<dyn Compiler>,
        multidimensional: Box<dyn Compiler>,
    ) -> Self {
        Self {
            relational,
            multidimensional,
        }
    }

    pub fn generate(
        &self,
        intent: &Intent,
        catalog: &SchemaCatalog,
        options: &GenerationOptions,
    ) -> Result<QueryPair> {
        let plan = Arc::new(planner::plan(intent, catalog, options)?);
        info!(
            "Generating {} + {} with pattern {} over base table '{}'",
            self.relational.dialect(),
            self.multidimensional.dialect(),
            plan.pattern,
            plan.base_table
        );

        let mut relational = self.relational.compile(&plan)?;
        validate::validate(&relational, catalog, plan.pattern)?;
        relational.plan = Some(Arc::clone(&plan));

        let mut multidimensional = self.multidimensional.compile(&plan)?;
        validate::validate(&multidimensional, catalog, plan.pattern)?;
        multidimensional.plan = Some(Arc::clone(&plan));

        let column_mapping = build_mapping(&plan, &relational, &multidimensional)?;
        Ok(QueryPair {
            relational,
            multidimensional,
            pattern_used: plan.pattern,
            column_mapping,
            catalog_version: catalog.version.clone(),
            plan,
        })
    }
}

fn build_mapping(
    plan: &QueryPlan,
    relational: &CompiledQuery,
    multidimensional: &CompiledQuery,
) -> Result<Vec<ColumnMapping>> {
    let logical = plan.output_aliases();
    if relational.output_columns.len() != logical.len()
        || multidimensional.output_columns.len() != logical.len()
    {
        return Err(QueryBridgeError::QueryGeneration(format!(
            "compilers disagree on output shape: plan {}, relational {}, multidimensional {}",
            logical.len(),
            relational.output_columns.len(),
            multidimensional.output_columns.len()
        )));
    }
    Ok(logical
        .into_iter()
        .zip(relational.output_columns.iter())
        .zip(multidimensional.output_columns.iter())
        .map(|(((alias, role), rel), md)| ColumnMapping {
            logical: alias,
            relational: rel.clone(),
            multidimensional: md.clone(),
            role,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::credit_catalog;
    use crate::intent::{FilterOp, FilterValue};

    #[test]
    fn test_cross_table_grouping_defaults_to_lookup() {
        let engine = QueryTemplateEngine::new(SqlFlavor::Ansi);
        let intent = Intent::sum("facility", "limit_amount").group("customer", "industry");
        let pair = engine
            .generate(&intent, &credit_catalog(), &GenerationOptions::default())
            .unwrap();
        assert_eq!(pair.pattern_used, Pattern::RelationshipLookup);
        assert!(pair.multidimensional_text().contains("LOOKUPVALUE"));
        assert!(!pair.multidimensional_text().contains("SUMMARIZECOLUMNS"));
        assert!(pair.relational_text().contains("LEFT JOIN \"customer\""));
    }

    #[test]
    fn test_declared_requires_every_edge_attested() {
        let catalog = credit_catalog();
        let engine = QueryTemplateEngine::new(SqlFlavor::Ansi);
        let intent = Intent::sum("facility", "limit_amount").group("country", "country_name");

        let partial = GenerationOptions::default().attest(Relationship::new(
            "facility",
            "customer_key",
            "customer",
            "customer_key",
        ));
        let pair = engine.generate(&intent, &catalog, &partial).unwrap();
        assert_eq!(pair.pattern_used, Pattern::RelationshipLookup);

        let edge = Relationship::new("customer", "country_key", "country", "country_key");
        let full = partial.attest(edge);
        let pair = engine.generate(&intent, &catalog, &full).unwrap();
        assert_eq!(pair.pattern_used, Pattern::RelationshipDeclared);
        assert!(pair.multidimensional_text().contains("SUMMARIZECOLUMNS"));
    }

    #[test]
    fn test_single_table_is_direct_filter() {
        let engine = QueryTemplateEngine::new(SqlFlavor::TSql);
        let intent = Intent::sum("facility", "limit_amount")
            .group("facility", "status")
            .filter("facility", "limit_amount", FilterOp::Gt, FilterValue::Number(0.0));
        let pair = engine
            .generate(&intent, &credit_catalog(), &GenerationOptions::default())
            .unwrap();
        assert_eq!(pair.pattern_used, Pattern::DirectFilter);
        assert!(!pair.relational_text().contains("JOIN"));
    }

    #[test]
    fn test_mapping_follows_output_order() {
        let engine = QueryTemplateEngine::new(SqlFlavor::Ansi);
        let intent = Intent::sum("facility", "limit_amount")
            .group("facility", "status")
            .group("customer", "industry");
        let pair = engine
            .generate(&intent, &credit_catalog(), &GenerationOptions::default())
            .unwrap();
        let logical: Vec<&str> = pair.column_mapping.iter().map(|m| m.logical.as_str()).collect();
        assert_eq!(logical, vec!["status", "industry", "total_limit_amount"]);
        assert_eq!(pair.column_mapping[0].multidimensional, "facility[status]");
        assert_eq!(pair.column_mapping[1].multidimensional, "[industry]");
        assert_eq!(pair.column_mapping[2].role, ColumnRole::Measure);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let catalog = credit_catalog();
        let engine = QueryTemplateEngine::new(SqlFlavor::Ansi);
        let intent = Intent::count_rows("facility")
            .group("country", "country_name")
            .filter("currency", "currency_code", FilterOp::Eq, FilterValue::Text("USD".into()))
            .limited(3);
        let a = engine.generate(&intent, &catalog, &GenerationOptions::default()).unwrap();
        let b = engine.generate(&intent, &catalog, &GenerationOptions::default()).unwrap();
        assert_eq!(a.pattern_used, b.pattern_used);
        assert_eq!(a.relational_text(), b.relational_text());
        assert_eq!(a.multidimensional_text(), b.multidimensional_text());
    }
}
