use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::{ColumnRole, GenerationOptions, Pattern};
use crate::catalog::{Classification, JoinPath, Relationship, SchemaCatalog};
use crate::error::{QueryBridgeError, Result};
use crate::intent::{Aggregation, ColumnRef, FilterOp, FilterValue, Intent, SortTarget};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanColumn {
    pub column: ColumnRef,
    pub alias: String,
    /// Join path from the base table; empty for base-table columns.
    pub path: JoinPath,
    pub role: ColumnRole,
}

impl PlanColumn {
    pub fn is_local(&self) -> bool {
        self.path.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMeasure {
    pub aggregation: Aggregation,
    /// `None` counts rows of the base table.
    pub column: Option<ColumnRef>,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFilter {
    pub column: ColumnRef,
    pub path: JoinPath,
    pub op: FilterOp,
    pub value: FilterValue,
    /// Name of the computed column carrying this value in lookup queries.
    pub alias: String,
    /// The value can be NULL: the column is nullable or sits behind a join.
    #[serde(default)]
    pub nullable: bool,
}

impl PlanFilter {
    pub fn is_local(&self) -> bool {
        self.path.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortKey {
    Measure,
    /// Index into `QueryPlan::columns`.
    Column(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSort {
    pub key: SortKey,
    pub descending: bool,
}

/// A value resolved from another table by walking its join path.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupColumn<'a> {
    pub alias: &'a str,
    pub column: &'a ColumnRef,
    pub path: &'a JoinPath,
}

/// Dialect-neutral plan shared by every compiler and the in-memory engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub base_table: String,
    pub pattern: Pattern,
    /// Group columns (aggregates) or projected columns (row listings).
    pub columns: Vec<PlanColumn>,
    pub measure: Option<PlanMeasure>,
    pub filters: Vec<PlanFilter>,
    /// Union of all join paths, parents before children.
    pub joins: Vec<Relationship>,
    pub sort: Option<PlanSort>,
    pub limit: Option<u64>,
}

impl QueryPlan {
    pub fn is_aggregate(&self) -> bool {
        self.measure.is_some()
    }

    /// Logical output columns: grouped/projected columns, then the measure.
    pub fn output_aliases(&self) -> Vec<(String, ColumnRole)> {
        let mut out: Vec<(String, ColumnRole)> = self
            .columns
            .iter()
            .map(|c| (c.alias.clone(), c.role))
            .collect();
        if let Some(measure) = &self.measure {
            out.push((measure.alias.clone(), ColumnRole::Measure));
        }
        out
    }

    /// Cross-table values the query needs, outputs first, each alias once.
    pub fn lookup_columns(&self) -> Vec<LookupColumn<'_>> {
        let mut out: Vec<LookupColumn<'_>> = Vec::new();
        let outputs = self.columns.iter().filter(|c| !c.is_local()).map(|c| LookupColumn {
            alias: &c.alias,
            column: &c.column,
            path: &c.path,
        });
        let filters = self.filters.iter().filter(|f| !f.is_local()).map(|f| LookupColumn {
            alias: &f.alias,
            column: &f.column,
            path: &f.path,
        });
        for lookup in outputs.chain(filters) {
            if !out.iter().any(|l| l.alias == lookup.alias) {
                out.push(lookup);
            }
        }
        out
    }

    pub fn sort_alias(&self) -> Option<&str> {
        let sort = self.sort?;
        match sort.key {
            SortKey::Measure => self.measure.as_ref().map(|m| m.alias.as_str()),
            SortKey::Column(i) => self.columns.get(i).map(|c| c.alias.as_str()),
        }
    }
}

/// Resolve base table, join paths, aliases and pattern for an intent.
pub fn plan(
    intent: &Intent,
    catalog: &SchemaCatalog,
    options: &GenerationOptions,
) -> Result<QueryPlan> {
    if !intent.is_resolved() {
        return Err(QueryBridgeError::QueryGeneration(format!(
            "clarification needed, unresolved entities: {}",
            intent.unresolved_entities.join(", ")
        )));
    }
    for column in intent.columns() {
        if !catalog.has_column(&column.table, &column.column) {
            return Err(QueryBridgeError::QueryGeneration(format!(
                "column {} does not exist in schema version {}",
                column, catalog.version
            )));
        }
    }
    check_measure(intent, catalog)?;

    let base_table = choose_base_table(intent, catalog)?;
    let graph = catalog.graph();
    let mut paths: BTreeMap<String, JoinPath> = BTreeMap::new();
    for table in intent.referenced_tables() {
        let path = graph.shortest_path(&base_table, &table).ok_or_else(|| {
            let message = format!("no join path from {} to {}", base_table, table);
            QueryBridgeError::QueryGeneration(message)
        })?;
        paths.insert(table, path);
    }
    let path_to = |column: &ColumnRef| paths.get(&column.table).cloned().unwrap_or_default();

    // Output columns, deduplicated, in intent order.
    let listing = intent.aggregation == Aggregation::None;
    let mut selected: Vec<ColumnRef> = Vec::new();
    let projected = intent
        .group_by
        .iter()
        .chain(if listing { intent.measure.as_ref() } else { None });
    for column in projected {
        if !selected.contains(column) {
            selected.push(column.clone());
        }
    }
    if listing && selected.is_empty() {
        return Err(QueryBridgeError::QueryGeneration(
            "a row listing needs at least one column".to_string(),
        ));
    }

    let aliases = assign_aliases(&selected, &base_table, catalog);
    let role = if listing { ColumnRole::Projection } else { ColumnRole::Group };
    let columns: Vec<PlanColumn> = selected
        .iter()
        .zip(aliases)
        .map(|(column, alias)| PlanColumn {
            column: column.clone(),
            alias,
            path: path_to(column),
            role,
        })
        .collect();

    let measure = if listing {
        None
    } else {
        let mut alias = match (&intent.aggregation, &intent.measure) {
            (Aggregation::Sum, Some(c)) => format!("total_{}", c.column),
            (Aggregation::Avg, Some(c)) => format!("avg_{}", c.column),
            (Aggregation::Count, Some(c)) => format!("count_{}", c.column),
            _ => "row_count".to_string(),
        };
        if columns.iter().any(|c| c.alias == alias) {
            alias.push_str("_measure");
        }
        Some(PlanMeasure {
            aggregation: intent.aggregation,
            column: intent.measure.clone(),
            alias,
        })
    };

    let filters: Vec<PlanFilter> = intent
        .filters
        .iter()
        .map(|f| {
            let alias = columns
                .iter()
                .find(|c| c.column == f.column)
                .map(|c| c.alias.clone())
                .unwrap_or_else(|| format!("filter_{}_{}", f.column.table, f.column.column));
            let path = path_to(&f.column);
            let nullable = !path.is_empty()
                || catalog
                    .column(&f.column.table, &f.column.column)
                    .map_or(true, |c| c.nullable);
            PlanFilter {
                column: f.column.clone(),
                path,
                op: f.op,
                value: f.value.clone(),
                alias,
                nullable,
            }
        })
        .collect();

    let sort = match &intent.sort {
        Some(sort) => {
            let key = match &sort.by {
                SortTarget::Measure if measure.is_some() => SortKey::Measure,
                SortTarget::Measure => {
                    return Err(QueryBridgeError::QueryGeneration(
                        "cannot sort a row listing by its measure".to_string(),
                    ))
                }
                SortTarget::Column(c) => match columns.iter().position(|pc| &pc.column == c) {
                    Some(i) => SortKey::Column(i),
                    None => {
                        return Err(QueryBridgeError::QueryGeneration(format!(
                            "sort column {} is not part of the output",
                            c
                        )))
                    }
                },
            };
            Some(PlanSort {
                key,
                descending: sort.descending,
            })
        }
        // A limit needs an order to be meaningful.
        None if intent.limit.is_some() => Some(if measure.is_some() {
            PlanSort {
                key: SortKey::Measure,
                descending: true,
            }
        } else {
            PlanSort {
                key: SortKey::Column(0),
                descending: false,
            }
        }),
        None => None,
    };

    let mut joins: Vec<Relationship> = Vec::new();
    let used_paths = columns.iter().map(|c| &c.path).chain(filters.iter().map(|f| &f.path));
    for path in used_paths {
        for edge in path {
            if !joins.contains(edge) {
                joins.push(edge.clone());
            }
        }
    }

    let pattern = if joins.is_empty() {
        Pattern::DirectFilter
    } else if joins.iter().all(|e| options.attested_relationships.contains(e)) {
        Pattern::RelationshipDeclared
    } else {
        Pattern::RelationshipLookup
    };
    debug!(
        "Planned base '{}', {} joins, pattern {}",
        base_table,
        joins.len(),
        pattern
    );

    Ok(QueryPlan {
        base_table,
        pattern,
        columns,
        measure,
        filters,
        joins,
        sort,
        limit: intent.limit,
    })
}

fn check_measure(intent: &Intent, catalog: &SchemaCatalog) -> Result<()> {
    match (&intent.aggregation, &intent.measure) {
        (Aggregation::Sum | Aggregation::Avg, None) => Err(QueryBridgeError::QueryGeneration(
            format!("{} needs a measure column", intent.aggregation),
        )),
        (Aggregation::Sum | Aggregation::Avg, Some(c)) => {
            let numeric = catalog
                .column(&c.table, &c.column)
                .map_or(false, |info| info.data_type.is_numeric());
            if numeric {
                Ok(())
            } else {
                Err(QueryBridgeError::QueryGeneration(format!(
                    "cannot {} non-numeric column {}",
                    intent.aggregation, c
                )))
            }
        }
        _ => Ok(()),
    }
}

/// The measure's table, else the subject, else the referenced table that
/// reaches every other one (facts preferred).
fn choose_base_table(intent: &Intent, catalog: &SchemaCatalog) -> Result<String> {
    if let Some(measure) = &intent.measure {
        if intent.aggregation != Aggregation::None {
            return Ok(measure.table.clone());
        }
    }
    if let Some(subject) = &intent.subject {
        return catalog
            .table(subject)
            .map(|t| t.name.clone())
            .ok_or_else(|| QueryBridgeError::QueryGeneration(format!("unknown table {}", subject)));
    }

    let mut candidates: Vec<&str> = Vec::new();
    for column in intent.columns() {
        if !candidates.contains(&column.table.as_str()) {
            candidates.push(&column.table);
        }
    }
    let referenced = intent.referenced_tables();
    let graph = catalog.graph();
    let is_fact = |t: &str| {
        catalog
            .table(t)
            .map_or(false, |i| i.classification == Classification::Fact)
    };
    candidates.sort_by_key(|t| !is_fact(t));
    candidates
        .into_iter()
        .find(|t| {
            let reachable = graph.reachable(t);
            referenced.iter().all(|r| reachable.contains(r))
        })
        .map(str::to_string)
        .ok_or_else(|| {
            QueryBridgeError::QueryGeneration(format!(
                "no single table reaches all of: {}",
                referenced.iter().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
}

/// Column name as alias, qualified with its table when the bare name would
/// be ambiguous in the output or shadow a base-table column.
fn assign_aliases(columns: &[ColumnRef], base_table: &str, catalog: &SchemaCatalog) -> Vec<String> {
    columns
        .iter()
        .map(|c| {
            let duplicate = columns.iter().filter(|o| o.column == c.column).count() > 1;
            let shadows = c.table != base_table && catalog.has_column(base_table, &c.column);
            if duplicate || shadows {
                format!("{}_{}", c.table, c.column)
            } else {
                c.column.clone()
            }
        })
        .collect()
}
