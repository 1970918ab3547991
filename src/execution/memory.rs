//! In-memory engines
//!
//! `MemoryDatabase` holds a small star schema as JSON rows. It serves as a
//! metadata source and backs two adapters that interpret the `QueryPlan`
//! attached to a compiled query with each engine's semantics:
//!
//! - relational: LEFT JOIN fan-out, NULL never matches a predicate, exact LIMIT,
//!   NULLs sort last ascending
//! - model: `LOOKUPVALUE` yields blank on no match and fails on several
//!   distinct matches, blank compares as 0 / "" unless the filter excludes
//!   it, `SUMMARIZECOLUMNS` drops blank measure rows, `TOPN` keeps ties,
//!   filters do not cross inactive relationships
//!
//! Text compares case-insensitively on both sides.

use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{EngineKind, ExecutionAdapter, RowSet};
use crate::catalog::{ColumnKey, JoinPath, Relationship};
use crate::compiler::{CompiledQuery, Pattern, PlanFilter, PlanMeasure, QueryPlan, SortKey};
use crate::error::{ExecutionError, Result};
use crate::intent::{Aggregation, ColumnRef};
use crate::metadata::{MetadataError, MetadataProvider, MetadataRow, MetadataSnapshot};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryColumn {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub references: Option<ColumnKey>,
}

impl MemoryColumn {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            primary_key: false,
            references: None,
        }
    }

    pub fn key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn references(mut self, table: &str, column: &str) -> Self {
        self.references = Some(ColumnKey::new(table, column));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTable {
    pub name: String,
    pub columns: Vec<MemoryColumn>,
    /// Positional rows, one value per column.
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

impl MemoryTable {
    pub fn new(name: &str, columns: Vec<MemoryColumn>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn cell(&self, row: usize, column: &str) -> &Value {
        const NULL: &Value = &Value::Null;
        self.column_index(column)
            .and_then(|i| self.rows.get(row).and_then(|r| r.get(i)))
            .unwrap_or(NULL)
    }
}

/// A small database plus the model's view of its relationships.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryDatabase {
    pub name: String,
    pub tables: Vec<MemoryTable>,
    /// Foreign keys the tabular model has declared inactive (or not at all).
    #[serde(default)]
    pub inactive_relationships: Vec<Relationship>,
}

impl MemoryDatabase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_table(mut self, table: MemoryTable) -> Self {
        self.tables.push(table);
        self
    }

    pub fn deactivate(mut self, relationship: Relationship) -> Self {
        self.inactive_relationships.push(relationship);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn is_active(&self, relationship: &Relationship) -> bool {
        !self.inactive_relationships.contains(relationship)
    }

    fn require_table(
        &self,
        engine: EngineKind,
        name: &str,
    ) -> std::result::Result<&MemoryTable, ExecutionError> {
        self.table(name).ok_or_else(|| match engine {
            EngineKind::Relational => {
                ExecutionError::rejected(engine, format!("relation \"{}\" does not exist", name))
            }
            EngineKind::Multidimensional => {
                ExecutionError::rejected(engine, format!("Cannot find table '{}'.", name))
            }
        })
    }

    fn require_column(
        &self,
        engine: EngineKind,
        column: &ColumnRef,
    ) -> std::result::Result<(), ExecutionError> {
        let table = self.require_table(engine, &column.table)?;
        if table.column_index(&column.column).is_some() {
            return Ok(());
        }
        Err(match engine {
            EngineKind::Relational => {
                ExecutionError::rejected(engine, format!("column {} does not exist", column))
            }
            EngineKind::Multidimensional => ExecutionError::rejected(
                engine,
                format!("Column '{}' in table '{}' cannot be found.", column.column, column.table),
            ),
        })
    }

    fn check_plan(
        &self,
        engine: EngineKind,
        plan: &QueryPlan,
    ) -> std::result::Result<(), ExecutionError> {
        self.require_table(engine, &plan.base_table)?;
        let referenced = plan
            .columns
            .iter()
            .map(|c| &c.column)
            .chain(plan.filters.iter().map(|f| &f.column))
            .chain(plan.measure.iter().filter_map(|m| m.column.as_ref()));
        for column in referenced {
            self.require_column(engine, column)?;
        }
        for edge in &plan.joins {
            self.require_column(engine, &ColumnRef::new(&edge.from_table, &edge.from_column))?;
            self.require_column(engine, &ColumnRef::new(&edge.to_table, &edge.to_column))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataProvider for MemoryDatabase {
    fn source_id(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn fetch(&self) -> std::result::Result<MetadataSnapshot, MetadataError> {
        let mut snapshot = MetadataSnapshot::default();
        for table in &self.tables {
            for column in &table.columns {
                snapshot.rows.push(MetadataRow {
                    table: table.name.clone(),
                    column: column.name.clone(),
                    data_type: column.data_type.clone(),
                    nullable: column.nullable,
                    is_primary_key: column.primary_key,
                    foreign_key_refs: column.references.iter().cloned().collect(),
                });
            }
            snapshot.row_counts.insert(table.name.clone(), table.rows.len() as u64);
        }
        Ok(snapshot)
    }
}

pub struct MemoryRelationalAdapter {
    db: Arc<MemoryDatabase>,
    latency: Option<Duration>,
}

impl MemoryRelationalAdapter {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self { db, latency: None }
    }

    /// Delay every answer, to exercise timeouts and cancellation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl ExecutionAdapter for MemoryRelationalAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Relational
    }

    fn name(&self) -> &str {
        "memory-relational"
    }

    async fn execute(&self, query: &CompiledQuery) -> std::result::Result<RowSet, ExecutionError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let plan = attached_plan(self.engine(), query)?;
        let rows = run_relational(&self.db, plan)?;
        Ok(RowSet::new(query.output_columns.clone(), rows))
    }
}

pub struct MemoryModelAdapter {
    db: Arc<MemoryDatabase>,
    latency: Option<Duration>,
}

impl MemoryModelAdapter {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self { db, latency: None }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl ExecutionAdapter for MemoryModelAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Multidimensional
    }

    fn name(&self) -> &str {
        "memory-model"
    }

    async fn execute(&self, query: &CompiledQuery) -> std::result::Result<RowSet, ExecutionError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let plan = attached_plan(self.engine(), query)?;
        let rows = run_model(&self.db, plan)?;
        Ok(RowSet::new(query.output_columns.clone(), rows))
    }
}

fn attached_plan(
    engine: EngineKind,
    query: &CompiledQuery,
) -> std::result::Result<&QueryPlan, ExecutionError> {
    query.plan.as_deref().ok_or_else(|| {
        ExecutionError::failed(engine, "in-memory engine needs the query plan attached")
    })
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Order of two non-null values; mixed types fall back to their text.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn group_key(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::Number(n) => format!("n:{}", n.as_f64().unwrap_or_default()),
            Value::String(s) => format!("s:{}", s),
            other => other.to_string(),
        })
        .join("\u{1f}")
}

/// Groups in first-appearance order.
fn group_rows<T: Copy>(members: &[T], key: impl Fn(T) -> Vec<Value>) -> Vec<(Vec<Value>, Vec<T>)> {
    let mut groups: Vec<(Vec<Value>, Vec<T>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for &member in members {
        let values = key(member);
        let slot = *index.entry(group_key(&values)).or_insert_with(|| {
            groups.push((values, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(member);
    }
    groups
}

/// Aggregates `cells` (the measure column of each member row; unused for row counts).
/// Counts are never blank; sums and averages over nothing are.
fn aggregate(measure: &PlanMeasure, cells: &[Value]) -> Value {
    match (measure.aggregation, &measure.column) {
        (Aggregation::Sum, Some(_)) => {
            if cells.is_empty() {
                return Value::Null;
            }
            number(cells.iter().filter_map(Value::as_f64).sum())
        }
        (Aggregation::Avg, Some(_)) => {
            let values: Vec<f64> = cells.iter().filter_map(Value::as_f64).collect();
            if values.is_empty() {
                Value::Null
            } else {
                number(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        (Aggregation::Count, Some(_)) => {
            Value::from(cells.iter().filter(|c| !c.is_null()).count() as u64)
        }
        _ => Value::from(cells.len() as u64),
    }
}

fn sort_index(plan: &QueryPlan) -> Option<(usize, bool)> {
    let sort = plan.sort?;
    let index = match sort.key {
        SortKey::Measure => plan.columns.len(),
        SortKey::Column(i) => i,
    };
    Some((index, sort.descending))
}

// ---------------------------------------------------------------------------
// Relational semantics
// ---------------------------------------------------------------------------

/// One joined row: the row index bound for each table, `None` after an
/// unmatched LEFT JOIN.
type Binding = BTreeMap<String, Option<usize>>;

fn bound_value(db: &MemoryDatabase, binding: &Binding, column: &ColumnRef) -> Value {
    binding
        .get(&column.table)
        .copied()
        .flatten()
        .and_then(|row| db.table(&column.table).map(|t| t.cell(row, &column.column).clone()))
        .unwrap_or(Value::Null)
}

pub(crate) fn run_relational(
    db: &MemoryDatabase,
    plan: &QueryPlan,
) -> std::result::Result<Vec<Vec<Value>>, ExecutionError> {
    let engine = EngineKind::Relational;
    db.check_plan(engine, plan)?;
    let base = db.require_table(engine, &plan.base_table)?;

    let mut bindings: Vec<Binding> = (0..base.rows.len())
        .map(|i| Binding::from([(plan.base_table.clone(), Some(i))]))
        .collect();
    for edge in &plan.joins {
        let to = db.require_table(engine, &edge.to_table)?;
        let mut next = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let from = ColumnRef::new(&edge.from_table, &edge.from_column);
            let key = bound_value(db, &binding, &from);
            let matches: Vec<usize> = (0..to.rows.len())
                .filter(|&j| values_equal(to.cell(j, &edge.to_column), &key))
                .collect();
            if matches.is_empty() {
                let mut unmatched = binding;
                unmatched.insert(edge.to_table.clone(), None);
                next.push(unmatched);
            } else {
                for j in matches {
                    let mut matched = binding.clone();
                    matched.insert(edge.to_table.clone(), Some(j));
                    next.push(matched);
                }
            }
        }
        bindings = next;
    }

    bindings.retain(|b| {
        plan.filters
            .iter()
            .all(|f| f.op.evaluate(&bound_value(db, b, &f.column), &f.value))
    });
    debug!("relational: {} rows after joins and filters", bindings.len());

    let mut rows: Vec<Vec<Value>> = match &plan.measure {
        None => bindings
            .iter()
            .map(|b| plan.columns.iter().map(|c| bound_value(db, b, &c.column)).collect())
            .collect(),
        Some(measure) => {
            let members: Vec<usize> = (0..bindings.len()).collect();
            let mut groups = group_rows(&members, |i| {
                plan.columns.iter().map(|c| bound_value(db, &bindings[i], &c.column)).collect()
            });
            if plan.columns.is_empty() && groups.is_empty() {
                groups.push((Vec::new(), Vec::new()));
            }
            groups
                .into_iter()
                .map(|(mut values, members)| {
                    let cells: Vec<Value> = members
                        .iter()
                        .map(|&i| match &measure.column {
                            Some(c) => bound_value(db, &bindings[i], c),
                            None => Value::Bool(true),
                        })
                        .collect();
                    values.push(aggregate(measure, &cells));
                    values
                })
                .collect()
        }
    };

    if let Some((index, descending)) = sort_index(plan) {
        rows.sort_by(|a, b| {
            let (x, y) = (&a[index], &b[index]);
            match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => if descending { Ordering::Less } else { Ordering::Greater },
                (false, true) => if descending { Ordering::Greater } else { Ordering::Less },
                (false, false) => {
                    let ord = compare_values(x, y);
                    if descending { ord.reverse() } else { ord }
                }
            }
        });
    }
    if let Some(limit) = plan.limit {
        rows.truncate(limit as usize);
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Tabular-model semantics
// ---------------------------------------------------------------------------

/// Filter test as the rendered DAX states it: nullable values carry a
/// `NOT ISBLANK` guard, anything else sees blank as 0 / "".
fn model_filter(filter: &PlanFilter, cell: &Value) -> bool {
    if filter.nullable && cell.is_null() {
        return false;
    }
    filter.op.evaluate_blank(cell, &filter.value)
}

/// Walks `path` from a base-table row with `LOOKUPVALUE` semantics.
fn lookup_value(
    db: &MemoryDatabase,
    base: &MemoryTable,
    row: usize,
    column: &ColumnRef,
    path: &JoinPath,
) -> std::result::Result<Value, ExecutionError> {
    let engine = EngineKind::Multidimensional;
    let Some(first) = path.first() else {
        return Ok(base.cell(row, &column.column).clone());
    };
    let mut key = base.cell(row, &first.from_column).clone();
    for (i, edge) in path.iter().enumerate() {
        let wanted = match path.get(i + 1) {
            Some(next) => next.from_column.as_str(),
            None => column.column.as_str(),
        };
        let to = db.require_table(engine, &edge.to_table)?;
        let mut found: Vec<&Value> = Vec::new();
        for j in 0..to.rows.len() {
            if values_equal(to.cell(j, &edge.to_column), &key) {
                let value = to.cell(j, wanted);
                let seen = |f: &&Value| values_equal(f, value) || (f.is_null() && value.is_null());
                if !found.iter().any(seen) {
                    found.push(value);
                }
            }
        }
        key = match found.as_slice() {
            [] => Value::Null,
            [one] => (*one).clone(),
            _ => {
                return Err(ExecutionError::rejected(
                    engine,
                    "A table of multiple values was supplied where a single value was expected.",
                ))
            }
        };
    }
    Ok(key)
}

fn related_error(column: &ColumnRef) -> ExecutionError {
    ExecutionError::rejected(
        EngineKind::Multidimensional,
        format!(
            "The column '{}[{}]' either doesn't exist or doesn't have a relationship \
             to any table available in the current context.",
            column.table, column.column
        ),
    )
}

pub(crate) fn run_model(
    db: &MemoryDatabase,
    plan: &QueryPlan,
) -> std::result::Result<Vec<Vec<Value>>, ExecutionError> {
    let engine = EngineKind::Multidimensional;
    db.check_plan(engine, plan)?;
    let base = db.require_table(engine, &plan.base_table)?;

    // Under the declared pattern a value reached over an inactive
    // relationship does not filter the base table.
    let detached = |path: &JoinPath| {
        plan.pattern == Pattern::RelationshipDeclared && !path.iter().all(|e| db.is_active(e))
    };
    let column_detached: Vec<bool> = plan.columns.iter().map(|c| detached(&c.path)).collect();
    let filter_detached: Vec<bool> = plan.filters.iter().map(|f| detached(&f.path)).collect();

    if plan.measure.is_none() {
        let related = plan
            .columns
            .iter()
            .map(|c| &c.column)
            .zip(&column_detached)
            .chain(plan.filters.iter().map(|f| &f.column).zip(&filter_detached));
        for (column, detached) in related {
            if *detached {
                return Err(related_error(column));
            }
        }
    }

    let mut kept: Vec<usize> = Vec::new();
    let mut resolved: HashMap<usize, Vec<Value>> = HashMap::new();
    for row in 0..base.rows.len() {
        let mut pass = true;
        for (filter, skip) in plan.filters.iter().zip(&filter_detached) {
            if *skip {
                continue;
            }
            let cell = lookup_value(db, base, row, &filter.column, &filter.path)?;
            if !model_filter(filter, &cell) {
                pass = false;
                break;
            }
        }
        if !pass {
            continue;
        }
        let mut values = Vec::with_capacity(plan.columns.len());
        for (column, skip) in plan.columns.iter().zip(&column_detached) {
            values.push(if *skip {
                Value::Null
            } else {
                lookup_value(db, base, row, &column.column, &column.path)?
            });
        }
        resolved.insert(row, values);
        kept.push(row);
    }
    debug!("model: {} of {} base rows pass filters", kept.len(), base.rows.len());

    let Some(measure) = &plan.measure else {
        return Ok(kept.iter().filter_map(|r| resolved.remove(r)).collect());
    };
    let measure_cells = |members: &[usize]| -> Vec<Value> {
        members
            .iter()
            .map(|&r| match &measure.column {
                Some(c) => base.cell(r, &c.column).clone(),
                None => Value::Bool(true),
            })
            .collect()
    };

    if plan.columns.is_empty() {
        return Ok(vec![vec![aggregate(measure, &measure_cells(&kept))]]);
    }

    let attached: Vec<usize> = (0..plan.columns.len()).filter(|&i| !column_detached[i]).collect();
    let mut groups = group_rows(&kept, |r| {
        attached.iter().map(|&i| resolved[&r][i].clone()).collect()
    });
    if attached.is_empty() && groups.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }

    // Every value of a detached column pairs with every group.
    let detached_values: Vec<Vec<Value>> = plan
        .columns
        .iter()
        .zip(&column_detached)
        .filter(|(_, d)| **d)
        .map(|(c, _)| distinct_values(db, plan, &c.column))
        .collect();
    let combinations: Vec<Vec<Value>> = if detached_values.is_empty() {
        vec![Vec::new()]
    } else {
        detached_values.into_iter().multi_cartesian_product().collect()
    };

    let drops_blank = plan.pattern != Pattern::RelationshipLookup;
    let mut rows = Vec::new();
    for (key, members) in &groups {
        // a group with no rows is blank even for counts
        let value = if members.is_empty() {
            Value::Null
        } else {
            aggregate(measure, &measure_cells(members))
        };
        if drops_blank && value.is_null() {
            continue;
        }
        for combination in &combinations {
            let mut attached_iter = key.iter();
            let mut detached_iter = combination.iter();
            let mut row: Vec<Value> = column_detached
                .iter()
                .map(|d| {
                    let next = if *d { detached_iter.next() } else { attached_iter.next() };
                    next.cloned().unwrap_or(Value::Null)
                })
                .collect();
            row.push(value.clone());
            rows.push(row);
        }
    }

    if let Some((index, descending)) = sort_index(plan) {
        let order = |a: &Vec<Value>, b: &Vec<Value>| {
            // Blank sorts lowest.
            let ord = match (a[index].is_null(), b[index].is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => compare_values(&a[index], &b[index]),
            };
            if descending { ord.reverse() } else { ord }
        };
        rows.sort_by(|a, b| order(a, b));
        if let Some(limit) = plan.limit {
            let limit = limit as usize;
            if rows.len() > limit && limit > 0 {
                let last = rows[limit - 1].clone();
                let end = rows
                    .iter()
                    .skip(limit)
                    .position(|r| order(r, &last) != Ordering::Equal)
                    .map_or(rows.len(), |p| limit + p);
                rows.truncate(end);
            } else {
                rows.truncate(limit);
            }
        }
    }
    Ok(rows)
}

/// Distinct non-blank values of a column, restricted by filters on its own table.
fn distinct_values(db: &MemoryDatabase, plan: &QueryPlan, column: &ColumnRef) -> Vec<Value> {
    let Some(table) = db.table(&column.table) else {
        return Vec::new();
    };
    let own_filters: Vec<_> = plan
        .filters
        .iter()
        .filter(|f| f.column.table == column.table)
        .collect();
    let mut values: Vec<Value> = Vec::new();
    for row in 0..table.rows.len() {
        if !own_filters
            .iter()
            .all(|f| model_filter(f, table.cell(row, &f.column.column)))
        {
            continue;
        }
        let value = table.cell(row, &column.column);
        if !value.is_null() && !values.iter().any(|v| values_equal(v, value)) {
            values.push(value.clone());
        }
    }
    values
}
