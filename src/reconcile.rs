//! Result Reconciler - compares the two execution outcomes
//!
//! Rows are aligned on their non-measure columns (the grain). Rows present on
//! only one side form the population diff; measures of common rows are
//! compared within a relative epsilon.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::compiler::{ColumnMapping, ColumnRole, QueryPair};
use crate::error::{ExecutionErrorKind, QueryBridgeError, Result};
use crate::execution::{EngineKind, ExecutionResult};
use crate::intent::format_number;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergenceCause {
    /// Results agree.
    None,
    MissingFilterTranslation,
    NullHandlingDifference,
    /// Repeated totals or integer multiples: a relationship the model used
    /// is missing, inactive or fans out.
    RelationshipMisconfiguration,
    EngineRejectedQuery,
    Unclassified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDiff {
    pub key: Vec<String>,
    pub column: String,
    pub relational: Value,
    pub multidimensional: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub comparable: bool,
    pub row_count_match: bool,
    /// Rows compared, or rows returned by the surviving side.
    pub rows: usize,
    pub relational_rows: usize,
    pub multidimensional_rows: usize,
    /// Logical column order used for the rows below.
    pub columns: Vec<String>,
    pub value_diffs: Vec<ValueDiff>,
    pub only_relational: Vec<Vec<Value>>,
    pub only_multidimensional: Vec<Vec<Value>>,
    pub divergence_cause: DivergenceCause,
    pub reason: Option<String>,
}

impl ReconciliationReport {
    fn not_comparable(cause: DivergenceCause, reason: String, rows: usize) -> Self {
        Self {
            comparable: false,
            row_count_match: false,
            rows,
            relational_rows: 0,
            multidimensional_rows: 0,
            columns: Vec::new(),
            value_diffs: Vec::new(),
            only_relational: Vec::new(),
            only_multidimensional: Vec::new(),
            divergence_cause: cause,
            reason: Some(reason),
        }
    }

    pub fn is_match(&self) -> bool {
        self.comparable && self.divergence_cause == DivergenceCause::None
    }

    pub fn require_comparable(&self) -> Result<()> {
        if self.comparable {
            return Ok(());
        }
        Err(QueryBridgeError::ReconciliationInconclusive(
            self.reason.clone().unwrap_or_else(|| "comparison impossible".to_string()),
        ))
    }
}

/// One side's rows in logical column order.
struct Normalized {
    rows: Vec<Vec<Value>>,
}

/// Rows grouped by grain key; several rows per key only for listings or
/// duplicated groups.
type Keyed = BTreeMap<Vec<String>, Vec<Vec<Value>>>;

pub struct ResultReconciler {
    epsilon: f64,
}

impl Default for ResultReconciler {
    fn default() -> Self {
        Self { epsilon: 1e-6 }
    }
}

impl ResultReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative tolerance for numeric comparisons.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon.abs();
        self
    }

    pub fn reconcile(
        &self,
        pair: &QueryPair,
        relational: &ExecutionResult,
        multidimensional: &ExecutionResult,
    ) -> ReconciliationReport {
        let report = self.compare(pair, relational, multidimensional);
        if report.is_match() {
            info!("Reconciled {} rows, results agree", report.rows);
        } else {
            warn!(
                "Reconciliation: comparable={}, cause {:?}, {} value diffs, {}/{} rows",
                report.comparable,
                report.divergence_cause,
                report.value_diffs.len(),
                report.relational_rows,
                report.multidimensional_rows
            );
        }
        report
    }

    fn compare(
        &self,
        pair: &QueryPair,
        relational: &ExecutionResult,
        multidimensional: &ExecutionResult,
    ) -> ReconciliationReport {
        match (&relational.error_detail, &multidimensional.error_detail) {
            (Some(r), Some(m)) => {
                let rejected =
                    [r, m].iter().any(|e| e.kind == ExecutionErrorKind::EngineRejectedQuery);
                let cause = if rejected {
                    DivergenceCause::EngineRejectedQuery
                } else {
                    DivergenceCause::Unclassified
                };
                return ReconciliationReport::not_comparable(cause, format!("{}\n{}", r, m), 0);
            }
            (Some(failed), None) | (None, Some(failed)) => {
                let survivor = if relational.is_success() { relational } else { multidimensional };
                let cause = if failed.kind == ExecutionErrorKind::EngineRejectedQuery {
                    DivergenceCause::EngineRejectedQuery
                } else {
                    DivergenceCause::Unclassified
                };
                let rows = survivor.row_count();
                let mut report =
                    ReconciliationReport::not_comparable(cause, failed.message.clone(), rows);
                match survivor.engine {
                    EngineKind::Relational => report.relational_rows = rows,
                    EngineKind::Multidimensional => report.multidimensional_rows = rows,
                }
                return report;
            }
            (None, None) => {}
        }

        let mapping = &pair.column_mapping;
        let (rel, md) = match (
            normalize(relational, mapping, EngineKind::Relational),
            normalize(multidimensional, mapping, EngineKind::Multidimensional),
        ) {
            (Ok(rel), Ok(md)) => (rel, md),
            (Err(reason), _) | (_, Err(reason)) => {
                let cause = DivergenceCause::Unclassified;
                return ReconciliationReport::not_comparable(cause, reason, 0);
            }
        };

        let (measure_idx, key_idx): (Vec<usize>, Vec<usize>) =
            (0..mapping.len()).partition(|&i| mapping[i].role == ColumnRole::Measure);
        let rel_keyed = keyed(&rel, &key_idx);
        let md_keyed = keyed(&md, &key_idx);

        // Population diff
        let mut only_relational = Vec::new();
        let mut only_multidimensional = Vec::new();
        for (key, rows) in &rel_keyed {
            let other = md_keyed.get(key).map_or(0, Vec::len);
            only_relational.extend(rows.iter().skip(other).cloned());
        }
        for (key, rows) in &md_keyed {
            let other = rel_keyed.get(key).map_or(0, Vec::len);
            only_multidimensional.extend(rows.iter().skip(other).cloned());
        }

        // Data diff on common keys
        let mut value_diffs = Vec::new();
        for (key, rel_rows) in &rel_keyed {
            let Some(md_rows) = md_keyed.get(key) else {
                continue;
            };
            for (r, m) in rel_rows.iter().zip(md_rows) {
                for &i in &measure_idx {
                    if !self.values_match(&r[i], &m[i]) {
                        value_diffs.push(ValueDiff {
                            key: key.clone(),
                            column: mapping[i].logical.clone(),
                            relational: r[i].clone(),
                            multidimensional: m[i].clone(),
                        });
                    }
                }
            }
        }

        let mut report = ReconciliationReport {
            comparable: true,
            row_count_match: rel.rows.len() == md.rows.len(),
            rows: rel.rows.len(),
            relational_rows: rel.rows.len(),
            multidimensional_rows: md.rows.len(),
            columns: mapping.iter().map(|m| m.logical.clone()).collect(),
            value_diffs,
            only_relational,
            only_multidimensional,
            divergence_cause: DivergenceCause::None,
            reason: None,
        };
        if !report.row_count_match
            || !report.value_diffs.is_empty()
            || !report.only_relational.is_empty()
            || !report.only_multidimensional.is_empty()
        {
            report.divergence_cause = self.classify(pair, &report, &rel, &md, &measure_idx);
            report.reason = Some(describe(&report));
        }
        report
    }

    fn values_match(&self, a: &Value, b: &Value) -> bool {
        match (a.is_null(), b.is_null()) {
            (true, true) => return true,
            (true, false) | (false, true) => return false,
            _ => {}
        }
        match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => (x - y).abs() <= self.epsilon * x.abs().max(y.abs()).max(1.0),
            _ => key_text(a) == key_text(b),
        }
    }

    /// Pattern rules over the shape of the divergence, most specific first.
    fn classify(
        &self,
        pair: &QueryPair,
        report: &ReconciliationReport,
        rel: &Normalized,
        md: &Normalized,
        measure_idx: &[usize],
    ) -> DivergenceCause {
        if let Some(&m) = measure_idx.first() {
            let rel_values: Vec<f64> = rel.rows.iter().filter_map(|r| as_number(&r[m])).collect();
            let md_values: Vec<f64> = md.rows.iter().filter_map(|r| as_number(&r[m])).collect();

            // The model repeats one total across groups the relational side tells apart.
            if md_values.len() >= 2
                && self.distinct(&md_values) == 1
                && self.distinct(&rel_values) > 1
            {
                return DivergenceCause::RelationshipMisconfiguration;
            }
            // Every differing value is inflated by a whole factor.
            let whole_factor = |d: &ValueDiff| {
                match (as_number(&d.relational), as_number(&d.multidimensional)) {
                    (Some(r), Some(x)) if r != 0.0 => {
                        let ratio = x / r;
                        ratio >= 2.0 - self.epsilon
                            && (ratio - ratio.round()).abs() <= 1e-9 * ratio.abs().max(1.0)
                    }
                    _ => false,
                }
            };
            let multiples =
                !report.value_diffs.is_empty() && report.value_diffs.iter().all(whole_factor);
            if multiples {
                return DivergenceCause::RelationshipMisconfiguration;
            }
        }

        let null_diff = report
            .value_diffs
            .iter()
            .any(|d| d.relational.is_null() != d.multidimensional.is_null());
        let null_rows = report
            .only_relational
            .iter()
            .chain(&report.only_multidimensional)
            .any(|row| {
                row.iter().any(Value::is_null)
                    || measure_idx.iter().any(|&i| as_number(&row[i]) == Some(0.0))
            });
        if null_diff || null_rows {
            return DivergenceCause::NullHandlingDifference;
        }

        if !pair.plan.filters.is_empty() {
            let total = |rows: &[Vec<Value>]| -> f64 {
                measure_idx
                    .first()
                    .map_or(0.0, |&m| rows.iter().filter_map(|r| as_number(&r[m])).sum())
            };
            let extra_rows =
                !report.only_multidimensional.is_empty() && report.only_relational.is_empty();
            let inflated = total(&md.rows) > total(&rel.rows) * (1.0 + self.epsilon);
            if extra_rows || inflated {
                return DivergenceCause::MissingFilterTranslation;
            }
        }
        DivergenceCause::Unclassified
    }

    fn distinct(&self, values: &[f64]) -> usize {
        let mut seen: Vec<f64> = Vec::new();
        for &v in values {
            if !seen
                .iter()
                .any(|&s| (s - v).abs() <= self.epsilon * s.abs().max(v.abs()).max(1.0))
            {
                seen.push(v);
            }
        }
        seen.len()
    }
}

fn describe(report: &ReconciliationReport) -> String {
    format!(
        "{:?}: {} relational vs {} multidimensional rows, {} value diffs, \
         {} rows only relational, {} only multidimensional",
        report.divergence_cause,
        report.relational_rows,
        report.multidimensional_rows,
        report.value_diffs.len(),
        report.only_relational.len(),
        report.only_multidimensional.len()
    )
}

/// Fallback for result names not in the mapping: `'t'[c]`, `t[c]`, `[c]`, `"c"`.
fn bare_name(name: &str) -> String {
    let name = name.trim();
    let inner = match (name.rfind('['), name.ends_with(']')) {
        (Some(open), true) => &name[open + 1..name.len() - 1],
        _ => name,
    };
    inner.trim_matches('"').to_string()
}

fn normalize(
    result: &ExecutionResult,
    mapping: &[ColumnMapping],
    engine: EngineKind,
) -> std::result::Result<Normalized, String> {
    let mut positions = Vec::with_capacity(mapping.len());
    for m in mapping {
        let expected = match engine {
            EngineKind::Relational => &m.relational,
            EngineKind::Multidimensional => &m.multidimensional,
        };
        let position = result
            .columns
            .iter()
            .position(|c| c == expected)
            .or_else(|| result.columns.iter().position(|c| bare_name(c) == bare_name(expected)))
            .or_else(|| result.columns.iter().position(|c| bare_name(c) == m.logical));
        match position {
            Some(p) => positions.push(p),
            None => {
                return Err(format!(
                    "{} result has no column for '{}' (columns: {})",
                    engine,
                    m.logical,
                    result.columns.join(", ")
                ))
            }
        }
    }
    let rows = result
        .rows
        .iter()
        .map(|row| positions.iter().map(|&p| row.get(p).cloned().unwrap_or(Value::Null)).collect())
        .collect();
    Ok(Normalized { rows })
}

fn keyed(side: &Normalized, key_idx: &[usize]) -> Keyed {
    let mut out = Keyed::new();
    for row in &side.rows {
        let key = key_idx.iter().map(|&i| key_text(&row[i])).collect();
        out.entry(key).or_default().push(row.clone());
    }
    out
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn key_text(v: &Value) -> String {
    match v {
        Value::Null => "(blank)".to_string(),
        Value::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::credit_catalog;
    use crate::compiler::{QueryTemplateEngine, SqlFlavor};
    use crate::error::ExecutionError;
    use crate::execution::RowSet;
    use crate::intent::{FilterOp, FilterValue, Intent};
    use serde_json::json;

    fn pair(intent: &Intent) -> QueryPair {
        QueryTemplateEngine::new(SqlFlavor::Ansi)
            .generate(intent, &credit_catalog(), &Default::default())
            .unwrap()
    }

    fn industry_pair() -> QueryPair {
        pair(&Intent::sum("facility", "limit_amount").group("customer", "industry"))
    }

    fn ok(engine: EngineKind, columns: &[&str], rows: Vec<Vec<Value>>) -> ExecutionResult {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        ExecutionResult::success(engine, RowSet::new(columns, rows), 5)
    }

    fn rel(rows: Vec<Vec<Value>>) -> ExecutionResult {
        ok(EngineKind::Relational, &["industry", "total_limit_amount"], rows)
    }

    fn md(rows: Vec<Vec<Value>>) -> ExecutionResult {
        ok(EngineKind::Multidimensional, &["[industry]", "[total_limit_amount]"], rows)
    }

    #[test]
    fn test_matching_results_align_by_key_not_order() {
        let report = ResultReconciler::new().reconcile(
            &industry_pair(),
            &rel(vec![
                vec![json!("Manufacturing"), json!(5000000)],
                vec![json!("Oil & Gas"), json!("3500000.00")],
            ]),
            &md(vec![
                vec![json!("Oil & Gas"), json!(3500000.0000001)],
                vec![json!("Manufacturing"), json!(5000000.0)],
            ]),
        );
        assert!(report.is_match(), "{:?}", report);
        assert!(report.row_count_match);
        assert_eq!(report.rows, 2);
    }

    #[test]
    fn test_repeated_total_is_relationship_misconfiguration() {
        let report = ResultReconciler::new().reconcile(
            &industry_pair(),
            &rel(vec![
                vec![json!("Manufacturing"), json!(5000000)],
                vec![json!("Oil & Gas"), json!(3500000)],
            ]),
            &md(vec![
                vec![json!("Manufacturing"), json!(8500000)],
                vec![json!("Oil & Gas"), json!(8500000)],
            ]),
        );
        assert!(report.comparable);
        assert_eq!(report.value_diffs.len(), 2);
        assert_eq!(report.divergence_cause, DivergenceCause::RelationshipMisconfiguration);
    }

    #[test]
    fn test_integer_multiple_is_relationship_misconfiguration() {
        let report = ResultReconciler::new().reconcile(
            &industry_pair(),
            &rel(vec![vec![json!("A"), json!(10)], vec![json!("B"), json!(20)]]),
            &md(vec![vec![json!("A"), json!(30)], vec![json!("B"), json!(40)]]),
        );
        assert_eq!(report.divergence_cause, DivergenceCause::RelationshipMisconfiguration);
    }

    #[test]
    fn test_dropped_blank_row_is_null_handling() {
        let report = ResultReconciler::new().reconcile(
            &industry_pair(),
            &rel(vec![vec![json!("A"), json!(10)], vec![Value::Null, json!(0)]]),
            &md(vec![vec![json!("A"), json!(10)]]),
        );
        assert!(!report.row_count_match);
        assert_eq!(report.only_relational.len(), 1);
        assert_eq!(report.divergence_cause, DivergenceCause::NullHandlingDifference);
    }

    #[test]
    fn test_extra_rows_with_filter_is_missing_filter_translation() {
        let p = pair(
            &Intent::sum("facility", "limit_amount")
                .group("customer", "industry")
                .filter("facility", "status", FilterOp::Eq, FilterValue::Text("Active".into())),
        );
        let report = ResultReconciler::new().reconcile(
            &p,
            &rel(vec![vec![json!("A"), json!(10)]]),
            &md(vec![vec![json!("A"), json!(10)], vec![json!("B"), json!(7)]]),
        );
        assert_eq!(report.divergence_cause, DivergenceCause::MissingFilterTranslation);
    }

    #[test]
    fn test_one_side_failed_keeps_message_verbatim() {
        let message = "Query (4, 9) The column 'customer'[industry] cannot be found.";
        let failed = ExecutionResult::failure(
            EngineKind::Multidimensional,
            ExecutionError::rejected(EngineKind::Multidimensional, message),
            3,
        );
        let report = ResultReconciler::new().reconcile(
            &industry_pair(),
            &rel(vec![vec![json!("A"), json!(10)]]),
            &failed,
        );
        assert!(!report.comparable);
        assert_eq!(report.reason.as_deref(), Some(message));
        assert_eq!(report.divergence_cause, DivergenceCause::EngineRejectedQuery);
        assert_eq!(report.relational_rows, 1);
        assert!(matches!(
            report.require_comparable(),
            Err(QueryBridgeError::ReconciliationInconclusive(_))
        ));
    }

    #[test]
    fn test_empty_results_are_comparable() {
        let report = ResultReconciler::new().reconcile(&industry_pair(), &rel(vec![]), &md(vec![]));
        assert!(report.comparable);
        assert!(report.row_count_match);
        assert_eq!(report.rows, 0);
        assert_eq!(report.divergence_cause, DivergenceCause::None);
    }

    #[test]
    fn test_bare_name_fallback() {
        assert_eq!(bare_name("'customer'[industry]"), "industry");
        assert_eq!(bare_name("customer[industry]"), "industry");
        assert_eq!(bare_name("[total]"), "total");
        assert_eq!(bare_name("\"total\""), "total");
    }
}
