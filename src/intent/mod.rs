//! Intent - structured form of a business question
//!
//! Produced by the `IntentExtractor`, consumed by both query compilers.
//! All column references are catalog-resolved; anything the extractor could
//! not resolve is listed in `unresolved_entities` and blocks generation.

pub mod extractor;
pub mod resolver;

pub use extractor::{IntentExtractor, ParseOutcome, RawIntent};
pub use resolver::EntityResolver;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::catalog::ColumnKey;

/// A catalog column referenced by an intent.
pub type ColumnRef = ColumnKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
    /// Row listing, no aggregation.
    None,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Sum => write!(f, "sum"),
            Aggregation::Count => write!(f, "count"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "contains")]
    Contains,
}

impl FilterOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::In => "IN",
            FilterOp::Contains => "LIKE",
        }
    }

    /// Relational semantics: a NULL cell never satisfies a predicate. Text
    /// compares case-insensitively on every engine.
    pub fn evaluate(&self, cell: &serde_json::Value, value: &FilterValue) -> bool {
        if cell.is_null() {
            return false;
        }
        self.compare(cell, value)
    }

    /// Tabular-model semantics: a blank cell compares as 0 or "" depending
    /// on the type of the other operand.
    pub fn evaluate_blank(&self, cell: &serde_json::Value, value: &FilterValue) -> bool {
        if cell.is_null() {
            let substitute = match value {
                FilterValue::Number(_) => serde_json::json!(0.0),
                FilterValue::Bool(_) => serde_json::json!(false),
                FilterValue::List(items) => match items.first() {
                    Some(FilterValue::Number(_)) => serde_json::json!(0.0),
                    _ => serde_json::json!(""),
                },
                FilterValue::Text(_) => serde_json::json!(""),
            };
            return self.compare(&substitute, value);
        }
        self.compare(cell, value)
    }

    fn compare(&self, cell: &serde_json::Value, value: &FilterValue) -> bool {
        use std::cmp::Ordering;
        match self {
            FilterOp::In => match value {
                FilterValue::List(items) => {
                    items.iter().any(|item| item.matches(cell) == Some(Ordering::Equal))
                }
                single => single.matches(cell) == Some(Ordering::Equal),
            },
            FilterOp::Contains => {
                let needle = value.as_text().to_lowercase();
                cell_text(cell).to_lowercase().contains(&needle)
            }
            op => match value.matches(cell) {
                Some(ord) => match op {
                    FilterOp::Eq => ord == Ordering::Equal,
                    FilterOp::Ne => ord != Ordering::Equal,
                    FilterOp::Gt => ord == Ordering::Greater,
                    FilterOp::Ge => ord != Ordering::Less,
                    FilterOp::Lt => ord == Ordering::Less,
                    FilterOp::Le => ord != Ordering::Greater,
                    FilterOp::In | FilterOp::Contains => false,
                },
                // Incomparable types: only inequality holds.
                None => *op == FilterOp::Ne,
            },
        }
    }
}

fn cell_text(cell: &serde_json::Value) -> String {
    match cell {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FilterValue>),
}

impl FilterValue {
    pub fn as_text(&self) -> String {
        match self {
            FilterValue::Bool(b) => b.to_string(),
            FilterValue::Number(n) => format_number(*n),
            FilterValue::Text(s) => s.clone(),
            FilterValue::List(items) => {
                items.iter().map(|i| i.as_text()).collect::<Vec<_>>().join(",")
            }
        }
    }

    /// Text, or a list of text values.
    pub fn is_text(&self) -> bool {
        match self {
            FilterValue::Text(_) => true,
            FilterValue::List(items) => !items.is_empty() && items.iter().all(FilterValue::is_text),
            _ => false,
        }
    }

    pub fn to_lowercase(&self) -> FilterValue {
        match self {
            FilterValue::Text(s) => FilterValue::Text(s.to_lowercase()),
            FilterValue::List(items) => {
                FilterValue::List(items.iter().map(FilterValue::to_lowercase).collect())
            }
            other => other.clone(),
        }
    }

    /// Ordering of `cell` relative to this value, if the types are comparable.
    fn matches(&self, cell: &serde_json::Value) -> Option<std::cmp::Ordering> {
        match (self, cell) {
            (FilterValue::Number(n), serde_json::Value::Number(c)) => c.as_f64()?.partial_cmp(n),
            (FilterValue::Number(n), serde_json::Value::String(s)) => {
                s.trim().parse::<f64>().ok()?.partial_cmp(n)
            }
            (FilterValue::Text(t), serde_json::Value::String(s)) => {
                Some(s.to_lowercase().cmp(&t.to_lowercase()))
            }
            (FilterValue::Text(t), serde_json::Value::Number(c)) => {
                let parsed = t.trim().parse::<f64>().ok()?;
                c.as_f64()?.partial_cmp(&parsed)
            }
            (FilterValue::Bool(b), serde_json::Value::Bool(c)) => Some(c.cmp(b)),
            _ => None,
        }
    }
}

/// Integral values print without a fractional part.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: ColumnRef,
    pub op: FilterOp,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortTarget {
    Measure,
    Column(ColumnRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub by: SortTarget,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Measured column; `None` for `Count` means counting rows.
    pub measure: Option<ColumnRef>,
    pub aggregation: Aggregation,
    /// Grouping columns, or the projected columns of a row listing.
    #[serde(default)]
    pub group_by: Vec<ColumnRef>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: Option<Sort>,
    #[serde(default)]
    pub limit: Option<u64>,
    /// Table whose rows are counted or listed, when no measure names it.
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub unresolved_entities: Vec<String>,
}

impl Intent {
    pub fn new(aggregation: Aggregation, measure: Option<ColumnRef>) -> Self {
        Self {
            measure,
            aggregation,
            group_by: Vec::new(),
            filters: Vec::new(),
            sort: None,
            limit: None,
            subject: None,
            unresolved_entities: Vec::new(),
        }
    }

    pub fn sum(table: &str, column: &str) -> Self {
        Self::new(Aggregation::Sum, Some(ColumnRef::new(table, column)))
    }

    pub fn count_rows(table: &str) -> Self {
        let mut intent = Self::new(Aggregation::Count, None);
        intent.subject = Some(table.to_string());
        intent
    }

    pub fn group(mut self, table: &str, column: &str) -> Self {
        self.group_by.push(ColumnRef::new(table, column));
        self
    }

    pub fn filter(mut self, table: &str, column: &str, op: FilterOp, value: FilterValue) -> Self {
        self.filters.push(Filter {
            column: ColumnRef::new(table, column),
            op,
            value,
        });
        self
    }

    pub fn sorted(mut self, by: SortTarget, descending: bool) -> Self {
        self.sort = Some(Sort { by, descending });
        self
    }

    pub fn limited(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.unresolved_entities.is_empty()
    }

    /// Every column the intent touches, in measure, group, filter, sort order.
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut out: Vec<&ColumnRef> = Vec::new();
        out.extend(self.measure.iter());
        out.extend(self.group_by.iter());
        out.extend(self.filters.iter().map(|f| &f.column));
        if let Some(Sort {
            by: SortTarget::Column(c),
            ..
        }) = &self.sort
        {
            out.push(c);
        }
        out
    }

    pub fn referenced_tables(&self) -> BTreeSet<String> {
        let mut tables: BTreeSet<String> =
            self.columns().into_iter().map(|c| c.table.clone()).collect();
        if let Some(subject) = &self.subject {
            tables.insert(subject.clone());
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_op_null_semantics_differ() {
        let value = FilterValue::Number(100.0);
        assert!(!FilterOp::Lt.evaluate(&json!(null), &value));
        // A blank compares as zero in the model.
        assert!(FilterOp::Lt.evaluate_blank(&json!(null), &value));
    }

    #[test]
    fn test_filter_op_comparisons() {
        let text = |s: &str| FilterValue::Text(s.to_string());
        assert!(FilterOp::Ge.evaluate(&json!(5), &FilterValue::Number(5.0)));
        assert!(FilterOp::Eq.evaluate(&json!("US"), &text("US")));
        assert!(FilterOp::Ne.evaluate(&json!("DE"), &text("US")));
        assert!(FilterOp::Eq.evaluate(&json!("Active"), &text("ACTIVE")));
        assert!(!FilterOp::Ne.evaluate_blank(&json!("active"), &text("Active")));
        assert!(FilterOp::Contains.evaluate(&json!("Oil & Gas"), &text("gas")));
        let list = FilterValue::List(vec![text("US"), text("GB")]);
        assert!(FilterOp::In.evaluate(&json!("GB"), &list));
        assert!(!FilterOp::In.evaluate(&json!("FR"), &list));
    }

    #[test]
    fn test_intent_serde_shape() {
        let intent = Intent::sum("facility", "limit_amount")
            .group("customer", "industry")
            .filter("facility", "status", FilterOp::Eq, FilterValue::Text("active".into()))
            .sorted(SortTarget::Measure, true)
            .limited(5);
        let text = serde_json::to_string(&intent).unwrap();
        assert!(text.contains("\"op\":\"=\""));
        assert!(text.contains("\"by\":\"measure\""));
        let back: Intent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, intent);
    }

    #[test]
    fn test_referenced_tables() {
        let intent = Intent::count_rows("facility").group("country", "country_name");
        let tables: Vec<String> = intent.referenced_tables().into_iter().collect();
        assert_eq!(tables, vec!["country".to_string(), "facility".to_string()]);
    }
}
