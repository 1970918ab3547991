use strsim::jaro_winkler;

use super::ColumnRef;
use crate::catalog::{DataType, SchemaCatalog, TableInfo};

/// Fuzzy matcher from question/model vocabulary to catalog names.
///
/// Names that do not reach the threshold are reported as unresolved; the
/// resolver never guesses below it.
pub struct EntityResolver {
    /// Similarity threshold (0.0-1.0) for accepting a match
    pub similarity_threshold: f64,
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
        }
    }
}

impl EntityResolver {
    pub fn new(threshold: f64) -> Self {
        Self {
            similarity_threshold: threshold,
        }
    }

    /// Lowercase, separators to `_`, punctuation removed.
    pub fn normalize(&self, s: &str) -> String {
        let mapped: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        mapped
            .split('_')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Jaro-Winkler with a small bonus when one name contains the other.
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = self.normalize(a);
        let b = self.normalize(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }
        let jw = jaro_winkler(&a, &b);
        let bonus = if a.contains(&b) || b.contains(&a) {
            let len_diff = (a.len() as f64 - b.len() as f64).abs();
            let max_len = a.len().max(b.len()) as f64;
            (1.0 - len_diff / max_len) * 0.1
        } else {
            0.0
        };
        (jw + bonus).min(1.0)
    }

    pub fn resolve_table<'a>(
        &self,
        catalog: &'a SchemaCatalog,
        raw: &str,
    ) -> Option<&'a TableInfo> {
        if let Some(table) = catalog.find_table(raw.trim()) {
            return Some(table);
        }
        best(
            catalog.tables.iter().map(|t| (t, self.similarity(raw, &t.name))),
            self.similarity_threshold,
        )
    }

    /// Resolve `table.column` or a bare column name.
    ///
    /// A bare name that only matches a table resolves to that table's label
    /// column (its first descriptive non-key column).
    pub fn resolve_column(&self, catalog: &SchemaCatalog, raw: &str) -> Option<ColumnRef> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some((table_part, column_part)) = raw.split_once('.') {
            let table = self.resolve_table(catalog, table_part)?;
            return self.resolve_in_table(table, column_part);
        }

        let mut candidates: Vec<(ColumnRef, f64, u8)> = Vec::new();
        for table in &catalog.tables {
            for column in &table.columns {
                let score = self.similarity(raw, &column.name);
                if score >= self.similarity_threshold {
                    // Plain attributes win ties over keys.
                    let key_penalty = u8::from(column.is_key || column.references.is_some());
                    let candidate = ColumnRef::new(&table.name, &column.name);
                    candidates.push((candidate, score, key_penalty));
                }
            }
        }
        let mut best_column: Option<(ColumnRef, f64, u8)> = None;
        for candidate in candidates {
            let better = match &best_column {
                None => true,
                Some((_, score, penalty)) => {
                    candidate.1 > *score || (candidate.1 == *score && candidate.2 < *penalty)
                }
            };
            if better {
                best_column = Some(candidate);
            }
        }
        if let Some((column, score, _)) = best_column {
            if score >= 1.0 {
                return Some(column);
            }
            // A table name match beats a merely similar column name.
            if let Some(table) = self.resolve_table(catalog, raw) {
                if self.similarity(raw, &table.name) > score {
                    if let Some(label) = label_column(table) {
                        return Some(label);
                    }
                }
            }
            return Some(column);
        }
        self.resolve_table(catalog, raw).and_then(label_column)
    }

    fn resolve_in_table(&self, table: &TableInfo, raw: &str) -> Option<ColumnRef> {
        let exact = table.columns.iter().find(|c| c.name.eq_ignore_ascii_case(raw.trim()));
        if let Some(column) = exact {
            return Some(ColumnRef::new(&table.name, &column.name));
        }
        best(
            table.columns.iter().map(|c| (c, self.similarity(raw, &c.name))),
            self.similarity_threshold,
        )
        .map(|c| ColumnRef::new(&table.name, &c.name))
    }
}

fn best<T>(scored: impl Iterator<Item = (T, f64)>, threshold: f64) -> Option<T> {
    let mut winner: Option<(T, f64)> = None;
    for (item, score) in scored {
        if score < threshold {
            continue;
        }
        if winner.as_ref().map_or(true, |(_, s)| score > *s) {
            winner = Some((item, score));
        }
    }
    winner.map(|(item, _)| item)
}

fn label_column(table: &TableInfo) -> Option<ColumnRef> {
    table
        .columns
        .iter()
        .find(|c| !c.is_key && c.references.is_none() && c.data_type == DataType::Text)
        .map(|c| ColumnRef::new(&table.name, &c.name))
}
