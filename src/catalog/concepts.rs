//! Business concept keyword table
//!
//! Concepts are assigned by substring match on lowercased table and column
//! names. The match is approximate; it only ranks join candidates
//! and never blocks generation.

use std::collections::BTreeSet;

/// Curated concept -> keyword table. Order of this slice is also the
/// tie-break preference used by join-path selection.
pub const CONCEPT_KEYWORDS: &[(&str, &[&str])] = &[
    ("geography", &["country", "region", "location", "address", "city", "state", "postal", "zip"]),
    ("customer", &["customer", "client", "account_holder", "borrower", "obligor"]),
    ("time", &["date", "time", "period", "month", "year", "quarter"]),
    ("product", &["product", "service", "offering"]),
    ("currency", &["currency", "ccy", "exchange", "forex", "fx_"]),
    ("risk", &["risk", "rating", "exposure", "default", "probability", "lgd"]),
    ("financial", &["loan", "credit", "facility", "limit", "balance", "amount", "transaction"]),
    ("organization", &["organization", "institution", "entity", "owner", "branch"]),
    ("industry", &["industry", "sector", "naics", "sic_code"]),
];

/// Concepts whose keywords appear in `name`.
pub fn concepts_for(name: &str) -> BTreeSet<String> {
    let lower = name.to_lowercase();
    CONCEPT_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(concept, _)| concept.to_string())
        .collect()
}

/// Rank of a concept in the preference order; unknown concepts rank last.
pub fn preference_rank(concept: &str) -> usize {
    CONCEPT_KEYWORDS
        .iter()
        .position(|(c, _)| *c == concept)
        .unwrap_or(CONCEPT_KEYWORDS.len())
}

/// Best (lowest) rank among a set of concepts.
pub fn best_rank(concepts: &BTreeSet<String>) -> usize {
    concepts
        .iter()
        .map(|c| preference_rank(c))
        .min()
        .unwrap_or(CONCEPT_KEYWORDS.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concepts_from_column_names() {
        let concepts = concepts_for("CUSTOMER_COUNTRY_CODE");
        assert!(concepts.contains("customer"));
        assert!(concepts.contains("geography"));
        assert!(concepts_for("widget_sku").is_empty());
    }

    #[test]
    fn test_geography_preferred_over_currency() {
        assert!(preference_rank("geography") < preference_rank("currency"));
        assert_eq!(preference_rank("unheard_of"), CONCEPT_KEYWORDS.len());
    }
}
