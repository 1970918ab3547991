use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use super::concepts::best_rank;
use super::{Relationship, SchemaCatalog};

/// Ordered list of relationships from a start table to a target table.
pub type JoinPath = Vec<Relationship>;

/// Relationship graph keyed by table, edges labelled by their column pair.
///
/// Edges are only walked from the referencing (many) side to the referenced
/// (one) side, so every path is many-to-one and cannot duplicate fact rows.
#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    edges: BTreeMap<String, Vec<Relationship>>,
}

impl RelationshipGraph {
    pub fn from_catalog(catalog: &SchemaCatalog) -> Self {
        let rank: BTreeMap<&str, usize> = catalog
            .tables
            .iter()
            .map(|t| (t.name.as_str(), best_rank(&t.business_concepts)))
            .collect();

        let mut edges: BTreeMap<String, Vec<Relationship>> = BTreeMap::new();
        for rel in &catalog.relationships {
            if rel.from_table == rel.to_table {
                continue;
            }
            edges.entry(rel.from_table.clone()).or_default().push(rel.clone());
        }
        // Neighbour order is the tie-break for equally short paths.
        for list in edges.values_mut() {
            list.sort_by(|a, b| {
                let ra = rank.get(a.to_table.as_str()).copied().unwrap_or(usize::MAX);
                let rb = rank.get(b.to_table.as_str()).copied().unwrap_or(usize::MAX);
                ra.cmp(&rb)
                    .then_with(|| a.to_table.cmp(&b.to_table))
                    .then_with(|| a.from_column.cmp(&b.from_column))
            });
        }
        Self { edges }
    }

    pub fn neighbors(&self, table: &str) -> &[Relationship] {
        self.edges.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Breadth-first shortest path. `Some(vec![])` when `from == to`.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<JoinPath> {
        if from == to {
            return Some(Vec::new());
        }
        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();
        queue.push_back((from.to_string(), Vec::new()));
        visited.insert(from.to_string());

        while let Some((current, path)) = queue.pop_front() {
            for edge in self.neighbors(&current) {
                if !visited.insert(edge.to_table.clone()) {
                    continue;
                }
                let mut next: JoinPath = path.clone();
                next.push(edge.clone());
                if edge.to_table == to {
                    return Some(next);
                }
                queue.push_back((edge.to_table.clone(), next));
            }
        }
        None
    }

    /// Every table reachable from `from`, including itself.
    pub fn reachable(&self, from: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from.to_string()];
        while let Some(table) = stack.pop() {
            if !seen.insert(table.clone()) {
                continue;
            }
            for edge in self.neighbors(&table) {
                stack.push(edge.to_table.clone());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::credit_catalog;

    #[test]
    fn test_shortest_path_multi_hop() {
        let graph = credit_catalog().graph();
        let path = graph.shortest_path("facility", "country").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].to_table, "customer");
        assert_eq!(path[1].to_table, "country");
    }

    #[test]
    fn test_no_reverse_traversal() {
        let graph = credit_catalog().graph();
        // customer -> facility would fan out; the graph refuses it.
        assert!(graph.shortest_path("customer", "facility").is_none());
        assert!(graph.shortest_path("currency", "country").is_none());
    }

    #[test]
    fn test_same_table_is_empty_path() {
        let graph = credit_catalog().graph();
        assert_eq!(graph.shortest_path("customer", "customer"), Some(vec![]));
    }

    #[test]
    fn test_neighbors_follow_concept_preference() {
        let graph = credit_catalog().graph();
        let targets: Vec<&str> = graph
            .neighbors("facility")
            .iter()
            .map(|r| r.to_table.as_str())
            .collect();
        // customer carries geography (country_key) so it outranks currency.
        assert_eq!(targets, vec!["customer", "currency"]);
        assert!(graph.reachable("facility").contains("country"));
    }
}
