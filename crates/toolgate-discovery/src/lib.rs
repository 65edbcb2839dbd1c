#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! TF-IDF tool discovery (spec §4.8).
//!
//! One document per catalog entry: `"{server_name} {tool_name} {description}"`.
//! The index is immutable once built; a catalog change means calling
//! [`ToolIndex::build`] again from scratch, not an incremental update.

use std::collections::HashMap;

use serde::Serialize;

/// One row of the corpus the index is built over.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub server_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub server_id: String,
    pub tool_name: String,
    pub score: f64,
}

struct Document {
    server_id: String,
    tool_name: String,
    term_freq: HashMap<String, u32>,
    norm: f64,
}

/// Lowercases, splits on non-alphanumeric boundaries, drops tokens shorter
/// than 2 characters (spec §4.8).
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 2)
        .map(str::to_string)
        .collect()
}

/// An immutable, in-memory inverted index over a snapshot of the catalog.
pub struct ToolIndex {
    documents: Vec<Document>,
    /// Number of documents each term appears in at least once.
    doc_freq: HashMap<String, u32>,
}

impl ToolIndex {
    /// Builds a fresh index from a corpus snapshot. Rebuilding is the only
    /// way to reflect catalog changes (spec §4.8: "rebuilds require a full
    /// `index()` call").
    pub fn build(entries: &[ToolEntry]) -> Self {
        let mut doc_freq: HashMap<String, u32> = HashMap::new();
        let mut raw_docs: Vec<(String, String, HashMap<String, u32>)> = Vec::with_capacity(entries.len());

        for entry in entries {
            let text = format!("{} {} {}", entry.server_name, entry.tool_name, entry.description);
            let mut term_freq: HashMap<String, u32> = HashMap::new();
            for token in tokenize(&text) {
                *term_freq.entry(token).or_insert(0) += 1;
            }
            for term in term_freq.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            raw_docs.push((entry.server_id.clone(), entry.tool_name.clone(), term_freq));
        }

        let n = entries.len().max(1) as f64;
        let idf = |term: &str, doc_freq: &HashMap<String, u32>| -> f64 {
            let df = doc_freq.get(term).copied().unwrap_or(0) as f64;
            ((n + 1.0) / (df + 1.0)).ln() + 1.0
        };

        let documents = raw_docs
            .into_iter()
            .map(|(server_id, tool_name, term_freq)| {
                let norm = term_freq
                    .iter()
                    .map(|(term, tf)| {
                        let weight = (*tf as f64) * idf(term, &doc_freq);
                        weight * weight
                    })
                    .sum::<f64>()
                    .sqrt();
                Document { server_id, tool_name, term_freq, norm }
            })
            .collect();

        Self { documents, doc_freq }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.documents.len().max(1) as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        ((n + 1.0) / (df + 1.0)).ln() + 1.0
    }

    /// Cosine similarity search; returns the top `top_k` hits sorted by
    /// descending score. RBAC filtering happens downstream in the router
    /// (spec §4.8).
    pub fn search(&self, query: &str, top_k: usize) -> Vec<SearchHit> {
        let mut query_tf: HashMap<String, u32> = HashMap::new();
        for token in tokenize(query) {
            *query_tf.entry(token).or_insert(0) += 1;
        }
        if query_tf.is_empty() {
            return Vec::new();
        }

        let query_weights: HashMap<&str, f64> = query_tf
            .iter()
            .map(|(term, tf)| (term.as_str(), (*tf as f64) * self.idf(term)))
            .collect();
        let query_norm = query_weights.values().map(|w| w * w).sum::<f64>().sqrt();
        if query_norm == 0.0 {
            return Vec::new();
        }

        let mut scored: Vec<SearchHit> = self
            .documents
            .iter()
            .filter_map(|doc| {
                if doc.norm == 0.0 {
                    return None;
                }
                let dot: f64 = query_weights
                    .iter()
                    .filter_map(|(term, qw)| {
                        doc.term_freq.get(*term).map(|tf| {
                            let dw = (*tf as f64) * self.idf(term);
                            qw * dw
                        })
                    })
                    .sum();
                if dot <= 0.0 {
                    return None;
                }
                Some(SearchHit {
                    server_id: doc.server_id.clone(),
                    tool_name: doc.tool_name.clone(),
                    score: dot / (query_norm * doc.norm),
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(server_id: &str, server_name: &str, tool_name: &str, description: &str) -> ToolEntry {
        ToolEntry {
            server_id: server_id.into(),
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            description: description.into(),
        }
    }

    #[test]
    fn tokenize_lowercases_and_drops_short_tokens() {
        let tokens = tokenize("GitHub PR #42 - a fix");
        assert_eq!(tokens, vec!["github", "pr", "42", "fix"]);
    }

    #[test]
    fn top_one_search_is_exact_match_for_indexed_tool_name() {
        let entries = vec![
            entry("builtin:github", "GitHub", "create_issue", "Open a new GitHub issue"),
            entry("builtin:slack", "Slack", "send_message", "Post a message to a Slack channel"),
            entry("builtin:jira", "Jira", "create_ticket", "File a Jira support ticket"),
        ];
        let index = ToolIndex::build(&entries);

        let hits = index.search("create_issue", 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool_name, "create_issue");
    }

    #[test]
    fn search_respects_top_k() {
        let entries = (0..10)
            .map(|i| entry(&format!("builtin:s{i}"), "Server", &format!("tool_{i}"), "generic tool for testing"))
            .collect::<Vec<_>>();
        let index = ToolIndex::build(&entries);
        let hits = index.search("tool testing", 3);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn empty_query_returns_no_hits() {
        let entries = vec![entry("builtin:github", "GitHub", "create_issue", "Open an issue")];
        let index = ToolIndex::build(&entries);
        assert!(index.search("   ", 5).is_empty());
    }

    #[test]
    fn unrelated_query_returns_no_hits() {
        let entries = vec![entry("builtin:github", "GitHub", "create_issue", "Open an issue")];
        let index = ToolIndex::build(&entries);
        assert!(index.search("zzz_nonexistent_term", 5).is_empty());
    }

    #[test]
    fn empty_corpus_builds_and_searches_without_panicking() {
        let index = ToolIndex::build(&[]);
        assert!(index.is_empty());
        assert!(index.search("anything", 5).is_empty());
    }
}
