//! Canonical paper index for cross-source deduplication
//!
//! Fuses academic API results and browser SERP results under one canonical
//! key per paper: resolved DOI first, arXiv id in its absence, raw URL as a
//! last resort. The index lives within a single pipeline execution and is
//! never shared across executions.

use std::collections::HashMap;

use crate::search::identifier::{normalize_doi, PaperIdentifier};
use crate::search::paper::{Paper, SerpItem};

/// Canonical dedup key, in precedence order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalKey {
    Doi(String),
    Arxiv(String),
    Url(String),
}

impl CanonicalKey {
    /// Derive the canonical key from an extracted identifier set
    #[must_use]
    pub fn from_identifier(id: &PaperIdentifier) -> Self {
        if let Some(doi) = &id.doi {
            return CanonicalKey::Doi(normalize_doi(doi));
        }
        if let Some(arxiv) = &id.arxiv_id {
            return CanonicalKey::Arxiv(arxiv.to_lowercase());
        }
        CanonicalKey::Url(id.url.clone())
    }

    fn from_paper(paper: &Paper) -> Self {
        if let Some(doi) = &paper.doi {
            return CanonicalKey::Doi(normalize_doi(doi));
        }
        if let Some(arxiv) = &paper.arxiv_id {
            return CanonicalKey::Arxiv(arxiv.to_lowercase());
        }
        CanonicalKey::Url(paper.reference_url())
    }
}

/// One deduplicated record in the index
#[derive(Debug, Clone, Default)]
pub struct CanonicalEntry {
    /// Resolved paper object from an academic API, if any
    pub paper: Option<Paper>,
    /// SERP result, if the paper surfaced in browser search
    pub serp: Option<SerpItem>,
    /// Identifier extracted from the SERP URL, if any
    pub identifier: Option<PaperIdentifier>,
    /// Seen in the academic API result set
    pub in_api: bool,
    /// Seen in the browser SERP result set
    pub in_serp: bool,
}

impl CanonicalEntry {
    /// True when no abstract is available, so the entry still requires a
    /// web fetch to yield content.
    #[must_use]
    pub fn needs_fetch(&self) -> bool {
        self.paper
            .as_ref()
            .and_then(|p| p.abstract_text.as_ref())
            .is_none()
    }
}

/// Deduplication statistics across both sources.
///
/// Invariant: `total == api_only + serp_only + both`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub total: usize,
    pub api_only: usize,
    pub serp_only: usize,
    pub both: usize,
}

/// In-memory dedup index keyed by canonical identifier.
///
/// Only one entry per canonical key ever exists within a single pipeline
/// execution; later registrations merge into the existing entry. Entries
/// keep insertion order so "top N papers" is deterministic.
#[derive(Debug, Default)]
pub struct CanonicalPaperIndex {
    items: Vec<CanonicalEntry>,
    by_key: HashMap<CanonicalKey, usize>,
}

impl CanonicalPaperIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, key: CanonicalKey) -> &mut CanonicalEntry {
        let idx = match self.by_key.get(&key) {
            Some(&i) => i,
            None => {
                self.items.push(CanonicalEntry::default());
                let i = self.items.len() - 1;
                self.by_key.insert(key, i);
                i
            }
        };
        &mut self.items[idx]
    }

    /// Register an academic API paper
    pub fn register_paper(&mut self, paper: Paper) {
        let entry = self.slot(CanonicalKey::from_paper(&paper));
        entry.in_api = true;
        // First API record wins; later duplicates only confirm the source.
        if entry.paper.is_none() {
            entry.paper = Some(paper);
        }
    }

    /// Register a browser SERP result under its extracted identifier
    pub fn register_serp_result(&mut self, item: SerpItem, identifier: PaperIdentifier) {
        let entry = self.slot(CanonicalKey::from_identifier(&identifier));
        entry.in_serp = true;
        if entry.serp.is_none() {
            entry.serp = Some(item);
        }
        if entry.identifier.is_none() {
            entry.identifier = Some(identifier);
        }
    }

    /// All entries in insertion order
    pub fn entries(&self) -> impl Iterator<Item = &CanonicalEntry> {
        self.items.iter()
    }

    /// All entries in insertion order, mutable
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut CanonicalEntry> {
        self.items.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Deduplication statistics
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {
            total: self.items.len(),
            ..IndexStats::default()
        };
        for entry in &self.items {
            match (entry.in_api, entry.in_serp) {
                (true, true) => stats.both += 1,
                (true, false) => stats.api_only += 1,
                (false, true) => stats.serp_only += 1,
                (false, false) => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::identifier::extract_identifiers;

    fn paper(id: &str, doi: Option<&str>, abstract_text: Option<&str>) -> Paper {
        Paper {
            id: id.to_string(),
            title: format!("paper {id}"),
            doi: doi.map(str::to_string),
            abstract_text: abstract_text.map(str::to_string),
            source_api: "semantic_scholar".to_string(),
            ..Paper::default()
        }
    }

    fn serp(url: &str) -> SerpItem {
        SerpItem {
            url: url.to_string(),
            title: "t".to_string(),
            engine: "duckduckgo".to_string(),
            rank: 1,
            ..SerpItem::default()
        }
    }

    #[test]
    fn equal_dois_merge_to_one_entry() {
        let mut index = CanonicalPaperIndex::new();
        index.register_paper(paper("p1", Some("10.1000/ABC"), Some("a")));

        let url = "https://doi.org/10.1000/abc";
        index.register_serp_result(serp(url), extract_identifiers(url));

        assert_eq!(index.len(), 1);
        let stats = index.stats();
        assert_eq!(stats.both, 1);
        assert_eq!(stats.total, stats.api_only + stats.serp_only + stats.both);
    }

    #[test]
    fn distinct_urls_without_identifiers_do_not_merge() {
        let mut index = CanonicalPaperIndex::new();
        for url in ["https://a.example/x", "https://b.example/x"] {
            index.register_serp_result(serp(url), extract_identifiers(url));
        }
        assert_eq!(index.len(), 2);
        assert_eq!(index.stats().serp_only, 2);
    }

    #[test]
    fn abstract_presence_controls_needs_fetch() {
        let mut index = CanonicalPaperIndex::new();
        index.register_paper(paper("p1", Some("10.1/a"), Some("text")));
        index.register_paper(paper("p2", Some("10.1/b"), None));

        let entries: Vec<_> = index.entries().collect();
        assert!(!entries[0].needs_fetch());
        assert!(entries[1].needs_fetch());
    }

    #[test]
    fn arxiv_key_used_in_dois_absence() {
        let mut index = CanonicalPaperIndex::new();
        index.register_paper(Paper {
            id: "p1".to_string(),
            arxiv_id: Some("2101.01234".to_string()),
            source_api: "openalex".to_string(),
            ..Paper::default()
        });
        let url = "https://arxiv.org/abs/2101.01234v2";
        index.register_serp_result(serp(url), extract_identifiers(url));
        assert_eq!(index.len(), 1);
        assert_eq!(index.stats().both, 1);
    }
}
