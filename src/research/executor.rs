//! Mechanical search execution
//!
//! Runs one agent-designed query through the search → fetch → extract →
//! evaluate pipeline. Expansion is strictly mechanical (site/filetype
//! operators); the executor never designs queries or makes strategic
//! decisions. That is the external agent's job.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::collaborators::{
    CitationEdge, ClaimEvidence, Collaborators, NliPair, Passage, Relation, Stance,
};
use crate::config::{Settings, WebCitationDetectionConfig};
use crate::error::CoreResult;
use crate::research::domains::{
    domain_category, host_of, is_primary_source_domain, registered_domain, DomainCategory,
};
use crate::research::state::{ExplorationState, SearchStatus};
use crate::research::ucb::Priority;
use crate::search::paper::{FetchMethod, PageType, SerpItem};
use crate::storage::{short_id, Database, NewPage};

/// Claim text handed to the LLM extractor is truncated to this many chars
const CLAIM_EXTRACTION_TEXT_LIMIT: usize = 4000;

/// Extracted text below this length is not considered useful
const USEFUL_TEXT_MIN_CHARS: usize = 200;

/// Sentinel for "no candidate limit" when the config says 0
const UNLIMITED_CANDIDATES: usize = 10_000;

/// A claim surfaced by one execution
#[derive(Debug, Clone, Serialize)]
pub struct ClaimRecord {
    pub id: String,
    pub text: String,
    pub confidence: f64,
    pub source_url: String,
    pub is_primary_source: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_refutation: bool,
}

/// Result of one executor run
#[derive(Debug, Clone, Default)]
pub struct ExecutorResult {
    pub search_id: String,
    pub status: String,
    pub pages_fetched: u32,
    pub useful_fragments: u32,
    pub harvest_rate: f64,
    pub independent_sources: u32,
    pub has_primary_source: bool,
    pub satisfaction_score: f64,
    pub novelty_score: f64,
    pub new_claims: Vec<ClaimRecord>,
    pub auth_blocked_urls: u32,
    pub auth_queued_count: u32,
    pub errors: Vec<String>,
}

/// Gate for web citation detection on one page.
///
/// Precedence: disabled, then per-task page budget (0 = unlimited),
/// then the primary-source requirement, then the usefulness requirement.
#[must_use]
pub fn should_run_web_citation_detection(
    config: &WebCitationDetectionConfig,
    pages_processed: usize,
    is_primary: bool,
    is_useful: bool,
) -> bool {
    if !config.enabled {
        return false;
    }
    if config.max_pages_per_task > 0 && pages_processed >= config.max_pages_per_task {
        return false;
    }
    if config.run_on_primary_sources_only && !is_primary {
        return false;
    }
    if config.require_useful_text && !is_useful {
        return false;
    }
    true
}

/// Candidate limit for the citation detector; the config's 0 means
/// unlimited and maps to a large sentinel.
#[must_use]
pub fn citation_detector_max_candidates(config: &WebCitationDetectionConfig) -> usize {
    if config.max_candidates_per_page == 0 {
        UNLIMITED_CANDIDATES
    } else {
        config.max_candidates_per_page
    }
}

/// 16-hex content hash over the first 1 KB of extracted text. Cheap, and
/// good enough for the recent-fragment novelty window.
#[must_use]
pub fn fragment_content_hash(text: &str) -> String {
    let prefix: String = text.chars().take(1024).collect();
    let digest = Sha256::digest(prefix.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Mechanical executor for one search
pub struct SearchExecutor {
    task_id: String,
    state: Arc<ExplorationState>,
    db: Database,
    collaborators: Collaborators,
    settings: Arc<Settings>,
    worker_id: Option<usize>,
    seen_fragment_hashes: HashSet<String>,
    seen_domains: HashSet<String>,
    citation_pages_processed: usize,
}

impl SearchExecutor {
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        state: Arc<ExplorationState>,
        db: Database,
        collaborators: Collaborators,
        settings: Arc<Settings>,
        worker_id: Option<usize>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            db,
            collaborators,
            settings,
            worker_id,
            seen_fragment_hashes: HashSet::new(),
            seen_domains: HashSet::new(),
            citation_pages_processed: 0,
        }
    }

    /// Execute a search: mechanical expansion, one SERP call per expansion,
    /// URL dedup, then fetch/extract up to the page budget.
    pub async fn execute(
        &mut self,
        search_id: &str,
        query: &str,
        priority: Priority,
        budget_pages: Option<u32>,
        engines: Option<Vec<String>>,
        serp_max_pages: Option<u32>,
    ) -> ExecutorResult {
        info!(task_id = %self.task_id, search_id, query = %truncate(query, 100), "Executing search");

        self.state
            .register_search(search_id, query, priority, budget_pages, None);
        self.state.start_search(search_id);

        let engines_label = engines.as_ref().map(|e| e.join(","));
        if let Err(e) = self
            .db
            .insert_query(search_id, &self.task_id, query, engines_label.as_deref())
            .await
        {
            warn!(search_id, error = %e, "Failed to persist query row");
        }

        let mut result = ExecutorResult {
            search_id: search_id.to_string(),
            status: SearchStatus::Running.as_str().to_string(),
            ..ExecutorResult::default()
        };

        // Step 1: mechanical expansion
        let expanded = expand_query(query);

        // Step 2: one SERP call per expansion, deduplicated by URL
        let mut unique_items: Vec<SerpItem> = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        for eq in &expanded {
            let items = self.execute_search(eq, engines.clone(), serp_max_pages).await;
            for item in items {
                if !item.url.is_empty() && seen_urls.insert(item.url.clone()) {
                    unique_items.push(item);
                }
            }
        }
        info!(
            search_id,
            expanded_count = expanded.len(),
            total_results = unique_items.len(),
            "Search completed"
        );

        for item in &unique_items {
            if let Err(e) = self
                .db
                .insert_serp_item(
                    search_id,
                    &item.url,
                    &item.title,
                    &item.snippet,
                    &item.engine,
                    item.rank as i64,
                )
                .await
            {
                debug!(url = %truncate(&item.url, 50), error = %e, "Failed to persist SERP item");
            }
        }

        // Step 3: fetch and extract from top results
        let budget = budget_pages.unwrap_or_else(|| self.state.get_dynamic_budget(search_id));
        for item in unique_items.iter().take(budget as usize) {
            let (within_budget, _) = self.state.check_budget();
            if !within_budget {
                result.errors.push("Task page budget reached".to_string());
                break;
            }
            if self.state.check_novelty_stop_condition(search_id) {
                info!(search_id, "Novelty stop condition met");
                break;
            }
            if let Err(e) = self.fetch_and_extract(search_id, item, &mut result).await {
                debug!(url = %truncate(&item.url, 50), error = %e, "Fetch/extract failed");
            }
        }

        // Step 4: copy final metrics from state
        if let Some(search) = self.state.get_search(search_id) {
            let mut search = search;
            search.update_status();
            result.status = search.status.as_str().to_string();
            result.pages_fetched = search.pages_fetched;
            result.useful_fragments = search.useful_fragments;
            result.harvest_rate = search.harvest_rate;
            result.independent_sources = search.independent_sources;
            result.has_primary_source = search.has_primary_source;
            result.satisfaction_score = search.satisfaction_score;
            result.novelty_score = search.novelty_score;

            if let Err(e) = self
                .db
                .update_query_harvest_rate(search_id, search.harvest_rate)
                .await
            {
                debug!(search_id, error = %e, "Failed to update query harvest rate");
            }
        }

        result
    }

    /// One SERP collaborator call. Engine failures degrade to an empty
    /// result set, never an error.
    async fn execute_search(
        &self,
        query: &str,
        engines: Option<Vec<String>>,
        serp_max_pages: Option<u32>,
    ) -> Vec<SerpItem> {
        let request = crate::collaborators::SerpRequest {
            query: query.to_string(),
            limit: 10,
            engines,
            task_id: self.task_id.clone(),
            serp_max_pages,
            worker_id: self.worker_id,
        };
        match self.collaborators.serp.search(request).await {
            Ok(items) => items,
            Err(e) => {
                warn!(query = %truncate(query, 50), error = %e, "Search failed");
                Vec::new()
            }
        }
    }

    /// Fetch one URL, extract its content, and record everything the page
    /// yields: page row, fragment row, claims, citation edges.
    async fn fetch_and_extract(
        &mut self,
        search_id: &str,
        serp_item: &SerpItem,
        result: &mut ExecutorResult,
    ) -> CoreResult<()> {
        let url = &serp_item.url;
        if url.is_empty() {
            return Ok(());
        }

        let host = host_of(url).unwrap_or_else(|| url.clone());
        let domain_short = registered_domain(&host);
        let is_primary = is_primary_source_domain(&host);
        let is_independent = self.seen_domains.insert(domain_short.clone());

        let context = crate::collaborators::FetchContext {
            referer: serp_item.engine.clone(),
            task_id: self.task_id.clone(),
            worker_id: self.worker_id,
        };
        let fetch = self.collaborators.fetcher.fetch(url, &context).await?;
        if !fetch.ok {
            if fetch.auth_queued {
                result.auth_blocked_urls += 1;
                result.auth_queued_count += 1;
            }
            debug!(url = %truncate(url, 50), reason = ?fetch.reason, "Fetch failed");
            return Ok(());
        }

        self.state
            .record_page_fetch(search_id, &domain_short, is_primary, is_independent);

        let page_id = self
            .db
            .upsert_page(&NewPage {
                url: fetch.final_url.clone().unwrap_or_else(|| url.clone()),
                domain: host.clone(),
                page_type: PageType::Html,
                fetch_method: FetchMethod::Browser,
                title: Some(serp_item.title.clone()),
                paper_metadata: None,
            })
            .await?;

        let Some(html_path) = fetch.html_path.as_deref() else {
            return Ok(());
        };
        let extract = self
            .collaborators
            .extractor
            .extract(html_path, "html")
            .await?;
        if extract.text.is_empty() {
            return Ok(());
        }

        let content_hash = fragment_content_hash(&extract.text);
        let is_novel = self.seen_fragment_hashes.insert(content_hash.clone());
        let is_useful = extract.text.chars().count() > USEFUL_TEXT_MIN_CHARS;

        let fragment_id = self
            .db
            .insert_fragment(&page_id, "body", &extract.text, extract.title.as_deref(), 0)
            .await?;

        self.state
            .record_fragment(search_id, &content_hash, is_useful, is_novel);

        // Claims come from primary sources only; a non-primary page never
        // produces a claim row, however useful its text.
        if is_useful && is_primary {
            let claims = self
                .extract_claims_from_text(&extract.text, url, &serp_item.title, is_primary)
                .await;

            if claims.is_empty() {
                // No LLM claims: still record the page's lead text as a
                // potential claim so the agent sees what was found.
                let claim_id = short_id("c");
                let snippet: String = extract.text.chars().take(200).collect();
                if let Err(e) = self
                    .persist_claim(&claim_id, &snippet, 0.5, url, &fragment_id)
                    .await
                {
                    debug!(claim_id = %claim_id, error = %e, "Failed to persist snippet claim");
                }
                self.state.record_claim(search_id, false, false);
                result.new_claims.push(ClaimRecord {
                    id: claim_id,
                    text: snippet,
                    confidence: 0.5,
                    source_url: url.clone(),
                    is_primary_source: is_primary,
                    is_refutation: false,
                });
            } else {
                for (text, confidence) in claims {
                    let claim_id = short_id("c");
                    if let Err(e) = self
                        .persist_claim(&claim_id, &text, confidence, url, &fragment_id)
                        .await
                    {
                        debug!(claim_id = %claim_id, error = %e, "Failed to persist claim");
                    }
                    self.state.record_claim(search_id, false, false);
                    result.new_claims.push(ClaimRecord {
                        id: claim_id,
                        text: truncate(&text, 200).to_string(),
                        confidence,
                        source_url: url.clone(),
                        is_primary_source: is_primary,
                        is_refutation: false,
                    });
                }
            }
        }

        self.run_web_citation_detection(&page_id, html_path, url, &host, is_primary, is_useful)
            .await;

        Ok(())
    }

    /// Claim extraction, gated on primary sources only. Input text is
    /// truncated and the fast model is used to keep LLM time bounded.
    async fn extract_claims_from_text(
        &self,
        text: &str,
        source_url: &str,
        _title: &str,
        is_primary: bool,
    ) -> Vec<(String, f64)> {
        if !is_primary {
            return Vec::new();
        }

        let passage = Passage {
            id: fragment_content_hash(source_url),
            text: text.chars().take(CLAIM_EXTRACTION_TEXT_LIMIT).collect(),
            source_url: source_url.to_string(),
        };
        let context = self.state.task_hypothesis();
        match self
            .collaborators
            .claim_extractor
            .extract_claims(vec![passage], "extract_claims", &context, false)
            .await
        {
            Ok(extraction) if extraction.ok => extraction
                .claims
                .into_iter()
                .filter(|c| !c.claim.is_empty())
                .map(|c| (c.claim, c.confidence))
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!(source_url = %truncate(source_url, 50), error = %e, "LLM claim extraction failed");
                Vec::new()
            }
        }
    }

    /// Persist a claim row, judge it against its source fragment with NLI,
    /// and record the evidence edge.
    ///
    /// NLI failures never skip edge persistence; that would silently
    /// unwire the graph. A failed judgement records a neutral edge with
    /// zero confidence instead.
    pub async fn persist_claim(
        &self,
        claim_id: &str,
        text: &str,
        confidence: f64,
        source_url: &str,
        fragment_id: &str,
    ) -> CoreResult<()> {
        self.db
            .insert_claim(
                claim_id,
                &self.task_id,
                text,
                confidence,
                Some(&format!("source_url={source_url}")),
            )
            .await?;

        // Premise is the source fragment's text; the claim judges itself
        // when the fragment is unavailable.
        let premise = self
            .db
            .fragment_text(fragment_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| text.to_string());

        let (stance, nli_confidence) = match self
            .collaborators
            .nli
            .judge(vec![NliPair {
                pair_id: claim_id.to_string(),
                premise,
                hypothesis: text.to_string(),
            }])
            .await
        {
            Ok(verdicts) => verdicts
                .first()
                .map(|v| (v.stance, v.confidence))
                .unwrap_or((Stance::Neutral, 0.0)),
            Err(e) => {
                debug!(claim_id, error = %e, "NLI judgement failed; persisting neutral edge");
                (Stance::Neutral, 0.0)
            }
        };

        let source_category = host_of(source_url)
            .map(|h| domain_category(&h))
            .filter(|c| *c != DomainCategory::Unknown)
            .map(|c| c.as_str().to_string());

        self.collaborators
            .evidence_graph
            .add_claim_evidence(ClaimEvidence {
                claim_id: claim_id.to_string(),
                fragment_id: fragment_id.to_string(),
                task_id: self.task_id.clone(),
                relation: Relation::from(stance),
                nli_label: stance,
                nli_confidence,
                confidence: nli_confidence,
                source_domain_category: source_category,
                target_domain_category: None,
            })
            .await
    }

    /// Detect outbound citations on a page and wire CITES edges, within
    /// the configured policy gates.
    async fn run_web_citation_detection(
        &mut self,
        page_id: &str,
        html_path: &std::path::Path,
        base_url: &str,
        source_domain: &str,
        is_primary: bool,
        is_useful: bool,
    ) {
        let config = &self.settings.search.web_citation_detection;
        if !should_run_web_citation_detection(
            config,
            self.citation_pages_processed,
            is_primary,
            is_useful,
        ) {
            return;
        }
        self.citation_pages_processed += 1;

        let max_candidates = citation_detector_max_candidates(config);
        let detected = match self
            .collaborators
            .web_citation_detector
            .detect_citations(html_path, base_url, source_domain, max_candidates)
            .await
        {
            Ok(detected) => detected,
            Err(e) => {
                debug!(base_url = %truncate(base_url, 50), error = %e, "Citation detection failed");
                return;
            }
        };

        let mut edges_created = 0usize;
        for citation in detected.into_iter().filter(|c| c.is_citation) {
            if config.max_edges_per_page > 0 && edges_created >= config.max_edges_per_page {
                break;
            }

            let target_page_id = match self.db.page_id_for_url(&citation.url).await {
                Ok(Some(id)) => id,
                Ok(None) if config.create_placeholder_pages => {
                    let domain = host_of(&citation.url).unwrap_or_default();
                    match self
                        .db
                        .upsert_page(&NewPage {
                            url: citation.url.clone(),
                            domain,
                            page_type: PageType::CitationPlaceholder,
                            fetch_method: FetchMethod::Placeholder,
                            title: None,
                            paper_metadata: None,
                        })
                        .await
                    {
                        Ok(id) => id,
                        Err(e) => {
                            debug!(url = %truncate(&citation.url, 50), error = %e, "Placeholder insert failed");
                            continue;
                        }
                    }
                }
                // Placeholder creation disabled: only link existing pages.
                Ok(None) => continue,
                Err(e) => {
                    debug!(url = %truncate(&citation.url, 50), error = %e, "Page lookup failed");
                    continue;
                }
            };

            let edge = CitationEdge {
                source_page_id: page_id.to_string(),
                target_page_id,
                task_id: self.task_id.clone(),
                citation_source: "extraction".to_string(),
                citation_context: citation.context.clone(),
            };
            if let Err(e) = self.collaborators.evidence_graph.add_citation(edge).await {
                debug!(error = %e, "Failed to record citation edge");
                continue;
            }
            edges_created += 1;
        }
    }
}

/// Mechanical query expansion.
///
/// Returns the original query plus up to two operator variants:
/// site-scoped variants for academic or government keywords, and a
/// `filetype:pdf` variant for document-heavy keywords. Never invents new
/// query ideas.
#[must_use]
pub fn expand_query(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let mut expanded = vec![query.to_string()];

    if !lower.contains("site:") {
        if ["研究", "論文", "paper", "study"].iter().any(|kw| lower.contains(kw)) {
            expanded.push(format!("{query} site:arxiv.org OR site:jstage.jst.go.jp"));
        }
        if ["政府", "省", "gov", "official"].iter().any(|kw| lower.contains(kw)) {
            expanded.push(format!("{query} site:go.jp"));
        }
    }

    if !lower.contains("filetype:")
        && ["仕様", "報告書", "白書", "specification", "report"]
            .iter()
            .any(|kw| lower.contains(kw))
    {
        expanded.push(format!("{query} filetype:pdf"));
    }

    expanded
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebCitationDetectionConfig;

    #[test]
    fn expansion_adds_site_operator_for_academic_keywords() {
        let expanded = expand_query("transformer attention paper");
        assert_eq!(expanded[0], "transformer attention paper");
        assert!(expanded
            .iter()
            .any(|q| q.contains("site:arxiv.org OR site:jstage.jst.go.jp")));
    }

    #[test]
    fn expansion_skips_queries_with_existing_operators() {
        let expanded = expand_query("attention paper site:arxiv.org");
        assert_eq!(expanded.len(), 1);
    }

    #[test]
    fn expansion_adds_filetype_for_document_keywords() {
        let expanded = expand_query("protocol specification");
        assert!(expanded.iter().any(|q| q.ends_with("filetype:pdf")));
    }

    #[test]
    fn content_hash_is_16_hex_over_first_kilobyte() {
        let hash = fragment_content_hash("hello world");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        // Only the first 1 KB participates
        let long_a = format!("{}{}", "a".repeat(1024), "tail-one");
        let long_b = format!("{}{}", "a".repeat(1024), "tail-two");
        assert_eq!(fragment_content_hash(&long_a), fragment_content_hash(&long_b));
    }

    #[test]
    fn citation_gate_precedence() {
        let mut config = WebCitationDetectionConfig::default();

        // disabled beats everything
        config.enabled = false;
        assert!(!should_run_web_citation_detection(&config, 0, true, true));

        // budget exhaustion beats primary/usefulness
        config.enabled = true;
        config.max_pages_per_task = 2;
        assert!(!should_run_web_citation_detection(&config, 2, true, true));
        assert!(should_run_web_citation_detection(&config, 1, true, true));

        // budget 0 means unlimited
        config.max_pages_per_task = 0;
        assert!(should_run_web_citation_detection(&config, 10_000, true, true));

        // primary-only gate
        assert!(!should_run_web_citation_detection(&config, 0, false, true));

        // usefulness gate
        assert!(!should_run_web_citation_detection(&config, 0, true, false));
        config.require_useful_text = false;
        assert!(should_run_web_citation_detection(&config, 0, true, false));
    }

    #[test]
    fn zero_candidate_config_means_large_sentinel() {
        let mut config = WebCitationDetectionConfig::default();
        config.max_candidates_per_page = 0;
        assert_eq!(citation_detector_max_candidates(&config), 10_000);
        config.max_candidates_per_page = 7;
        assert_eq!(citation_detector_max_candidates(&config), 7);
    }
}
