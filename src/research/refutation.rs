//! Claim-directed counter-evidence search
//!
//! Runs refutation searches for claims and searches using mechanical
//! suffix patterns only. The external agent decides what to refute; this
//! executor applies the fixed suffix list, checks candidate passages with
//! NLI, and records refutation edges. It never asks an LLM to invent
//! hypotheses.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::collaborators::{Collaborators, NliPair, SerpRequest, Stance};
use crate::error::CoreResult;
use crate::research::domains::{domain_category, host_of, DomainCategory};
use crate::research::pipeline::generate_refutation_queries;
use crate::research::state::{ExplorationState, RefutationStatus};
use crate::storage::{Database, NewEdge};

/// Confidence decay applied when no refutation is found
pub const NO_REFUTATION_CONFIDENCE_DECAY: f64 = 0.05;

/// SERP results requested per reverse query
const SERP_LIMIT: usize = 5;

/// SERP results checked per reverse query
const CHECK_TOP: usize = 3;

/// NLI confidence threshold for accepting a refutation
const NLI_THRESHOLD: f64 = 0.6;

/// One detected refutation
#[derive(Debug, Clone, Serialize)]
pub struct RefutationDetail {
    pub claim_text: String,
    pub refuting_passage: String,
    pub source_url: String,
    pub source_title: String,
    pub nli_confidence: f64,
}

/// Result of one refutation run
#[derive(Debug, Clone, Serialize)]
pub struct RefutationResult {
    /// claim id or search id
    pub target: String,
    /// "claim" or "search"
    pub target_type: String,
    pub reverse_queries_executed: usize,
    pub refutations_found: usize,
    pub refutation_details: Vec<RefutationDetail>,
    pub confidence_adjustment: f64,
    pub errors: Vec<String>,
}

impl RefutationResult {
    fn new(target: String, target_type: &str) -> Self {
        Self {
            target,
            target_type: target_type.to_string(),
            reverse_queries_executed: 0,
            refutations_found: 0,
            refutation_details: Vec::new(),
            confidence_adjustment: 0.0,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Mechanical refutation executor for one task
pub struct RefutationExecutor {
    task_id: String,
    state: Arc<ExplorationState>,
    db: Database,
    collaborators: Collaborators,
}

impl RefutationExecutor {
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        state: Arc<ExplorationState>,
        db: Database,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            db,
            collaborators,
        }
    }

    /// Run refutation for a stored claim. Finding nothing decays the
    /// claim's confidence (floored at zero); finding refutations records
    /// them as edges in the evidence graph.
    pub async fn execute_for_claim(&self, claim_id: &str) -> CoreResult<RefutationResult> {
        let mut result = RefutationResult::new(claim_id.to_string(), "claim");

        let Some(claim) = self.db.fetch_claim(claim_id).await? else {
            result.errors.push(format!("Claim not found: {claim_id}"));
            return Ok(result);
        };

        info!(
            task_id = %self.task_id,
            claim_id,
            claim_text = %truncate(&claim.claim_text, 50),
            "Executing refutation for claim"
        );

        let reverse_queries = generate_refutation_queries(&claim.claim_text);
        result.reverse_queries_executed = reverse_queries.len();

        for rq in &reverse_queries {
            let refutations = self.search_and_detect(rq, &claim.claim_text).await;
            result.refutation_details.extend(refutations);
        }
        result.refutations_found = result.refutation_details.len();

        if result.refutations_found == 0 {
            result.confidence_adjustment = -NO_REFUTATION_CONFIDENCE_DECAY;
            let new_confidence = (claim.confidence_score - NO_REFUTATION_CONFIDENCE_DECAY).max(0.0);
            self.db
                .update_claim_confidence(claim_id, new_confidence)
                .await?;
            info!(
                claim_id,
                adjustment = result.confidence_adjustment,
                "No refutation found, confidence decayed"
            );
        } else {
            let target_category = claim_source_category(claim.verification_notes.as_deref());
            for detail in &result.refutation_details {
                if let Err(e) = self
                    .record_refutation_edge(claim_id, detail, target_category.as_deref())
                    .await
                {
                    debug!(claim_id, error = %e, "Failed to record refutation edge");
                }
            }
        }

        Ok(result)
    }

    /// Run refutation keyed on a search's query text and update the
    /// search's refutation status.
    pub async fn execute_for_search(&self, search_id: &str) -> CoreResult<RefutationResult> {
        let mut result = RefutationResult::new(search_id.to_string(), "search");

        let Some(search) = self.state.get_search(search_id) else {
            result.errors.push(format!("Search not found: {search_id}"));
            return Ok(result);
        };

        info!(
            task_id = %self.task_id,
            search_id,
            search_text = %truncate(&search.text, 50),
            "Executing refutation for search"
        );

        let reverse_queries = generate_refutation_queries(&search.text);
        result.reverse_queries_executed = reverse_queries.len();

        for rq in &reverse_queries {
            let refutations = self.search_and_detect(rq, &search.text).await;
            result.refutation_details.extend(refutations);
        }
        result.refutations_found = result.refutation_details.len();

        if result.refutations_found > 0 {
            self.state.set_refutation_status(
                search_id,
                RefutationStatus::Found,
                result.refutations_found as u32,
            );
        } else {
            self.state
                .set_refutation_status(search_id, RefutationStatus::NotFound, 0);
            result.confidence_adjustment = -NO_REFUTATION_CONFIDENCE_DECAY;
        }

        Ok(result)
    }

    /// One reverse query: small SERP, top results fetched and extracted,
    /// each passage checked against the original text with NLI.
    async fn search_and_detect(&self, query: &str, original_text: &str) -> Vec<RefutationDetail> {
        let mut refutations = Vec::new();

        let request = SerpRequest {
            query: query.to_string(),
            limit: SERP_LIMIT,
            engines: None,
            task_id: self.task_id.clone(),
            serp_max_pages: None,
            worker_id: None,
        };
        let items = match self.collaborators.serp.search(request).await {
            Ok(items) => items,
            Err(e) => {
                debug!(query = %truncate(query, 50), error = %e, "Refutation search failed");
                return refutations;
            }
        };

        for item in items.iter().take(CHECK_TOP) {
            if item.url.is_empty() {
                continue;
            }

            let context = crate::collaborators::FetchContext {
                referer: "refutation_search".to_string(),
                task_id: self.task_id.clone(),
                worker_id: None,
            };
            let fetch = match self.collaborators.fetcher.fetch(&item.url, &context).await {
                Ok(fetch) => fetch,
                Err(e) => {
                    debug!(url = %truncate(&item.url, 50), error = %e, "Refutation fetch failed");
                    continue;
                }
            };
            if !fetch.ok {
                continue;
            }
            let Some(html_path) = fetch.html_path.as_deref() else {
                continue;
            };
            let text = match self.collaborators.extractor.extract(html_path, "html").await {
                Ok(extract) => extract.text,
                Err(e) => {
                    debug!(url = %truncate(&item.url, 50), error = %e, "Refutation extract failed");
                    continue;
                }
            };
            if text.is_empty() {
                continue;
            }

            let passage: String = text.chars().take(500).collect();
            if let Some(detail) = self
                .detect_refutation_nli(original_text, &passage, &item.url, &item.title)
                .await
            {
                refutations.push(detail);
            }
        }

        refutations
    }

    /// NLI exceptions yield a safe no-refutation signal.
    async fn detect_refutation_nli(
        &self,
        claim_text: &str,
        passage: &str,
        source_url: &str,
        source_title: &str,
    ) -> Option<RefutationDetail> {
        let pairs = vec![NliPair {
            pair_id: "refutation_check".to_string(),
            premise: passage.to_string(),
            hypothesis: claim_text.to_string(),
        }];
        match self.collaborators.nli.judge(pairs).await {
            Ok(verdicts) => verdicts.first().and_then(|v| {
                (v.stance == Stance::Refutes && v.confidence > NLI_THRESHOLD).then(|| {
                    RefutationDetail {
                        claim_text: claim_text.chars().take(100).collect(),
                        refuting_passage: passage.chars().take(200).collect(),
                        source_url: source_url.to_string(),
                        source_title: source_title.to_string(),
                        nli_confidence: v.confidence,
                    }
                })
            }),
            Err(e) => {
                debug!(error = %e, "NLI detection failed");
                None
            }
        }
    }

    /// Record a `refutes` edge from the refuting fragment's source to the
    /// claim, with domain categories for ranking adjustment.
    async fn record_refutation_edge(
        &self,
        claim_id: &str,
        refutation: &RefutationDetail,
        target_domain_category: Option<&str>,
    ) -> CoreResult<()> {
        let source_domain_category = host_of(&refutation.source_url)
            .map(|h| domain_category(&h))
            .filter(|c| *c != DomainCategory::Unknown)
            .map(|c| c.as_str().to_string());

        self.db
            .insert_edge(&NewEdge {
                source_type: "fragment".to_string(),
                source_id: refutation.source_url.clone(),
                target_type: "claim".to_string(),
                target_id: claim_id.to_string(),
                relation: "refutes".to_string(),
                confidence: refutation.nli_confidence,
                nli_label: Some("refutes".to_string()),
                nli_confidence: Some(refutation.nli_confidence),
                source_domain_category,
                target_domain_category: target_domain_category.map(str::to_string),
            })
            .await?;

        info!(
            claim_id,
            source_url = %truncate(&refutation.source_url, 50),
            "Recorded refutation edge"
        );
        Ok(())
    }
}

/// Target-claim domain category, derived from the `source_url=` marker in
/// the claim's verification notes.
fn claim_source_category(verification_notes: Option<&str>) -> Option<String> {
    let notes = verification_notes?;
    let url = notes
        .split("source_url=")
        .nth(1)?
        .split(';')
        .next()?
        .trim();
    let host = host_of(url)?;
    let category = domain_category(&host);
    if category == DomainCategory::Unknown {
        None
    } else {
        Some(category.as_str().to_string())
    }
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

    #[test]
    fn claim_source_category_parses_verification_notes() {
        assert_eq!(
            claim_source_category(Some("source_url=https://www.soumu.go.jp/page; other=1")),
            Some("government".to_string())
        );
        assert_eq!(
            claim_source_category(Some("source_url=https://blog.example.com/x")),
            None
        );
        assert_eq!(claim_source_category(None), None);
        assert_eq!(claim_source_category(Some("no marker here")), None);
    }
}
