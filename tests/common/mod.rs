//! Shared stub collaborators for integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use scout_core::collaborators::{
    noop, AcademicIndexEntry, AcademicProvider, AcademicSearchOptions, AcademicSearchOutcome,
    Citation, CitationEdge, ClaimEvidence, ClaimExtraction, ClaimExtractor, Collaborators,
    EvidenceGraph, ExtractOutcome, Extractor, FetchContext, FetchOutcome, Fetcher, GraphStats,
    NliJudge, NliPair, NliVerdict, NodeType, Passage, SerpRequest, SerpSearch, Stance,
};
use scout_core::{CoreResult, Paper, SerpItem, Settings};

/// Initialize test logging once: tracing for the core, env_logger for the
/// log-facade modules.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn serp_item(url: &str, rank: usize) -> SerpItem {
    SerpItem {
        url: url.to_string(),
        title: format!("result {rank}"),
        snippet: "snippet".to_string(),
        engine: "duckduckgo".to_string(),
        rank,
        date: None,
    }
}

pub fn paper(id: &str, doi: Option<&str>, abstract_text: Option<&str>) -> Paper {
    Paper {
        id: id.to_string(),
        title: format!("Paper {id}"),
        abstract_text: abstract_text.map(str::to_string),
        doi: doi.map(str::to_string),
        source_api: "semantic_scholar".to_string(),
        ..Paper::default()
    }
}

/// SERP adapter returning a fixed result list, optionally after a delay
pub struct StaticSerp {
    pub items: Vec<SerpItem>,
    pub delay: Option<Duration>,
}

impl StaticSerp {
    pub fn new(items: Vec<SerpItem>) -> Self {
        Self { items, delay: None }
    }

    pub fn slow(items: Vec<SerpItem>, delay: Duration) -> Self {
        Self {
            items,
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl SerpSearch for StaticSerp {
    async fn search(&self, _request: SerpRequest) -> CoreResult<Vec<SerpItem>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.items.clone())
    }
}

/// Fetcher that always succeeds with a dummy HTML path
pub struct OkFetcher {
    pub auth_queued: bool,
}

#[async_trait]
impl Fetcher for OkFetcher {
    async fn fetch(&self, url: &str, _context: &FetchContext) -> CoreResult<FetchOutcome> {
        if self.auth_queued {
            return Ok(FetchOutcome {
                ok: false,
                auth_queued: true,
                reason: Some("authentication required".to_string()),
                ..FetchOutcome::default()
            });
        }
        Ok(FetchOutcome {
            ok: true,
            html_path: Some(PathBuf::from("/tmp/fetched.html")),
            final_url: Some(url.to_string()),
            ..FetchOutcome::default()
        })
    }
}

/// Extractor returning fixed text regardless of input path
pub struct TextExtractor {
    pub text: String,
}

#[async_trait]
impl Extractor for TextExtractor {
    async fn extract(&self, _input_path: &Path, _content_type: &str) -> CoreResult<ExtractOutcome> {
        Ok(ExtractOutcome {
            text: self.text.clone(),
            title: Some("extracted".to_string()),
        })
    }
}

/// NLI judge with a fixed verdict
pub struct FixedNli {
    pub stance: Stance,
    pub confidence: f64,
}

#[async_trait]
impl NliJudge for FixedNli {
    async fn judge(&self, pairs: Vec<NliPair>) -> CoreResult<Vec<NliVerdict>> {
        Ok(pairs
            .into_iter()
            .map(|p| NliVerdict {
                pair_id: p.pair_id,
                stance: self.stance,
                confidence: self.confidence,
            })
            .collect())
    }
}

/// NLI judge that always fails
pub struct FailingNli;

#[async_trait]
impl NliJudge for FailingNli {
    async fn judge(&self, _pairs: Vec<NliPair>) -> CoreResult<Vec<NliVerdict>> {
        Err(scout_core::CoreError::Collaborator(
            "nli backend unavailable".to_string(),
        ))
    }
}

/// Claim extractor returning fixed claims
pub struct StaticClaimExtractor {
    pub claims: Vec<(String, f64)>,
    pub calls: Mutex<u32>,
}

impl StaticClaimExtractor {
    pub fn new(claims: Vec<(String, f64)>) -> Self {
        Self {
            claims,
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ClaimExtractor for StaticClaimExtractor {
    async fn extract_claims(
        &self,
        _passages: Vec<Passage>,
        _task: &str,
        _context: &str,
        _use_slow_model: bool,
    ) -> CoreResult<ClaimExtraction> {
        *self.calls.lock() += 1;
        Ok(ClaimExtraction {
            ok: true,
            claims: self
                .claims
                .iter()
                .map(|(text, confidence)| scout_core::collaborators::ExtractedClaim {
                    claim: text.clone(),
                    claim_type: "fact".to_string(),
                    confidence: *confidence,
                })
                .collect(),
        })
    }
}

/// Evidence graph recording every call
#[derive(Default)]
pub struct RecordingGraph {
    pub nodes: Mutex<Vec<(NodeType, String)>>,
    pub claim_evidence: Mutex<Vec<ClaimEvidence>>,
    pub citations: Mutex<Vec<CitationEdge>>,
}

#[async_trait]
impl EvidenceGraph for RecordingGraph {
    async fn add_node(&self, _task_id: &str, node_type: NodeType, node_id: &str) -> CoreResult<()> {
        self.nodes.lock().push((node_type, node_id.to_string()));
        Ok(())
    }

    async fn add_claim_evidence(&self, evidence: ClaimEvidence) -> CoreResult<()> {
        self.claim_evidence.lock().push(evidence);
        Ok(())
    }

    async fn add_citation(&self, citation: CitationEdge) -> CoreResult<()> {
        self.citations.lock().push(citation);
        Ok(())
    }

    async fn add_academic_page_with_citations(
        &self,
        page_id: &str,
        _paper_metadata: serde_json::Value,
        citations: &[Citation],
        task_id: &str,
        paper_to_page: &std::collections::HashMap<String, String>,
    ) -> CoreResult<()> {
        for citation in citations {
            if let Some(target) = paper_to_page.get(&citation.cited_paper_id) {
                self.citations.lock().push(CitationEdge {
                    source_page_id: page_id.to_string(),
                    target_page_id: target.clone(),
                    task_id: task_id.to_string(),
                    citation_source: "academic_api".to_string(),
                    citation_context: String::new(),
                });
            }
        }
        Ok(())
    }

    async fn stats(&self, _task_id: &str) -> CoreResult<GraphStats> {
        Ok(GraphStats {
            total_nodes: self.nodes.lock().len() as u64,
            total_edges: (self.claim_evidence.lock().len() + self.citations.lock().len()) as u64,
        })
    }
}

/// Academic provider returning fixed papers and an optional citation graph
pub struct StaticAcademic {
    pub papers: Vec<Paper>,
    pub related: Vec<Paper>,
    pub citations: Vec<Citation>,
}

impl StaticAcademic {
    pub fn new(papers: Vec<Paper>) -> Self {
        Self {
            papers,
            related: Vec::new(),
            citations: Vec::new(),
        }
    }
}

#[async_trait]
impl AcademicProvider for StaticAcademic {
    async fn search(
        &self,
        _query: &str,
        _options: &AcademicSearchOptions,
    ) -> CoreResult<AcademicSearchOutcome> {
        Ok(AcademicSearchOutcome {
            ok: true,
            results: Vec::new(),
            entries: self
                .papers
                .iter()
                .map(|p| AcademicIndexEntry {
                    needs_fetch: p.abstract_text.is_none(),
                    paper: Some(p.clone()),
                })
                .collect(),
        })
    }

    async fn citation_graph(
        &self,
        _paper_id: &str,
        _depth: u32,
        _direction: &str,
    ) -> CoreResult<(Vec<Paper>, Vec<Citation>)> {
        Ok((self.related.clone(), self.citations.clone()))
    }

    async fn resolve_oa_url(&self, _paper: &Paper) -> CoreResult<Option<String>> {
        Ok(None)
    }
}

/// Baseline bundle: inert collaborators around a recording graph
pub fn recording_bundle() -> (Collaborators, Arc<RecordingGraph>) {
    let graph = Arc::new(RecordingGraph::default());
    let collaborators = noop::bundle(graph.clone());
    (collaborators, graph)
}

/// Settings with a short pipeline timeout for timeout tests
pub fn settings_with_timeout(seconds: u64) -> Settings {
    let mut settings = Settings::default();
    settings.task_limits.pipeline_timeout_seconds = seconds;
    settings
}
