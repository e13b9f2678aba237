//! Collaborator interfaces
//!
//! Everything the core depends on but does not implement: SERP engines,
//! academic API clients, fetchers, extractors, the NLI judge, the LLM claim
//! extractor, the evidence graph, and the URL/DOI ingestors. The core talks
//! to these through object-safe async traits so the concrete adapters stay
//! out of this crate (and tests can substitute stubs).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::search::paper::{Paper, SerpItem};

// =============================================================================
// Shared vocabulary
// =============================================================================

/// NLI stance between a premise and a hypothesis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Supports,
    Refutes,
    Neutral,
}

impl Stance {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stance::Supports => "supports",
            Stance::Refutes => "refutes",
            Stance::Neutral => "neutral",
        }
    }

    /// Sanitize an arbitrary label into a stance; anything unknown becomes
    /// neutral so edge persistence never fails on a bad label.
    #[must_use]
    pub fn sanitize(label: &str) -> Self {
        match label {
            "supports" => Stance::Supports,
            "refutes" => Stance::Refutes,
            _ => Stance::Neutral,
        }
    }
}

/// Typed relation between evidence graph nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Supports,
    Refutes,
    Neutral,
    Cites,
}

impl Relation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Supports => "supports",
            Relation::Refutes => "refutes",
            Relation::Neutral => "neutral",
            Relation::Cites => "cites",
        }
    }
}

impl From<Stance> for Relation {
    fn from(stance: Stance) -> Self {
        match stance {
            Stance::Supports => Relation::Supports,
            Stance::Refutes => Relation::Refutes,
            Stance::Neutral => Relation::Neutral,
        }
    }
}

/// Evidence graph node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Page,
    Fragment,
    Claim,
}

impl NodeType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Page => "page",
            NodeType::Fragment => "fragment",
            NodeType::Claim => "claim",
        }
    }
}

// =============================================================================
// SERP search
// =============================================================================

/// One browser SERP request
#[derive(Debug, Clone, Default)]
pub struct SerpRequest {
    pub query: String,
    pub limit: usize,
    /// None lets the adapter auto-select engines
    pub engines: Option<Vec<String>>,
    pub task_id: String,
    /// Per-search SERP page cap, when the caller wants one
    pub serp_max_pages: Option<u32>,
    /// Worker whose tab pool and Chrome endpoint should serve the request
    pub worker_id: Option<usize>,
}

/// Browser SERP search adapter
#[async_trait]
pub trait SerpSearch: Send + Sync {
    async fn search(&self, request: SerpRequest) -> CoreResult<Vec<SerpItem>>;
}

// =============================================================================
// Academic search
// =============================================================================

/// Options forwarded to the academic provider
#[derive(Debug, Clone, Default)]
pub struct AcademicSearchOptions {
    pub apis: Option<Vec<String>>,
    pub max_results: Option<usize>,
}

/// One entry of the provider's internal dedup index
#[derive(Debug, Clone)]
pub struct AcademicIndexEntry {
    pub paper: Option<Paper>,
    pub needs_fetch: bool,
}

/// Outcome of an academic API search, exposing the provider's last index
/// so resolved `Paper` objects can be transferred into the unified
/// canonical index.
#[derive(Debug, Clone, Default)]
pub struct AcademicSearchOutcome {
    pub ok: bool,
    pub results: Vec<SerpItem>,
    pub entries: Vec<AcademicIndexEntry>,
}

/// A directed citation between two provider paper ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub citing_paper_id: String,
    pub cited_paper_id: String,
}

/// Academic API client (search, citation graph, OA resolution)
#[async_trait]
pub trait AcademicProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        options: &AcademicSearchOptions,
    ) -> CoreResult<AcademicSearchOutcome>;

    /// Citation neighborhood of a paper at the given depth and direction
    /// ("references", "citations", or "both").
    async fn citation_graph(
        &self,
        paper_id: &str,
        depth: u32,
        direction: &str,
    ) -> CoreResult<(Vec<Paper>, Vec<Citation>)>;

    /// Try to resolve an open-access URL for a paper with a DOI
    async fn resolve_oa_url(&self, paper: &Paper) -> CoreResult<Option<String>>;
}

// =============================================================================
// Fetch and extract
// =============================================================================

/// Context for a page fetch
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    pub referer: String,
    pub task_id: String,
    pub worker_id: Option<usize>,
}

/// Outcome of a page fetch
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub ok: bool,
    pub html_path: Option<PathBuf>,
    pub final_url: Option<String>,
    pub page_id: Option<String>,
    /// The fetch was blocked and queued for manual authentication
    pub auth_queued: bool,
    pub reason: Option<String>,
}

/// Page fetcher (browser or HTTP, the adapter decides)
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, context: &FetchContext) -> CoreResult<FetchOutcome>;
}

/// Extracted page content
#[derive(Debug, Clone, Default)]
pub struct ExtractOutcome {
    pub text: String,
    pub title: Option<String>,
}

/// Content extractor over fetched files
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, input_path: &Path, content_type: &str) -> CoreResult<ExtractOutcome>;
}

// =============================================================================
// NLI judge
// =============================================================================

/// One premise/hypothesis pair for NLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NliPair {
    pub pair_id: String,
    pub premise: String,
    pub hypothesis: String,
}

/// NLI verdict for one pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NliVerdict {
    pub pair_id: String,
    pub stance: Stance,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

/// Natural-language-inference judge
#[async_trait]
pub trait NliJudge: Send + Sync {
    async fn judge(&self, pairs: Vec<NliPair>) -> CoreResult<Vec<NliVerdict>>;
}

// =============================================================================
// LLM claim extraction
// =============================================================================

/// A passage submitted for claim extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    pub source_url: String,
}

/// A claim reported by the LLM extractor.
///
/// Confidence is accepted verbatim in [0, 1]; treating it as calibrated
/// truth is downstream's problem, not this crate's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedClaim {
    pub claim: String,
    #[serde(default)]
    pub claim_type: String,
    pub confidence: f64,
}

/// Claim extraction outcome
#[derive(Debug, Clone, Default)]
pub struct ClaimExtraction {
    pub ok: bool,
    pub claims: Vec<ExtractedClaim>,
}

/// LLM claim extractor
#[async_trait]
pub trait ClaimExtractor: Send + Sync {
    async fn extract_claims(
        &self,
        passages: Vec<Passage>,
        task: &str,
        context: &str,
        use_slow_model: bool,
    ) -> CoreResult<ClaimExtraction>;
}

// =============================================================================
// Evidence graph
// =============================================================================

/// A claim-to-fragment evidence edge
#[derive(Debug, Clone)]
pub struct ClaimEvidence {
    pub claim_id: String,
    pub fragment_id: String,
    pub task_id: String,
    pub relation: Relation,
    pub nli_label: Stance,
    pub nli_confidence: f64,
    /// Legacy alias of `nli_confidence`
    pub confidence: f64,
    pub source_domain_category: Option<String>,
    pub target_domain_category: Option<String>,
}

/// A page-to-page citation edge
#[derive(Debug, Clone)]
pub struct CitationEdge {
    pub source_page_id: String,
    pub target_page_id: String,
    pub task_id: String,
    /// Where the citation came from (e.g. "extraction", "academic_api")
    pub citation_source: String,
    pub citation_context: String,
}

/// Evidence graph statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphStats {
    pub total_nodes: u64,
    pub total_edges: u64,
}

/// The provenance/evidence graph. Concurrency inside the graph is the
/// collaborator's problem; the core only sequences its own writes.
#[async_trait]
pub trait EvidenceGraph: Send + Sync {
    async fn add_node(&self, task_id: &str, node_type: NodeType, node_id: &str) -> CoreResult<()>;

    async fn add_claim_evidence(&self, evidence: ClaimEvidence) -> CoreResult<()>;

    async fn add_citation(&self, citation: CitationEdge) -> CoreResult<()>;

    /// Wire CITES edges from an academic page to every cited page that has
    /// a known page id in `paper_to_page`.
    async fn add_academic_page_with_citations(
        &self,
        page_id: &str,
        paper_metadata: serde_json::Value,
        citations: &[Citation],
        task_id: &str,
        paper_to_page: &HashMap<String, String>,
    ) -> CoreResult<()>;

    async fn stats(&self, task_id: &str) -> CoreResult<GraphStats>;
}

// =============================================================================
// Identifier resolution and citation filtering
// =============================================================================

/// Resolves secondary scholarly identifiers to DOIs
#[async_trait]
pub trait IdResolver: Send + Sync {
    async fn pmid_to_doi(&self, pmid: &str) -> CoreResult<Option<String>>;
    async fn arxiv_to_doi(&self, arxiv_id: &str) -> CoreResult<Option<String>>;
}

/// A candidate paper with its relevance score
#[derive(Debug, Clone)]
pub struct ScoredPaper {
    pub paper: Paper,
    pub score: f64,
}

/// Relevance filter over citation-graph candidates (staged: metadata floor,
/// embedding+impact score, LLM evidence-usefulness score).
#[async_trait]
pub trait CitationRelevanceFilter: Send + Sync {
    async fn filter_relevant(
        &self,
        query: &str,
        source_paper: &Paper,
        candidates: Vec<Paper>,
    ) -> CoreResult<Vec<ScoredPaper>>;
}

/// An outbound link the detector classified
#[derive(Debug, Clone)]
pub struct DetectedCitation {
    pub url: String,
    pub link_text: String,
    pub context: String,
    pub is_citation: bool,
}

/// LLM-backed detector classifying outbound links as citations
#[async_trait]
pub trait WebCitationDetector: Send + Sync {
    async fn detect_citations(
        &self,
        html_path: &Path,
        base_url: &str,
        source_domain: &str,
        max_candidates: usize,
    ) -> CoreResult<Vec<DetectedCitation>>;
}

// =============================================================================
// Target ingestors
// =============================================================================

/// Options blob passed through to ingestors; per-target options are merged
/// over task options and annotated with task/job/worker identity.
pub type IngestOptions = serde_json::Map<String, serde_json::Value>;

/// Direct URL ingestion (citation chasing)
#[async_trait]
pub trait UrlIngestor: Send + Sync {
    async fn ingest_url(
        &self,
        task_id: &str,
        url: &str,
        options: &IngestOptions,
    ) -> CoreResult<serde_json::Value>;
}

/// DOI ingestion via academic APIs
#[async_trait]
pub trait DoiIngestor: Send + Sync {
    async fn ingest_doi(
        &self,
        task_id: &str,
        doi: &str,
        options: &IngestOptions,
    ) -> CoreResult<serde_json::Value>;
}

// =============================================================================
// Bundle
// =============================================================================

/// Every collaborator the core needs, bundled for threading through the
/// pipeline, executor, and workers.
#[derive(Clone)]
pub struct Collaborators {
    pub serp: Arc<dyn SerpSearch>,
    pub academic: Arc<dyn AcademicProvider>,
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub nli: Arc<dyn NliJudge>,
    pub claim_extractor: Arc<dyn ClaimExtractor>,
    pub evidence_graph: Arc<dyn EvidenceGraph>,
    pub id_resolver: Arc<dyn IdResolver>,
    pub citation_filter: Arc<dyn CitationRelevanceFilter>,
    pub web_citation_detector: Arc<dyn WebCitationDetector>,
    pub url_ingestor: Arc<dyn UrlIngestor>,
    pub doi_ingestor: Arc<dyn DoiIngestor>,
}

/// Inert collaborator implementations.
///
/// Useful as a baseline bundle: harnesses and tests start from
/// `noop::bundle(graph)` and swap in the adapters they care about.
pub mod noop {
    use super::*;

    pub struct NoopSerp;

    #[async_trait]
    impl SerpSearch for NoopSerp {
        async fn search(&self, _request: SerpRequest) -> CoreResult<Vec<SerpItem>> {
            Ok(Vec::new())
        }
    }

    pub struct NoopAcademic;

    #[async_trait]
    impl AcademicProvider for NoopAcademic {
        async fn search(
            &self,
            _query: &str,
            _options: &AcademicSearchOptions,
        ) -> CoreResult<AcademicSearchOutcome> {
            Ok(AcademicSearchOutcome::default())
        }

        async fn citation_graph(
            &self,
            _paper_id: &str,
            _depth: u32,
            _direction: &str,
        ) -> CoreResult<(Vec<Paper>, Vec<Citation>)> {
            Ok((Vec::new(), Vec::new()))
        }

        async fn resolve_oa_url(&self, _paper: &Paper) -> CoreResult<Option<String>> {
            Ok(None)
        }
    }

    pub struct NoopFetcher;

    #[async_trait]
    impl Fetcher for NoopFetcher {
        async fn fetch(&self, _url: &str, _context: &FetchContext) -> CoreResult<FetchOutcome> {
            Ok(FetchOutcome {
                ok: false,
                reason: Some("fetcher not configured".to_string()),
                ..FetchOutcome::default()
            })
        }
    }

    pub struct NoopExtractor;

    #[async_trait]
    impl Extractor for NoopExtractor {
        async fn extract(
            &self,
            _input_path: &Path,
            _content_type: &str,
        ) -> CoreResult<ExtractOutcome> {
            Ok(ExtractOutcome::default())
        }
    }

    pub struct NoopNli;

    #[async_trait]
    impl NliJudge for NoopNli {
        async fn judge(&self, pairs: Vec<NliPair>) -> CoreResult<Vec<NliVerdict>> {
            Ok(pairs
                .into_iter()
                .map(|p| NliVerdict {
                    pair_id: p.pair_id,
                    stance: Stance::Neutral,
                    confidence: 0.0,
                })
                .collect())
        }
    }

    pub struct NoopClaimExtractor;

    #[async_trait]
    impl ClaimExtractor for NoopClaimExtractor {
        async fn extract_claims(
            &self,
            _passages: Vec<Passage>,
            _task: &str,
            _context: &str,
            _use_slow_model: bool,
        ) -> CoreResult<ClaimExtraction> {
            Ok(ClaimExtraction::default())
        }
    }

    pub struct NoopIdResolver;

    #[async_trait]
    impl IdResolver for NoopIdResolver {
        async fn pmid_to_doi(&self, _pmid: &str) -> CoreResult<Option<String>> {
            Ok(None)
        }

        async fn arxiv_to_doi(&self, _arxiv_id: &str) -> CoreResult<Option<String>> {
            Ok(None)
        }
    }

    pub struct NoopCitationFilter;

    #[async_trait]
    impl CitationRelevanceFilter for NoopCitationFilter {
        async fn filter_relevant(
            &self,
            _query: &str,
            _source_paper: &Paper,
            _candidates: Vec<Paper>,
        ) -> CoreResult<Vec<ScoredPaper>> {
            Ok(Vec::new())
        }
    }

    pub struct NoopWebCitationDetector;

    #[async_trait]
    impl WebCitationDetector for NoopWebCitationDetector {
        async fn detect_citations(
            &self,
            _html_path: &Path,
            _base_url: &str,
            _source_domain: &str,
            _max_candidates: usize,
        ) -> CoreResult<Vec<DetectedCitation>> {
            Ok(Vec::new())
        }
    }

    pub struct NoopUrlIngestor;

    #[async_trait]
    impl UrlIngestor for NoopUrlIngestor {
        async fn ingest_url(
            &self,
            _task_id: &str,
            url: &str,
            _options: &IngestOptions,
        ) -> CoreResult<serde_json::Value> {
            Ok(serde_json::json!({"ok": false, "status": "skipped", "url": url}))
        }
    }

    pub struct NoopDoiIngestor;

    #[async_trait]
    impl DoiIngestor for NoopDoiIngestor {
        async fn ingest_doi(
            &self,
            _task_id: &str,
            doi: &str,
            _options: &IngestOptions,
        ) -> CoreResult<serde_json::Value> {
            Ok(serde_json::json!({"ok": false, "status": "skipped", "doi": doi}))
        }
    }

    /// A bundle of inert collaborators around a real evidence graph
    #[must_use]
    pub fn bundle(evidence_graph: Arc<dyn EvidenceGraph>) -> Collaborators {
        Collaborators {
            serp: Arc::new(NoopSerp),
            academic: Arc::new(NoopAcademic),
            fetcher: Arc::new(NoopFetcher),
            extractor: Arc::new(NoopExtractor),
            nli: Arc::new(NoopNli),
            claim_extractor: Arc::new(NoopClaimExtractor),
            evidence_graph,
            id_resolver: Arc::new(NoopIdResolver),
            citation_filter: Arc::new(NoopCitationFilter),
            web_citation_detector: Arc::new(NoopWebCitationDetector),
            url_ingestor: Arc::new(NoopUrlIngestor),
            doi_ingestor: Arc::new(NoopDoiIngestor),
        }
    }
}
