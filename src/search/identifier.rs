//! Mechanical identifier extraction for scholarly URLs
//!
//! Pulls DOI / arXiv / PMID identifiers out of URLs (and query text) with
//! plain regexes. No network access: resolving a PMID or arXiv id to a DOI
//! is the ID-resolver collaborator's job.

use once_cell::sync::Lazy;
use regex::Regex;

/// DOI pattern: `10.` followed by a 4+ digit registrant code and a suffix
static DOI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(10\.\d{4,9}/[-._;()/:a-zA-Z0-9]+)").unwrap_or_else(|e| panic!("doi regex: {e}"))
});

/// arXiv id in URL form (`arxiv.org/abs/2101.01234v2`) or prefixed form
static ARXIV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)arxiv(?:\.org/(?:abs|pdf))?[:/](\d{4}\.\d{4,5})(?:v\d+)?")
        .unwrap_or_else(|e| panic!("arxiv regex: {e}"))
});

/// PMID from a PubMed URL
static PMID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:pubmed\.ncbi\.nlm\.nih\.gov|ncbi\.nlm\.nih\.gov/pubmed)/(\d+)")
        .unwrap_or_else(|e| panic!("pmid regex: {e}"))
});

/// Identifiers extracted from a single URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaperIdentifier {
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub pmid: Option<String>,
    /// The URL the identifiers were extracted from
    pub url: String,
}

impl PaperIdentifier {
    /// True when the URL carries a PMID or arXiv id but no DOI, so a DOI
    /// must be resolved externally before cross-source dedup can work.
    #[must_use]
    pub fn needs_doi_resolution(&self) -> bool {
        self.doi.is_none() && (self.pmid.is_some() || self.arxiv_id.is_some())
    }
}

/// Extract identifiers from a URL.
///
/// DOIs are normalized (lowercased, surrounding punctuation trimmed) so
/// that `10.1000/ABC` and `https://doi.org/10.1000/abc.` dedup to the same
/// canonical key.
#[must_use]
pub fn extract_identifiers(url: &str) -> PaperIdentifier {
    PaperIdentifier {
        doi: DOI_RE
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| normalize_doi(m.as_str())),
        arxiv_id: ARXIV_RE
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase()),
        pmid: PMID_RE
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string()),
        url: url.to_string(),
    }
}

/// Normalize a DOI for use as a dedup key: lowercase, strip a leading
/// `doi.org/` style prefix, trim trailing punctuation left over from
/// sentence or URL context.
#[must_use]
pub fn normalize_doi(raw: &str) -> String {
    let mut doi = raw.trim().to_lowercase();
    for prefix in ["https://doi.org/", "http://doi.org/", "doi.org/", "doi:"] {
        if let Some(rest) = doi.strip_prefix(prefix) {
            doi = rest.to_string();
        }
    }
    doi.trim_end_matches(['.', ',', ';', ')', ']']).to_string()
}

/// True when the text contains anything that parses as a DOI
#[must_use]
pub fn contains_doi(text: &str) -> bool {
    DOI_RE.is_match(text)
}
