//! Data structures for scholarly papers and SERP items

use serde::{Deserialize, Serialize};

/// Author of a scholarly paper
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub affiliation: Option<String>,
    pub orcid: Option<String>,
}

/// A scholarly paper as returned by an academic API provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Paper {
    /// Provider-scoped paper id
    pub id: String,
    pub title: String,
    pub abstract_text: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub authors: Vec<Author>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub citation_count: Option<u32>,
    pub reference_count: Option<u32>,
    pub is_open_access: bool,
    /// Open-access full-text URL, if resolved
    pub oa_url: Option<String>,
    pub pdf_url: Option<String>,
    /// Which API produced this record (e.g. "semantic_scholar")
    pub source_api: String,
}

impl Paper {
    /// Reference URL for persistence: OA URL, then DOI URL, then an
    /// id-based placeholder.
    #[must_use]
    pub fn reference_url(&self) -> String {
        if let Some(oa) = &self.oa_url {
            return oa.clone();
        }
        if let Some(doi) = &self.doi {
            return format!("https://doi.org/{doi}");
        }
        format!("https://paper/{}", self.id)
    }

    /// Metadata blob stored in the pages table alongside the abstract
    #[must_use]
    pub fn metadata_json(&self) -> serde_json::Value {
        serde_json::json!({
            "paper_id": self.id,
            "doi": self.doi,
            "arxiv_id": self.arxiv_id,
            "authors": self.authors,
            "year": self.year,
            "venue": self.venue,
            "citation_count": self.citation_count,
            "reference_count": self.reference_count,
            "is_open_access": self.is_open_access,
            "oa_url": self.oa_url,
            "pdf_url": self.pdf_url,
            "source_api": self.source_api,
        })
    }
}

/// A single SERP result with rank, title, URL, and snippet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerpItem {
    pub url: String,
    pub title: String,
    pub snippet: String,
    /// Engine that produced this result
    pub engine: String,
    /// Result ranking (1-indexed)
    pub rank: usize,
    pub date: Option<String>,
}

/// How a page row came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Html,
    AcademicPaper,
    CitationPlaceholder,
}

impl PageType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::Html => "html",
            PageType::AcademicPaper => "academic_paper",
            PageType::CitationPlaceholder => "citation_placeholder",
        }
    }
}

/// Mechanism used to obtain a page's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Browser,
    AcademicApi,
    Placeholder,
}

impl FetchMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMethod::Browser => "browser",
            FetchMethod::AcademicApi => "academic_api",
            FetchMethod::Placeholder => "placeholder",
        }
    }
}
