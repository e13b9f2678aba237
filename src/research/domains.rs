//! Primary-source domain policy
//!
//! A page counts as a primary source when its domain ends with one of a
//! fixed suffix set: government, academic, standards bodies, official
//! organizations, and scholarly repositories. Claims are only ever
//! extracted from primary sources.

use url::Url;

/// Primary source domain suffixes
pub const PRIMARY_SOURCE_DOMAINS: &[&str] = &[
    // Government
    "go.jp",
    "gov.uk",
    "gov",
    "gouv.fr",
    "bund.de",
    // Academic institutions
    "edu",
    "ac.jp",
    "ac.uk",
    "edu.cn",
    // Standards bodies
    "iso.org",
    "ietf.org",
    "w3.org",
    // Official organizations
    "who.int",
    "un.org",
    "oecd.org",
    // Scholarly publishers and repositories
    "arxiv.org",
    "pubmed.gov",
    "jstage.jst.go.jp",
    "doi.org",
];

/// Mechanical refutation suffixes appended to claim text when generating
/// reverse queries. The list is exhaustive: reverse queries are never
/// designed by an LLM.
pub const REFUTATION_SUFFIXES: &[&str] = &[
    "課題",
    "批判",
    "問題点",
    "limitations",
    "反論",
    "誤り",
    "criticism",
    "problems",
    "issues",
];

/// Coarse category of a source domain, recorded on evidence edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainCategory {
    Government,
    Academic,
    Standards,
    Organization,
    Unknown,
}

impl DomainCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainCategory::Government => "government",
            DomainCategory::Academic => "academic",
            DomainCategory::Standards => "standards",
            DomainCategory::Organization => "organization",
            DomainCategory::Unknown => "unknown",
        }
    }
}

/// Whether a domain ends with one of the primary-source suffixes
#[must_use]
pub fn is_primary_source_domain(domain: &str) -> bool {
    let domain = domain.to_lowercase();
    PRIMARY_SOURCE_DOMAINS
        .iter()
        .any(|suffix| domain == *suffix || domain.ends_with(&format!(".{suffix}")))
}

/// Whether a URL points at a primary source
#[must_use]
pub fn is_primary_source_url(url: &str) -> bool {
    host_of(url).map(|h| is_primary_source_domain(&h)).unwrap_or(false)
}

/// Categorize a domain for edge metadata
#[must_use]
pub fn domain_category(domain: &str) -> DomainCategory {
    let d = domain.to_lowercase();
    let ends = |suffix: &str| d == suffix || d.ends_with(&format!(".{suffix}"));

    if ["go.jp", "gov.uk", "gov", "gouv.fr", "bund.de"].iter().any(|s| ends(s)) {
        DomainCategory::Government
    } else if [
        "edu",
        "ac.jp",
        "ac.uk",
        "edu.cn",
        "arxiv.org",
        "pubmed.gov",
        "jstage.jst.go.jp",
        "doi.org",
    ]
    .iter()
    .any(|s| ends(s))
    {
        DomainCategory::Academic
    } else if ["iso.org", "ietf.org", "w3.org"].iter().any(|s| ends(s)) {
        DomainCategory::Standards
    } else if ["who.int", "un.org", "oecd.org"].iter().any(|s| ends(s)) {
        DomainCategory::Organization
    } else {
        DomainCategory::Unknown
    }
}

/// Host of a URL, lowercased
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

/// Registered domain approximation: the last two labels of the host.
/// Used for independent-source bucketing, where `news.example.com` and
/// `www.example.com` should count once.
#[must_use]
pub fn registered_domain(host: &str) -> String {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() >= 2 {
        parts[parts.len() - 2..].join(".")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_match_not_substring_match() {
        assert!(is_primary_source_domain("www.metro.tokyo.go.jp"));
        assert!(is_primary_source_domain("arxiv.org"));
        assert!(is_primary_source_domain("export.arxiv.org"));
        // "gov" must match as a label suffix, not as a substring
        assert!(!is_primary_source_domain("governance.example.com"));
        assert!(!is_primary_source_domain("notarxiv.org"));
    }

    #[test]
    fn url_gate() {
        assert!(is_primary_source_url("https://pubmed.gov/12345"));
        assert!(!is_primary_source_url("https://blog.example.com/post"));
        assert!(!is_primary_source_url("not a url"));
    }

    #[test]
    fn categories() {
        assert_eq!(domain_category("www.soumu.go.jp"), DomainCategory::Government);
        assert_eq!(domain_category("arxiv.org"), DomainCategory::Academic);
        assert_eq!(domain_category("www.ietf.org"), DomainCategory::Standards);
        assert_eq!(domain_category("who.int"), DomainCategory::Organization);
        assert_eq!(domain_category("example.com"), DomainCategory::Unknown);
    }

    #[test]
    fn registered_domain_keeps_last_two_labels() {
        assert_eq!(registered_domain("news.example.com"), "example.com");
        assert_eq!(registered_domain("example.com"), "example.com");
        assert_eq!(registered_domain("localhost"), "localhost");
    }
}
