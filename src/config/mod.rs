//! Typed configuration surface for the exploration core
//!
//! The core consumes a fully-typed `Settings` tree. Parsing configuration
//! files into this tree is the embedding application's job; every field
//! here carries the documented default so `Settings::default()` is a
//! complete, working configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Number of target-queue workers and their queue behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQueueConfig {
    /// Number of background workers pulling from the target queue (>= 1)
    pub num_workers: usize,
}

impl Default for SearchQueueConfig {
    fn default() -> Self {
        Self { num_workers: 2 }
    }
}

/// Browser SERP tab limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSerpConfig {
    /// Maximum concurrent tabs per worker (>= 1). Start at 1 for
    /// correctness; raise only after stability validation.
    pub max_tabs: usize,
}

impl Default for BrowserSerpConfig {
    fn default() -> Self {
        Self { max_tabs: 1 }
    }
}

/// Backoff tuning for academic API providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcademicApiBackoffConfig {
    /// Seconds without a 429 (and since the last recovery attempt) before
    /// effective parallelism is raised by one (>= 1)
    pub recovery_stable_seconds: u64,
    /// How much to reduce effective parallelism on each 429 (>= 1)
    pub decrease_step: usize,
}

impl Default for AcademicApiBackoffConfig {
    fn default() -> Self {
        Self {
            recovery_stable_seconds: 60,
            decrease_step: 1,
        }
    }
}

/// Backoff tuning for browser SERP tab pools.
///
/// Browser pools never auto-recover: the underlying cause (fingerprinting,
/// IP block) is rarely self-curing, so recovery is manual only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSerpBackoffConfig {
    /// How much to reduce effective tabs on each CAPTCHA/403 (>= 1)
    pub decrease_step: usize,
}

impl Default for BrowserSerpBackoffConfig {
    fn default() -> Self {
        Self { decrease_step: 1 }
    }
}

/// Backoff configuration grouping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub academic_api: AcademicApiBackoffConfig,
    pub browser_serp: BrowserSerpBackoffConfig,
}

/// Concurrency configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub search_queue: SearchQueueConfig,
    pub browser_serp: BrowserSerpConfig,
    pub backoff: BackoffConfig,
}

/// Task-level budgets and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLimitsConfig {
    /// Total page budget per task
    pub budget_pages_per_task: u32,
    /// Wall-clock limit for one pipeline execution (safe stop)
    pub pipeline_timeout_seconds: u64,
    /// Agent idle threshold before the status projection warns
    pub cursor_idle_timeout_seconds: u64,
    /// Task time limit in minutes
    pub max_time_minutes_gpu: u64,
}

impl Default for TaskLimitsConfig {
    fn default() -> Self {
        Self {
            budget_pages_per_task: 120,
            pipeline_timeout_seconds: 300,
            cursor_idle_timeout_seconds: 60,
            max_time_minutes_gpu: 60,
        }
    }
}

/// Web citation detection policy.
///
/// Controls when LLM calls are spent classifying outbound links as
/// citations. `max_*` fields use 0 to mean "no limit".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebCitationDetectionConfig {
    pub enabled: bool,
    pub run_on_primary_sources_only: bool,
    pub require_useful_text: bool,
    /// Minimum extracted-text length for a page to qualify
    pub min_text_chars: usize,
    /// Max outbound links evaluated per page (0 = unlimited)
    pub max_candidates_per_page: usize,
    /// Max CITES edges created per page (0 = unlimited)
    pub max_edges_per_page: usize,
    /// Max pages to run detection on per task (0 = unlimited)
    pub max_pages_per_task: usize,
    /// Create placeholder page rows for newly discovered citation URLs.
    /// When false, only existing pages are linked; unknown targets are
    /// skipped.
    pub create_placeholder_pages: bool,
}

impl Default for WebCitationDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_on_primary_sources_only: true,
            require_useful_text: true,
            min_text_chars: 200,
            max_candidates_per_page: 10,
            max_edges_per_page: 0,
            max_pages_per_task: 0,
            create_placeholder_pages: true,
        }
    }
}

/// Search pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Number of top abstract-backed papers to expand through the
    /// citation graph
    pub citation_graph_top_n_papers: usize,
    /// Citation graph traversal depth
    pub citation_graph_depth: u32,
    /// Traversal direction: "references", "citations", or "both"
    pub citation_graph_direction: String,
    pub web_citation_detection: WebCitationDetectionConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            citation_graph_top_n_papers: 5,
            citation_graph_depth: 1,
            citation_graph_direction: "both".to_string(),
            web_citation_detection: WebCitationDetectionConfig::default(),
        }
    }
}

/// Rate limit settings for one academic API provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcademicApiProviderConfig {
    pub base_url: String,
    /// Minimum seconds between requests to this provider
    pub min_interval_seconds: f64,
    /// Maximum concurrent requests to this provider
    pub max_parallel: usize,
    /// Polite-pool profile name, if the provider supports one
    pub profile: Option<String>,
}

impl Default for AcademicApiProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            min_interval_seconds: 0.1,
            max_parallel: 1,
            profile: None,
        }
    }
}

/// Rate limit settings for one SERP engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerpEngineConfig {
    /// Minimum seconds between requests to this engine
    pub min_interval: f64,
    /// Maximum concurrent requests to this engine
    pub concurrency: usize,
}

impl Default for SerpEngineConfig {
    fn default() -> Self {
        Self {
            min_interval: 2.0,
            concurrency: 1,
        }
    }
}

/// Chrome endpoint layout for worker isolation.
///
/// Worker `w` gets debug port `base_port + w` and profile
/// `{profile_prefix}{w:02}` so one worker's backoff or fingerprint damage
/// never bleeds into another's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChromeConfig {
    pub base_port: u16,
    pub profile_prefix: String,
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            base_port: 9222,
            profile_prefix: "scout-worker-".to_string(),
        }
    }
}

/// Main settings container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub concurrency: ConcurrencyConfig,
    pub task_limits: TaskLimitsConfig,
    pub search: SearchConfig,
    /// Per-provider academic API settings, keyed by provider name
    /// (e.g. "semantic_scholar", "openalex"). Looked up on first use and
    /// cached by the rate limiter; unknown providers fall back to
    /// `AcademicApiProviderConfig::default()`.
    pub academic_apis: HashMap<String, AcademicApiProviderConfig>,
    /// Per-engine SERP settings, keyed by engine name. Unknown engines
    /// fall back to `SerpEngineConfig::default()`.
    pub serp_engines: HashMap<String, SerpEngineConfig>,
    pub chrome: ChromeConfig,
}

impl Settings {
    /// Provider settings with type-safe fallback for unconfigured providers
    #[must_use]
    pub fn academic_api(&self, provider: &str) -> AcademicApiProviderConfig {
        self.academic_apis
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    /// Engine settings with type-safe fallback for unconfigured engines
    #[must_use]
    pub fn serp_engine(&self, engine: &str) -> SerpEngineConfig {
        self.serp_engines.get(engine).cloned().unwrap_or_default()
    }

    /// Task time limit as seconds
    #[must_use]
    pub fn task_time_limit_seconds(&self) -> u64 {
        self.task_limits.max_time_minutes_gpu * 60
    }
}
