//! Exploration control: state, budgets, pipelines, and refutation

pub mod domains;
pub mod executor;
pub mod pipeline;
pub mod refutation;
pub mod state;
pub mod state_registry;
pub mod ucb;

pub use domains::{
    domain_category, is_primary_source_domain, is_primary_source_url, registered_domain,
    DomainCategory, PRIMARY_SOURCE_DOMAINS, REFUTATION_SUFFIXES,
};
pub use executor::{
    citation_detector_max_candidates, expand_query, fragment_content_hash,
    should_run_web_citation_detection, ClaimRecord, ExecutorResult, SearchExecutor,
};
pub use pipeline::{
    expand_academic_query, generate_refutation_queries, is_academic_query, BudgetRemaining,
    PipelineOptions, PipelineResult, SearchPipeline,
};
pub use refutation::{
    RefutationDetail, RefutationExecutor, RefutationResult, NO_REFUTATION_CONFIDENCE_DECAY,
};
pub use state::{
    EvidenceGraphSummary, ExplorationState, FinalizeReport, FinalizeSummary, RefutationStatus,
    SearchReport, SearchState, SearchStatus, StatusBudget, StatusMetrics, StatusReport,
    TaskStatus, UcbScores, DEFAULT_BUDGET_PER_SEARCH, RECENT_FRAGMENT_WINDOW,
};
pub use state_registry::StateRegistry;
pub use ucb::{ArmStatus, Priority, SearchArm, UcbAllocator};
