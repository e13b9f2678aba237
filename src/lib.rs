//! scout-core: exploration control core for a semi-autonomous research
//! assistant
//!
//! An external strategic agent issues search intents; this crate turns
//! each intent into a concrete pipeline of web and academic retrievals,
//! deduplicates results across heterogeneous sources, applies NLI to
//! extracted claims, records a provenance graph, and reallocates a
//! bounded page budget across competing searches with a UCB1 policy.
//! Adaptive concurrency polices external services that answer with
//! rate-limit or CAPTCHA signals.
//!
//! The crate does not originate queries, plan research strategy, or
//! extract claims from non-primary sources. SERP engines, fetchers,
//! extractors, academic API clients, NLI models, and LLM extractors are
//! collaborators behind the traits in [`collaborators`].

pub mod collaborators;
pub mod config;
pub mod core;
pub mod error;
pub mod research;
pub mod scheduler;
pub mod search;
pub mod storage;

pub use collaborators::Collaborators;
pub use config::Settings;
pub use core::{Core, StopMode};
pub use error::{CoreError, CoreResult};
pub use research::{
    ExplorationState, PipelineOptions, PipelineResult, Priority, RefutationExecutor,
    SearchExecutor, SearchPipeline, SearchState, SearchStatus, StateRegistry, StatusReport,
    TaskStatus, UcbAllocator,
};
pub use scheduler::TargetWorkerManager;
pub use search::{
    AcademicApiRateLimiter, BrowserTabPool, CanonicalPaperIndex, EngineRateLimiter, Paper,
    SerpItem, TabPool, TabPoolRegistry,
};
pub use storage::{evidence_graph::SqliteEvidenceGraph, Database};
