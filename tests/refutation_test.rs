//! Refutation executor: mechanical reverse queries, NLI detection, and
//! confidence decay

mod common;

use std::sync::Arc;

use scout_core::collaborators::Stance;
use scout_core::research::{RefutationExecutor, RefutationStatus, NO_REFUTATION_CONFIDENCE_DECAY};
use scout_core::{Database, ExplorationState, PipelineOptions, Priority, Settings};

use common::{recording_bundle, serp_item, FailingNli, FixedNli, OkFetcher, StaticSerp, TextExtractor};

struct Fixture {
    db: Database,
    state: Arc<ExplorationState>,
    executor: RefutationExecutor,
}

async fn fixture(nli: Arc<dyn scout_core::collaborators::NliJudge>) -> Fixture {
    let settings = Arc::new(Settings::default());
    let db = Database::open_in_memory().await.expect("db");
    let (mut collaborators, graph) = recording_bundle();
    collaborators.serp = Arc::new(StaticSerp::new(vec![serp_item(
        "https://critics.example.org/rebuttal",
        1,
    )]));
    collaborators.fetcher = Arc::new(OkFetcher { auth_queued: false });
    collaborators.extractor = Arc::new(TextExtractor {
        text: "a long critical passage disputing the claim ".repeat(10),
    });
    collaborators.nli = nli;

    let state = Arc::new(ExplorationState::new(
        "t_refute",
        db.clone(),
        Arc::clone(&settings),
        graph,
        true,
        None,
    ));
    let executor = RefutationExecutor::new(
        "t_refute",
        Arc::clone(&state),
        db.clone(),
        collaborators,
    );
    Fixture {
        db,
        state,
        executor,
    }
}

#[tokio::test]
async fn refutations_found_record_edges() {
    let f = fixture(Arc::new(FixedNli {
        stance: Stance::Refutes,
        confidence: 0.85,
    }))
    .await;
    f.db.insert_claim(
        "c_ref",
        "t_refute",
        "the disputed claim",
        0.9,
        Some("source_url=https://www.soumu.go.jp/origin"),
    )
    .await
    .expect("claim");

    let result = f.executor.execute_for_claim("c_ref").await.expect("run");
    assert!(result.ok());
    assert_eq!(result.reverse_queries_executed, 5);
    assert!(result.refutations_found > 0);
    assert_eq!(result.confidence_adjustment, 0.0);

    // Edges persisted with relation=refutes and the claim's origin category
    assert!(f.db.edge_count().await.expect("edges") as usize >= result.refutations_found);
    let edges = f
        .db
        .edges_for_target("claim", "c_ref")
        .await
        .expect("edges for claim");
    assert!(!edges.is_empty());
    for (_, relation, confidence) in &edges {
        assert_eq!(relation, "refutes");
        assert!((confidence - 0.85).abs() < 1e-9);
    }

    // Confidence untouched when refutations were found
    let claim = f.db.fetch_claim("c_ref").await.expect("query").expect("row");
    assert!((claim.confidence_score - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn no_refutation_decays_confidence_with_floor() {
    let f = fixture(Arc::new(FixedNli {
        stance: Stance::Supports,
        confidence: 0.9,
    }))
    .await;
    f.db.insert_claim("c_low", "t_refute", "claim", 0.03, None)
        .await
        .expect("claim");

    let result = f.executor.execute_for_claim("c_low").await.expect("run");
    assert_eq!(result.refutations_found, 0);
    assert!((result.confidence_adjustment + NO_REFUTATION_CONFIDENCE_DECAY).abs() < 1e-9);

    // 0.03 - 0.05 floors at 0
    let claim = f.db.fetch_claim("c_low").await.expect("query").expect("row");
    assert!(claim.confidence_score.abs() < 1e-9);
}

#[tokio::test]
async fn nli_failure_is_a_safe_no_refutation_signal() {
    let f = fixture(Arc::new(FailingNli)).await;
    f.db.insert_claim("c_nli", "t_refute", "claim", 0.5, None)
        .await
        .expect("claim");

    let result = f.executor.execute_for_claim("c_nli").await.expect("run");
    assert!(result.ok());
    assert_eq!(result.refutations_found, 0);
}

#[tokio::test]
async fn unknown_claim_reports_input_error_without_raising() {
    let f = fixture(Arc::new(FailingNli)).await;
    let result = f.executor.execute_for_claim("missing").await.expect("run");
    assert!(!result.ok());
    assert!(result.errors[0].contains("Claim not found"));
}

#[tokio::test]
async fn search_refutation_sets_refutation_status() {
    let f = fixture(Arc::new(FixedNli {
        stance: Stance::Refutes,
        confidence: 0.9,
    }))
    .await;
    f.state
        .register_search("s_ref", "the search text", Priority::Medium, None, None);

    let result = f.executor.execute_for_search("s_ref").await.expect("run");
    assert!(result.refutations_found > 0);
    let search = f.state.get_search("s_ref").expect("search");
    assert_eq!(search.refutation_status, RefutationStatus::Found);
    assert_eq!(search.refutation_count as usize, result.refutations_found);
}

#[tokio::test]
async fn pipeline_refute_mode_uses_suffix_queries_and_threshold() {
    let settings = Arc::new(Settings::default());
    let db = Database::open_in_memory().await.expect("db");
    let (mut collaborators, graph) = recording_bundle();
    collaborators.serp = Arc::new(StaticSerp::new(vec![serp_item(
        "https://critics.example.org/rebuttal",
        1,
    )]));
    collaborators.fetcher = Arc::new(OkFetcher { auth_queued: false });
    collaborators.extractor = Arc::new(TextExtractor {
        text: "counter-evidence passage ".repeat(30),
    });
    // Below the 0.6 threshold: refuting stance but not confident enough
    collaborators.nli = Arc::new(FixedNli {
        stance: Stance::Refutes,
        confidence: 0.5,
    });

    let state = Arc::new(ExplorationState::new(
        "t_pipe_ref",
        db.clone(),
        Arc::clone(&settings),
        graph,
        true,
        None,
    ));
    let pipeline = scout_core::SearchPipeline::new(
        "t_pipe_ref",
        Arc::clone(&state),
        db,
        collaborators,
        Arc::clone(&settings),
    );

    let options = PipelineOptions {
        refute: true,
        ..PipelineOptions::default()
    };
    let result = pipeline.execute("the original claim", &options).await;
    assert!(result.is_refutation);
    assert_eq!(result.refutations_found, 0);
    // Under budget with no hits: partial
    assert_eq!(result.status, "partial");
    assert!(result.pages_fetched > 0);
}
