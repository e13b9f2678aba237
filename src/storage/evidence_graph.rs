//! SQLite-backed evidence graph
//!
//! Default implementation of the `EvidenceGraph` collaborator writing into
//! this crate's `edges` table. Nodes live in their own tables (pages,
//! fragments, claims), the arena-plus-typed-id layout, so edges carry
//! typed id pairs and there are no owned back-references to cycle.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::collaborators::{
    Citation, CitationEdge, ClaimEvidence, EvidenceGraph, GraphStats, NodeType, Relation,
};
use crate::error::CoreResult;
use crate::storage::{Database, NewEdge};

/// Evidence graph persisted in the exploration store
#[derive(Clone)]
pub struct SqliteEvidenceGraph {
    db: Database,
}

impl SqliteEvidenceGraph {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EvidenceGraph for SqliteEvidenceGraph {
    async fn add_node(&self, task_id: &str, node_type: NodeType, node_id: &str) -> CoreResult<()> {
        // Nodes are their rows; nothing extra to materialize.
        debug!(task_id, node_type = node_type.as_str(), node_id, "Evidence graph node");
        Ok(())
    }

    async fn add_claim_evidence(&self, evidence: ClaimEvidence) -> CoreResult<()> {
        self.db
            .insert_edge(&NewEdge {
                source_type: NodeType::Fragment.as_str().to_string(),
                source_id: evidence.fragment_id.clone(),
                target_type: NodeType::Claim.as_str().to_string(),
                target_id: evidence.claim_id.clone(),
                relation: evidence.relation.as_str().to_string(),
                confidence: evidence.confidence,
                nli_label: Some(evidence.nli_label.as_str().to_string()),
                nli_confidence: Some(evidence.nli_confidence),
                source_domain_category: evidence.source_domain_category.clone(),
                target_domain_category: evidence.target_domain_category.clone(),
            })
            .await?;
        debug!(
            claim_id = %evidence.claim_id,
            fragment_id = %evidence.fragment_id,
            relation = evidence.relation.as_str(),
            nli_confidence = evidence.nli_confidence,
            "Recorded claim evidence edge"
        );
        Ok(())
    }

    async fn add_citation(&self, citation: CitationEdge) -> CoreResult<()> {
        self.db
            .insert_edge(&NewEdge {
                source_type: NodeType::Page.as_str().to_string(),
                source_id: citation.source_page_id.clone(),
                target_type: NodeType::Page.as_str().to_string(),
                target_id: citation.target_page_id.clone(),
                relation: Relation::Cites.as_str().to_string(),
                confidence: 1.0,
                nli_label: None,
                nli_confidence: None,
                source_domain_category: None,
                target_domain_category: None,
            })
            .await?;
        Ok(())
    }

    async fn add_academic_page_with_citations(
        &self,
        page_id: &str,
        _paper_metadata: serde_json::Value,
        citations: &[Citation],
        task_id: &str,
        paper_to_page: &HashMap<String, String>,
    ) -> CoreResult<()> {
        let mut wired = 0usize;
        for citation in citations {
            // Only papers that were actually persisted have page ids.
            let Some(cited_page) = paper_to_page.get(&citation.cited_paper_id) else {
                continue;
            };
            if cited_page == page_id {
                continue;
            }
            let edge = CitationEdge {
                source_page_id: page_id.to_string(),
                target_page_id: cited_page.clone(),
                task_id: task_id.to_string(),
                citation_source: "academic_api".to_string(),
                citation_context: String::new(),
            };
            if let Err(e) = self.add_citation(edge).await {
                warn!(page_id, error = %e, "Failed to wire citation edge");
                continue;
            }
            wired += 1;
        }
        debug!(page_id, task_id, wired, "Wired academic citation edges");
        Ok(())
    }

    async fn stats(&self, task_id: &str) -> CoreResult<GraphStats> {
        let metrics = self.db.task_metrics(task_id).await?;
        let claims = self.db.claim_count(task_id).await?;
        let edges = self.db.edge_count().await?;
        Ok(GraphStats {
            total_nodes: metrics.page_count + metrics.fragment_count + claims,
            total_edges: edges,
        })
    }
}
