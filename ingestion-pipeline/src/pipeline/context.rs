use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{edge::Edge, node::Node, remembered_content::RememberedContent},
    },
    utils::services::{EmbeddingService, LlmService},
};
use tracing::error;

use super::{config::IngestionConfig, llm::ExtractedFact};

/// An entity after resolution: either an existing node being reused, or a
/// newly minted id whose row is only created at `commit`.
#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    pub id: String,
    pub name: String,
    pub node_type: String,
    pub summary: Option<String>,
    pub is_new: bool,
}

/// An extracted fact after resolution against existing edges: either a
/// re-assertion of `existing_edge_id`, a contradiction of it (in which case
/// it gets invalidated at commit), or a brand new edge.
#[derive(Debug, Clone)]
pub struct ResolvedFact {
    pub subject_id: String,
    pub object_id: String,
    pub edge_type: String,
    pub fact_text: String,
    pub existing_edge_id: Option<String>,
    pub contradicts_edge_id: Option<String>,
    pub valid_at: Option<DateTime<Utc>>,
    pub invalid_at: Option<DateTime<Utc>>,
}

impl ResolvedFact {
    fn is_new_edge(&self) -> bool {
        self.existing_edge_id.is_none()
    }
}

/// Per-job scratch state threaded through the eight pipeline stages. Not a
/// database row itself; everything here is discarded once `commit`
/// completes (successfully or not).
pub struct PipelineContext<'a> {
    pub content: &'a RememberedContent,
    pub graph: String,
    pub reference_timestamp: DateTime<Utc>,
    pub db: &'a SurrealDbClient,
    pub config: &'a IngestionConfig,
    pub embedding: &'a dyn EmbeddingService,
    pub llm: &'a dyn LlmService,

    pub candidate_nodes: Vec<Node>,
    pub extracted_entity_names: Vec<(String, String, Option<String>)>,
    pub resolved_entities: HashMap<String, ResolvedEntity>,
    pub extracted_facts: Vec<ExtractedFact>,
    pub candidate_edges: Vec<Edge>,
    pub resolved_facts: Vec<ResolvedFact>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        content: &'a RememberedContent,
        graph: String,
        reference_timestamp: DateTime<Utc>,
        db: &'a SurrealDbClient,
        config: &'a IngestionConfig,
        embedding: &'a dyn EmbeddingService,
        llm: &'a dyn LlmService,
    ) -> Self {
        Self {
            content,
            graph,
            reference_timestamp,
            db,
            config,
            embedding,
            llm,
            candidate_nodes: Vec::new(),
            extracted_entity_names: Vec::new(),
            resolved_entities: HashMap::new(),
            extracted_facts: Vec::new(),
            candidate_edges: Vec::new(),
            resolved_facts: Vec::new(),
        }
    }

    /// Entities newly minted during `resolve_entities`, not yet persisted.
    pub fn new_entities(&self) -> Vec<&ResolvedEntity> {
        self.resolved_entities.values().filter(|e| e.is_new).collect()
    }

    pub fn new_facts(&self) -> Vec<&ResolvedFact> {
        self.resolved_facts.iter().filter(|f| f.is_new_edge()).collect()
    }

    pub fn reasserted_facts(&self) -> Vec<&ResolvedFact> {
        self.resolved_facts
            .iter()
            .filter(|f| f.existing_edge_id.is_some() && f.contradicts_edge_id.is_none())
            .collect()
    }

    pub fn contradicted_edge_ids(&self) -> Vec<String> {
        self.resolved_facts
            .iter()
            .filter_map(|f| f.contradicts_edge_id.clone())
            .collect()
    }

    pub fn abort(&self, err: AppError) -> AppError {
        error!(graph = %self.graph, content_id = %self.content.id, error = %err, "ingestion pipeline aborted");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_facts_excludes_reassertions_and_contradictions() {
        let reasserted = ResolvedFact {
            subject_id: "a".into(),
            object_id: "b".into(),
            edge_type: "knows".into(),
            fact_text: "a knows b".into(),
            existing_edge_id: Some("edge:1".into()),
            contradicts_edge_id: None,
            valid_at: None,
            invalid_at: None,
        };
        let fresh = ResolvedFact {
            existing_edge_id: None,
            ..reasserted.clone()
        };
        let facts = vec![reasserted, fresh];

        let new_count = facts.iter().filter(|f| f.is_new_edge()).count();
        assert_eq!(new_count, 1);
    }
}
