use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Edge, "edge", {
    graph: String,
    source_id: String,
    destination_id: String,
    edge_type: String,
    fact_text: Option<String>,
    valid_at: Option<DateTime<Utc>>,
    invalid_at: Option<DateTime<Utc>>,
    recorded_at: DateTime<Utc>,
    is_current: bool,
    attributes: serde_json::Value,
    fact_embedding: Option<Vec<f32>>,
    type_embedding: Option<Vec<f32>>,
    provenance_weight_cache: f32,
    provenance_count_cache: u32
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredEdge {
    #[serde(flatten)]
    pub edge: Edge,
    pub score: f32,
}

/// Re-asserting an edge logistically grows its weight with the number of
/// independent sources that have confirmed it, saturating toward 1.0.
pub fn provenance_weight(count: u32) -> f32 {
    let count = f32::from(u16::try_from(count).unwrap_or(u16::MAX));
    1.0 - (-count / 3.0).exp()
}

impl Edge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: String,
        source_id: String,
        destination_id: String,
        edge_type: String,
        fact_text: Option<String>,
        valid_at: Option<DateTime<Utc>>,
        attributes: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            graph,
            source_id,
            destination_id,
            edge_type,
            fact_text,
            valid_at,
            invalid_at: None,
            recorded_at: now,
            is_current: true,
            attributes,
            fact_embedding: None,
            type_embedding: None,
            provenance_weight_cache: provenance_weight(1),
            provenance_count_cache: 1,
        }
    }

    /// All edges (current or not) incident to any of `node_ids`, for
    /// `load_existing_facts`.
    pub async fn find_incident(
        db: &SurrealDbClient,
        graph: &str,
        node_ids: &[String],
    ) -> Result<Vec<Edge>, AppError> {
        let sql = "SELECT * FROM edge WHERE graph = $graph AND (source_id IN $ids OR destination_id IN $ids)";
        Ok(db
            .client
            .query(sql)
            .bind(("graph", graph.to_owned()))
            .bind(("ids", node_ids.to_vec()))
            .await
            .map_err(AppError::Database)?
            .take(0)
            .map_err(AppError::Database)?)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_edge_is_current_with_single_provenance() {
        let edge = Edge::new(
            String::new(),
            "a".into(),
            "b".into(),
            "acquires".into(),
            Some("AlphaCorp acquires BetaInc".into()),
            None,
            serde_json::json!({}),
        );
        assert!(edge.is_current);
        assert!(edge.invalid_at.is_none());
        assert_eq!(edge.provenance_count_cache, 1);
    }

    #[test]
    fn provenance_weight_increases_and_saturates() {
        let w1 = provenance_weight(1);
        let w5 = provenance_weight(5);
        let w50 = provenance_weight(50);
        assert!(w1 < w5);
        assert!(w5 < w50);
        assert!(w50 < 1.0);
    }
}
