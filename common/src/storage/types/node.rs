use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const NAME_EMBEDDING_DIM: usize = 768;

stored_object!(Node, "node", {
    graph: String,
    node_type: String,
    name: String,
    summary: Option<String>,
    attributes: serde_json::Value,
    name_embedding: Option<Vec<f32>>
});

/// A node row plus the score attached by a retrieval call; `__score` is
/// surfaced to callers as documented in the fusion rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredNode {
    #[serde(flatten)]
    pub node: Node,
    pub score: f32,
}

impl Node {
    pub fn new(
        graph: String,
        node_type: String,
        name: String,
        summary: Option<String>,
        attributes: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            graph,
            node_type,
            name,
            summary,
            attributes,
            name_embedding: None,
        }
    }

    /// `graph` gates the search exactly like the SQL/trigram legs: `None`
    /// searches every graph, `Some("")` (a capture's default graph) is a
    /// filter like any other.
    pub async fn vector_search(
        db: &SurrealDbClient,
        graph: Option<&str>,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredNode>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(flatten)]
            node: Node,
            score: f32,
        }

        let where_graph = if graph.is_some() { " AND graph = $graph" } else { "" };
        let sql = format!(
            "SELECT *, vector::similarity::cosine(name_embedding, $embedding) AS score \
             FROM node \
             WHERE name_embedding != NONE{where_graph} \
               AND name_embedding <|{limit},64|> $embedding \
             ORDER BY score DESC LIMIT {limit}"
        );

        let mut query = db.client.query(sql).bind(("embedding", query_embedding.to_vec()));
        if let Some(graph) = graph {
            query = query.bind(("graph", graph.to_owned()));
        }

        let rows: Vec<Row> = query
            .await
            .map_err(AppError::Database)?
            .take(0)
            .map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| ScoredNode {
                node: r.node,
                score: r.score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_defaults_embedding_to_none() {
        let node = Node::new(
            String::new(),
            "organization".into(),
            "AlphaCorp".into(),
            None,
            serde_json::json!({}),
        );
        assert!(node.name_embedding.is_none());
        assert_eq!(node.graph, "");
    }
}
