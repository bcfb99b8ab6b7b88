pub mod scoring;
pub mod trigram;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::edge::{Edge, ScoredEdge},
        types::node::{Node, ScoredNode},
    },
    utils::services::EmbeddingService,
};
use scoring::{fuse, SourceRow, SourceWeights};
use tracing::instrument;

/// Cutoff `trigram_search_nodes`/`trigram_search_edges` apply when the
/// caller leaves `SearchParams::threshold` unset.
const DEFAULT_TRIGRAM_THRESHOLD: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub terms: Vec<String>,
    pub limit: usize,
    pub weights: SourceWeights,
    pub graph: Option<String>,
    pub threshold: Option<f32>,
}

impl SearchParams {
    fn joined_query(&self) -> String {
        self.terms.join(" ")
    }
}

#[instrument(skip(db, embedding, params), fields(limit = params.limit))]
pub async fn search_nodes(
    db: &SurrealDbClient,
    embedding: &dyn EmbeddingService,
    params: &SearchParams,
) -> Result<Vec<ScoredNode>, AppError> {
    let sql_rows = sql_search_nodes(db, params).await?;
    let vector_rows = vector_search_nodes(db, embedding, params).await?;
    let trigram_rows = trigram_search_nodes(db, params).await?;

    Ok(fuse(
        [sql_rows, vector_rows, trigram_rows],
        params.weights,
        params.limit,
    ))
}

#[instrument(skip(db, embedding, params), fields(limit = params.limit))]
pub async fn search_edges(
    db: &SurrealDbClient,
    embedding: &dyn EmbeddingService,
    params: &SearchParams,
) -> Result<Vec<ScoredEdge>, AppError> {
    let sql_rows = sql_search_edges(db, params).await?;
    let vector_rows = vector_search_edges(db, embedding, params).await?;
    let trigram_rows = trigram_search_edges(db, params).await?;

    Ok(fuse(
        [sql_rows, vector_rows, trigram_rows],
        params.weights,
        params.limit,
    ))
}

async fn sql_search_nodes(
    db: &SurrealDbClient,
    params: &SearchParams,
) -> Result<Vec<SourceRow<ScoredNode>>, AppError> {
    if params.terms.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT * FROM node WHERE (",
    );
    let clauses: Vec<String> = params
        .terms
        .iter()
        .enumerate()
        .map(|(i, _)| format!("string::lowercase(name) CONTAINS string::lowercase($term{i})"))
        .collect();
    sql.push_str(&clauses.join(" OR "));
    sql.push(')');
    if params.graph.is_some() {
        sql.push_str(" AND graph = $graph");
    }

    let mut query = db.client.query(sql);
    for (i, term) in params.terms.iter().enumerate() {
        query = query.bind((format!("term{i}"), term.clone()));
    }
    if let Some(graph) = &params.graph {
        query = query.bind(("graph", graph.clone()));
    }

    let nodes: Vec<Node> = query.await.map_err(AppError::Database)?.take(0).map_err(AppError::Database)?;

    Ok(nodes
        .into_iter()
        .map(|node| SourceRow {
            id: node.id.clone(),
            score: 1.0,
            item: ScoredNode { node, score: 1.0 },
        })
        .collect())
}

async fn vector_search_nodes(
    db: &SurrealDbClient,
    embedding: &dyn EmbeddingService,
    params: &SearchParams,
) -> Result<Vec<SourceRow<ScoredNode>>, AppError> {
    if params.terms.is_empty() {
        return Ok(Vec::new());
    }

    let query_embedding = embedding.text_to_vector(&params.joined_query()).await?;
    let scored = Node::vector_search(
        db,
        params.graph.as_deref(),
        &query_embedding,
        params.limit.max(1),
    )
    .await?;

    Ok(scored
        .into_iter()
        .filter(|s| params.threshold.is_none_or(|t| s.score >= t))
        .map(|s| SourceRow {
            id: s.node.id.clone(),
            score: s.score,
            item: s,
        })
        .collect())
}

async fn trigram_search_nodes(
    db: &SurrealDbClient,
    params: &SearchParams,
) -> Result<Vec<SourceRow<ScoredNode>>, AppError> {
    if params.terms.is_empty() {
        return Ok(Vec::new());
    }
    let query = params.joined_query();

    let sql = if params.graph.is_some() {
        "SELECT * FROM node WHERE graph = $graph"
    } else {
        "SELECT * FROM node"
    };
    let mut q = db.client.query(sql);
    if let Some(graph) = &params.graph {
        q = q.bind(("graph", graph.clone()));
    }

    let candidates: Vec<Node> = q.await.map_err(AppError::Database)?.take(0).map_err(AppError::Database)?;
    let threshold = params.threshold.unwrap_or(DEFAULT_TRIGRAM_THRESHOLD);

    let mut scored: Vec<SourceRow<ScoredNode>> = candidates
        .into_iter()
        .filter_map(|node| {
            let score = trigram::dice_coefficient(&query, &node.name);
            if score < threshold {
                return None;
            }
            Some(SourceRow {
                id: node.id.clone(),
                score,
                item: ScoredNode { node, score },
            })
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(params.limit.max(1) * 4);
    Ok(scored)
}

async fn sql_search_edges(
    db: &SurrealDbClient,
    params: &SearchParams,
) -> Result<Vec<SourceRow<ScoredEdge>>, AppError> {
    if params.terms.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from("SELECT * FROM edge WHERE (");
    let clauses: Vec<String> = params
        .terms
        .iter()
        .enumerate()
        .map(|(i, _)| {
            format!(
                "string::lowercase(edge_type) CONTAINS string::lowercase($term{i}) \
                 OR string::lowercase(fact_text) CONTAINS string::lowercase($term{i})"
            )
        })
        .collect();
    sql.push_str(&clauses.join(" OR "));
    sql.push(')');
    if params.graph.is_some() {
        sql.push_str(" AND graph = $graph");
    }

    let mut query = db.client.query(sql);
    for (i, term) in params.terms.iter().enumerate() {
        query = query.bind((format!("term{i}"), term.clone()));
    }
    if let Some(graph) = &params.graph {
        query = query.bind(("graph", graph.clone()));
    }

    let edges: Vec<Edge> = query.await.map_err(AppError::Database)?.take(0).map_err(AppError::Database)?;

    Ok(edges
        .into_iter()
        .map(|edge| SourceRow {
            id: edge.id.clone(),
            score: 1.0,
            item: ScoredEdge { edge, score: 1.0 },
        })
        .collect())
}

async fn vector_search_edges(
    db: &SurrealDbClient,
    embedding: &dyn EmbeddingService,
    params: &SearchParams,
) -> Result<Vec<SourceRow<ScoredEdge>>, AppError> {
    if params.terms.is_empty() {
        return Ok(Vec::new());
    }

    let query_embedding = embedding.text_to_vector(&params.joined_query()).await?;
    let where_graph = if params.graph.is_some() { " AND graph = $graph" } else { "" };
    let sql = format!(
        "SELECT *, math::max([\
           vector::similarity::cosine(fact_embedding, $embedding), \
           vector::similarity::cosine(type_embedding, $embedding)\
         ]) AS score \
         FROM edge \
         WHERE (fact_embedding != NONE OR type_embedding != NONE){where_graph} \
         ORDER BY score DESC LIMIT $limit"
    );
    let mut query = db
        .client
        .query(sql)
        .bind(("embedding", query_embedding))
        .bind(("limit", params.limit.max(1) as i64));
    if let Some(graph) = &params.graph {
        query = query.bind(("graph", graph.clone()));
    }

    let scored: Vec<ScoredEdge> = query.await.map_err(AppError::Database)?.take(0).map_err(AppError::Database)?;

    Ok(scored
        .into_iter()
        .filter(|s| params.threshold.is_none_or(|t| s.score >= t))
        .map(|s| SourceRow {
            id: s.edge.id.clone(),
            score: s.score,
            item: s,
        })
        .collect())
}

async fn trigram_search_edges(
    db: &SurrealDbClient,
    params: &SearchParams,
) -> Result<Vec<SourceRow<ScoredEdge>>, AppError> {
    if params.terms.is_empty() {
        return Ok(Vec::new());
    }
    let query_str = params.joined_query();

    let sql = if params.graph.is_some() {
        "SELECT * FROM edge WHERE graph = $graph"
    } else {
        "SELECT * FROM edge"
    };
    let mut q = db.client.query(sql);
    if let Some(graph) = &params.graph {
        q = q.bind(("graph", graph.clone()));
    }

    let candidates: Vec<Edge> = q.await.map_err(AppError::Database)?.take(0).map_err(AppError::Database)?;
    let threshold = params.threshold.unwrap_or(DEFAULT_TRIGRAM_THRESHOLD);

    let mut scored: Vec<SourceRow<ScoredEdge>> = candidates
        .into_iter()
        .filter_map(|edge| {
            let fact_text = edge.fact_text.clone().unwrap_or_default();
            let score = trigram::dice_coefficient(&query_str, &fact_text)
                .max(trigram::dice_coefficient(&query_str, &edge.edge_type));
            if score < threshold {
                return None;
            }
            Some(SourceRow {
                id: edge.id.clone(),
                score,
                item: ScoredEdge { edge, score },
            })
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(params.limit.max(1) * 4);
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::StoredObject;
    use common::utils::services::EmbeddingService;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct FixedEmbedding(Vec<f32>);

    #[async_trait]
    impl EmbeddingService for FixedEmbedding {
        async fn text_to_vector(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Ok(self.0.clone())
        }
        async fn texts_to_vectors(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
        async fn initialize(&self) -> Result<(), AppError> {
            Ok(())
        }
        fn is_ready(&self) -> bool {
            true
        }
        fn dimensions(&self) -> u32 {
            self.0.len() as u32
        }
    }

    async fn setup_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("retrieval_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn search_nodes_finds_exact_name_match() {
        let db = setup_db().await;
        let node = Node::new(
            "graph-1".to_string(),
            "person".to_string(),
            "Ada Lovelace".to_string(),
            None,
            serde_json::json!({}),
        );
        db.store_item(node.clone()).await.expect("store node");

        let embedding = FixedEmbedding(vec![0.1, 0.2, 0.3]);
        let params = SearchParams {
            terms: vec!["Ada".to_string()],
            limit: 5,
            weights: SourceWeights::default(),
            graph: Some("graph-1".to_string()),
            threshold: None,
        };

        let results = search_nodes(&db, &embedding, &params).await.expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node.id, node.id);
    }

    #[tokio::test]
    async fn search_nodes_returns_empty_when_no_source_matches() {
        let db = setup_db().await;
        let embedding = FixedEmbedding(vec![0.1, 0.2, 0.3]);
        let params = SearchParams {
            terms: vec!["nonexistent".to_string()],
            limit: 5,
            weights: SourceWeights::default(),
            graph: Some("graph-1".to_string()),
            threshold: None,
        };

        let results = search_nodes(&db, &embedding, &params).await.expect("search");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn vector_search_nodes_fires_for_default_empty_graph() {
        let db = setup_db().await;
        common::storage::indexes::ensure_runtime_indexes(&db, 3)
            .await
            .expect("build indexes");

        let mut node = Node::new(
            String::new(),
            "organization".to_string(),
            "AlphaCorp".to_string(),
            None,
            serde_json::json!({}),
        );
        node.name_embedding = Some(vec![0.1, 0.2, 0.3]);
        db.store_item(node.clone()).await.expect("store node");

        let embedding = FixedEmbedding(vec![0.1, 0.2, 0.3]);
        let params = SearchParams {
            terms: vec!["AlphaCorp".to_string()],
            limit: 5,
            weights: SourceWeights::default(),
            graph: Some(String::new()),
            threshold: None,
        };

        let rows = vector_search_nodes(&db, &embedding, &params)
            .await
            .expect("vector search");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, node.id);
    }

    #[tokio::test]
    async fn vector_search_nodes_with_no_graph_filter_searches_every_graph() {
        let db = setup_db().await;
        common::storage::indexes::ensure_runtime_indexes(&db, 3)
            .await
            .expect("build indexes");

        let mut node = Node::new(
            "other-graph".to_string(),
            "organization".to_string(),
            "AlphaCorp".to_string(),
            None,
            serde_json::json!({}),
        );
        node.name_embedding = Some(vec![0.1, 0.2, 0.3]);
        db.store_item(node.clone()).await.expect("store node");

        let embedding = FixedEmbedding(vec![0.1, 0.2, 0.3]);
        let params = SearchParams {
            terms: vec!["AlphaCorp".to_string()],
            limit: 5,
            weights: SourceWeights::default(),
            graph: None,
            threshold: None,
        };

        let rows = vector_search_nodes(&db, &embedding, &params)
            .await
            .expect("vector search");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, node.id);
    }

    #[tokio::test]
    async fn trigram_search_nodes_drops_matches_below_threshold() {
        let db = setup_db().await;
        let node = Node::new(
            "graph-1".to_string(),
            "person".to_string(),
            "Zzyzx".to_string(),
            None,
            serde_json::json!({}),
        );
        db.store_item(node).await.expect("store node");

        let params = SearchParams {
            terms: vec!["Ada".to_string()],
            limit: 5,
            weights: SourceWeights::default(),
            graph: Some("graph-1".to_string()),
            threshold: Some(0.9),
        };

        let rows = trigram_search_nodes(&db, &params).await.expect("trigram search");
        assert!(rows.is_empty());
    }
}
