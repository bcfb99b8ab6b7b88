//! The eight guarded transitions driving a capture from `Ready` through
//! `Committed`. Each stage takes ownership of the machine in its expected
//! state and returns it advanced by exactly one event; an invalid
//! transition (a stage called out of order) is a programmer error turned
//! into `AppError::InternalError` by `map_guard_error`.

use std::collections::HashMap;

use chrono::Utc;
use common::{
    error::AppError,
    storage::types::edge::{provenance_weight, Edge},
};
use futures::{stream, StreamExt};
use retrieval_pipeline::{scoring::SourceWeights, search_nodes, SearchParams};
use serde_json::json;
use state_machines::core::GuardError;
use tracing::instrument;
use uuid::Uuid;

use super::{
    chunking::chunk_paragraphs,
    context::{PipelineContext, ResolvedEntity, ResolvedFact},
    llm::{
        assign_temporal, extract_entities_chunk, extract_facts_chunk, judges_contradiction,
        ExtractedFact, TemporalAssignment,
    },
    state::{
        Committed, EntitiesExtracted, EntitiesLoaded, EntitiesResolved, FactsExtracted,
        FactsLoaded, FactsResolved, IngestionMachine, Ready, Temporalized,
    },
};

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid ingestion pipeline transition during {event}: {guard:?}"
    ))
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[instrument(level = "trace", skip_all, fields(graph = %ctx.graph))]
pub async fn load_existing_entities(
    machine: IngestionMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), EntitiesLoaded>, AppError> {
    let preview: String = ctx.content.text_content.chars().take(500).collect();
    let terms: Vec<String> = format!("{} {}", ctx.content.title, preview)
        .split_whitespace()
        .map(str::to_string)
        .collect();

    ctx.candidate_nodes = if terms.is_empty() {
        Vec::new()
    } else {
        let params = SearchParams {
            terms,
            limit: ctx.config.existing_entity_candidates,
            weights: SourceWeights::default(),
            graph: Some(ctx.graph.clone()),
            threshold: None,
        };
        search_nodes(ctx.db, ctx.embedding, &params)
            .await?
            .into_iter()
            .map(|scored| scored.node)
            .collect()
    };

    machine
        .load_existing_entities()
        .map_err(|(_, guard)| map_guard_error("load_existing_entities", &guard))
}

#[instrument(level = "trace", skip_all, fields(graph = %ctx.graph))]
pub async fn extract_entities(
    machine: IngestionMachine<(), EntitiesLoaded>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), EntitiesExtracted>, AppError> {
    let chunks = chunk_paragraphs(&ctx.content.text_content, ctx.config.chunk_size);
    let per_chunk = stream::iter(chunks.iter().map(|chunk| extract_entities_chunk(ctx.llm, chunk)))
        .buffer_unordered(ctx.config.max_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut merged: HashMap<String, (String, String, Option<String>)> = HashMap::new();
    for entities in per_chunk {
        for entity in entities {
            merged
                .entry(entity.name.to_lowercase())
                .or_insert((entity.name, entity.node_type, entity.summary));
        }
    }

    if merged.is_empty() && !ctx.content.text_content.trim().is_empty() {
        return Err(ctx.abort(AppError::EmptyExtraction));
    }

    ctx.extracted_entity_names = merged.into_values().collect();

    machine
        .extract_entities()
        .map_err(|(_, guard)| map_guard_error("extract_entities", &guard))
}

#[instrument(level = "trace", skip_all, fields(graph = %ctx.graph))]
pub async fn resolve_entities(
    machine: IngestionMachine<(), EntitiesExtracted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), EntitiesResolved>, AppError> {
    let extracted = std::mem::take(&mut ctx.extracted_entity_names);

    for (name, node_type, summary) in extracted {
        let key = name.to_lowercase();
        if ctx.resolved_entities.contains_key(&key) {
            continue;
        }

        if let Some(existing) = ctx
            .candidate_nodes
            .iter()
            .find(|node| node.node_type == node_type && node.name.to_lowercase() == key)
        {
            ctx.resolved_entities.insert(
                key,
                ResolvedEntity {
                    id: existing.id.clone(),
                    name: existing.name.clone(),
                    node_type: existing.node_type.clone(),
                    summary: existing.summary.clone(),
                    is_new: false,
                },
            );
            continue;
        }

        let params = SearchParams {
            terms: vec![name.clone()],
            limit: 5,
            weights: SourceWeights::default(),
            graph: Some(ctx.graph.clone()),
            threshold: Some(ctx.config.entity_match_threshold),
        };
        let hit = search_nodes(ctx.db, ctx.embedding, &params)
            .await?
            .into_iter()
            .find(|scored| scored.node.node_type == node_type);

        let resolved = match hit {
            Some(scored) => ResolvedEntity {
                id: scored.node.id,
                name: scored.node.name,
                node_type: scored.node.node_type,
                summary: scored.node.summary,
                is_new: false,
            },
            None => ResolvedEntity {
                id: Uuid::new_v4().to_string(),
                name,
                node_type,
                summary,
                is_new: true,
            },
        };
        ctx.resolved_entities.insert(key, resolved);
    }

    machine
        .resolve_entities()
        .map_err(|(_, guard)| map_guard_error("resolve_entities", &guard))
}

#[instrument(level = "trace", skip_all, fields(graph = %ctx.graph))]
pub async fn extract_facts(
    machine: IngestionMachine<(), EntitiesResolved>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), FactsExtracted>, AppError> {
    let known_entities: Vec<String> = ctx.resolved_entities.values().map(|e| e.name.clone()).collect();
    let chunks = chunk_paragraphs(&ctx.content.text_content, ctx.config.chunk_size);

    let per_chunk = stream::iter(
        chunks
            .iter()
            .map(|chunk| extract_facts_chunk(ctx.llm, chunk, &known_entities)),
    )
    .buffer_unordered(ctx.config.max_concurrency.max(1))
    .collect::<Vec<_>>()
    .await;

    ctx.extracted_facts = per_chunk
        .into_iter()
        .flatten()
        .filter(|fact| {
            ctx.resolved_entities.contains_key(&fact.subject.to_lowercase())
                && ctx.resolved_entities.contains_key(&fact.object.to_lowercase())
        })
        .collect();

    machine
        .extract_facts()
        .map_err(|(_, guard)| map_guard_error("extract_facts", &guard))
}

#[instrument(level = "trace", skip_all, fields(graph = %ctx.graph))]
pub async fn load_existing_facts(
    machine: IngestionMachine<(), FactsExtracted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), FactsLoaded>, AppError> {
    let ids: Vec<String> = ctx.resolved_entities.values().map(|e| e.id.clone()).collect();
    ctx.candidate_edges = if ids.is_empty() {
        Vec::new()
    } else {
        Edge::find_incident(ctx.db, &ctx.graph, &ids).await?
    };

    machine
        .load_existing_facts()
        .map_err(|(_, guard)| map_guard_error("load_existing_facts", &guard))
}

#[instrument(level = "trace", skip_all, fields(graph = %ctx.graph))]
pub async fn resolve_facts(
    machine: IngestionMachine<(), FactsLoaded>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), FactsResolved>, AppError> {
    let extracted = std::mem::take(&mut ctx.extracted_facts);
    let mut resolved = Vec::with_capacity(extracted.len());

    for fact in extracted {
        let Some(subject) = ctx.resolved_entities.get(&fact.subject.to_lowercase()) else {
            continue;
        };
        let Some(object) = ctx.resolved_entities.get(&fact.object.to_lowercase()) else {
            continue;
        };
        let subject_id = subject.id.clone();
        let object_id = object.id.clone();

        let current = ctx.candidate_edges.iter().find(|edge| {
            edge.is_current
                && edge.edge_type == fact.edge_type
                && ((edge.source_id == subject_id && edge.destination_id == object_id)
                    || (edge.source_id == object_id && edge.destination_id == subject_id))
        });

        if let Some(existing) = current {
            let same_text = existing
                .fact_text
                .as_deref()
                .is_some_and(|text| text.trim().eq_ignore_ascii_case(fact.fact_text.trim()));

            if same_text {
                resolved.push(reassertion(subject_id, object_id, fact, existing.id.clone()));
                continue;
            }

            let existing_text = existing.fact_text.clone().unwrap_or_default();
            if judges_contradiction(ctx.llm, &existing_text, &fact.fact_text).await {
                resolved.push(contradiction(subject_id, object_id, fact, existing.id.clone()));
            } else {
                resolved.push(reassertion(subject_id, object_id, fact, existing.id.clone()));
            }
            continue;
        }

        // A fact of a type never seen between this pair can still supersede
        // a current edge of a *different* type between the same two
        // entities (an "acquires" edge contradicted by a later
        // "cancels_acquisition" fact, say) — the same-type lookup above
        // can't see that, so any other current edge for the pair gets one
        // more contradiction check before falling through to a plain new
        // edge.
        let other_current = ctx.candidate_edges.iter().find(|edge| {
            edge.is_current
                && edge.edge_type != fact.edge_type
                && ((edge.source_id == subject_id && edge.destination_id == object_id)
                    || (edge.source_id == object_id && edge.destination_id == subject_id))
        });
        if let Some(existing) = other_current {
            let existing_text = existing.fact_text.clone().unwrap_or_default();
            if judges_contradiction(ctx.llm, &existing_text, &fact.fact_text).await {
                resolved.push(contradiction(subject_id, object_id, fact, existing.id.clone()));
                continue;
            }
        }

        let fact_embedding = ctx.embedding.text_to_vector(&fact.fact_text).await?;
        let semantic_match = ctx.candidate_edges.iter().find(|edge| {
            edge.edge_type == fact.edge_type
                && ((edge.source_id == subject_id && edge.destination_id == object_id)
                    || (edge.source_id == object_id && edge.destination_id == subject_id))
                && edge.fact_embedding.as_ref().is_some_and(|existing_vector| {
                    cosine(existing_vector, &fact_embedding) >= ctx.config.fact_match_threshold
                })
        });

        resolved.push(match semantic_match {
            Some(existing) => reassertion(subject_id, object_id, fact, existing.id.clone()),
            None => new_fact(subject_id, object_id, fact),
        });
    }

    ctx.resolved_facts = resolved;

    machine
        .resolve_facts()
        .map_err(|(_, guard)| map_guard_error("resolve_facts", &guard))
}

fn reassertion(subject_id: String, object_id: String, fact: ExtractedFact, existing_edge_id: String) -> ResolvedFact {
    ResolvedFact {
        subject_id,
        object_id,
        edge_type: fact.edge_type,
        fact_text: fact.fact_text,
        existing_edge_id: Some(existing_edge_id),
        contradicts_edge_id: None,
        valid_at: None,
        invalid_at: None,
    }
}

fn contradiction(subject_id: String, object_id: String, fact: ExtractedFact, contradicts_edge_id: String) -> ResolvedFact {
    ResolvedFact {
        subject_id,
        object_id,
        edge_type: fact.edge_type,
        fact_text: fact.fact_text,
        existing_edge_id: None,
        contradicts_edge_id: Some(contradicts_edge_id),
        valid_at: None,
        invalid_at: None,
    }
}

fn new_fact(subject_id: String, object_id: String, fact: ExtractedFact) -> ResolvedFact {
    ResolvedFact {
        subject_id,
        object_id,
        edge_type: fact.edge_type,
        fact_text: fact.fact_text,
        existing_edge_id: None,
        contradicts_edge_id: None,
        valid_at: None,
        invalid_at: None,
    }
}

#[instrument(level = "trace", skip_all, fields(graph = %ctx.graph))]
pub async fn extract_temporal(
    machine: IngestionMachine<(), FactsResolved>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Temporalized>, AppError> {
    let new_indices: Vec<usize> = ctx
        .resolved_facts
        .iter()
        .enumerate()
        .filter(|(_, fact)| fact.existing_edge_id.is_none())
        .map(|(i, _)| i)
        .collect();

    let targets: Vec<ExtractedFact> = new_indices
        .iter()
        .map(|&i| {
            let fact = &ctx.resolved_facts[i];
            ExtractedFact {
                subject: fact.subject_id.clone(),
                object: fact.object_id.clone(),
                edge_type: fact.edge_type.clone(),
                fact_text: fact.fact_text.clone(),
            }
        })
        .collect();

    let assignments = assign_temporal(ctx.llm, ctx.reference_timestamp, &targets).await;
    let mut by_index: HashMap<usize, TemporalAssignment> =
        assignments.into_iter().map(|a| (a.index, a)).collect();

    for (local_index, &i) in new_indices.iter().enumerate() {
        let assignment = by_index.remove(&local_index);
        let fact = &mut ctx.resolved_facts[i];
        fact.valid_at = assignment
            .as_ref()
            .and_then(|a| a.valid_at)
            .or(Some(ctx.reference_timestamp));
        fact.invalid_at = assignment.and_then(|a| a.invalid_at);
    }

    machine
        .extract_temporal()
        .map_err(|(_, guard)| map_guard_error("extract_temporal", &guard))
}

/// Inserts new nodes/edges, invalidates contradicted edges, bumps
/// provenance on reassertions, and flips `source` to completed, all inside
/// one transaction so a mid-commit failure leaves nothing partially
/// written.
#[instrument(level = "trace", skip_all, fields(graph = %ctx.graph))]
pub async fn commit(
    machine: IngestionMachine<(), Temporalized>,
    ctx: &PipelineContext<'_>,
    source_id: &str,
) -> Result<IngestionMachine<(), Committed>, AppError> {
    let now = Utc::now();

    let new_entities = ctx.new_entities();
    let name_vectors = if new_entities.is_empty() {
        Vec::new()
    } else {
        let names: Vec<String> = new_entities.iter().map(|e| e.name.clone()).collect();
        ctx.embedding.texts_to_vectors(&names).await?
    };

    let new_facts = ctx.new_facts();
    let fact_texts: Vec<String> = new_facts.iter().map(|f| f.fact_text.clone()).collect();
    let fact_vectors = if fact_texts.is_empty() {
        Vec::new()
    } else {
        ctx.embedding.texts_to_vectors(&fact_texts).await?
    };
    let edge_types: Vec<String> = new_facts.iter().map(|f| f.edge_type.clone()).collect();
    let type_vectors = if edge_types.is_empty() {
        Vec::new()
    } else {
        ctx.embedding.texts_to_vectors(&edge_types).await?
    };

    let mut sql = String::from("BEGIN TRANSACTION;\n");
    let mut binds: Vec<(String, serde_json::Value)> = vec![
        ("now".to_string(), json!(now)),
        ("reference_timestamp".to_string(), json!(ctx.reference_timestamp)),
        ("source_id".to_string(), json!(source_id)),
    ];

    for (i, entity) in new_entities.iter().enumerate() {
        sql.push_str(&format!(
            "CREATE type::thing('node', $node_id_{i}) CONTENT $node_{i};\n"
        ));
        binds.push((format!("node_id_{i}"), json!(entity.id)));
        binds.push((
            format!("node_{i}"),
            json!({
                "graph": ctx.graph,
                "node_type": entity.node_type,
                "name": entity.name,
                "summary": entity.summary,
                "attributes": {},
                "name_embedding": name_vectors.get(i),
                "created_at": now,
                "updated_at": now,
            }),
        ));

        sql.push_str(&format!(
            "CREATE type::thing('source_node', $sn_id_{i}) CONTENT $sn_{i};\n"
        ));
        binds.push((format!("sn_id_{i}"), json!(Uuid::new_v4().to_string())));
        binds.push((
            format!("sn_{i}"),
            json!({
                "source_id": source_id,
                "node_id": entity.id,
                "created_at": now,
                "updated_at": now,
            }),
        ));
    }

    for (i, fact) in new_facts.iter().enumerate() {
        let edge_id = Uuid::new_v4().to_string();
        sql.push_str(&format!(
            "CREATE type::thing('edge', $edge_id_{i}) CONTENT $edge_{i};\n"
        ));
        binds.push((format!("edge_id_{i}"), json!(edge_id)));
        binds.push((
            format!("edge_{i}"),
            json!({
                "graph": ctx.graph,
                "source_id": fact.subject_id,
                "destination_id": fact.object_id,
                "edge_type": fact.edge_type,
                "fact_text": fact.fact_text,
                "valid_at": fact.valid_at,
                "invalid_at": fact.invalid_at,
                "recorded_at": now,
                "is_current": fact.invalid_at.is_none(),
                "attributes": {},
                "fact_embedding": fact_vectors.get(i),
                "type_embedding": type_vectors.get(i),
                "provenance_weight_cache": provenance_weight(1),
                "provenance_count_cache": 1,
                "created_at": now,
                "updated_at": now,
            }),
        ));

        sql.push_str(&format!(
            "CREATE type::thing('source_edge', $se_id_{i}) CONTENT $se_{i};\n"
        ));
        binds.push((format!("se_id_{i}"), json!(Uuid::new_v4().to_string())));
        binds.push((
            format!("se_{i}"),
            json!({
                "source_id": source_id,
                "edge_id": edge_id,
                "created_at": now,
                "updated_at": now,
            }),
        ));
    }

    for (i, edge_id) in ctx.contradicted_edge_ids().into_iter().enumerate() {
        sql.push_str(&format!(
            "UPDATE type::thing('edge', $invalidate_id_{i}) SET invalid_at = $reference_timestamp, is_current = false, updated_at = $now;\n"
        ));
        binds.push((format!("invalidate_id_{i}"), json!(edge_id)));
    }

    for (i, fact) in ctx.reasserted_facts().into_iter().enumerate() {
        let Some(edge_id) = &fact.existing_edge_id else {
            continue;
        };
        sql.push_str(&format!(
            "UPDATE type::thing('edge', $reassert_id_{i}) SET \
               provenance_count_cache = provenance_count_cache + 1, \
               provenance_weight_cache = 1.0 - math::pow(math::E, -(provenance_count_cache + 1) / 3.0), \
               updated_at = $now;\n"
        ));
        binds.push((format!("reassert_id_{i}"), json!(edge_id)));
    }

    sql.push_str(
        "UPDATE type::thing('source', $source_id) SET status = 'completed', status_valid_from = $now, updated_at = $now;\n",
    );
    sql.push_str("COMMIT TRANSACTION;");

    let mut query = ctx.db.client.query(sql);
    for (key, value) in binds {
        query = query.bind((key, value));
    }
    query
        .await
        .map_err(AppError::Database)?
        .check()
        .map_err(|err| AppError::CommitFailed(err.to_string()))?;

    machine
        .commit()
        .map_err(|(_, guard)| map_guard_error("commit", &guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
