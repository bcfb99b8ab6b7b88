//! Scenario runner exercising the end-to-end behaviors the rest of the
//! workspace is expected to satisfy together: a capture goes in one end,
//! a graph comes out the other, re-ingestion is idempotent, a later
//! contradicting capture supersedes what came before it, hybrid search
//! fuses SQL/vector/trigram hits, the proxy transaction boundary rolls
//! back on error, and an aborted job leaves no graph rows behind.
//!
//! Every scenario builds its own in-memory `SurrealDbClient` and drives it
//! with the deterministic stand-ins in [`stubs`] rather than a real model.

mod stubs;

use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            edge::Edge,
            job::{Job, JobType},
            node::Node,
            remembered_content::{RememberedContent, SourceType},
            source::{Source, SourceStatus, TargetType},
            StoredObject,
        },
    },
};
use ingestion_pipeline::{IngestionConfig, IngestionJobHandler, IngestionPipeline};
use jobqueue::{JobDeps, JobHandler};
use retrieval_pipeline::{scoring::SourceWeights, search_nodes, SearchParams};
use rpc::{proxy::DbProxy, RpcHost};
use stubs::{FixedEmbedding, ScriptedLlm};
use transport::Transport;
use uuid::Uuid;

struct ScenarioOutcome {
    name: &'static str,
    result: Result<(), String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let outcomes = vec![
        ScenarioOutcome {
            name: "ingest creates a graph",
            result: ingest_creates_a_graph().await,
        },
        ScenarioOutcome {
            name: "re-ingesting the same page is idempotent",
            result: reingest_is_idempotent().await,
        },
        ScenarioOutcome {
            name: "a later contradiction supersedes a prior fact",
            result: contradiction_supersedes_prior_fact().await,
        },
        ScenarioOutcome {
            name: "hybrid search fuses across sources",
            result: hybrid_search_fuses_across_sources().await,
        },
        ScenarioOutcome {
            name: "a failed proxy transaction rolls back",
            result: proxy_transaction_rolls_back_on_error().await,
        },
        ScenarioOutcome {
            name: "an aborted job leaves no graph rows",
            result: abort_mid_pipeline_leaves_no_graph_rows().await,
        },
    ];

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(()) => println!("ok   - {}", outcome.name),
            Err(reason) => {
                failed += 1;
                println!("FAIL - {}: {reason}", outcome.name);
            }
        }
    }

    println!("{}/{} scenarios passed", outcomes.len() - failed, outcomes.len());
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn setup_db(ns: &str) -> Result<SurrealDbClient, String> {
    let db = SurrealDbClient::memory(ns, &Uuid::new_v4().to_string())
        .await
        .map_err(|err| err.to_string())?;
    db.apply_migrations().await.map_err(|err| err.to_string())?;
    Ok(db)
}

fn reference_timestamp(rfc3339: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(rfc3339)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| err.to_string())
}

fn acme_capture(headline: &str, body: &str, graph: &str) -> RememberedContent {
    RememberedContent::new(
        SourceType::RawText,
        None,
        None,
        headline.to_string(),
        body.to_string(),
        body.to_string(),
        body.to_string(),
        serde_json::json!({}),
        serde_json::json!({}),
        Some(graph.to_string()),
    )
}

async fn run_ingestion(
    db: &SurrealDbClient,
    content: &RememberedContent,
    graph: &str,
    reference_timestamp: DateTime<Utc>,
) -> Result<ingestion_pipeline::IngestionStats, AppError> {
    let source = Source::new(TargetType::RememberedContent, content.id.clone());
    db.store_item(source.clone()).await.map_err(AppError::Database)?;
    Source::mark_processing(db, &source.id).await?;

    let pipeline = IngestionPipeline::new(IngestionConfig::default());
    let job_id = Uuid::new_v4().to_string();
    pipeline
        .run(
            db,
            &FixedEmbedding,
            &ScriptedLlm,
            content,
            graph.to_string(),
            reference_timestamp,
            &source.id,
            &job_id,
        )
        .await
}

fn expect(condition: bool, message: impl Into<String>) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message.into())
    }
}

/// A capture mentioning an acquisition produces the two organizations and
/// one current `acquires` edge between them, dated from the capture.
async fn ingest_creates_a_graph() -> Result<(), String> {
    let db = setup_db("eval_scenario1").await?;
    let content = acme_capture(
        "AlphaCorp buys BetaInc",
        "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.",
        "acme-graph",
    );
    db.store_item(content.clone()).await.map_err(|e| e.to_string())?;

    let ts = reference_timestamp("2024-03-01T00:00:00Z")?;
    let stats = run_ingestion(&db, &content, "acme-graph", ts)
        .await
        .map_err(|e| e.to_string())?;

    expect(stats.entities_created == 2, format!("expected 2 entities, got {}", stats.entities_created))?;
    expect(stats.relations_created == 1, format!("expected 1 relation, got {}", stats.relations_created))?;

    let edges: Vec<Edge> = db
        .client
        .query("SELECT * FROM edge WHERE graph = 'acme-graph' AND edge_type = 'acquires'")
        .await
        .map_err(|e| e.to_string())?
        .take(0)
        .map_err(|e| e.to_string())?;

    expect(edges.len() == 1, format!("expected 1 acquires edge, got {}", edges.len()))?;
    let edge = &edges[0];
    expect(edge.is_current, "edge should be current")?;
    expect(edge.valid_at == Some(ts), "edge valid_at should match the capture's reference timestamp")?;
    Ok(())
}

/// Re-ingesting the exact same capture creates no new rows and bumps the
/// existing edge's provenance count instead.
async fn reingest_is_idempotent() -> Result<(), String> {
    let db = setup_db("eval_scenario2").await?;
    let content = acme_capture(
        "AlphaCorp buys BetaInc",
        "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.",
        "acme-graph",
    );
    db.store_item(content.clone()).await.map_err(|e| e.to_string())?;
    let ts = reference_timestamp("2024-03-01T00:00:00Z")?;

    run_ingestion(&db, &content, "acme-graph", ts).await.map_err(|e| e.to_string())?;
    let second = run_ingestion(&db, &content, "acme-graph", ts).await.map_err(|e| e.to_string())?;

    expect(second.entities_created == 0, format!("re-ingestion created {} entities", second.entities_created))?;
    expect(second.relations_created == 0, format!("re-ingestion created {} relations", second.relations_created))?;

    let edges: Vec<Edge> = db
        .client
        .query("SELECT * FROM edge WHERE graph = 'acme-graph' AND edge_type = 'acquires'")
        .await
        .map_err(|e| e.to_string())?
        .take(0)
        .map_err(|e| e.to_string())?;
    expect(edges.len() == 1, format!("expected a single edge surviving re-ingestion, got {}", edges.len()))?;
    expect(
        edges[0].provenance_count_cache == 2,
        format!("expected provenance_count_cache 2, got {}", edges[0].provenance_count_cache),
    )
}

/// A later capture that contradicts the acquisition invalidates the prior
/// edge as of the new capture's reference timestamp and asserts a
/// differently-typed current edge in its place.
async fn contradiction_supersedes_prior_fact() -> Result<(), String> {
    let db = setup_db("eval_scenario3").await?;
    let first = acme_capture(
        "AlphaCorp buys BetaInc",
        "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.",
        "acme-graph",
    );
    db.store_item(first.clone()).await.map_err(|e| e.to_string())?;
    let first_ts = reference_timestamp("2024-03-01T00:00:00Z")?;
    run_ingestion(&db, &first, "acme-graph", first_ts).await.map_err(|e| e.to_string())?;

    let second = acme_capture(
        "AlphaCorp cancels BetaInc deal",
        "AlphaCorp cancelled the BetaInc acquisition on 2024-05-01.",
        "acme-graph",
    );
    db.store_item(second.clone()).await.map_err(|e| e.to_string())?;
    let second_ts = reference_timestamp("2024-05-01T00:00:00Z")?;
    let stats = run_ingestion(&db, &second, "acme-graph", second_ts)
        .await
        .map_err(|e| e.to_string())?;

    expect(stats.entities_created == 0, "the second capture names no new entities")?;
    expect(stats.relations_created == 1, format!("expected 1 new relation, got {}", stats.relations_created))?;

    let acquires: Vec<Edge> = db
        .client
        .query("SELECT * FROM edge WHERE graph = 'acme-graph' AND edge_type = 'acquires'")
        .await
        .map_err(|e| e.to_string())?
        .take(0)
        .map_err(|e| e.to_string())?;
    expect(acquires.len() == 1, "the original acquires edge should still exist, invalidated")?;
    expect(!acquires[0].is_current, "the original acquires edge should no longer be current")?;
    expect(
        acquires[0].invalid_at == Some(second_ts),
        "invalid_at should be the contradicting capture's reference timestamp",
    )?;

    let cancellations: Vec<Edge> = db
        .client
        .query("SELECT * FROM edge WHERE graph = 'acme-graph' AND edge_type = 'cancels_acquisition'")
        .await
        .map_err(|e| e.to_string())?
        .take(0)
        .map_err(|e| e.to_string())?;
    expect(cancellations.len() == 1, format!("expected 1 cancels_acquisition edge, got {}", cancellations.len()))?;
    expect(cancellations[0].is_current, "the cancellation edge should be current")
}

/// `search_nodes` fuses SQL/vector/trigram hits against hand-seeded nodes,
/// surfacing the exact-name match above a merely similar one.
async fn hybrid_search_fuses_across_sources() -> Result<(), String> {
    let db = setup_db("eval_scenario4").await?;
    let alpha = Node::new("acme-graph".to_string(), "organization".to_string(), "AlphaCorp".to_string(), None, serde_json::json!({}));
    let alphabet = Node::new("acme-graph".to_string(), "organization".to_string(), "AlphaBet Traders".to_string(), None, serde_json::json!({}));
    db.store_item(alpha.clone()).await.map_err(|e| e.to_string())?;
    db.store_item(alphabet.clone()).await.map_err(|e| e.to_string())?;

    let params = SearchParams {
        terms: vec!["AlphaCorp".to_string()],
        limit: 5,
        weights: SourceWeights::default(),
        graph: Some("acme-graph".to_string()),
        threshold: None,
    };
    let results = search_nodes(&db, &FixedEmbedding, &params).await.map_err(|e| e.to_string())?;

    expect(!results.is_empty(), "hybrid search returned no rows")?;
    expect(results[0].node.id == alpha.id, "exact name match should rank first")
}

/// A transaction whose body returns an error rolls back: the row the body
/// created never commits.
async fn proxy_transaction_rolls_back_on_error() -> Result<(), String> {
    let db = Arc::new(
        SurrealDbClient::memory("eval_scenario5", &Uuid::new_v4().to_string())
            .await
            .map_err(|e| e.to_string())?,
    );
    let (host_transport, client_transport) = Transport::pair(16);
    let host = RpcHost::new(db, Arc::new(host_transport));
    let host_task = tokio::spawn(async move { host.run().await });

    let proxy = DbProxy::new(Arc::new(client_transport));
    proxy
        .exec("DEFINE TABLE IF NOT EXISTS topic SCHEMALESS;")
        .await
        .map_err(|e| e.to_string())?;

    let outcome = proxy
        .transaction(|p| async move {
            p.exec("CREATE topic:doomed SET name = 'will not survive';").await?;
            Err(AppError::Validation("deliberate failure".to_string()))
        })
        .await;
    expect(outcome.is_err(), "the transaction body's error should propagate")?;

    #[derive(serde::Deserialize)]
    struct CountRow {
        count: Option<i64>,
    }
    let result: rpc::proxy::QueryResult<CountRow> = proxy
        .query(
            "SELECT count() AS count FROM topic WHERE id = topic:doomed GROUP ALL;",
            None,
            rpc::RowMode::Object,
        )
        .await
        .map_err(|e| e.to_string())?;
    host_task.abort();

    expect(result.rows.is_empty(), "a rolled-back row must not be visible")
}

/// A job marked aborted before the handler runs fails the pipeline with
/// `AppError::Cancelled`, leaves the source failed, and writes no graph
/// rows.
async fn abort_mid_pipeline_leaves_no_graph_rows() -> Result<(), String> {
    let db = setup_db("eval_scenario6").await?;
    let content = acme_capture(
        "AlphaCorp buys BetaInc",
        "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.",
        "acme-graph",
    );
    db.store_item(content.clone()).await.map_err(|e| e.to_string())?;

    let job = Job::new(JobType::ConvertToKg, serde_json::json!({"contentId": content.id}));
    db.store_item(job.clone()).await.map_err(|e| e.to_string())?;
    Job::mark_processing(&db, &job.id).await.map_err(|e| e.to_string())?;
    Job::mark_aborted(&db, &job.id).await.map_err(|e| e.to_string())?;

    let deps = JobDeps {
        db: Arc::new(db),
        embedding: Arc::new(FixedEmbedding),
        llm: Arc::new(ScriptedLlm),
    };
    let handler = IngestionJobHandler::new(IngestionConfig::default());
    let outcome = handler.process(&job, &deps).await;
    expect(matches!(outcome, Err(AppError::Cancelled)), "an aborted job must fail with Cancelled")?;

    let nodes: Vec<Node> = deps
        .db
        .client
        .query("SELECT * FROM node")
        .await
        .map_err(|e| e.to_string())?
        .take(0)
        .map_err(|e| e.to_string())?;
    expect(nodes.is_empty(), "an aborted run must not write node rows")?;

    let sources: Vec<Source> = deps
        .db
        .client
        .query("SELECT * FROM source")
        .await
        .map_err(|e| e.to_string())?
        .take(0)
        .map_err(|e| e.to_string())?;
    expect(sources.len() == 1, "exactly one source row should exist")?;
    expect(sources[0].status == SourceStatus::Failed, "the source should be marked failed")
}
