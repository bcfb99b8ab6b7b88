//! Demo host process: owns the embedded database directly (`Mode::Host`),
//! the way a browser extension's service worker would.
//!
//! Seeds one capture, enqueues it for ingestion, and runs the worker loop
//! against it until Ctrl-C. Run `client` separately to see the same
//! capability exercised through the proxy path (C3) instead.

use std::sync::Arc;

use common::{
    registry::ServiceRegistry,
    storage::types::{
        job::{JobStatus, JobType},
        remembered_content::{RememberedContent, SourceType},
    },
    utils::config::get_config,
};
use ingestion_pipeline::{IngestionConfig, IngestionJobHandler};
use jobqueue::{HandlerRegistry, JobDeps, JobQueue};
use retrieval_pipeline::{scoring::SourceWeights, search_nodes, SearchParams};
use tracing::{info, warn};
use transport::Transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = get_config()?;
    let registry = ServiceRegistry::connect_host(&config).await?;
    registry
        .initialize(config.embedding_dimensions as usize)
        .await?;

    let deps = Arc::new(JobDeps {
        db: registry.db.clone(),
        embedding: registry.embedding.clone(),
        llm: registry.llm.clone(),
    });

    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(IngestionJobHandler::new(IngestionConfig::default())));

    // No client connects to this handle in the demo; the queue still needs
    // a transport end to post NEW_JOB/JOB_UPDATED events onto.
    let (events, _unused) = Transport::pair(64);

    let queue = Arc::new(JobQueue::new(
        registry.db.clone(),
        Arc::new(events),
        deps,
        Arc::new(handlers),
    ));

    let content = RememberedContent::new(
        SourceType::RawText,
        None,
        None,
        "AlphaCorp buys BetaInc".to_string(),
        "AlphaCorp announced it will acquire BetaInc.".to_string(),
        "AlphaCorp announced it will acquire BetaInc.".to_string(),
        "AlphaCorp announced it will acquire BetaInc.".to_string(),
        serde_json::json!({}),
        serde_json::json!({}),
        Some("demo-graph".to_string()),
    );
    registry.db.store_item(content.clone()).await?;
    let job = queue
        .enqueue(JobType::ConvertToKg, serde_json::json!({"contentId": content.id}))
        .await?;
    info!(job_id = %job.id, "enqueued demo capture for ingestion");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let worker_task = tokio::spawn({
        let queue = queue.clone();
        async move {
            queue
                .run_worker_loop("demo-worker", std::time::Duration::from_millis(200), shutdown_rx)
                .await;
        }
    });

    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        match queue.get(&job.id).await? {
            Some(job) if job.status == JobStatus::Completed => break,
            Some(job) if job.status == JobStatus::Failed => {
                warn!(job_id = %job.id, status = ?job.status, "demo capture failed to ingest");
                break;
            }
            _ => continue,
        }
    }

    let params = SearchParams {
        terms: vec!["AlphaCorp".to_string()],
        limit: 5,
        weights: SourceWeights::default(),
        graph: Some("demo-graph".to_string()),
        threshold: None,
    };
    let results = search_nodes(&registry.db, registry.embedding.as_ref(), &params).await?;
    for scored in &results {
        info!(name = %scored.node.name, score = scored.score, "match for the ingested capture");
    }

    info!("host running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let _ = shutdown_tx.send(());
    worker_task.abort();

    Ok(())
}
