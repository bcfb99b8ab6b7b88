mod chunking;
mod config;
mod context;
mod llm;
mod stages;
mod state;

pub use config::IngestionConfig;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{job::Job, remembered_content::RememberedContent},
    },
    utils::services::{EmbeddingService, LlmService},
};
use tracing::info;

use self::{context::PipelineContext, state::ready};

/// Row counts a `convert-to-kg` job result reports back to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestionStats {
    pub entities_created: usize,
    pub relations_created: usize,
}

#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    config: IngestionConfig,
}

impl IngestionPipeline {
    pub fn new(config: IngestionConfig) -> Self {
        Self { config }
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    async fn ensure_not_aborted(db: &SurrealDbClient, job_id: &str) -> Result<(), AppError> {
        if Job::is_aborted(db, job_id).await? {
            return Err(AppError::Cancelled);
        }
        Ok(())
    }

    /// Drives a capture through all eight stages, committing the resulting
    /// graph rows in one transaction. `job_id` is polled for an abort
    /// request before every stage.
    #[tracing::instrument(skip_all, fields(graph = %graph, content_id = %content.id, job_id = %job_id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        db: &SurrealDbClient,
        embedding: &dyn EmbeddingService,
        llm: &dyn LlmService,
        content: &RememberedContent,
        graph: String,
        reference_timestamp: DateTime<Utc>,
        source_id: &str,
        job_id: &str,
    ) -> Result<IngestionStats, AppError> {
        let mut ctx = PipelineContext::new(content, graph, reference_timestamp, db, &self.config, embedding, llm);
        let pipeline_started = Instant::now();

        Self::ensure_not_aborted(db, job_id).await?;
        let stage_start = Instant::now();
        let machine = stages::load_existing_entities(ready(), &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let load_existing_entities_ms = Self::duration_millis(stage_start.elapsed());

        Self::ensure_not_aborted(db, job_id).await?;
        let stage_start = Instant::now();
        let machine = stages::extract_entities(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let extract_entities_ms = Self::duration_millis(stage_start.elapsed());

        Self::ensure_not_aborted(db, job_id).await?;
        let stage_start = Instant::now();
        let machine = stages::resolve_entities(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let resolve_entities_ms = Self::duration_millis(stage_start.elapsed());

        Self::ensure_not_aborted(db, job_id).await?;
        let stage_start = Instant::now();
        let machine = stages::extract_facts(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let extract_facts_ms = Self::duration_millis(stage_start.elapsed());

        Self::ensure_not_aborted(db, job_id).await?;
        let stage_start = Instant::now();
        let machine = stages::load_existing_facts(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let load_existing_facts_ms = Self::duration_millis(stage_start.elapsed());

        Self::ensure_not_aborted(db, job_id).await?;
        let stage_start = Instant::now();
        let machine = stages::resolve_facts(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let resolve_facts_ms = Self::duration_millis(stage_start.elapsed());

        Self::ensure_not_aborted(db, job_id).await?;
        let stage_start = Instant::now();
        let machine = stages::extract_temporal(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let extract_temporal_ms = Self::duration_millis(stage_start.elapsed());

        Self::ensure_not_aborted(db, job_id).await?;
        let stage_start = Instant::now();
        let entities_created = ctx.new_entities().len();
        let relations_created = ctx.new_facts().len();
        let _machine = stages::commit(machine, &ctx, source_id)
            .await
            .map_err(|err| ctx.abort(err))?;
        let commit_ms = Self::duration_millis(stage_start.elapsed());

        info!(
            total_ms = Self::duration_millis(pipeline_started.elapsed()),
            load_existing_entities_ms,
            extract_entities_ms,
            resolve_entities_ms,
            extract_facts_ms,
            load_existing_facts_ms,
            resolve_facts_ms,
            extract_temporal_ms,
            commit_ms,
            entities_created,
            relations_created,
            "ingestion pipeline finished"
        );

        Ok(IngestionStats {
            entities_created,
            relations_created,
        })
    }
}
