//! Background job queue: wraps `common::storage::types::job::Job`'s
//! claim/lease primitives with a handler registry and a worker loop,
//! fanning `NEW_JOB`/`JOB_UPDATED`/`JOB_COMPLETED` events out over the
//! transport layer so every connected context (a proxy's UI, say) observes
//! progress without polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::job::{Job, JobStatus, JobType},
    },
    utils::services::{EmbeddingService, LlmService},
};
use tracing::{info, instrument, warn};
use transport::{Envelope, Transport};

/// Services a job handler needs, assembled once at bootstrap and passed by
/// reference into every `process` call rather than reached for through an
/// ambient global.
pub struct JobDeps {
    pub db: Arc<SurrealDbClient>,
    pub embedding: Arc<dyn EmbeddingService>,
    pub llm: Arc<dyn LlmService>,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;
    async fn process(&self, job: &Job, deps: &JobDeps) -> Result<serde_json::Value, AppError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type().as_str(), handler);
    }

    fn get(&self, job_type: JobType) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(job_type.as_str())
    }

    fn job_types(&self) -> Vec<JobType> {
        self.handlers
            .values()
            .map(|handler| handler.job_type())
            .collect()
    }
}

fn event(kind: &str, job: &Job) -> Envelope {
    Envelope::new(serde_json::json!({
        "type": kind,
        "job_id": job.id,
        "job_type": job.job_type.as_str(),
        "status": job.status,
        "progress": job.progress,
    }))
}

pub struct JobQueue {
    db: Arc<SurrealDbClient>,
    transport: Arc<Transport>,
    deps: Arc<JobDeps>,
    registry: Arc<HandlerRegistry>,
}

impl JobQueue {
    pub fn new(
        db: Arc<SurrealDbClient>,
        transport: Arc<Transport>,
        deps: Arc<JobDeps>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            db,
            transport,
            deps,
            registry,
        }
    }

    #[instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Job, AppError> {
        let job = Job::new(job_type, payload);
        self.db
            .store_item(job.clone())
            .await
            .map_err(AppError::Database)?;
        let _ = self.transport.post(event("NEW_JOB", &job)).await;
        Ok(job)
    }

    pub async fn abort(&self, job_id: &str) -> Result<(), AppError> {
        Job::mark_aborted(&self.db, job_id).await?;
        if let Some(job) = self.get(job_id).await? {
            let _ = self.transport.post(event("JOB_UPDATED", &job)).await;
        }
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, AppError> {
        self.db.get_item::<Job>(job_id).await.map_err(AppError::Database)
    }

    /// Claims and processes ready jobs in a loop until `shutdown` resolves.
    /// Never returns `Ok` on its own; intended to run on a dedicated task.
    pub async fn run_worker_loop(
        &self,
        worker_id: &str,
        poll_interval: StdDuration,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) {
        let job_types = self.registry.job_types();
        loop {
            if shutdown.try_recv().is_ok() {
                info!(worker_id, "worker loop shutting down");
                return;
            }

            match Job::claim_next_ready(&self.db, &job_types, worker_id).await {
                Ok(Some(job)) => self.run_one(job).await,
                Ok(None) => tokio::time::sleep(poll_interval).await,
                Err(err) => {
                    warn!(error = ?err, "failed to claim next job");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    async fn run_one(&self, mut job: Job) {
        let Some(handler) = self.registry.get(job.job_type).cloned() else {
            warn!(job_type = job.job_type.as_str(), "no handler registered for job type");
            let _ = Job::mark_dead_letter(&self.db, &job.id, "no handler registered").await;
            return;
        };

        let _ = Job::mark_processing(&self.db, &job.id).await;
        job.status = JobStatus::Processing;
        let _ = self.transport.post(event("JOB_UPDATED", &job)).await;

        match handler.process(&job, &self.deps).await {
            Ok(result) => {
                let _ = Job::mark_succeeded(&self.db, &job.id, result).await;
                if let Ok(Some(updated)) = self.get(&job.id).await {
                    let _ = self.transport.post(event("JOB_COMPLETED", &updated)).await;
                }
            }
            Err(err) => self.handle_failure(&job, &err).await,
        }
    }

    /// Every handler error is terminal: `processing` has no edge back to
    /// `pending`, only to `completed`, `failed`, or `aborted`.
    async fn handle_failure(&self, job: &Job, err: &AppError) {
        warn!(job_id = job.id, error = ?err, "job handler failed");

        let _ = Job::mark_dead_letter(&self.db, &job.id, &err.to_string()).await;

        if let Ok(Some(updated)) = self.get(&job.id).await {
            let _ = self.transport.post(event("JOB_UPDATED", &updated)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::services::{ChatMessage, EmbeddingService, LlmService};
    use uuid::Uuid;

    struct NoopEmbedding;
    #[async_trait]
    impl EmbeddingService for NoopEmbedding {
        async fn text_to_vector(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Ok(vec![0.0])
        }
        async fn texts_to_vectors(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(vec![])
        }
        async fn initialize(&self) -> Result<(), AppError> {
            Ok(())
        }
        fn is_ready(&self) -> bool {
            true
        }
        fn dimensions(&self) -> u32 {
            1
        }
    }

    struct NoopLlm;
    #[async_trait]
    impl LlmService for NoopLlm {
        async fn chat_completions(&self, _messages: Vec<ChatMessage>) -> Result<String, AppError> {
            Ok(String::new())
        }
        async fn serve_for(&self, _s: &str, _m: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn unload_for(&self, _s: &str) -> Result<(), AppError> {
            Ok(())
        }
        fn models(&self) -> Vec<String> {
            vec![]
        }
        async fn set_current_model(&self, _m: &str) -> Result<(), AppError> {
            Ok(())
        }
        fn on_current_model_change(&self) -> tokio::sync::watch::Receiver<String> {
            tokio::sync::watch::channel(String::new()).1
        }
    }

    struct EchoHandler;
    #[async_trait]
    impl JobHandler for EchoHandler {
        fn job_type(&self) -> JobType {
            JobType::Chat
        }
        async fn process(&self, job: &Job, _deps: &JobDeps) -> Result<serde_json::Value, AppError> {
            Ok(job.payload.clone())
        }
    }

    struct AlwaysFailsHandler;
    #[async_trait]
    impl JobHandler for AlwaysFailsHandler {
        fn job_type(&self) -> JobType {
            JobType::RememberSave
        }
        async fn process(&self, _job: &Job, _deps: &JobDeps) -> Result<serde_json::Value, AppError> {
            Err(AppError::ModelUnavailable("down".to_string()))
        }
    }

    async fn setup() -> (JobQueue, Arc<SurrealDbClient>) {
        let db = Arc::new(
            SurrealDbClient::memory("jobqueue_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        let (t1, _t2) = Transport::pair(8);
        let deps = Arc::new(JobDeps {
            db: db.clone(),
            embedding: Arc::new(NoopEmbedding),
            llm: Arc::new(NoopLlm),
        });
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(EchoHandler));
        registry.register(Arc::new(AlwaysFailsHandler));

        let queue = JobQueue::new(db.clone(), Arc::new(t1), deps, Arc::new(registry));
        (queue, db)
    }

    #[tokio::test]
    async fn enqueue_then_worker_loop_completes_job() {
        let (queue, _db) = setup().await;
        let job = queue
            .enqueue(JobType::Chat, serde_json::json!({"echo": true}))
            .await
            .expect("enqueue");

        let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let claimed = common::storage::types::job::Job::claim_next_ready(
            &queue.db,
            &[JobType::Chat],
            "worker-1",
        )
        .await
        .expect("claim")
        .expect("job available");
        drop(shutdown_rx);

        queue.run_one(claimed).await;

        let updated = queue.get(&job.id).await.expect("get").expect("present");
        assert_eq!(updated.status, JobStatus::Completed);
        assert_eq!(updated.result, Some(serde_json::json!({"echo": true})));
    }

    #[tokio::test]
    async fn failed_job_is_immediately_terminal() {
        let (queue, _db) = setup().await;
        let job = queue
            .enqueue(JobType::RememberSave, serde_json::json!({}))
            .await
            .expect("enqueue");

        let claimed = common::storage::types::job::Job::claim_next_ready(
            &queue.db,
            &[JobType::RememberSave],
            "worker-1",
        )
        .await
        .expect("claim")
        .expect("job available");
        queue.run_one(claimed).await;

        let updated = queue.get(&job.id).await.expect("get").expect("present");
        assert_eq!(updated.status, JobStatus::Failed);
        assert_eq!(updated.attempts, 1);
    }
}
