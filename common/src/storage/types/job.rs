use chrono::Duration;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const DEFAULT_VISIBILITY_SECS: i64 = 60;
pub const DEFAULT_HEARTBEAT_SECS: i64 = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Processing,
    Completed,
    Failed,
    Aborted,
}

/// Stable job-type identifiers, the observable contract handlers register
/// against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    RememberSave,
    ConvertToKg,
    Chat,
    RestoreLocalServices,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::RememberSave => "remember-save",
            JobType::ConvertToKg => "convert-to-kg",
            JobType::Chat => "chat",
            JobType::RestoreLocalServices => "restore-local-services",
        }
    }
}

stored_object!(Job, "job", {
    job_type: JobType,
    payload: serde_json::Value,
    status: JobStatus,
    progress: u8,
    result: Option<serde_json::Value>,
    error: Option<String>,
    visibility_deadline: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    attempts: u32
});

impl Job {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            job_type,
            payload,
            status: JobStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            visibility_deadline: None,
            worker_id: None,
            attempts: 0,
        }
    }

    /// Atomically claims the oldest `pending` row (or one whose visibility
    /// deadline has lapsed without completing — at-least-once reclaim), for
    /// any job type in `job_types`. Only one caller wins the update.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        job_types: &[JobType],
        worker_id: &str,
    ) -> Result<Option<Job>, AppError> {
        let now = Utc::now();
        let candidates: Vec<&'static str> = job_types.iter().map(|t| t.as_str()).collect();

        let mut response = db
            .client
            .query(
                "SELECT * FROM job \
                 WHERE job_type IN $types \
                   AND (status = 'pending' \
                        OR (status IN ['claimed', 'processing'] AND visibility_deadline < $now)) \
                 ORDER BY created_at ASC LIMIT 1",
            )
            .bind(("types", candidates))
            .bind(("now", surrealdb::Datetime::from(now)))
            .await
            .map_err(AppError::Database)?;
        let rows: Vec<Job> = response.take(0).map_err(AppError::Database)?;
        let Some(candidate) = rows.into_iter().next() else {
            return Ok(None);
        };

        let deadline = now + Duration::seconds(DEFAULT_VISIBILITY_SECS);
        let mut claimed: Vec<Job> = db
            .client
            .query(
                "UPDATE type::thing('job', $id) SET \
                   status = 'claimed', worker_id = $worker_id, \
                   visibility_deadline = $deadline, attempts = attempts + 1, \
                   updated_at = $now \
                 WHERE status = $expected_status",
            )
            .bind(("id", candidate.id.clone()))
            .bind(("worker_id", worker_id.to_owned()))
            .bind(("deadline", surrealdb::Datetime::from(deadline)))
            .bind(("now", surrealdb::Datetime::from(now)))
            .bind(("expected_status", candidate.status))
            .await
            .map_err(AppError::Database)?
            .take(0)
            .map_err(AppError::Database)?;

        Ok(claimed.pop())
    }

    pub async fn mark_processing(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing('job', $id) SET status = 'processing', updated_at = time::now()")
            .bind(("id", id.to_owned()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn heartbeat(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        let deadline = Utc::now() + Duration::seconds(DEFAULT_VISIBILITY_SECS);
        db.client
            .query("UPDATE type::thing('job', $id) SET visibility_deadline = $deadline, updated_at = time::now()")
            .bind(("id", id.to_owned()))
            .bind(("deadline", surrealdb::Datetime::from(deadline)))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn progress(
        db: &SurrealDbClient,
        id: &str,
        percent: u8,
        result: Option<serde_json::Value>,
    ) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing('job', $id) SET progress = $progress, result = $result, updated_at = time::now()")
            .bind(("id", id.to_owned()))
            .bind(("progress", percent.min(100)))
            .bind(("result", result))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn mark_succeeded(
        db: &SurrealDbClient,
        id: &str,
        result: serde_json::Value,
    ) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing('job', $id) SET status = 'completed', progress = 100, result = $result, updated_at = time::now()")
            .bind(("id", id.to_owned()))
            .bind(("result", result))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        Ok(())
    }

    /// Polled by a running handler between stages to notice an abort
    /// requested while it was mid-flight.
    pub async fn is_aborted(db: &SurrealDbClient, id: &str) -> Result<bool, AppError> {
        let job: Option<Job> = db.get_item(id).await.map_err(AppError::Database)?;
        Ok(job.is_none_or(|job| job.status == JobStatus::Aborted))
    }

    pub async fn mark_dead_letter(
        db: &SurrealDbClient,
        id: &str,
        error: &str,
    ) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing('job', $id) SET status = 'failed', error = $error, updated_at = time::now()")
            .bind(("id", id.to_owned()))
            .bind(("error", error.to_owned()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn mark_aborted(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('job', $id) SET status = 'aborted', updated_at = time::now() \
                 WHERE status IN ['pending', 'claimed', 'processing']",
            )
            .bind(("id", id.to_owned()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_as_str_matches_wire_format() {
        assert_eq!(JobType::RememberSave.as_str(), "remember-save");
        assert_eq!(JobType::ConvertToKg.as_str(), "convert-to-kg");
        assert_eq!(JobType::Chat.as_str(), "chat");
        assert_eq!(
            JobType::RestoreLocalServices.as_str(),
            "restore-local-services"
        );
    }

    #[test]
    fn new_job_starts_pending_with_zero_attempts() {
        let job = Job::new(JobType::RememberSave, serde_json::json!({}));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn claim_next_ready_picks_oldest_matching_pending_job() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let job = Job::new(JobType::RememberSave, serde_json::json!({"a": 1}));
        db.store_item(job.clone()).await.expect("store job");

        let claimed = Job::claim_next_ready(&db, &[JobType::RememberSave], "worker-1")
            .await
            .expect("claim")
            .expect("a job was claimed");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Claimed);
        assert_eq!(claimed.attempts, 1);

        let second = Job::claim_next_ready(&db, &[JobType::RememberSave], "worker-2")
            .await
            .expect("claim");
        assert!(second.is_none(), "only one worker should claim the job");
    }
}
