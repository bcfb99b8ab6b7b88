use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// What kind of row a `source` points at. Today only captures are ingested,
/// but the discriminator keeps the join honest if that changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    RememberedContent,
}

stored_object!(Source, "source", {
    target_type: TargetType,
    target_id: String,
    status: SourceStatus,
    status_valid_from: DateTime<Utc>
});

impl Source {
    pub fn new(target_type: TargetType, target_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            target_type,
            target_id,
            status: SourceStatus::Pending,
            status_valid_from: now,
        }
    }

    pub fn transition(&mut self, status: SourceStatus) {
        self.status = status;
        self.status_valid_from = Utc::now();
        self.updated_at = self.status_valid_from;
    }

    async fn set_status(db: &SurrealDbClient, id: &str, status: SourceStatus) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing('source', $id) SET status = $status, status_valid_from = time::now(), updated_at = time::now()")
            .bind(("id", id.to_owned()))
            .bind(("status", status))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn mark_processing(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        Self::set_status(db, id, SourceStatus::Processing).await
    }

    /// Commit sets a completed source's status itself, inside its own
    /// transaction; this is for the failure path only.
    pub async fn mark_failed(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        Self::set_status(db, id, SourceStatus::Failed).await
    }
}
