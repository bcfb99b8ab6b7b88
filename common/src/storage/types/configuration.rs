use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Configuration, "configuration", {
    key: String,
    value: serde_json::Value
});

impl Configuration {
    pub fn new(key: String, value: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: key.clone(),
            created_at: now,
            updated_at: now,
            key,
            value,
        }
    }

    pub async fn get(db: &SurrealDbClient, key: &str) -> Result<Option<Self>, AppError> {
        db.get_item(key).await.map_err(AppError::Database)
    }

    /// Upsert keyed by `key`; returns the previous value if any, for
    /// last-writer-wins change broadcast.
    pub async fn set(
        db: &SurrealDbClient,
        key: &str,
        value: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let previous = Self::get(db, key).await?.map(|c| c.value);
        let now = Utc::now();
        db.client
            .query(
                "UPSERT type::thing('configuration', $key) SET key = $key, value = $value, \
                 created_at = IF created_at != NONE THEN created_at ELSE $now END, updated_at = $now",
            )
            .bind(("key", key.to_owned()))
            .bind(("value", value))
            .bind(("now", surrealdb::Datetime::from(now)))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        Ok(previous)
    }
}
