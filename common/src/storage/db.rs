use crate::error::AppError;

use super::types::StoredObject;
use futures::Stream;
use std::{ops::Deref, sync::Arc};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Notification, Surreal,
};
use tracing::{debug, info};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

/// A single forward schema step, applied transactionally and recorded in
/// `schema_migration` so re-running `apply_migrations` is a no-op. Mirrors
/// §4.4's migration contract: up-only here since nothing in this crate ever
/// needs to roll one back programmatically.
struct Migration {
    name: &'static str,
    up: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    name: "0001_define_tables",
    up: "DEFINE TABLE remembered_content SCHEMALESS;
         DEFINE TABLE topic SCHEMALESS;
         DEFINE TABLE source SCHEMALESS;
         DEFINE TABLE node SCHEMALESS;
         DEFINE TABLE edge SCHEMALESS;
         DEFINE TABLE source_node SCHEMALESS;
         DEFINE TABLE source_edge SCHEMALESS;
         DEFINE TABLE conversation SCHEMALESS;
         DEFINE TABLE message SCHEMALESS;
         DEFINE TABLE job SCHEMALESS;
         DEFINE TABLE configuration SCHEMALESS;
         DEFINE TABLE encryption SCHEMALESS;",
}];

impl SurrealDbClient {
    /// Connects to `address`, authenticates as root, and selects the given
    /// namespace/database. Used by the host process; a proxy process never
    /// opens its own connection (see the data-plane proxy).
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Runs schema migrations and builds runtime indexes. Called once at
    /// host startup, never by a proxy.
    pub async fn ensure_initialized(&self, embedding_dimension: usize) -> Result<(), AppError> {
        self.apply_migrations().await?;
        super::indexes::ensure_runtime_indexes(self, embedding_dimension).await?;
        Ok(())
    }

    /// Applies every migration in `MIGRATIONS` not yet recorded in
    /// `schema_migration`, each inside its own transaction, in filename
    /// order. Safe to call on every host start.
    pub async fn apply_migrations(&self) -> Result<(), AppError> {
        self.client
            .query("DEFINE TABLE IF NOT EXISTS schema_migration SCHEMALESS;")
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        for migration in MIGRATIONS {
            let mut existing = self
                .client
                .query("SELECT name FROM type::thing('schema_migration', $name)")
                .bind(("name", migration.name.to_owned()))
                .await
                .map_err(AppError::Database)?;
            let rows: Vec<serde_json::Value> = existing.take(0).map_err(AppError::Database)?;
            if !rows.is_empty() {
                debug!(migration = migration.name, "migration already applied");
                continue;
            }

            let statement = format!(
                "BEGIN TRANSACTION;\n{}\nCREATE type::thing('schema_migration', $name);\nCOMMIT TRANSACTION;",
                migration.up
            );
            self.client
                .query(statement)
                .bind(("name", migration.name.to_owned()))
                .await
                .map_err(AppError::Database)?
                .check()
                .map_err(|err| AppError::SchemaMigrationFailed(err.to_string()))?;

            info!(migration = migration.name, "applied migration");
        }

        Ok(())
    }

    pub async fn rebuild_indexes(&self) -> Result<(), AppError> {
        super::indexes::rebuild_indexes(self).await
    }

    pub async fn drop_table<T>(&self) -> Result<Vec<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.delete(T::table_name()).await
    }

    /// Stores an object, requires the struct to implement `StoredObject`.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    /// Live-query a table for change notifications, requires the struct to
    /// implement `StoredObject`.
    pub async fn listen<T>(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification<T>, Error>>, Error>
    where
        T: for<'de> StoredObject + std::marker::Unpin,
    {
        self.client.select(T::table_name()).live().await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use uuid::Uuid;

    stored_object!(Dummy, "dummy", {
        name: String
    });

    #[tokio::test]
    async fn test_initialization_and_crud() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized(768)
            .await
            .expect("Failed to initialize schema");

        let dummy = Dummy {
            id: "abc".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db.store_item(dummy.clone()).await.expect("Failed to store");
        assert!(stored.is_some());

        let fetched = db
            .get_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched, Some(dummy.clone()));

        let all = db
            .get_all_stored_items::<Dummy>()
            .await
            .expect("Failed to fetch all");
        assert!(all.contains(&dummy));

        let deleted = db
            .delete_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, Some(dummy));

        let fetch_post = db
            .get_item::<Dummy>("abc")
            .await
            .expect("Failed fetch post delete");
        assert!(fetch_post.is_none());
    }

    #[tokio::test]
    async fn apply_migrations_is_idempotent() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.apply_migrations().await.expect("first pass");
        db.apply_migrations().await.expect("second pass is a no-op");
    }

    #[tokio::test]
    async fn test_build_indexes() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        super::super::indexes::ensure_runtime_indexes(&db, 768)
            .await
            .expect("Failed to build indexes");
    }
}
