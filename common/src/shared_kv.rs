use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::configuration::Configuration};

const SUBSCRIBER_BUFFER: usize = 64;

/// A single mutation to a shared key, broadcast to every subscribed context.
/// Last-writer-wins is enforced by comparing `ts`, not by the store
/// detecting write order, since writers may live in different processes.
#[derive(Debug, Clone)]
pub struct StorageChanged {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub ts: DateTime<Utc>,
}

/// Fan-out hook invoked on every mutation so other contexts converge over
/// the transport layer (C1). `common` has no dependency on `transport`
/// (the reverse would be circular); the `transport`/`rpc` crates implement
/// this trait by wrapping `Transport::post` with a `STORAGE_CHANGED`
/// envelope.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, change: &StorageChanged);
}

/// Typed key-value store for small cross-context state (current model,
/// tour completion, and the like), generalizing the `configuration`/
/// `encryption` per-type row pattern to arbitrary string keys with explicit
/// subscription.
pub struct SharedKv {
    db: Arc<SurrealDbClient>,
    subscribers: RwLock<HashMap<String, broadcast::Sender<StorageChanged>>>,
    notifier: Option<Arc<dyn ChangeNotifier>>,
}

impl SharedKv {
    pub fn new(db: Arc<SurrealDbClient>, notifier: Option<Arc<dyn ChangeNotifier>>) -> Self {
        Self {
            db,
            subscribers: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, AppError> {
        Ok(Configuration::get(&self.db, key).await?.map(|c| c.value))
    }

    /// Sets `key` to `value`, returns the previous value if any, and
    /// broadcasts `STORAGE_CHANGED` to in-process subscribers and (if a
    /// notifier is configured) every other context over the transport.
    pub async fn set(&self, key: &str, value: Value) -> Result<Option<Value>, AppError> {
        let old_value = Configuration::set(&self.db, key, value.clone()).await?;
        let change = StorageChanged {
            key: key.to_string(),
            old_value,
            new_value: Some(value),
            ts: Utc::now(),
        };
        self.publish(change).await;
        Ok(Configuration::get(&self.db, key).await?.map(|c| c.value))
    }

    pub async fn remove(&self, key: &str) -> Result<Option<Value>, AppError> {
        let previous = self.get(key).await?;
        self.db.delete_item::<Configuration>(key).await.map_err(AppError::Database)?;

        if let Some(old_value) = previous.clone() {
            self.publish(StorageChanged {
                key: key.to_string(),
                old_value: Some(old_value),
                new_value: None,
                ts: Utc::now(),
            })
            .await;
        }
        Ok(previous)
    }

    /// Subscribes to changes for `key`. Returned receiver only observes
    /// mutations made after subscription.
    pub async fn subscribe(&self, key: &str) -> broadcast::Receiver<StorageChanged> {
        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry(key.to_string())
            .or_insert_with(|| broadcast::Sender::new(SUBSCRIBER_BUFFER))
            .subscribe()
    }

    async fn publish(&self, change: StorageChanged) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(&change);
        }

        let subscribers = self.subscribers.read().await;
        if let Some(sender) = subscribers.get(&change.key) {
            let _ = sender.send(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingNotifier {
        seen: Mutex<Vec<StorageChanged>>,
    }

    impl ChangeNotifier for RecordingNotifier {
        fn notify(&self, change: &StorageChanged) {
            self.seen.lock().expect("lock poisoned").push(change.clone());
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips_and_notifies() {
        let db = Arc::new(
            SurrealDbClient::memory("shared_kv_ns", &uuid::Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        let notifier = Arc::new(RecordingNotifier {
            seen: Mutex::new(Vec::new()),
        });
        let kv = SharedKv::new(db, Some(notifier.clone()));

        let previous = kv
            .set("current_model", serde_json::json!("gpt-4o"))
            .await
            .expect("set");
        assert_eq!(previous, None);

        let value = kv.get("current_model").await.expect("get").expect("present");
        assert_eq!(value, serde_json::json!("gpt-4o"));
        assert_eq!(notifier.seen.lock().expect("lock poisoned").len(), 1);
    }

    #[tokio::test]
    async fn subscribers_only_see_changes_after_subscribing() {
        let db = Arc::new(
            SurrealDbClient::memory("shared_kv_ns2", &uuid::Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        let kv = SharedKv::new(db, None);

        kv.set("tour_complete", serde_json::json!(false))
            .await
            .expect("initial set");

        let mut rx = kv.subscribe("tour_complete").await;
        kv.set("tour_complete", serde_json::json!(true))
            .await
            .expect("second set");

        let change = rx.recv().await.expect("change delivered");
        assert_eq!(change.new_value, Some(serde_json::json!(true)));
        assert_eq!(change.old_value, Some(serde_json::json!(false)));
    }

    #[tokio::test]
    async fn remove_returns_previous_value() {
        let db = Arc::new(
            SurrealDbClient::memory("shared_kv_ns3", &uuid::Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        let kv = SharedKv::new(db, None);

        kv.set("ephemeral", serde_json::json!(1)).await.expect("set");
        let removed = kv.remove("ephemeral").await.expect("remove");
        assert_eq!(removed, Some(serde_json::json!(1)));
        assert_eq!(kv.get("ephemeral").await.expect("get"), None);
    }
}
