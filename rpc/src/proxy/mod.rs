//! Data-plane proxy (C3): the client-side handle a proxy-mode context uses
//! in place of a direct `SurrealDbClient`. Every call round-trips a
//! `Request`/`Response` pair over the transport, correlated by id.

use std::collections::HashMap;
use std::sync::Arc;

use common::error::AppError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{instrument, warn};
use transport::{Envelope, Transport};

use crate::{IdGenerator, Op, Request, Response, RowMode, DEFAULT_TIMEOUT};

type PendingMap = Arc<Mutex<HashMap<u32, oneshot::Sender<Response>>>>;

/// Result shape for `DbProxy::query`, mirroring the host's `{rows, rowCount}`
/// response body.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
    pub rows: Vec<T>,
    pub row_count: usize,
}

pub struct DbProxy {
    transport: Arc<Transport>,
    ids: IdGenerator,
    pending: PendingMap,
    pump: tokio::task::JoinHandle<()>,
}

impl DbProxy {
    pub fn new(transport: Arc<Transport>) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pump = tokio::spawn(Self::pump_responses(transport.clone(), pending.clone()));
        Self {
            transport,
            ids: IdGenerator::default(),
            pending,
            pump,
        }
    }

    /// Background task resolving pending requests as responses arrive. Runs
    /// for the lifetime of the proxy; dropped (and its pending map orphaned)
    /// when `close` or `Drop` tears the proxy down.
    async fn pump_responses(transport: Arc<Transport>, pending: PendingMap) {
        let mut inbound = transport.subscribe();
        loop {
            let envelope = match inbound.recv().await {
                Ok(envelope) => envelope,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "rpc proxy dropped lagging inbound messages");
                    continue;
                }
            };

            let Ok(response) = serde_json::from_value::<Response>(envelope.payload) else {
                continue;
            };

            if let Some(sender) = pending.lock().await.remove(&response.id) {
                let _ = sender.send(response);
            }
        }
    }

    #[instrument(skip(self, op))]
    async fn call(&self, op: Op) -> Result<Value, AppError> {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = Request { id, op };
        let payload = serde_json::to_value(&request).map_err(|e| AppError::InternalError(e.to_string()))?;
        if let Err(err) = self.transport.post(Envelope::new(payload)).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(DEFAULT_TIMEOUT, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(AppError::RpcTimeout),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AppError::RpcTimeout)
            }
        }
    }

    pub async fn query<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: Option<Value>,
        row_mode: RowMode,
    ) -> Result<QueryResult<T>, AppError> {
        let data = self
            .call(Op::Query {
                sql: sql.to_string(),
                params: params.unwrap_or_else(|| Value::Object(Default::default())),
                row_mode,
            })
            .await?;

        let row_count = data
            .get("row_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let rows_value = data.get("rows").cloned().unwrap_or(Value::Array(Vec::new()));
        let rows: Vec<T> = serde_json::from_value(rows_value)
            .map_err(|e| AppError::InternalError(e.to_string()))?;

        Ok(QueryResult { rows, row_count })
    }

    pub async fn exec(&self, sql: &str) -> Result<(), AppError> {
        self.call(Op::Exec { sql: sql.to_string() }).await?;
        Ok(())
    }

    /// Issues `BEGIN`, runs `f` with this proxy, then `COMMIT` on success or
    /// `ROLLBACK` on failure. Rollback errors are swallowed: the original
    /// error from `f` is what the caller sees.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&Self) -> Fut,
        Fut: std::future::Future<Output = Result<T, AppError>>,
    {
        self.exec("BEGIN TRANSACTION;").await?;
        match f(self).await {
            Ok(value) => {
                self.exec("COMMIT TRANSACTION;").await?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.exec("CANCEL TRANSACTION;").await;
                Err(err)
            }
        }
    }

    /// Resolves once the host answers a health check, retrying until the
    /// transport itself gives up.
    pub async fn wait_ready(&self) -> Result<(), AppError> {
        self.call(Op::Health).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), AppError> {
        self.call(Op::Close).await?;
        self.pump.abort();
        Ok(())
    }
}

impl Drop for DbProxy {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::db::SurrealDbClient;
    use crate::RpcHost;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Deserialize)]
    struct CountRow {
        #[allow(dead_code)]
        count: Option<i64>,
    }

    async fn setup() -> (Arc<DbProxy>, tokio::task::JoinHandle<()>) {
        let db = Arc::new(
            SurrealDbClient::memory("rpc_proxy_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        db.apply_migrations().await.expect("migrations");

        let (host_transport, client_transport) = Transport::pair(16);
        let host = RpcHost::new(db, Arc::new(host_transport));
        let host_task = tokio::spawn(async move { host.run().await });

        let proxy = Arc::new(DbProxy::new(Arc::new(client_transport)));
        (proxy, host_task)
    }

    #[tokio::test]
    async fn wait_ready_succeeds_against_running_host() {
        let (proxy, host_task) = setup().await;
        proxy.wait_ready().await.expect("health check");
        host_task.abort();
    }

    #[tokio::test]
    async fn exec_then_query_round_trips_through_host() {
        let (proxy, host_task) = setup().await;
        proxy
            .exec("DEFINE TABLE IF NOT EXISTS widget SCHEMALESS;")
            .await
            .expect("define table");
        proxy
            .exec("CREATE widget:one SET name = 'gizmo';")
            .await
            .expect("create row");

        let result: QueryResult<CountRow> = proxy
            .query("SELECT count() AS count FROM widget GROUP ALL;", None, RowMode::Object)
            .await
            .expect("query");
        assert_eq!(result.rows.len(), 1);
        host_task.abort();
    }

    #[tokio::test]
    async fn transaction_commits_on_success() {
        let (proxy, host_task) = setup().await;
        proxy
            .exec("DEFINE TABLE IF NOT EXISTS widget SCHEMALESS;")
            .await
            .expect("define table");

        proxy
            .transaction(|p| async move {
                p.exec("CREATE widget:txn SET name = 'from-txn';").await
            })
            .await
            .expect("transaction");

        let result: QueryResult<CountRow> = proxy
            .query("SELECT count() AS count FROM widget WHERE id = widget:txn GROUP ALL;", None, RowMode::Object)
            .await
            .expect("query");
        assert_eq!(result.rows.len(), 1);
        host_task.abort();
    }
}
