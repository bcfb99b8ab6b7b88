//! Request/response correlation over the transport (C2) plus the
//! data-plane proxy (C3) in the `proxy` module. The host never trusts a
//! client to send SQL it hasn't already validated through `common`'s query
//! helpers — this layer only moves bytes and correlates replies.

pub mod proxy;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{error::AppError, storage::db::SurrealDbClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};
use transport::{Envelope, Transport};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowMode {
    Object,
    Array,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Query {
        sql: String,
        params: Value,
        row_mode: RowMode,
    },
    Exec {
        sql: String,
    },
    Health,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Ok { data: Value },
    Err { error: String },
}

/// Wire shape is `{ok: true, data}` / `{ok: false, error}` literally, via a
/// manual (de)serialization rather than an externally tagged enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl Response {
    pub fn new(id: u32, body: ResponseBody) -> Self {
        match body {
            ResponseBody::Ok { data } => Self {
                id,
                ok: true,
                data: Some(data),
                error: None,
            },
            ResponseBody::Err { error } => Self {
                id,
                ok: false,
                data: None,
                error: Some(error),
            },
        }
    }

    pub fn into_result(self) -> Result<Value, AppError> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(AppError::QueryError(
                self.error.unwrap_or_else(|| "unknown rpc error".to_string()),
            ))
        }
    }
}

/// Monotonically increasing 32-bit request id generator that wraps and
/// always skips 0 (0 is reserved as "no request").
#[derive(Default)]
pub struct IdGenerator(AtomicU32);

impl IdGenerator {
    pub fn next(&self) -> u32 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }
}

/// Host-side RPC dispatcher: executes `Request`s arriving over the
/// transport against a direct `SurrealDbClient` and posts back `Response`s
/// correlated by id. The host serializes RPCs per connection (one dispatch
/// loop per `Transport`), so statements between `BEGIN` and `COMMIT` on a
/// given connection never interleave with another connection's statements.
pub struct RpcHost {
    db: Arc<SurrealDbClient>,
    transport: Arc<Transport>,
}

impl RpcHost {
    pub fn new(db: Arc<SurrealDbClient>, transport: Arc<Transport>) -> Self {
        Self { db, transport }
    }

    /// Runs until the transport closes. Intended to run on a dedicated task
    /// per client connection.
    pub async fn run(&self) {
        let mut inbound = self.transport.subscribe();
        loop {
            let envelope = match inbound.recv().await {
                Ok(envelope) => envelope,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "rpc host dropped lagging inbound messages");
                    continue;
                }
            };

            let Ok(request) = serde_json::from_value::<Request>(envelope.payload) else {
                continue;
            };

            let response = self.dispatch(request).await;
            let payload = serde_json::to_value(response).unwrap_or(Value::Null);
            let _ = self.transport.post(Envelope::new(payload)).await;
        }
    }

    #[instrument(skip(self))]
    async fn dispatch(&self, request: Request) -> Response {
        let body = match self.execute(request.op).await {
            Ok(data) => ResponseBody::Ok { data },
            Err(err) => ResponseBody::Err {
                error: err.to_string(),
            },
        };
        Response::new(request.id, body)
    }

    async fn execute(&self, op: Op) -> Result<Value, AppError> {
        match op {
            Op::Query {
                sql,
                params,
                row_mode,
            } => self.run_query(&sql, params, row_mode).await,
            Op::Exec { sql } => {
                self.db
                    .client
                    .query(sql)
                    .await
                    .map_err(AppError::Database)?
                    .check()
                    .map_err(AppError::Database)?;
                Ok(Value::Null)
            }
            Op::Health => Ok(serde_json::json!({"status": "ok"})),
            Op::Close => Ok(Value::Null),
        }
    }

    async fn run_query(
        &self,
        sql: &str,
        params: Value,
        row_mode: RowMode,
    ) -> Result<Value, AppError> {
        let mut query = self.db.client.query(sql);
        if let Value::Object(map) = params {
            for (key, value) in map {
                query = query.bind((key, value));
            }
        }

        let mut result = query.await.map_err(AppError::Database)?;
        let rows: Vec<Value> = result.take(0).map_err(AppError::Database)?;

        let rows = match row_mode {
            RowMode::Object => rows,
            RowMode::Array => rows
                .into_iter()
                .map(|row| match row {
                    Value::Object(map) => Value::Array(map.into_values().collect()),
                    other => other,
                })
                .collect(),
        };

        let row_count = rows.len();
        Ok(serde_json::json!({ "rows": rows, "row_count": row_count }))
    }
}
