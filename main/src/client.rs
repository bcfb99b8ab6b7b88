//! Demo client process: never touches a database driver directly, only the
//! proxy (C3) over a transport (C1) to a host's RPC dispatcher (C2) — the
//! way a tab's content script would reach the extension's service worker.
//!
//! No separate `host` process is required to run this: it boots an
//! in-memory host registry internally, seeds a couple of nodes on the host
//! side, then wires `Transport::pair` between an `RpcHost` and a `DbProxy`
//! and reads those nodes back through the proxy to show the round trip
//! works end to end.

use std::sync::Arc;

use common::{registry::ServiceRegistry, storage::types::node::Node, utils::config::AppConfig};
use rpc::{
    proxy::{DbProxy, QueryResult},
    RowMode, RpcHost,
};
use tracing::info;
use transport::Transport;

fn demo_config() -> AppConfig {
    AppConfig {
        openai_api_key: "unused-in-demo".to_string(),
        surrealdb_address: "mem://".to_string(),
        surrealdb_username: String::new(),
        surrealdb_password: String::new(),
        surrealdb_namespace: "client_demo".to_string(),
        surrealdb_database: "client_demo".to_string(),
        data_dir: "./data".to_string(),
        openai_base_url: "https://api.openai.com/v1".to_string(),
        embedding_model: "text-embedding-3-small".to_string(),
        embedding_dimensions: 8,
        chat_model: "gpt-4o-mini".to_string(),
        rpc_timeout_secs: 30,
        rpc_retry_base_ms: 100,
        rpc_max_retries: 3,
        job_visibility_secs: 60,
        job_heartbeat_secs: 20,
        chunk_size: 5,
        chunk_max_concurrency: 2,
        entity_match_threshold: 0.85,
        fact_match_threshold: 0.90,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = demo_config();
    let registry = ServiceRegistry::host_for_test(&config).await?;
    registry
        .initialize(config.embedding_dimensions as usize)
        .await?;

    registry
        .db
        .store_item(Node::new(
            "demo-graph".to_string(),
            "organization".to_string(),
            "AlphaCorp".to_string(),
            None,
            serde_json::json!({}),
        ))
        .await?;
    registry
        .db
        .store_item(Node::new(
            "demo-graph".to_string(),
            "organization".to_string(),
            "BetaInc".to_string(),
            None,
            serde_json::json!({}),
        ))
        .await?;

    let (host_transport, client_transport) = Transport::pair(64);
    let rpc_host = Arc::new(RpcHost::new(registry.db.clone(), Arc::new(host_transport)));
    let rpc_task = tokio::spawn({
        let rpc_host = rpc_host.clone();
        async move { rpc_host.run().await }
    });

    let proxy = DbProxy::new(Arc::new(client_transport));
    proxy.wait_ready().await?;

    let result: QueryResult<Node> = proxy
        .query(
            "SELECT * FROM node WHERE graph = $graph ORDER BY name;",
            Some(serde_json::json!({"graph": "demo-graph"})),
            RowMode::Object,
        )
        .await?;
    for node in &result.rows {
        info!(name = %node.name, node_type = %node.node_type, "node read through the proxy");
    }

    proxy.close().await?;
    rpc_task.abort();
    Ok(())
}
