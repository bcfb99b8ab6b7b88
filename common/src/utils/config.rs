use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    768
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_rpc_retry_base_ms() -> u64 {
    100
}

fn default_rpc_max_retries() -> u32 {
    3
}

fn default_job_visibility_secs() -> i64 {
    60
}

fn default_job_heartbeat_secs() -> i64 {
    20
}

fn default_chunk_size() -> usize {
    5
}

fn default_chunk_max_concurrency() -> usize {
    2
}

fn default_entity_match_threshold() -> f32 {
    0.85
}

fn default_fact_match_threshold() -> f32 {
    0.90
}

/// Process-wide configuration, layered from `Config.toml` (if present) over
/// built-in defaults, then overridden by `MEMORALL_*` environment variables.
/// Every tunable carries a sensible built-in default so a bare deployment
/// needs no configuration file at all.
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_rpc_retry_base_ms")]
    pub rpc_retry_base_ms: u64,
    #[serde(default = "default_rpc_max_retries")]
    pub rpc_max_retries: u32,

    #[serde(default = "default_job_visibility_secs")]
    pub job_visibility_secs: i64,
    #[serde(default = "default_job_heartbeat_secs")]
    pub job_heartbeat_secs: i64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_max_concurrency")]
    pub chunk_max_concurrency: usize,
    #[serde(default = "default_entity_match_threshold")]
    pub entity_match_threshold: f32,
    #[serde(default = "default_fact_match_threshold")]
    pub fact_match_threshold: f32,
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("Config").required(false))
        .add_source(Environment::with_prefix("MEMORALL").separator("__"))
        .build()?;

    config.try_deserialize()
}
