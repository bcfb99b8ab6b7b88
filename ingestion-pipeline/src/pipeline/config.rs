use common::utils::config::AppConfig;

/// Tunables for the eight-stage pipeline, sourced from `AppConfig` at
/// construction time rather than re-read per job.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    pub entity_match_threshold: f32,
    pub fact_match_threshold: f32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_backoff_cap_exponent: u32,
    pub existing_entity_candidates: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            max_concurrency: 2,
            entity_match_threshold: 0.85,
            fact_match_threshold: 0.90,
            retry_base_delay_secs: 1,
            retry_max_delay_secs: 30,
            retry_backoff_cap_exponent: 5,
            existing_entity_candidates: 20,
        }
    }
}

impl From<&AppConfig> for IngestionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_concurrency: config.chunk_max_concurrency,
            entity_match_threshold: config.entity_match_threshold,
            fact_match_threshold: config.fact_match_threshold,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = IngestionConfig::default();
        assert_eq!(config.chunk_size, 5);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.entity_match_threshold, 0.85);
        assert_eq!(config.fact_match_threshold, 0.90);
    }
}
