use std::time::Duration;

use crate::batch::BatchLimits;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Process configuration, read from the environment at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub store_timeout: Duration,
    pub topic_raw_web: String,
    /// Unset disables search indexing
    pub topic_search: Option<String>,
    pub group: String,
    /// Bus partitions, also the detector shard count
    pub partitions: u32,
    pub session_end_timeout: Duration,
    pub tick_interval: Duration,
    pub commit_gap: Duration,
    pub project_expiration: Duration,
    pub metadata_retry_delay: Duration,
    pub batch: BatchLimits,
    pub consumer_poll_limit: u32,
    pub consumer_idle: Duration,
    pub stats_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let database_url = env
            .string("DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let partitions = env.number("REPLAY_PARTITIONS", 16u32)?;
        if partitions == 0 {
            return Err(ConfigError::Invalid {
                name: "REPLAY_PARTITIONS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url,
            db_max_connections: env.number("REPLAY_DB_MAX_CONNECTIONS", 20)?,
            store_timeout: env.millis("REPLAY_STORE_TIMEOUT_MS", 10_000)?,
            topic_raw_web: env
                .string("REPLAY_TOPIC_RAW_WEB")
                .unwrap_or_else(|| "raw".to_string()),
            topic_search: env.string("REPLAY_TOPIC_SEARCH"),
            group: env
                .string("REPLAY_GROUP")
                .unwrap_or_else(|| "replay-sink".to_string()),
            partitions,
            session_end_timeout: env.millis("REPLAY_SESSION_END_TIMEOUT_MS", 150_000)?,
            tick_interval: env.millis("REPLAY_TICK_INTERVAL_MS", 30_000)?,
            commit_gap: env.millis("REPLAY_COMMIT_GAP_MS", 360_000)?,
            project_expiration: env.millis("REPLAY_PROJECT_EXPIRATION_MS", 1_200_000)?,
            metadata_retry_delay: env.millis("REPLAY_METADATA_RETRY_DELAY_MS", 60_000)?,
            batch: BatchLimits {
                queue_limit: env.number("REPLAY_BATCH_QUEUE_LIMIT", 20)?,
                size_limit: env.number("REPLAY_BATCH_SIZE_LIMIT", 10_000_000)?,
                alert_after: env.number("REPLAY_BATCH_ALERT_AFTER", 3)?,
            },
            consumer_poll_limit: env.number("REPLAY_CONSUMER_POLL_LIMIT", 500)?,
            consumer_idle: env.millis("REPLAY_CONSUMER_IDLE_MS", 200)?,
            stats_interval: env.millis("REPLAY_STATS_INTERVAL_MS", 60_000)?,
            shutdown_timeout: env.millis("REPLAY_SHUTDOWN_TIMEOUT_MS", 30_000)?,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Empty values count as unset.
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn number<T: std::str::FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.string(name) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value }),
            None => Ok(default),
        }
    }

    fn millis(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.number(name, default).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = config_from(&[("DATABASE_URL", "postgres://localhost/replay")]).unwrap();
        assert_eq!(config.db_max_connections, 20);
        assert_eq!(config.topic_raw_web, "raw");
        assert_eq!(config.topic_search, None);
        assert_eq!(config.partitions, 16);
        assert_eq!(config.session_end_timeout, Duration::from_millis(150_000));
        assert_eq!(config.tick_interval, Duration::from_secs(30));
        assert_eq!(config.commit_gap, Duration::from_secs(360));
        assert_eq!(config.project_expiration, Duration::from_secs(1200));
        assert_eq!(config.metadata_retry_delay, Duration::from_secs(60));
        assert_eq!(config.batch.queue_limit, 20);
        assert_eq!(config.batch.size_limit, 10_000_000);
        assert_eq!(config.batch.alert_after, 3);
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let err = config_from(&[]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn unparsable_number_is_rejected() {
        let err = config_from(&[
            ("DATABASE_URL", "postgres://localhost/replay"),
            ("REPLAY_TICK_INTERVAL_MS", "soon"),
        ])
        .unwrap_err();
        match err {
            ConfigError::Invalid { name, value } => {
                assert_eq!(name, "REPLAY_TICK_INTERVAL_MS");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error variant: {:?}", other),
        }
    }

    #[test]
    fn zero_partitions_is_rejected() {
        let err = config_from(&[
            ("DATABASE_URL", "postgres://localhost/replay"),
            ("REPLAY_PARTITIONS", "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "REPLAY_PARTITIONS", .. }));
    }

    #[test]
    fn empty_search_topic_counts_as_unset() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/replay"),
            ("REPLAY_TOPIC_SEARCH", "  "),
        ])
        .unwrap();
        assert_eq!(config.topic_search, None);
    }
}
