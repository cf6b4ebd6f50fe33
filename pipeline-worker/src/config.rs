use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use pipeline_common::config::{default_event_priorities, PipelineConfig};
use pipeline_common::event::Priority;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "PROCESSING_TIME_TARGET_MS", default = "500")]
    pub processing_time_target: EnvMsDuration,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "10000")]
    pub max_queue_size: usize,

    #[envconfig(from = "BATCH_INTERVAL_MS", default = "100")]
    pub batch_interval: EnvMsDuration,

    #[envconfig(from = "CLEANUP_INTERVAL_MS", default = "1000")]
    pub cleanup_interval: EnvMsDuration,

    #[envconfig(from = "METRICS_INTERVAL_MS", default = "5000")]
    pub metrics_interval: EnvMsDuration,

    #[envconfig(default = "10")]
    pub concurrency: usize,

    #[envconfig(default = "10")]
    pub immediate_threshold: usize,

    #[envconfig(default = "medium")]
    pub idle_bypass_min_priority: Priority,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "1000")]
    pub dead_letter_capacity: usize,

    #[envconfig(from = "DEAD_LETTER_RETENTION_MS", default = "3600000")]
    pub dead_letter_retention: EnvMsDuration,

    #[envconfig(from = "DEDUPLICATION_WINDOW_MS", default = "5000")]
    pub deduplication_window: EnvMsDuration,

    #[envconfig(default = "true")]
    pub enable_deduplication: bool,

    #[envconfig(default = "false")]
    pub shared_deduplication: bool,

    #[envconfig(from = "CLOCK_SKEW_TOLERANCE_MS", default = "300000")]
    pub clock_skew_tolerance: EnvMsDuration,

    #[envconfig(default = "100")]
    pub stage_history_size: usize,

    /// Overrides merged over the built-in event type table, as `type=priority,...`.
    pub event_type_priorities: Option<PriorityTable>,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut event_type_priorities = default_event_priorities();
        if let Some(overrides) = &self.event_type_priorities {
            event_type_priorities.extend(overrides.0.clone());
        }

        PipelineConfig {
            processing_time_target: self.processing_time_target.0,
            batch_size: self.batch_size,
            max_queue_size: self.max_queue_size,
            batch_interval: self.batch_interval.0,
            cleanup_interval: self.cleanup_interval.0,
            metrics_interval: self.metrics_interval.0,
            concurrency: self.concurrency,
            immediate_threshold: self.immediate_threshold,
            idle_bypass_min_priority: self.idle_bypass_min_priority,
            max_retries: self.retry_policy.max_retries,
            retry_base_delay: self.retry_policy.retry_base_delay.0,
            retry_backoff_multiplier: self.retry_policy.retry_backoff_multiplier,
            retry_max_delay: self.retry_policy.retry_max_delay.map(|delay| delay.0),
            dead_letter_capacity: self.dead_letter_capacity,
            dead_letter_retention: self.dead_letter_retention.0,
            deduplication_window: self.deduplication_window.0,
            enable_deduplication: self.enable_deduplication,
            clock_skew_tolerance: self.clock_skew_tolerance.0,
            stage_history_size: self.stage_history_size,
            event_type_priorities,
            ..PipelineConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "3")]
    pub max_retries: u32,

    #[envconfig(from = "RETRY_BASE_DELAY_MS", default = "1000")]
    pub retry_base_delay: EnvMsDuration,

    #[envconfig(default = "2")]
    pub retry_backoff_multiplier: u32,

    #[envconfig(from = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay: Option<EnvMsDuration>,
}

/// Event type to priority table, parsed from `type=priority` pairs separated by commas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityTable(pub HashMap<String, Priority>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePriorityTableError(pub String);

impl fmt::Display for ParsePriorityTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event type priority entry: {}", self.0)
    }
}

impl FromStr for PriorityTable {
    type Err = ParsePriorityTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut table = HashMap::new();

        for entry in s.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (event_type, priority) = entry
                .split_once('=')
                .ok_or_else(|| ParsePriorityTableError(entry.to_owned()))?;
            let event_type = event_type.trim();
            if event_type.is_empty() {
                return Err(ParsePriorityTableError(entry.to_owned()));
            }
            let priority = priority
                .parse::<Priority>()
                .map_err(|_| ParsePriorityTableError(entry.to_owned()))?;
            _ = table.insert(event_type.to_owned(), priority);
        }

        Ok(PriorityTable(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_table_from_str() {
        let table: PriorityTable = " checkout=critical, newsletter_signup = low ,".parse().unwrap();
        assert_eq!(table.0.len(), 2);
        assert_eq!(table.0.get("checkout"), Some(&Priority::Critical));
        assert_eq!(table.0.get("newsletter_signup"), Some(&Priority::Low));

        assert!("checkout".parse::<PriorityTable>().is_err());
        assert!("checkout=urgent".parse::<PriorityTable>().is_err());
        assert!("=low".parse::<PriorityTable>().is_err());
    }

    #[test]
    fn test_env_ms_duration() {
        let duration: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(duration.0, time::Duration::from_millis(1500));
        assert!("1.5s".parse::<EnvMsDuration>().is_err());
    }

    #[test]
    fn test_pipeline_config_from_env() {
        let env = HashMap::from([
            ("BATCH_SIZE".to_owned(), "50".to_owned()),
            ("MAX_QUEUE_SIZE".to_owned(), "2".to_owned()),
            ("BATCH_INTERVAL_MS".to_owned(), "250".to_owned()),
            ("RETRY_MAX_DELAY_MS".to_owned(), "8000".to_owned()),
            ("IDLE_BYPASS_MIN_PRIORITY".to_owned(), "high".to_owned()),
            (
                "EVENT_TYPE_PRIORITIES".to_owned(),
                "page_view=medium,checkout=critical".to_owned(),
            ),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        let pipeline = config.pipeline_config();

        assert_eq!(pipeline.batch_size, 50);
        assert_eq!(pipeline.max_queue_size, 2);
        assert_eq!(pipeline.batch_interval, time::Duration::from_millis(250));
        assert_eq!(pipeline.retry_max_delay, Some(time::Duration::from_secs(8)));
        assert_eq!(pipeline.max_retries, 3);
        assert_eq!(pipeline.idle_bypass_min_priority, Priority::High);
        assert_eq!(
            pipeline.event_type_priorities.get("page_view"),
            Some(&Priority::Medium)
        );
        assert_eq!(
            pipeline.event_type_priorities.get("checkout"),
            Some(&Priority::Critical)
        );
        assert_eq!(
            pipeline.event_type_priorities.get("booking_complete"),
            Some(&Priority::Critical)
        );
        assert_eq!(config.bind(), "0.0.0.0:3302");
    }
}
