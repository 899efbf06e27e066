use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::error::ConfigError;

/// Thresholds for the ingestion flow control.
///
/// Consumers pause once the in-flight count reaches `high_watermark` and only resume
/// once it falls back to `low_watermark` or below.
#[derive(Envconfig, Clone, Debug)]
pub struct FlowControlConfig {
    #[envconfig(from = "FLOW_CONTROL_ENABLED", default = "true")]
    pub enabled: bool,

    #[envconfig(from = "FLOW_CONTROL_HIGH_WATERMARK", default = "20")]
    pub high_watermark: u64,

    #[envconfig(from = "FLOW_CONTROL_LOW_WATERMARK", default = "10")]
    pub low_watermark: u64,
}

impl FlowControlConfig {
    pub fn new(enabled: bool, high_watermark: u64, low_watermark: u64) -> Self {
        Self {
            enabled,
            high_watermark,
            low_watermark,
        }
    }

    /// A low watermark at or above the high one makes consumers pause and resume on every event.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_watermark >= self.high_watermark {
            return Err(ConfigError::InvalidWatermarks {
                high: self.high_watermark,
                low: self.low_watermark,
            });
        }
        Ok(())
    }
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self::new(true, 20, 10)
    }
}

/// Settings for the background drain loop of a `BatchDispatcher`.
#[derive(Envconfig, Clone, Debug)]
pub struct DispatcherConfig {
    #[envconfig(default = "5000")]
    pub flush_timeout: EnvMsDuration,

    #[envconfig(default = "16")]
    pub max_concurrent_flushes: usize,

    #[envconfig(default = "2")]
    pub flush_backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub flush_initial_interval: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub flush_maximum_interval: EnvMsDuration,
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_flushes == 0 {
            return Err(ConfigError::ZeroValue("MAX_CONCURRENT_FLUSHES"));
        }
        if self.flush_timeout.0.is_zero() {
            return Err(ConfigError::ZeroValue("FLUSH_TIMEOUT"));
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            flush_timeout: EnvMsDuration(time::Duration::from_secs(5)),
            max_concurrent_flushes: 16,
            flush_backoff_coefficient: 2,
            flush_initial_interval: EnvMsDuration(time::Duration::from_millis(100)),
            flush_maximum_interval: EnvMsDuration(time::Duration::from_secs(10)),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "import-worker")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            kafka_hosts: "localhost:9092".to_owned(),
            kafka_tls: false,
            kafka_consumer_group: "import-worker".to_owned(),
            kafka_consumer_offset_reset: "earliest".to_owned(),
            kafka_producer_linger_ms: 20,
            kafka_message_timeout_ms: 20000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
