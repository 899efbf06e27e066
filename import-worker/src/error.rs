use import_common::error::{ConfigError, StoreError};
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors related to initialization of the import worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("failed to set up kafka client: {0}")]
    KafkaError(#[from] KafkaError),
    #[error("failed to set up storage: {0}")]
    StoreError(#[from] StoreError),
}
