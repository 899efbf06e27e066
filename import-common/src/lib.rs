pub mod chunks;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod flow_control;
pub mod journal;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod progress;
pub mod retry;
pub mod signals;
pub mod storage;
pub mod test_utils;
