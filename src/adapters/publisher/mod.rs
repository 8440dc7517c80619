//! Event Log Adapters
//!
//! Implements the `EventPublisher` port against a Kafka REST proxy
//! (production) and local JSONL files (development, tests).

pub mod file_log;
pub mod rest_proxy;

pub use file_log::{FileLogPublisher, LogRecord};
pub use rest_proxy::RestProxyPublisher;
