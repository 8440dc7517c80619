//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (WebSockets, HTTP clients, file I/O).
//! Each sub-module groups adapters by infrastructure concern.
//!
//! Adapter categories:
//! - `source`: Upstream quote gateway over WebSocket
//! - `publisher`: Event log via Kafka REST proxy or JSONL files
//! - `metrics`: Prometheus metrics export and health checks

pub mod metrics;
pub mod publisher;
pub mod source;
