//! Metrics and Monitoring Adapters
//!
//! Prometheus metrics export on :9090 and the /live + /ready probes,
//! both served by axum 0.7 from the shared `BridgeStats`.

pub mod health;
pub mod prometheus;

pub use health::HealthServer;
pub use prometheus::MetricsRegistry;
