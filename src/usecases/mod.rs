//! Use Cases Layer - Application Business Logic
//!
//! Orchestrates domain logic with port interfaces to implement
//! the bridge's core workflows.
//!
//! Use cases:
//! - `TickPublisher`: Non-blocking batching hand-off to the event log
//! - `QuoteIngress`: Upstream session owner and callback handler
//! - `HealthMonitor`: Liveness loop, reconnects and holiday handling
//! - `Supervisor`: Monitor restarts and ordered shutdown
//! - `BridgeStats`: Shared counters read by the metrics adapters

pub mod health_monitor;
pub mod quote_ingress;
pub mod stats;
pub mod supervisor;
pub mod tick_publisher;

pub use health_monitor::{monitor_channel, HealthMonitor, MonitorInbox, MonitorLink, MonitorSignal};
pub use quote_ingress::{ConnectionState, IngressSettings, QuoteIngress, ReconnectOutcome};
pub use stats::BridgeStats;
pub use supervisor::Supervisor;
pub use tick_publisher::{Ack, DeliveryHandle, PublisherSettings, TickPublisher};
