//! Domain layer - Tick model, exchange calendar and feed health.
//!
//! Pure logic with no I/O: time is always passed in, never read.
//! Everything here is testable in isolation (hexagonal inner ring).

pub mod calendar;
pub mod errors;
pub mod health;
pub mod tick;

// Re-export core types for convenience
pub use calendar::{MarketCalendar, SessionKind, SessionSpec, SessionWindow};
pub use errors::{CalendarError, ConnectError, PublishError};
pub use health::{
    Assessment, HealthState, MonitorAction, MonitorPolicy, MonitorState, Notice, Severity,
};
pub use tick::{decode_batch, encode_batch, Compression, RawQuote, Tick, TickError};
