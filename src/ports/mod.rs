//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) that the usecases layer
//! requires from the outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `QuoteSource`: Upstream quote gateway (login, subscribe, callbacks)
//! - `EventPublisher`: Durable partitioned event log
//! - `Clock`: Wall-clock time, swappable in tests

pub mod clock;
pub mod event_publisher;
pub mod quote_source;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event_publisher::{BatchHeaders, EventPublisher, CONTENT_TYPE_NDJSON};
pub use quote_source::{Credentials, QuoteHandler, QuoteSource, SessionEvent};
