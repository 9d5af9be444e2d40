//! Request-path security: tiered rate limiting, pattern-based threat
//! detection, the durable event store, and the bounded queue that feeds it.

pub mod event_queue;
pub mod event_store;
pub mod monitor;
pub mod rate_limit;

pub use event_queue::{EventQueue, StoreJob};
pub use event_store::{EventStore, StoredEvent};
pub use monitor::SecurityMonitor;
pub use rate_limit::{AdmitDecision, RateLimiter, Tier};
