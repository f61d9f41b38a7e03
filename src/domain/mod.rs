//! Domain layer for rask-event-shipper.
//!
//! Contains the canonical types shared across all modules:
//! - `Event`: The opaque record handed in by application code
//! - `EventContext`: Explicit correlation context used to stamp events
//! - `QueuedItem`: The bookkeeping wrapper that travels through the queues
//! - `ShipperError`: Top-level error type

pub mod error;
pub mod event;
pub mod item;

pub use error::ShipperError;
pub use event::{Correlation, Event, EventContext};
pub use item::QueuedItem;
