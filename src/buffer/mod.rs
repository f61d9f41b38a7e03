pub mod backpressure;
pub mod queue;

pub use backpressure::BackpressureLevel;
pub use queue::{BufferError, EventQueue};
