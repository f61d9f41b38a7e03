// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_possible_truncation, // Millisecond durations and gauge values stay far below the limits
    clippy::cast_precision_loss,      // Fill ratios are approximate by nature
    clippy::missing_errors_doc,       // Error enums document their variants
    clippy::module_name_repetitions,  // e.g. SpilloverError in the spillover module
    clippy::must_use_candidate        // Annotated selectively on critical APIs
)]

pub mod app;
pub mod buffer;
pub mod domain;
pub mod reliability;
pub mod sender;
pub mod shipper;

// Re-export main types for easy access
pub use app::ShipperConfig;
pub use domain::{Correlation, Event, EventContext, ShipperError};
pub use reliability::{LossReason, MetricsSnapshot};
pub use sender::{BatchReport, DeliveryError, TokenProvider, Transport};
pub use shipper::{Capabilities, EventShipper, Lifecycle, ShutdownSummary};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
