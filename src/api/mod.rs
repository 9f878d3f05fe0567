//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub inboxes (signed deliveries)
//! - Metrics (Prometheus)

mod inbox;
pub mod metrics;

pub use inbox::inbox_router;
pub use metrics::metrics_router;
