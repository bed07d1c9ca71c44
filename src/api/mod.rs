//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - Admin API
//! - Metrics (Prometheus)

mod activitypub;
mod admin;
mod dto;
pub mod metrics;

pub use dto::*;

pub use activitypub::activitypub_router;
pub use admin::admin_router;
pub use metrics::metrics_router;
