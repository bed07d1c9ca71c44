//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Durable job queue rows
//! - Delivery audit trail

mod database;
mod models;

pub use database::{Database, DeliveryEventFilter, DeliveryEventSort, Page};
pub use models::*;
