//! Operator authentication
//!
//! Handles:
//! - Bearer token extraction
//! - Admin route middleware

mod middleware;

pub use middleware::{extract_bearer_token, require_admin_token};
