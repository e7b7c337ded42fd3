//! Helpdesk Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the help-desk coordinator.

pub mod error;
pub mod rate_limit;
pub mod types;

pub use error::*;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use types::*;
