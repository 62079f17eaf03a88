//! Middleware components for the video ingest server.
//!
//! - `rate_limit`: IP-based rate limiting for the chunk intake path
//! - `identity`: Caller identity extraction from the gateway header

pub mod identity;
pub mod rate_limit;

pub use identity::Caller;
pub use rate_limit::RateLimiter;
