//! Tool call rate limiting
//!
//! Two layers: a fixed-window counter keyed by bucket, and rule resolution
//! that picks which bucket (and limit) a call belongs to.

pub mod limiter;
pub mod rules;

pub use limiter::{FixedWindowLimiter, RateLimitDecision};
pub use rules::RateLimitRules;
