//! Concurrency controls for calls into the downstream compute service
//!
//! - `limiter`: fixed-size permit pool with a bounded wait, released by guard drop

pub mod limiter;

pub use limiter::{ConcurrencyLimiter, LimiterStats, SlotGuard};
