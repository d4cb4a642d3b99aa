//! Bandwidth limiting and throughput sampling

pub mod limiter;
pub mod shaper;

pub use limiter::RateLimiter;
pub use shaper::{TrafficCounters, TrafficShaper};
