//! # Utility Modules
//!
//! Supporting utilities used throughout the messaging layer.
//!
//! ## Components
//! - **Dedup**: TTL-bounded cache suppressing duplicate envelope deliveries
//! - **Logging**: `tracing-subscriber` setup from configuration
//! - **Metrics**: Thread-safe counters for traffic and connection churn
//! - **Timeout**: Timeout defaults, async timeout wrappers and reconnect backoff

pub mod dedup;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use dedup::DedupCache;
