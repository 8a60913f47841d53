//! Observability for the channel link
//!
//! Structured logging with span macros and process-wide link metrics.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{LogFormat, init_default_logging, init_logging, parse_level};
pub use metrics::{LinkMetrics, MetricsSnapshot, metrics};

// Span macros for structured logging
pub use logging::{connection_span, heartbeat_span, lifecycle_span, publish_span};
