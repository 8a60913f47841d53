//! Connection lifecycle core
//!
//! [`ConnectionManager`] owns the single active channel: it debounces
//! connect/disconnect requests, resolves channel conflicts by reconnecting,
//! keeps the [`ConnectionRegistry`] consistent and drives the heartbeat
//! [`HealthMonitor`].

pub mod debouncer;
pub mod health;
pub mod manager;
pub mod registry;

pub use debouncer::CommandDebouncer;
pub use health::{HealthMonitor, HeartbeatOutcome, HeartbeatTarget};
pub use manager::{ConnectTarget, ConnectionManager, ManagerSettings};
pub use registry::{ConnectionRecord, ConnectionRegistry};
