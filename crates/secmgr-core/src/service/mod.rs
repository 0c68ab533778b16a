//! Application services
//!
//! ## Components
//! - liveness: Ping-based presence tracking
//! - listeners: Listener registry and notification outbox
//! - monitor: Application Monitor (event loop, store writer)
//! - arbitrator: Claim Arbitrator
//! - manager: Security Manager facade

pub mod arbitrator;
pub mod listeners;
pub mod liveness;
pub mod manager;
pub mod monitor;

pub use arbitrator::{ClaimArbitrator, ClaimPolicy};
pub use listeners::{ListenerId, ListenerRegistry, NotificationOutbox};
pub use liveness::{LivenessTracker, Presence};
pub use manager::{SecurityContext, SecurityManager};
pub use monitor::{ApplicationMonitor, MonitorEvent, MonitorHandle};
