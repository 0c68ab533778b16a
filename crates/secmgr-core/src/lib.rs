//! # secmgr-core
//!
//! Application presence tracking and claim arbitration for the security
//! manager of an IoT messaging fabric.
//!
//! ## Overview
//!
//! This crate provides:
//! - **Liveness Tracker**: ping-based, edge-triggered found/lost events
//! - **Application Monitor**: serialized event queue, Security Info Store,
//!   ordered listener notifications
//! - **Identity Assembler**: certificate + about data + administrator input
//! - **Claim Arbitrator**: at most one claim per application, fully claimed
//!   or fully unclaimed in the local view
//! - **Security Manager**: facade owning every collaborator
//!
//! ## Architecture
//!
//! ```text
//! PingProbe ──→ LivenessTracker ──Found/Lost──┐
//! bus signals ──→ MonitorHandle ──Advertisement┼──→ ApplicationMonitor ──→ listeners
//!                                              │           ↑
//! administrator ──→ SecurityManager ──→ ClaimArbitrator ───┘ (records outcomes)
//!                                              │
//!                                              └──→ SessionTransport / PermissionManagement
//! ```
//!
//! Hexagonal layout:
//! - **Domain Layer:** value objects, store, identity, leases, claim lifecycle
//! - **Ports Layer:** listener and API traits, device-facing traits
//! - **Service Layer:** tracker, monitor, arbitrator, facade
//! - **Adapters Layer:** system clock
//!
//! ## Example
//!
//! ```rust,ignore
//! use secmgr_core::{SecurityContext, SecurityManager, SecurityManagerConfig};
//! use secmgr_core::ports::SecurityManagerApi;
//!
//! let context = SecurityContext::new(probe, transport, stub, authority);
//! let manager = SecurityManager::new(SecurityManagerConfig::from_env(), context)?;
//! manager.start();
//!
//! // Feed bus advertisements
//! manager.monitor_handle().submit_advertisement(advertisement).await;
//!
//! // Claim
//! let info = manager
//!     .claim_application(&ApplicationIdentity::new(endpoint, key), AdminInput::new(group))
//!     .await?;
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod service;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::SecurityManagerConfig;
pub use domain::{
    AboutData, AdminGroup, AdminInput, ApplicationIdentity, ApplicationState, ClaimCapabilities,
    ClaimData, EndpointName, Identity, IdentityAssembler, IdentityCertificate, PermissionPolicy,
    PublicKey, SecurityAdvertisement, SecurityInfo, Timestamp, UserInput,
};
pub use error::{ClaimError, ClaimResult, ConfigError};
pub use ports::{SecurityInfoListener, SecurityManagerApi};
pub use service::{MonitorHandle, SecurityContext, SecurityManager};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
