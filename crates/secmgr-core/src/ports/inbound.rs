//! Driving Ports (API - Inbound)
//!
//! The administrator-facing API of the security manager and the callback
//! interface it drives.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{AdminInput, ApplicationIdentity, EndpointName, PublicKey, SecurityInfo};
use crate::error::ClaimResult;

/// Subscriber to application presence and state changes.
///
/// Callbacks run on the notification drainer, outside every internal lock,
/// so they may call back into the security manager (including
/// unregistering themselves). For one endpoint they arrive in the order
/// added → state changed* → removed.
pub trait SecurityInfoListener: Send + Sync {
    /// A new application is tracked.
    fn on_application_added(&self, info: &SecurityInfo);

    /// Declared fields of a tracked application changed.
    fn on_application_state_changed(&self, old: &SecurityInfo, new: &SecurityInfo);

    /// An application is no longer tracked.
    fn on_application_removed(&self, info: &SecurityInfo);
}

/// Primary Security Manager API
///
/// This is the driving port for administrator tooling.
#[async_trait]
pub trait SecurityManagerApi: Send + Sync {
    /// Claim an unclaimed application.
    ///
    /// # Returns
    /// * The committed `SecurityInfo` (state `Claimed`) on success
    async fn claim_application(
        &self,
        target: &ApplicationIdentity,
        input: AdminInput,
    ) -> ClaimResult<SecurityInfo>;

    /// Point-in-time copy of every tracked application.
    fn get_applications(&self) -> Vec<SecurityInfo>;

    /// Most recently seen application known under `key`.
    fn get_application_by_key(&self, key: &PublicKey) -> Option<SecurityInfo>;

    /// Application currently tracked under `endpoint`.
    fn get_application_by_endpoint(&self, endpoint: &EndpointName) -> Option<SecurityInfo>;

    /// Subscribe to change notifications. Registering twice is a no-op.
    fn register_listener(&self, listener: Arc<dyn SecurityInfoListener>);

    /// Unsubscribe. Effective immediately, even for notifications already
    /// queued.
    fn unregister_listener(&self, listener: &Arc<dyn SecurityInfoListener>);
}
