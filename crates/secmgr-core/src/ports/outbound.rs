//! # Driven Ports (Outbound SPI)
//!
//! Interfaces this subsystem requires from the host: the presence primitive,
//! the management-session transport, the permission-management stub exposed
//! by target devices, and the certificate authority.
//!
//! All traits are `Send + Sync` so one instance can be shared through
//! `Arc` by the liveness tracker, the monitor and concurrent claims.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    AboutData, ApplicationState, ClaimCapabilities, ClaimPayload, EndpointName, IdentityCertificate,
    PermissionPolicy, PublicKey, Timestamp, UserInput,
};

// =============================================================================
// TIME
// =============================================================================

/// Source of the current time.
///
/// Production uses the system clock; tests inject a fixed clock.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp.
    fn now(&self) -> Timestamp;
}

// =============================================================================
// PRESENCE
// =============================================================================

/// Ping-based presence primitive.
///
/// The liveness tracker calls `ping` once per watched endpoint per probe
/// round. Any error counts as a missed probe; errors never reach listeners.
#[async_trait]
pub trait PingProbe: Send + Sync {
    /// Probe one endpoint. `Ok(())` means the endpoint answered.
    async fn ping(&self, endpoint: &EndpointName) -> Result<(), ProbeError>;
}

/// Presence probe failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,

    #[error("endpoint unknown to the bus")]
    UnknownEndpoint,

    #[error("probe failed: {reason}")]
    Network { reason: String },
}

// =============================================================================
// SESSIONS
// =============================================================================

/// Handle to an open management session with one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    /// Transport-assigned session identifier
    pub id: u32,
    /// Endpoint the session was opened to
    pub endpoint: EndpointName,
}

/// Session transport towards target applications.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Open a management session to `endpoint`.
    async fn open_management_session(
        &self,
        endpoint: &EndpointName,
    ) -> Result<SessionHandle, TransportError>;

    /// Close a session. Best effort; failures are swallowed by the transport.
    async fn close_session(&self, session: SessionHandle);
}

/// Session establishment failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No route to the endpoint (application gone)
    #[error("peer unreachable")]
    PeerUnreachable,

    #[error("session refused: {reason}")]
    SessionRefused { reason: String },

    #[error("transport failure: {reason}")]
    Io { reason: String },
}

// =============================================================================
// PERMISSION MANAGEMENT STUB
// =============================================================================

/// Remote permission-management interface of a target application.
///
/// Any `Err` from a mutating call is treated as "no committed effect" for
/// local bookkeeping; whatever the device actually applied is observed
/// afterwards through `get_application_state`.
#[async_trait]
pub trait PermissionManagement: Send + Sync {
    /// Public key the application authenticates with.
    async fn get_public_key(&self, session: &SessionHandle) -> Result<Vec<u8>, RemoteCallError>;

    /// Declared security state.
    async fn get_application_state(
        &self,
        session: &SessionHandle,
    ) -> Result<ApplicationState, RemoteCallError>;

    /// Supported claim mechanisms.
    async fn get_claim_capabilities(
        &self,
        session: &SessionHandle,
    ) -> Result<ClaimCapabilities, RemoteCallError>;

    /// Self-declared about data.
    async fn get_about_data(&self, session: &SessionHandle) -> Result<AboutData, RemoteCallError>;

    /// Install the root of trust, admin group and identity chain.
    async fn claim(
        &self,
        session: &SessionHandle,
        payload: &ClaimPayload,
    ) -> Result<(), RemoteCallError>;

    /// Install the initial permission policy.
    async fn install_policy(
        &self,
        session: &SessionHandle,
        policy: &PermissionPolicy,
    ) -> Result<(), RemoteCallError>;

    /// Return the device to the unclaimed state.
    async fn reset(&self, session: &SessionHandle) -> Result<(), RemoteCallError>;
}

/// Remote call failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteCallError {
    /// The device answered with a non-success status
    #[error("rejected with status {status}")]
    Rejected { status: String },

    /// The session dropped while the call was in flight
    #[error("session lost")]
    SessionLost,

    #[error("transport failure: {reason}")]
    Transport { reason: String },
}

// =============================================================================
// CERTIFICATE AUTHORITY
// =============================================================================

/// Issuer of identity certificates.
///
/// Issuance is synchronous and local to the security manager.
pub trait CertificateAuthority: Send + Sync {
    /// Public key of the authority; installed on devices as root of trust.
    fn authority_key(&self) -> PublicKey;

    /// Issue an identity certificate for `subject`.
    fn issue_identity_certificate(
        &self,
        subject: &PublicKey,
        user_input: &UserInput,
    ) -> Result<IdentityCertificate, IssuanceError>;
}

/// Certificate issuance failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssuanceError {
    #[error("issuance refused: {reason}")]
    Refused { reason: String },

    #[error("certificate authority unavailable")]
    Unavailable,
}
