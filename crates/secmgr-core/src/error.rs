//! Error types for the Security Manager
//!
//! One `thiserror` enum per concern. Port-level errors convert into
//! `ClaimError` through `From` so the arbitrator can use `?` throughout.

use thiserror::Error;

use crate::ports::outbound::{IssuanceError, RemoteCallError, TransportError};

/// Errors returned by `claim()`.
///
/// Validation and precondition errors (`InvalidArgument`, `AlreadyClaimed`,
/// `ClaimInProgress`, `PeerUnreachable` before provisioning) have no side
/// effects. Provisioning errors are returned after the lease is released and
/// the best-known device state has been recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// Malformed public key or unparseable request
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Target is already claimed
    #[error("application {endpoint} is already claimed")]
    AlreadyClaimed { endpoint: String },

    /// Another claim for the same target holds the lease
    #[error("a claim for this application is already in progress")]
    ClaimInProgress,

    /// Target is not (or no longer) tracked
    #[error("application is unreachable")]
    PeerUnreachable,

    /// Transport or session failure during provisioning
    #[error("network error during provisioning: {reason}")]
    NetworkError { reason: String },

    /// The device's permission management interface refused a call
    #[error("remote device rejected {operation}: {status}")]
    RemoteRejected {
        operation: &'static str,
        status: String,
    },

    /// Provisioning exceeded the configured claim timeout
    #[error("claim timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    /// Identity could not be assembled
    #[error("incomplete identity: {reason}")]
    IncompleteIdentity { reason: String },

    /// The certificate authority refused to issue an identity certificate
    #[error("certificate issuance failed: {reason}")]
    CertificateIssuance { reason: String },
}

/// Result type for claim operations
pub type ClaimResult<T> = Result<T, ClaimError>;

impl From<KeyError> for ClaimError {
    fn from(err: KeyError) -> Self {
        Self::InvalidArgument {
            reason: format!("public key: {err}"),
        }
    }
}

impl From<IdentityError> for ClaimError {
    fn from(err: IdentityError) -> Self {
        Self::IncompleteIdentity {
            reason: err.to_string(),
        }
    }
}

impl From<TransportError> for ClaimError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PeerUnreachable => Self::PeerUnreachable,
            other => Self::NetworkError {
                reason: other.to_string(),
            },
        }
    }
}

impl From<IssuanceError> for ClaimError {
    fn from(err: IssuanceError) -> Self {
        Self::CertificateIssuance {
            reason: err.to_string(),
        }
    }
}

impl ClaimError {
    /// Map a failed remote call for `operation`.
    pub fn from_remote(operation: &'static str, err: RemoteCallError) -> Self {
        match err {
            RemoteCallError::Rejected { status } => Self::RemoteRejected { operation, status },
            RemoteCallError::SessionLost => Self::NetworkError {
                reason: format!("session lost during {operation}"),
            },
            RemoteCallError::Transport { reason } => Self::NetworkError {
                reason: format!("{operation}: {reason}"),
            },
        }
    }
}

/// Malformed public key material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,

    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("key is not valid hex")]
    InvalidEncoding,

    #[error("key is not a valid curve point")]
    NotOnCurve,
}

/// Identity Assembler failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity certificate is missing")]
    MissingCertificate,

    #[error("about data is missing")]
    MissingAboutData,

    #[error("certificate subject {certificate} does not match application key {application}")]
    SubjectMismatch {
        certificate: String,
        application: String,
    },
}

/// Reasons an inbound security advertisement is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdvertisementError {
    #[error("advertisement has no endpoint name")]
    MissingEndpoint,

    #[error("advertised public key is malformed: {0}")]
    MalformedKey(#[from] KeyError),

    #[error("unknown application state code {0}")]
    UnknownState(u8),

    #[error("unknown claim capability bits {0:#06x}")]
    UnknownCapabilities(u16),
}

/// Failure to resolve the declared state of a newly found application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("could not open session: {0}")]
    Transport(#[from] TransportError),

    #[error("remote query failed: {0}")]
    Remote(#[from] RemoteCallError),

    #[error("device reported a malformed public key: {0}")]
    MalformedKey(#[from] KeyError),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(
            ClaimError::from(TransportError::PeerUnreachable),
            ClaimError::PeerUnreachable
        );
        assert!(matches!(
            ClaimError::from(TransportError::SessionRefused {
                reason: "busy".into()
            }),
            ClaimError::NetworkError { .. }
        ));
    }

    #[test]
    fn test_remote_error_mapping() {
        let rejected = ClaimError::from_remote(
            "claim",
            RemoteCallError::Rejected {
                status: "PERMISSION_DENIED".into(),
            },
        );
        assert_eq!(
            rejected,
            ClaimError::RemoteRejected {
                operation: "claim",
                status: "PERMISSION_DENIED".into()
            }
        );
        assert!(matches!(
            ClaimError::from_remote("install_policy", RemoteCallError::SessionLost),
            ClaimError::NetworkError { .. }
        ));
    }

    #[test]
    fn test_key_error_is_invalid_argument() {
        assert!(matches!(
            ClaimError::from(KeyError::Empty),
            ClaimError::InvalidArgument { .. }
        ));
    }
}
