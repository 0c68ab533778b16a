//! Per-application security records and inbound advertisements.

use crate::domain::{ApplicationState, ClaimCapabilities, EndpointName, PublicKey, Timestamp};
use crate::error::AdvertisementError;

/// Identity of a target application as supplied by an administrator.
///
/// The public key is carried as raw bytes: the arbitrator validates it and
/// rejects malformed keys with `InvalidArgument`. The endpoint may be stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationIdentity {
    /// Endpoint name as last seen by the administrator
    pub endpoint: EndpointName,
    /// Raw public key bytes
    pub public_key: Vec<u8>,
}

impl ApplicationIdentity {
    /// Create a new identity.
    pub fn new(endpoint: impl Into<EndpointName>, public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            endpoint: endpoint.into(),
            public_key: public_key.into(),
        }
    }
}

impl From<&SecurityInfo> for ApplicationIdentity {
    fn from(info: &SecurityInfo) -> Self {
        Self {
            endpoint: info.endpoint.clone(),
            public_key: info
                .public_key
                .map(|key| key.as_bytes().to_vec())
                .unwrap_or_default(),
        }
    }
}

/// Last-known security state of one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityInfo {
    /// Current transport address
    pub endpoint: EndpointName,
    /// Public key; `None` until first contact
    pub public_key: Option<PublicKey>,
    /// Declared security state
    pub application_state: ApplicationState,
    /// Supported claim mechanisms
    pub claim_capabilities: ClaimCapabilities,
    /// When the application was last heard from
    pub last_seen: Timestamp,
}

impl SecurityInfo {
    /// Fresh record for a newly found endpoint.
    pub fn unknown(endpoint: EndpointName, now: Timestamp) -> Self {
        Self {
            endpoint,
            public_key: None,
            application_state: ApplicationState::Unknown,
            claim_capabilities: ClaimCapabilities::empty(),
            last_seen: now,
        }
    }

    /// Copy of this record with the declared fields replaced.
    pub fn with_declared(&self, declared: &DeclaredState, now: Timestamp) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            public_key: Some(declared.public_key),
            application_state: declared.state,
            claim_capabilities: declared.claim_capabilities,
            last_seen: now,
        }
    }

    /// `true` if the record is known under `key`.
    pub fn has_key(&self, key: &PublicKey) -> bool {
        self.public_key.as_ref() == Some(key)
    }
}

/// Validated declared state of an application, from an advertisement or
/// from querying the device directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclaredState {
    pub public_key: PublicKey,
    pub state: ApplicationState,
    pub claim_capabilities: ClaimCapabilities,
}

/// Raw "security state changed" broadcast, as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityAdvertisement {
    /// Advertiser's endpoint name
    pub endpoint: String,
    /// Advertised public key bytes
    pub public_key: Vec<u8>,
    /// On-bus state code
    pub state_code: u8,
    /// Raw claim capability bits
    pub claim_capabilities: u16,
}

impl SecurityAdvertisement {
    /// Validate every field. Either the whole advertisement is usable or none
    /// of it is.
    pub fn validate(&self) -> Result<(EndpointName, DeclaredState), AdvertisementError> {
        let endpoint = EndpointName::new(self.endpoint.clone());
        if endpoint.is_blank() {
            return Err(AdvertisementError::MissingEndpoint);
        }
        let public_key = PublicKey::from_bytes(&self.public_key)?;
        let state = ApplicationState::from_code(self.state_code)
            .ok_or(AdvertisementError::UnknownState(self.state_code))?;
        let claim_capabilities = ClaimCapabilities::from_bits(self.claim_capabilities)
            .ok_or(AdvertisementError::UnknownCapabilities(self.claim_capabilities))?;

        Ok((
            endpoint,
            DeclaredState {
                public_key,
                state,
                claim_capabilities,
            },
        ))
    }
}
