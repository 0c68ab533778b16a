//! Value Objects for the Security Manager
//!
//! Endpoint names, public keys, timestamps, application states and the
//! claim-capability bitset shared by every component.

use std::fmt;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::KeyError;

// =============================================================================
// TIMESTAMP
// =============================================================================

/// Unix timestamp in seconds.
///
/// Values are clamped to `MAX_REASONABLE` so a misbehaving clock can never
/// corrupt `last_seen` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Maximum reasonable timestamp (year 9999).
    pub const MAX_REASONABLE: u64 = 253_402_300_799;

    /// Create a new timestamp, clamping to `MAX_REASONABLE`.
    pub fn new(secs: u64) -> Self {
        Self(secs.min(Self::MAX_REASONABLE))
    }

    /// Seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// ENDPOINT NAME
// =============================================================================

/// Transport address of an application on the bus.
///
/// Endpoint names are ephemeral: an application that restarts comes back
/// under a new name with the same public key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointName(String);

impl EndpointName {
    /// Wrap an endpoint name. No validation happens here; the monitor
    /// rejects empty names on intake.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` when the name is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EndpointName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// =============================================================================
// PUBLIC KEY
// =============================================================================

/// Application public key (Ed25519, 32 bytes).
///
/// This is the durable identity of an application. Construction validates
/// that the bytes decode to a curve point, so a `PublicKey` value is always
/// well-formed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Length of an encoded key in bytes.
    pub const LEN: usize = 32;

    /// Parse and validate raw key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.is_empty() {
            return Err(KeyError::Empty);
        }
        let raw: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        VerifyingKey::from_bytes(&raw).map_err(|_| KeyError::NotOnCurve)?;
        Ok(Self(raw))
    }

    /// Parse a hex-encoded key.
    pub fn from_hex(encoded: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| KeyError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }

    /// Build from an already-validated verifying key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short fingerprint for log lines.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

// Keys are hex strings on the wire and are re-validated on the way in.
impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Security state an application declares for itself.
///
/// `Unknown` is purely local: it marks an application that has been found
/// but whose declared state has not been resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ApplicationState {
    /// Not accepting claims (claim window closed)
    NotClaimable,
    /// Unclaimed and accepting a claim
    Claimable,
    /// Claimed by an administrator
    Claimed,
    /// Claimed, but provisioning is incomplete or outdated
    NeedUpdate,
    /// Found, declared state not yet known
    #[default]
    Unknown,
}

impl ApplicationState {
    /// Decode the on-bus state code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::NotClaimable),
            1 => Some(Self::Claimable),
            2 => Some(Self::Claimed),
            3 => Some(Self::NeedUpdate),
            _ => None,
        }
    }

    /// Encode to the on-bus state code. `Unknown` has no code.
    pub fn code(&self) -> Option<u8> {
        match self {
            Self::NotClaimable => Some(0),
            Self::Claimable => Some(1),
            Self::Claimed => Some(2),
            Self::NeedUpdate => Some(3),
            Self::Unknown => None,
        }
    }

    /// `true` for states in which the device holds a root of trust.
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed | Self::NeedUpdate)
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotClaimable => write!(f, "NOT_CLAIMABLE"),
            Self::Claimable => write!(f, "CLAIMABLE"),
            Self::Claimed => write!(f, "CLAIMED"),
            Self::NeedUpdate => write!(f, "NEED_UPDATE"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// =============================================================================
// CLAIM CAPABILITIES
// =============================================================================

/// Bitset of claim mechanisms supported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClaimCapabilities(u16);

impl ClaimCapabilities {
    /// Claim over an unauthenticated ECDHE session
    pub const ECDHE_NULL: Self = Self(0x01);
    /// Claim with a pre-shared key
    pub const ECDHE_PSK: Self = Self(0x02);
    /// Claim with certificate-based ECDSA authentication
    pub const ECDHE_ECDSA: Self = Self(0x04);
    /// Claim with a password-authenticated key exchange
    pub const ECDHE_SPEKE: Self = Self(0x08);

    const ALL_BITS: u16 = 0x0F;

    /// Empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from raw bits. Unknown bits are rejected.
    pub fn from_bits(bits: u16) -> Option<Self> {
        if bits & !Self::ALL_BITS != 0 {
            return None;
        }
        Some(Self(bits))
    }

    /// Raw bits.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// `true` if every mechanism in `other` is supported.
    pub fn supports(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` if no mechanism is supported.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ClaimCapabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
