//! Domain module for the Security Manager
//!
//! ## Core Modules
//! - value_objects: Endpoint names, public keys, states, capabilities
//! - security_info: Per-application records and advertisements
//! - store: Security Info Store
//! - identity: Identity Assembler
//! - lease: Claim lease arena
//! - claim: Claim lifecycle and provisioning payload

pub mod claim;
pub mod identity;
pub mod lease;
pub mod security_info;
pub mod store;
pub mod value_objects;

pub use claim::{
    AdminGroup, AdminInput, ClaimPayload, ClaimPhase, ClaimProgress, Manifest, PeerScope,
    PermissionPolicy, PolicyActions, PolicyRule, TransitionError,
};
pub use identity::{AboutData, ClaimData, Identity, IdentityAssembler, IdentityCertificate, UserInput};
pub use lease::{ClaimLease, LeaseError, LeaseKey, LeaseTable};
pub use security_info::{ApplicationIdentity, DeclaredState, SecurityAdvertisement, SecurityInfo};
pub use store::{Occurrence, SecurityInfoStore, StoreChange};
pub use value_objects::{
    saturating_millis, ApplicationState, ClaimCapabilities, EndpointName, PublicKey, Timestamp,
};
