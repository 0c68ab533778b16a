//! Claim attempt lifecycle and provisioning payload.
//!
//! State Machine:
//! ```text
//! [IDLE] ──begin──→ [VALIDATING] ──lease──→ [LEASE_ACQUIRED] ──session──→ [PROVISIONING]
//!                        │                        │                             │
//!                        │                        │                             └── commit ──→ [COMMITTED]
//!                        ↓                        ↓                             ↓
//!                    [ABORTED] ←──────────────────┴─────────────────────────────┘
//! ```
//!
//! `Committed` and `Aborted` are terminal. Each claim attempt owns one
//! `ClaimProgress`; transitions not in the diagram are rejected.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ClaimData, Identity, IdentityCertificate, PublicKey, UserInput};

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Phase of one claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClaimPhase {
    #[default]
    Idle,
    /// Checking arguments and the store
    Validating,
    /// Holding the exclusive lease; no remote call made yet
    LeaseAcquired,
    /// Remote provisioning exchange in flight
    Provisioning,
    /// Claim recorded locally
    Committed,
    /// Attempt ended without a commit
    Aborted,
}

impl ClaimPhase {
    /// `true` if `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ClaimPhase) -> bool {
        use ClaimPhase::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, LeaseAcquired)
                | (LeaseAcquired, Provisioning)
                | (Provisioning, Committed)
                | (Validating | LeaseAcquired | Provisioning, Aborted)
        )
    }

    /// `true` for `Committed` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ClaimPhase::Committed | ClaimPhase::Aborted)
    }
}

/// Illegal lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal claim transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ClaimPhase,
    pub to: ClaimPhase,
}

/// Tracks the phase of a single claim attempt.
#[derive(Debug, Clone, Default)]
pub struct ClaimProgress {
    phase: ClaimPhase,
    transitions: u8,
}

impl ClaimProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> ClaimPhase {
        self.phase
    }

    /// Number of transitions taken so far.
    pub fn transitions(&self) -> u8 {
        self.transitions
    }

    /// Move to `next`, rejecting transitions outside the lifecycle.
    pub fn advance(&mut self, next: ClaimPhase) -> Result<ClaimPhase, TransitionError> {
        if !self.phase.can_transition_to(next) {
            return Err(TransitionError {
                from: self.phase,
                to: next,
            });
        }
        tracing::trace!(from = ?self.phase, to = ?next, "Claim phase transition");
        self.phase = next;
        self.transitions = self.transitions.saturating_add(1);
        Ok(next)
    }

    /// Abort unless already terminal. Returns the final phase.
    pub fn abort(&mut self) -> ClaimPhase {
        if self.phase.can_transition_to(ClaimPhase::Aborted) {
            self.phase = ClaimPhase::Aborted;
            self.transitions = self.transitions.saturating_add(1);
        }
        self.phase
    }
}

// =============================================================================
// PERMISSION POLICY
// =============================================================================

/// Actions a rule grants on matching members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PolicyActions {
    pub provide: bool,
    pub observe: bool,
    pub modify: bool,
}

impl PolicyActions {
    /// Every action.
    pub const ALL: Self = Self {
        provide: true,
        observe: true,
        modify: true,
    };
}

/// Peers a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerScope {
    /// Any authenticated peer
    AnyTrusted,
    /// Members of a security group
    Group(Uuid),
    /// Holder of a specific key
    Key(PublicKey),
}

/// One access rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub peer: PeerScope,
    /// Object path pattern, `*` matches everything
    pub object_path: String,
    /// Interface name pattern, `*` matches everything
    pub interface_name: String,
    pub actions: PolicyActions,
}

impl PolicyRule {
    /// Rule granting `actions` on every object and interface.
    pub fn wildcard(peer: PeerScope, actions: PolicyActions) -> Self {
        Self {
            peer,
            object_path: "*".into(),
            interface_name: "*".into(),
            actions,
        }
    }
}

/// Permission policy installed on a freshly claimed application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    /// Monotonic policy version; devices reject downgrades
    pub version: u32,
    pub rules: Vec<PolicyRule>,
}

impl PermissionPolicy {
    /// Initial policy granting the admin group full access.
    pub fn for_admin_group(group: &AdminGroup) -> Self {
        Self {
            version: 1,
            rules: vec![PolicyRule::wildcard(
                PeerScope::Group(group.id),
                PolicyActions::ALL,
            )],
        }
    }
}

/// Rules an application declares it needs; carried opaquely to the device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub rules: Vec<PolicyRule>,
}

// =============================================================================
// ADMINISTRATOR INPUT & PAYLOAD
// =============================================================================

/// Security group whose members administer claimed applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminGroup {
    pub id: Uuid,
    /// Authority key of the group
    pub authority: PublicKey,
}

/// Everything an administrator supplies for one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminInput {
    pub user_input: UserInput,
    pub claim_data: ClaimData,
    pub admin_group: AdminGroup,
    pub policy: PermissionPolicy,
    pub manifests: Vec<Manifest>,
}

impl AdminInput {
    /// Input with the default admin policy and no user fields.
    pub fn new(admin_group: AdminGroup) -> Self {
        let policy = PermissionPolicy::for_admin_group(&admin_group);
        Self {
            user_input: UserInput::default(),
            claim_data: ClaimData::default(),
            admin_group,
            policy,
            manifests: Vec::new(),
        }
    }

    pub fn with_user_input(mut self, user_input: UserInput) -> Self {
        self.user_input = user_input;
        self
    }

    pub fn with_claim_data(mut self, claim_data: ClaimData) -> Self {
        self.claim_data = claim_data;
        self
    }

    pub fn with_policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_manifests(mut self, manifests: Vec<Manifest>) -> Self {
        self.manifests = manifests;
        self
    }
}

/// Arguments of the remote `claim` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPayload {
    /// Root of trust installed on the device
    pub certificate_authority: PublicKey,
    pub admin_group_id: Uuid,
    pub admin_group_authority: PublicKey,
    /// Identity chain, leaf first
    pub identity_certificate_chain: Vec<IdentityCertificate>,
    pub manifests: Vec<Manifest>,
}

impl ClaimPayload {
    pub fn new(certificate_authority: PublicKey, input: &AdminInput, identity: &Identity) -> Self {
        Self {
            certificate_authority,
            admin_group_id: input.admin_group.id,
            admin_group_authority: input.admin_group.authority,
            identity_certificate_chain: identity.certificate_chain(),
            manifests: input.manifests.clone(),
        }
    }
}
