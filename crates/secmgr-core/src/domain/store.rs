//! # Security Info Store
//!
//! In-memory map from endpoint to last-known `SecurityInfo`.
//!
//! The store is plain data: every method is synchronous and returns the
//! `StoreChange` it caused, which the Application Monitor turns into
//! listener notifications. Locking is the monitor's job.
//!
//! Each time an endpoint is (re)inserted it receives a fresh `Occurrence`.
//! Asynchronous work started for one occurrence (state resolution) is only
//! applied while that same occurrence is still tracked.

use std::collections::HashMap;

use crate::domain::{
    ApplicationState, DeclaredState, EndpointName, PublicKey, SecurityInfo, Timestamp,
};

/// Generation counter for one tracked appearance of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Occurrence(u64);

impl Occurrence {
    /// Raw counter value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A mutation that listeners must hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A new endpoint is tracked
    Added(SecurityInfo),
    /// Declared fields of a tracked endpoint changed
    StateChanged {
        old: SecurityInfo,
        new: SecurityInfo,
    },
    /// An endpoint is no longer tracked
    Removed(SecurityInfo),
}

impl StoreChange {
    /// Endpoint the change refers to.
    pub fn endpoint(&self) -> &EndpointName {
        match self {
            Self::Added(info) | Self::Removed(info) => &info.endpoint,
            Self::StateChanged { new, .. } => &new.endpoint,
        }
    }
}

#[derive(Debug, Clone)]
struct StoreEntry {
    info: SecurityInfo,
    occurrence: Occurrence,
}

/// Last-known security state of every tracked application.
#[derive(Debug, Default)]
pub struct SecurityInfoStore {
    entries: HashMap<EndpointName, StoreEntry>,
    next_occurrence: u64,
}

impl SecurityInfoStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked endpoints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record for `endpoint`.
    pub fn get(&self, endpoint: &EndpointName) -> Option<&SecurityInfo> {
        self.entries.get(endpoint).map(|entry| &entry.info)
    }

    /// Current occurrence of `endpoint`.
    pub fn occurrence(&self, endpoint: &EndpointName) -> Option<Occurrence> {
        self.entries.get(endpoint).map(|entry| entry.occurrence)
    }

    /// Most recently seen record known under `key`.
    ///
    /// An application that restarted may briefly be tracked under both its
    /// old and new endpoint; the fresher one wins.
    pub fn find_by_public_key(&self, key: &PublicKey) -> Option<&SecurityInfo> {
        self.entries
            .values()
            .filter(|entry| entry.info.has_key(key))
            .max_by(|a, b| {
                a.info
                    .last_seen
                    .cmp(&b.info.last_seen)
                    .then(a.occurrence.cmp(&b.occurrence))
            })
            .map(|entry| &entry.info)
    }

    /// Point-in-time copy of every record, ordered by endpoint.
    pub fn snapshot(&self) -> Vec<SecurityInfo> {
        let mut all: Vec<SecurityInfo> = self.entries.values().map(|e| e.info.clone()).collect();
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }

    /// Track `endpoint` as found.
    ///
    /// Creates an `Unknown` record if the endpoint is new; otherwise only
    /// refreshes `last_seen`. Returns the current occurrence and the change,
    /// if any.
    pub fn insert_found(
        &mut self,
        endpoint: &EndpointName,
        now: Timestamp,
    ) -> (Occurrence, Option<StoreChange>) {
        if let Some(entry) = self.entries.get_mut(endpoint) {
            entry.info.last_seen = entry.info.last_seen.max(now);
            return (entry.occurrence, None);
        }

        self.next_occurrence += 1;
        let occurrence = Occurrence(self.next_occurrence);
        let info = SecurityInfo::unknown(endpoint.clone(), now);
        self.entries.insert(
            endpoint.clone(),
            StoreEntry {
                info: info.clone(),
                occurrence,
            },
        );
        (occurrence, Some(StoreChange::Added(info)))
    }

    /// Replace the declared fields of a tracked endpoint.
    ///
    /// Returns `None` if the endpoint is not tracked or nothing but
    /// `last_seen` changed.
    pub fn apply_declared(
        &mut self,
        endpoint: &EndpointName,
        declared: &DeclaredState,
        now: Timestamp,
    ) -> Option<StoreChange> {
        let entry = self.entries.get_mut(endpoint)?;
        let updated = entry.info.with_declared(declared, now.max(entry.info.last_seen));
        Self::replace(entry, updated)
    }

    /// Set the application state of a tracked endpoint, keeping the other
    /// declared fields.
    pub fn set_state(
        &mut self,
        endpoint: &EndpointName,
        state: ApplicationState,
        now: Timestamp,
    ) -> Option<StoreChange> {
        let entry = self.entries.get_mut(endpoint)?;
        let mut updated = entry.info.clone();
        updated.application_state = state;
        updated.last_seen = now.max(entry.info.last_seen);
        Self::replace(entry, updated)
    }

    /// Stop tracking `endpoint`.
    pub fn remove(&mut self, endpoint: &EndpointName) -> Option<StoreChange> {
        self.entries
            .remove(endpoint)
            .map(|entry| StoreChange::Removed(entry.info))
    }

    fn replace(entry: &mut StoreEntry, updated: SecurityInfo) -> Option<StoreChange> {
        let declared_changed = updated.public_key != entry.info.public_key
            || updated.application_state != entry.info.application_state
            || updated.claim_capabilities != entry.info.claim_capabilities;

        let old = std::mem::replace(&mut entry.info, updated);
        if declared_changed {
            Some(StoreChange::StateChanged {
                old,
                new: entry.info.clone(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ClaimCapabilities;
    use ed25519_dalek::SigningKey;

    fn key(seed: u8) -> PublicKey {
        PublicKey::from_verifying_key(&SigningKey::from_bytes(&[seed; 32]).verifying_key())
    }

    fn declared(seed: u8, state: ApplicationState) -> DeclaredState {
        DeclaredState {
            public_key: key(seed),
            state,
            claim_capabilities: ClaimCapabilities::ECDHE_NULL,
        }
    }

    fn ep(name: &str) -> EndpointName {
        EndpointName::new(name)
    }

    #[test]
    fn test_found_creates_unknown_record_once() {
        let mut store = SecurityInfoStore::new();
        let (first, change) = store.insert_found(&ep(":1.1"), Timestamp::new(10));
        assert!(matches!(change, Some(StoreChange::Added(ref info))
            if info.application_state == ApplicationState::Unknown));

        let (second, change) = store.insert_found(&ep(":1.1"), Timestamp::new(20));
        assert_eq!(first, second);
        assert!(change.is_none());
        assert_eq!(store.get(&ep(":1.1")).unwrap().last_seen, Timestamp::new(20));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reinsert_after_remove_gets_new_occurrence() {
        let mut store = SecurityInfoStore::new();
        let (first, _) = store.insert_found(&ep(":1.1"), Timestamp::new(10));
        assert!(matches!(store.remove(&ep(":1.1")), Some(StoreChange::Removed(_))));
        let (second, _) = store.insert_found(&ep(":1.1"), Timestamp::new(11));
        assert!(second > first);
    }

    #[test]
    fn test_apply_declared_reports_change_only_when_fields_differ() {
        let mut store = SecurityInfoStore::new();
        store.insert_found(&ep(":1.1"), Timestamp::new(10));

        let change = store.apply_declared(
            &ep(":1.1"),
            &declared(1, ApplicationState::Claimable),
            Timestamp::new(11),
        );
        match change {
            Some(StoreChange::StateChanged { old, new }) => {
                assert_eq!(old.application_state, ApplicationState::Unknown);
                assert_eq!(new.application_state, ApplicationState::Claimable);
            }
            other => panic!("unexpected change: {other:?}"),
        }

        let repeat = store.apply_declared(
            &ep(":1.1"),
            &declared(1, ApplicationState::Claimable),
            Timestamp::new(12),
        );
        assert!(repeat.is_none());
        assert_eq!(store.get(&ep(":1.1")).unwrap().last_seen, Timestamp::new(12));
    }

    #[test]
    fn test_apply_declared_ignores_untracked() {
        let mut store = SecurityInfoStore::new();
        let change = store.apply_declared(
            &ep(":1.9"),
            &declared(1, ApplicationState::Claimable),
            Timestamp::new(1),
        );
        assert!(change.is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_find_by_public_key_prefers_freshest() {
        let mut store = SecurityInfoStore::new();
        store.insert_found(&ep(":1.1"), Timestamp::new(10));
        store.apply_declared(&ep(":1.1"), &declared(1, ApplicationState::Claimable), Timestamp::new(10));
        store.insert_found(&ep(":1.2"), Timestamp::new(30));
        store.apply_declared(&ep(":1.2"), &declared(1, ApplicationState::Claimable), Timestamp::new(30));

        let found = store.find_by_public_key(&key(1)).unwrap();
        assert_eq!(found.endpoint, ep(":1.2"));
        assert!(store.find_by_public_key(&key(2)).is_none());
    }

    #[test]
    fn test_set_state_and_snapshot() {
        let mut store = SecurityInfoStore::new();
        store.insert_found(&ep(":1.2"), Timestamp::new(1));
        store.insert_found(&ep(":1.1"), Timestamp::new(1));
        store.apply_declared(&ep(":1.1"), &declared(1, ApplicationState::Claimable), Timestamp::new(2));

        let change = store.set_state(&ep(":1.1"), ApplicationState::Claimed, Timestamp::new(3));
        assert!(matches!(change, Some(StoreChange::StateChanged { .. })));
        assert!(store.set_state(&ep(":9.9"), ApplicationState::Claimed, Timestamp::new(3)).is_none());

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].endpoint, ep(":1.1"));
        assert_eq!(snapshot[0].application_state, ApplicationState::Claimed);
    }
}
