//! # Claim Leases
//!
//! Process-wide mutual exclusion for claim attempts.
//!
//! A `LeaseTable` is an arena of slots indexed by the target's public key.
//! Endpoint names are ephemeral, so they never key a lease.
//! `try_acquire` either creates the slot and hands back a `ClaimLease`
//! guard, or fails immediately if the slot is taken. Dropping the guard
//! frees the slot, so every exit path of a claim (early return, error,
//! timeout cancellation, panic) releases its lease.
//!
//! Each slot records an ownership token. A guard only frees the slot that
//! carries its own token.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

use crate::domain::{saturating_millis, PublicKey};

/// Lease key: raw bytes of a validated public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey([u8; 32]);

impl From<&PublicKey> for LeaseKey {
    fn from(key: &PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{}", hex::encode(&self.0[..6]))
    }
}

/// Lease acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    #[error("lease for {0} is already held")]
    Held(LeaseKey),
}

#[derive(Debug)]
struct LeaseSlot {
    token: u64,
    acquired_at: Instant,
}

/// Arena of live claim leases.
#[derive(Debug, Default)]
pub struct LeaseTable {
    slots: Mutex<HashMap<LeaseKey, LeaseSlot>>,
    next_token: AtomicU64,
}

impl LeaseTable {
    /// Create an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lease for `key`, or fail without side effects if it is held.
    pub fn try_acquire(self: &Arc<Self>, key: LeaseKey) -> Result<ClaimLease, LeaseError> {
        let mut slots = self.slots.lock();
        if slots.contains_key(&key) {
            return Err(LeaseError::Held(key));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        slots.insert(
            key.clone(),
            LeaseSlot {
                token,
                acquired_at: Instant::now(),
            },
        );
        drop(slots);

        Ok(ClaimLease {
            table: Arc::clone(self),
            key,
            token,
        })
    }

    /// `true` if a live lease exists for `key`.
    pub fn is_held(&self, key: &LeaseKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of live leases.
    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn release(&self, key: &LeaseKey, token: u64) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|slot| slot.token == token) {
            if let Some(slot) = slots.remove(key) {
                tracing::trace!(
                    lease = %key,
                    held_ms = saturating_millis(slot.acquired_at.elapsed()),
                    "Claim lease released"
                );
            }
        }
    }
}

/// Scoped ownership of one lease slot. Releases on drop.
#[derive(Debug)]
#[must_use = "dropping the lease releases it immediately"]
pub struct ClaimLease {
    table: Arc<LeaseTable>,
    key: LeaseKey,
    token: u64,
}

impl ClaimLease {
    /// Key this lease protects.
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    /// Ownership token of this lease.
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for ClaimLease {
    fn drop(&mut self) {
        self.table.release(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    fn key(byte: u8) -> LeaseKey {
        LeaseKey([byte; 32])
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let table = LeaseTable::new();
        let lease = table.try_acquire(key(1)).unwrap();
        assert_eq!(table.try_acquire(key(1)).unwrap_err(), LeaseError::Held(key(1)));

        // Other keys are independent
        let other = table.try_acquire(key(2)).unwrap();
        assert_eq!(table.active_count(), 2);

        drop(lease);
        drop(other);
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn test_drop_releases_lease() {
        let table = LeaseTable::new();
        {
            let _lease = table.try_acquire(key(1)).unwrap();
            assert!(table.is_held(&key(1)));
        }
        assert!(!table.is_held(&key(1)));
        assert!(table.try_acquire(key(1)).is_ok());
    }

    #[test]
    fn test_panic_releases_lease() {
        let table = LeaseTable::new();
        let cloned = Arc::clone(&table);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _lease = cloned.try_acquire(key(3)).unwrap();
            panic!("provisioning blew up");
        }));
        assert!(result.is_err());
        assert!(!table.is_held(&key(3)));
    }

    #[test]
    fn test_tokens_are_unique() {
        let table = LeaseTable::new();
        let first = table.try_acquire(key(1)).unwrap();
        let first_token = first.token();
        drop(first);
        let second = table.try_acquire(key(1)).unwrap();
        assert_ne!(first_token, second.token());
    }

    #[test]
    fn test_concurrent_acquire_has_single_winner() {
        const THREADS: usize = 16;
        let table = LeaseTable::new();
        let winners = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(THREADS));
        let hold = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let table = Arc::clone(&table);
                let winners = Arc::clone(&winners);
                let start = Arc::clone(&start);
                let hold = Arc::clone(&hold);
                thread::spawn(move || {
                    start.wait();
                    let lease = table.try_acquire(key(9));
                    if lease.is_ok() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    // Keep the winner's lease alive until everyone has tried
                    hold.wait();
                    drop(lease);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn test_lease_key_display() {
        assert_eq!(key(4).to_string(), "key:040404040404");
    }
}
