//! # Liveness Tracker
//!
//! Pings every watched endpoint once per probe round and turns the results
//! into edge-triggered presence events on the monitor queue.
//!
//! ```text
//! [PENDING] ──reply──→ [ALIVE] ──max_missed_probes misses──→ [DEAD]
//!     │                   ↑                                     │
//!     │ (misses ignored)  └──────────────reply──────────────────┘
//! ```
//!
//! `Found` is sent on every transition into `Alive`, `Lost` on the
//! transition into `Dead`. An endpoint marked present by the monitor starts
//! in `Alive` without a `Found`, since the monitor already tracks it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::domain::EndpointName;
use crate::ports::PingProbe;
use crate::service::monitor::MonitorEvent;

/// Presence of one watched endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Watched, never answered
    Pending,
    Alive,
    /// Missed `max_missed_probes` consecutive probes
    Dead,
}

#[derive(Debug, Clone)]
struct WatchEntry {
    presence: Presence,
    missed: u32,
    generation: u64,
}

/// Edge produced by applying one probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Found,
    Lost,
}

/// Ping-based presence tracking for watched endpoints.
pub struct LivenessTracker {
    probe: Arc<dyn PingProbe>,
    events: mpsc::Sender<MonitorEvent>,
    watched: Mutex<HashMap<EndpointName, WatchEntry>>,
    next_generation: AtomicU64,
    max_missed_probes: u32,
}

impl LivenessTracker {
    pub fn new(
        probe: Arc<dyn PingProbe>,
        events: mpsc::Sender<MonitorEvent>,
        max_missed_probes: u32,
    ) -> Self {
        Self {
            probe,
            events,
            watched: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            max_missed_probes: max_missed_probes.max(1),
        }
    }

    /// Start watching `endpoint`. Idempotent.
    pub fn watch(&self, endpoint: &EndpointName) {
        self.insert(endpoint, Presence::Pending);
    }

    /// Watch `endpoint` as already present (it was just heard from).
    ///
    /// Resets the miss counter of an endpoint that is already watched.
    pub fn mark_present(&self, endpoint: &EndpointName) {
        self.insert(endpoint, Presence::Alive);
    }

    /// Stop watching `endpoint`. Safe for endpoints never watched.
    pub fn unwatch(&self, endpoint: &EndpointName) -> bool {
        let removed = self.watched.lock().remove(endpoint).is_some();
        if removed {
            trace!(endpoint = %endpoint, "Endpoint unwatched");
        }
        removed
    }

    /// `true` if `endpoint` is watched.
    pub fn is_watched(&self, endpoint: &EndpointName) -> bool {
        self.watched.lock().contains_key(endpoint)
    }

    /// Current presence of `endpoint`.
    pub fn presence(&self, endpoint: &EndpointName) -> Option<Presence> {
        self.watched.lock().get(endpoint).map(|entry| entry.presence)
    }

    /// Number of watched endpoints.
    pub fn watched_count(&self) -> usize {
        self.watched.lock().len()
    }

    fn insert(&self, endpoint: &EndpointName, presence: Presence) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut watched = self.watched.lock();
        match watched.get_mut(endpoint) {
            Some(entry) => {
                if presence == Presence::Alive {
                    entry.presence = Presence::Alive;
                    entry.missed = 0;
                }
            }
            None => {
                watched.insert(
                    endpoint.clone(),
                    WatchEntry {
                        presence,
                        missed: 0,
                        generation,
                    },
                );
                trace!(endpoint = %endpoint, ?presence, "Endpoint watched");
            }
        }
    }

    /// Probe every watched endpoint once and emit the resulting edges.
    ///
    /// Returns the number of events sent. Results for endpoints unwatched
    /// (or re-watched) while their ping was in flight are dropped.
    pub async fn run_probe_round(&self) -> usize {
        let targets: Vec<(EndpointName, u64)> = self
            .watched
            .lock()
            .iter()
            .map(|(endpoint, entry)| (endpoint.clone(), entry.generation))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let results = join_all(targets.iter().map(|(endpoint, _)| {
            let probe = Arc::clone(&self.probe);
            async move { probe.ping(endpoint).await }
        }))
        .await;

        let mut events = Vec::new();
        {
            let mut watched = self.watched.lock();
            for ((endpoint, generation), result) in targets.into_iter().zip(results) {
                let Some(entry) = watched.get_mut(&endpoint) else {
                    continue;
                };
                if entry.generation != generation {
                    continue;
                }
                if let Err(err) = &result {
                    trace!(endpoint = %endpoint, error = %err, "Probe missed");
                }
                match apply_probe(entry, result.is_ok(), self.max_missed_probes) {
                    Some(Edge::Found) => events.push(MonitorEvent::Found(endpoint)),
                    Some(Edge::Lost) => events.push(MonitorEvent::Lost(endpoint)),
                    None => {}
                }
            }
        }

        let mut sent = 0;
        for event in events {
            debug!(event = ?event, "Liveness edge");
            if self.events.send(event).await.is_err() {
                debug!("Monitor queue closed, dropping liveness events");
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Run probe rounds every `interval` until `shutdown` flips to `true`.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.run_probe_round().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Liveness probe loop stopped");
        })
    }
}

/// Pure transition for one probe result.
fn apply_probe(entry: &mut WatchEntry, answered: bool, max_missed: u32) -> Option<Edge> {
    if answered {
        entry.missed = 0;
        if entry.presence != Presence::Alive {
            entry.presence = Presence::Alive;
            return Some(Edge::Found);
        }
        return None;
    }

    match entry.presence {
        Presence::Alive => {
            entry.missed += 1;
            if entry.missed >= max_missed {
                entry.presence = Presence::Dead;
                return Some(Edge::Lost);
            }
            None
        }
        Presence::Pending | Presence::Dead => None,
    }
}
