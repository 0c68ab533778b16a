//! # Application Monitor
//!
//! Single consumer of the monitor event queue and single writer of the
//! Security Info Store.
//!
//! ```text
//! LivenessTracker ──Found/Lost──┐
//! MonitorHandle ──Advertisement─┼──→ [event queue] ──→ handle_event ──→ store ──→ outbox ──→ listeners
//! resolution task ──Resolved────┘
//! ```
//!
//! Events are handled strictly in queue order. Claim outcomes bypass the
//! queue but go through the same store lock and outbox, so listeners still
//! see one ordered stream per endpoint.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{
    ApplicationState, DeclaredState, EndpointName, Occurrence, PublicKey, SecurityAdvertisement,
    SecurityInfo, SecurityInfoStore, StoreChange, Timestamp,
};
use crate::error::ResolutionError;
use crate::ports::{PermissionManagement, SecurityInfoListener, SessionTransport, TimeSource};
use crate::service::listeners::{ListenerRegistry, NotificationOutbox};
use crate::service::liveness::{LivenessTracker, Presence};

/// Input of the monitor event loop.
#[derive(Debug)]
pub enum MonitorEvent {
    /// Endpoint became reachable
    Found(EndpointName),
    /// Endpoint stopped answering probes
    Lost(EndpointName),
    /// Raw security advertisement from the bus
    Advertisement(SecurityAdvertisement),
    /// Declared state fetched for one occurrence of an endpoint
    Resolved {
        endpoint: EndpointName,
        occurrence: Occurrence,
        result: Result<DeclaredState, ResolutionError>,
    },
    /// Acknowledged once every earlier event has been handled
    Flush(oneshot::Sender<()>),
}

/// Sending side of the monitor queue, for external signal sources.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    events: mpsc::Sender<MonitorEvent>,
}

impl MonitorHandle {
    pub fn new(events: mpsc::Sender<MonitorEvent>) -> Self {
        Self { events }
    }

    /// Queue a security advertisement. Returns `false` once the monitor has
    /// shut down.
    pub async fn submit_advertisement(&self, advertisement: SecurityAdvertisement) -> bool {
        self.events
            .send(MonitorEvent::Advertisement(advertisement))
            .await
            .is_ok()
    }

    /// Wait until every event queued before this call has been handled.
    ///
    /// Returns `false` if the monitor stopped first.
    pub async fn flush(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.events.send(MonitorEvent::Flush(tx)).await.is_err() {
            return false;
        }
        rx.await.is_ok()
    }
}

/// Tracks applications and fans out change notifications.
pub struct ApplicationMonitor {
    store: RwLock<SecurityInfoStore>,
    outbox: NotificationOutbox,
    liveness: Arc<LivenessTracker>,
    transport: Arc<dyn SessionTransport>,
    stub: Arc<dyn PermissionManagement>,
    time: Arc<dyn TimeSource>,
    events: mpsc::Sender<MonitorEvent>,
}

impl ApplicationMonitor {
    pub fn new(
        liveness: Arc<LivenessTracker>,
        transport: Arc<dyn SessionTransport>,
        stub: Arc<dyn PermissionManagement>,
        time: Arc<dyn TimeSource>,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            store: RwLock::new(SecurityInfoStore::new()),
            outbox: NotificationOutbox::new(Arc::new(ListenerRegistry::new())),
            liveness,
            transport,
            stub,
            time,
            events,
        }
    }

    // =========================================================================
    // QUERIES & LISTENERS
    // =========================================================================

    /// Subscribe `listener`. Returns `false` if it was already registered.
    pub fn register_listener(&self, listener: &Arc<dyn SecurityInfoListener>) -> bool {
        self.outbox.registry().register(listener)
    }

    /// Unsubscribe `listener`. Returns `false` if it was not registered.
    pub fn unregister_listener(&self, listener: &Arc<dyn SecurityInfoListener>) -> bool {
        self.outbox.registry().unregister(listener)
    }

    /// Point-in-time copy of every tracked application.
    pub fn get_applications(&self) -> Vec<SecurityInfo> {
        self.store.read().snapshot()
    }

    /// Application tracked under `endpoint`.
    pub fn get_application(&self, endpoint: &EndpointName) -> Option<SecurityInfo> {
        self.store.read().get(endpoint).cloned()
    }

    /// Most recently seen application known under `key`.
    pub fn find_by_public_key(&self, key: &PublicKey) -> Option<SecurityInfo> {
        self.store.read().find_by_public_key(key).cloned()
    }

    // =========================================================================
    // EVENT LOOP
    // =========================================================================

    /// Consume `events` until the queue closes or `shutdown` flips to `true`.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<MonitorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Some(event) => monitor.handle_event(event),
                        None => break,
                    },
                }
            }
            debug!("Application monitor stopped");
        })
    }

    /// Apply one event. Must run inside a tokio runtime (resolution tasks
    /// are spawned from here).
    pub fn handle_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Found(endpoint) => self.on_found(&endpoint),
            MonitorEvent::Lost(endpoint) => self.on_lost(&endpoint),
            MonitorEvent::Advertisement(advertisement) => self.on_advertisement(&advertisement),
            MonitorEvent::Resolved {
                endpoint,
                occurrence,
                result,
            } => self.on_resolved(&endpoint, occurrence, result),
            MonitorEvent::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn on_found(&self, endpoint: &EndpointName) {
        if endpoint.is_blank() {
            warn!("Ignoring found event without endpoint name");
            return;
        }

        let added = self.mutate(|store, now, changes| {
            let (occurrence, change) = store.insert_found(endpoint, now);
            change.map(|change| {
                changes.push(change);
                occurrence
            })
        });
        self.liveness.mark_present(endpoint);

        if let Some(occurrence) = added {
            info!(endpoint = %endpoint, "Application found");
            self.spawn_resolution(endpoint.clone(), occurrence);
        }
    }

    fn on_lost(&self, endpoint: &EndpointName) {
        // Revived by an advertisement queued ahead of this event
        if self.liveness.presence(endpoint) == Some(Presence::Alive) {
            debug!(endpoint = %endpoint, "Ignoring stale lost event");
            return;
        }

        let removed = self.mutate(|store, _, changes| match store.remove(endpoint) {
            Some(change) => {
                changes.push(change);
                true
            }
            None => false,
        });
        self.liveness.unwatch(endpoint);

        if removed {
            info!(endpoint = %endpoint, "Application lost");
        }
    }

    fn on_advertisement(&self, advertisement: &SecurityAdvertisement) {
        let (endpoint, declared) = match advertisement.validate() {
            Ok(valid) => valid,
            Err(err) => {
                warn!(
                    endpoint = %advertisement.endpoint,
                    error = %err,
                    "Discarding malformed security advertisement"
                );
                return;
            }
        };

        let implicit = self.mutate(|store, now, changes| {
            let (_, added) = store.insert_found(&endpoint, now);
            let implicit = added.is_some();
            changes.extend(added);
            changes.extend(store.apply_declared(&endpoint, &declared, now));
            implicit
        });
        self.liveness.mark_present(&endpoint);

        if implicit {
            info!(endpoint = %endpoint, state = %declared.state, "Application found by advertisement");
        } else {
            debug!(endpoint = %endpoint, state = %declared.state, "Security advertisement applied");
        }
    }

    fn on_resolved(
        &self,
        endpoint: &EndpointName,
        occurrence: Occurrence,
        result: Result<DeclaredState, ResolutionError>,
    ) {
        let declared = match result {
            Ok(declared) => declared,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "Could not resolve application state");
                return;
            }
        };

        let applied = self.mutate(|store, now, changes| {
            if store.occurrence(endpoint) != Some(occurrence) {
                return false;
            }
            // An advertisement already delivered fresher declared state
            if store.get(endpoint).is_some_and(|info| info.public_key.is_some()) {
                return false;
            }
            changes.extend(store.apply_declared(endpoint, &declared, now));
            true
        });

        if applied {
            debug!(endpoint = %endpoint, state = %declared.state, "Application state resolved");
        } else {
            debug!(
                endpoint = %endpoint,
                occurrence = occurrence.value(),
                "Discarding stale resolution"
            );
        }
    }

    fn spawn_resolution(&self, endpoint: EndpointName, occurrence: Occurrence) {
        let transport = Arc::clone(&self.transport);
        let stub = Arc::clone(&self.stub);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = resolve_declared_state(transport.as_ref(), stub.as_ref(), &endpoint).await;
            let event = MonitorEvent::Resolved {
                endpoint,
                occurrence,
                result,
            };
            if events.send(event).await.is_err() {
                debug!("Monitor queue closed before resolution completed");
            }
        });
    }

    // =========================================================================
    // CLAIM OUTCOMES
    // =========================================================================

    /// Record a committed claim. Returns the updated record, or `None` if
    /// the application is no longer tracked under `endpoint` with `key`.
    pub fn record_claim_committed(
        &self,
        endpoint: &EndpointName,
        key: &PublicKey,
    ) -> Option<SecurityInfo> {
        self.record_state(endpoint, key, ApplicationState::Claimed)
    }

    /// Record the state observed after a failed claim.
    ///
    /// A failed claim never leaves the record `Claimed`: an observed
    /// `Claimed` is stored as `NeedUpdate`. `Unknown` keeps the prior state.
    pub fn record_claim_failure(
        &self,
        endpoint: &EndpointName,
        key: &PublicKey,
        observed: ApplicationState,
    ) -> Option<SecurityInfo> {
        let state = match observed {
            ApplicationState::Unknown => return self.get_application(endpoint),
            ApplicationState::Claimed => ApplicationState::NeedUpdate,
            other => other,
        };
        self.record_state(endpoint, key, state)
    }

    fn record_state(
        &self,
        endpoint: &EndpointName,
        key: &PublicKey,
        state: ApplicationState,
    ) -> Option<SecurityInfo> {
        self.mutate(|store, now, changes| {
            if !store.get(endpoint)?.has_key(key) {
                return None;
            }
            changes.extend(store.set_state(endpoint, state, now));
            store.get(endpoint).cloned()
        })
    }

    /// Run `f` under the store lock, queue the changes it reports, then
    /// deliver them with the lock released.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut SecurityInfoStore, Timestamp, &mut Vec<StoreChange>) -> R,
    ) -> R {
        let now = self.time.now();
        let result = {
            let mut store = self.store.write();
            let mut changes = Vec::new();
            let result = f(&mut store, now, &mut changes);
            for change in changes {
                self.outbox.push(change);
            }
            result
        };
        self.outbox.drain();
        result
    }
}

/// Query a device for its declared state over a short-lived session.
async fn resolve_declared_state(
    transport: &dyn SessionTransport,
    stub: &dyn PermissionManagement,
    endpoint: &EndpointName,
) -> Result<DeclaredState, ResolutionError> {
    let session = transport.open_management_session(endpoint).await?;
    let result: Result<DeclaredState, ResolutionError> = async {
        let public_key = PublicKey::from_bytes(&stub.get_public_key(&session).await?)?;
        let state = stub.get_application_state(&session).await?;
        let claim_capabilities = stub.get_claim_capabilities(&session).await?;
        Ok(DeclaredState {
            public_key,
            state,
            claim_capabilities,
        })
    }
    .await;
    transport.close_session(session).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{public_key, FixedTimeSource, MockFabric, Notification, RecordingListener};

    struct Harness {
        fabric: Arc<MockFabric>,
        monitor: Arc<ApplicationMonitor>,
        liveness: Arc<LivenessTracker>,
        listener: Arc<RecordingListener>,
        events: mpsc::Receiver<MonitorEvent>,
    }

    fn harness() -> Harness {
        let fabric = MockFabric::new();
        let (tx, rx) = mpsc::channel(64);
        let liveness = Arc::new(LivenessTracker::new(fabric.clone(), tx.clone(), 1));
        let monitor = Arc::new(ApplicationMonitor::new(
            Arc::clone(&liveness),
            fabric.clone(),
            fabric.clone(),
            Arc::new(FixedTimeSource::new(100)),
            tx,
        ));
        let listener = Arc::new(RecordingListener::new());
        let as_listener: Arc<dyn SecurityInfoListener> = listener.clone();
        monitor.register_listener(&as_listener);
        Harness {
            fabric,
            monitor,
            liveness,
            listener,
            events: rx,
        }
    }

    fn ep(name: &str) -> EndpointName {
        EndpointName::new(name)
    }

    #[tokio::test]
    async fn test_advertisement_for_untracked_endpoint_is_implicit_found() {
        let h = harness();
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        let advertisement = h.fabric.advertisement(":1.1").unwrap();

        h.monitor.handle_event(MonitorEvent::Advertisement(advertisement));

        let seen = h.listener.notifications();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[0], Notification::Added(info)
            if info.application_state == ApplicationState::Unknown));
        assert!(matches!(&seen[1], Notification::StateChanged { new, .. }
            if new.application_state == ApplicationState::Claimable));
        assert_eq!(h.liveness.presence(&ep(":1.1")), Some(Presence::Alive));
    }

    #[tokio::test]
    async fn test_malformed_advertisement_is_discarded() {
        let h = harness();
        h.monitor.handle_event(MonitorEvent::Advertisement(SecurityAdvertisement {
            endpoint: ":1.1".into(),
            public_key: b"My Rubbish Key".to_vec(),
            state_code: 1,
            claim_capabilities: 1,
        }));
        h.monitor.handle_event(MonitorEvent::Advertisement(SecurityAdvertisement {
            endpoint: String::new(),
            public_key: public_key(1).as_bytes().to_vec(),
            state_code: 1,
            claim_capabilities: 1,
        }));

        assert!(h.monitor.get_applications().is_empty());
        assert!(h.listener.notifications().is_empty());
        assert_eq!(h.liveness.watched_count(), 0);
    }

    #[tokio::test]
    async fn test_found_resolves_declared_state() {
        let mut h = harness();
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);

        h.monitor.handle_event(MonitorEvent::Found(ep(":1.1")));
        assert_eq!(
            h.monitor.get_application(&ep(":1.1")).unwrap().application_state,
            ApplicationState::Unknown
        );

        let resolved = h.events.recv().await.unwrap();
        assert!(matches!(resolved, MonitorEvent::Resolved { .. }));
        h.monitor.handle_event(resolved);

        let info = h.monitor.get_application(&ep(":1.1")).unwrap();
        assert_eq!(info.application_state, ApplicationState::Claimable);
        assert_eq!(info.public_key, Some(public_key(1)));
        assert_eq!(h.fabric.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_stale_resolution_is_discarded() {
        let mut h = harness();
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);

        h.monitor.handle_event(MonitorEvent::Found(ep(":1.1")));
        let resolved = h.events.recv().await.unwrap();

        // Lost and found again before the resolution lands
        h.liveness.unwatch(&ep(":1.1"));
        h.monitor.handle_event(MonitorEvent::Lost(ep(":1.1")));
        h.monitor.handle_event(MonitorEvent::Found(ep(":1.1")));
        h.monitor.handle_event(resolved);

        assert_eq!(
            h.monitor.get_application(&ep(":1.1")).unwrap().application_state,
            ApplicationState::Unknown
        );
    }

    #[tokio::test]
    async fn test_lost_removes_and_unwatches() {
        let h = harness();
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        h.monitor
            .handle_event(MonitorEvent::Advertisement(h.fabric.advertisement(":1.1").unwrap()));

        h.fabric.set_reachable(":1.1", false);
        assert_eq!(h.liveness.run_probe_round().await, 1);
        let mut events = h.events;
        let lost = events.recv().await.unwrap();
        h.monitor.handle_event(lost);

        assert!(h.monitor.get_applications().is_empty());
        assert!(!h.liveness.is_watched(&ep(":1.1")));
        assert!(matches!(
            h.listener.notifications().last(),
            Some(Notification::Removed(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_claim_never_records_claimed() {
        let h = harness();
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        h.monitor
            .handle_event(MonitorEvent::Advertisement(h.fabric.advertisement(":1.1").unwrap()));

        let info = h
            .monitor
            .record_claim_failure(&ep(":1.1"), &public_key(1), ApplicationState::Claimed)
            .unwrap();
        assert_eq!(info.application_state, ApplicationState::NeedUpdate);

        // Wrong key: nothing recorded
        assert!(h
            .monitor
            .record_claim_committed(&ep(":1.1"), &public_key(2))
            .is_none());
    }
}
