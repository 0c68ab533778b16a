//! # Security Manager Facade
//!
//! Public entry point. Owns the monitor, the liveness tracker, the claim
//! arbitrator and the background tasks, all built from one explicit
//! `SecurityContext`.
//!
//! ```rust,ignore
//! let manager = SecurityManager::new(SecurityManagerConfig::from_env(), context)?;
//! manager.start();
//! manager.register_listener(listener);
//!
//! let info = manager.claim_application(&target, AdminInput::new(group)).await?;
//!
//! manager.shutdown().await;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::adapters::SystemTimeSource;
use crate::config::SecurityManagerConfig;
use crate::domain::{
    saturating_millis, AdminInput, ApplicationIdentity, EndpointName, PublicKey, SecurityInfo,
};
use crate::error::{ClaimResult, ConfigError};
use crate::ports::{
    CertificateAuthority, PermissionManagement, PingProbe, SecurityInfoListener,
    SecurityManagerApi, SessionTransport, TimeSource,
};
use crate::service::arbitrator::{ClaimArbitrator, ClaimPolicy};
use crate::service::liveness::LivenessTracker;
use crate::service::monitor::{ApplicationMonitor, MonitorEvent, MonitorHandle};

/// Every external collaborator of one security manager.
#[derive(Clone)]
pub struct SecurityContext {
    pub probe: Arc<dyn PingProbe>,
    pub transport: Arc<dyn SessionTransport>,
    pub permission_management: Arc<dyn PermissionManagement>,
    pub certificate_authority: Arc<dyn CertificateAuthority>,
    pub time: Arc<dyn TimeSource>,
}

impl SecurityContext {
    /// Context using the system clock.
    pub fn new(
        probe: Arc<dyn PingProbe>,
        transport: Arc<dyn SessionTransport>,
        permission_management: Arc<dyn PermissionManagement>,
        certificate_authority: Arc<dyn CertificateAuthority>,
    ) -> Self {
        Self {
            probe,
            transport,
            permission_management,
            certificate_authority,
            time: Arc::new(SystemTimeSource),
        }
    }

    /// Replace the clock.
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }
}

/// Security manager instance.
pub struct SecurityManager {
    config: SecurityManagerConfig,
    monitor: Arc<ApplicationMonitor>,
    liveness: Arc<LivenessTracker>,
    arbitrator: ClaimArbitrator,
    handle: MonitorHandle,
    pending_events: Mutex<Option<mpsc::Receiver<MonitorEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SecurityManager {
    /// Build a manager. Nothing runs until `start`.
    pub fn new(
        config: SecurityManagerConfig,
        context: SecurityContext,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity);
        let liveness = Arc::new(LivenessTracker::new(
            context.probe,
            events_tx.clone(),
            config.max_missed_probes,
        ));
        let monitor = Arc::new(ApplicationMonitor::new(
            Arc::clone(&liveness),
            Arc::clone(&context.transport),
            Arc::clone(&context.permission_management),
            context.time,
            events_tx.clone(),
        ));
        let arbitrator = ClaimArbitrator::new(
            Arc::clone(&monitor),
            context.transport,
            context.permission_management,
            context.certificate_authority,
            ClaimPolicy {
                claim_timeout: config.claim_timeout,
                reset_on_failed_claim: config.reset_on_failed_claim,
                warn_on_endpoint_mismatch: config.warn_on_endpoint_mismatch,
            },
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            monitor,
            liveness,
            arbitrator,
            handle: MonitorHandle::new(events_tx),
            pending_events: Mutex::new(Some(events_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SecurityManagerConfig {
        &self.config
    }

    /// Spawn the monitor loop and the probe loop.
    ///
    /// Returns `false` if the manager was already started. Must be called
    /// inside a tokio runtime.
    pub fn start(&self) -> bool {
        let Some(events) = self.pending_events.lock().take() else {
            return false;
        };

        let monitor_task = self
            .monitor
            .spawn_event_loop(events, self.shutdown.subscribe());
        let probe_task = self
            .liveness
            .spawn_probe_loop(self.config.probe_interval, self.shutdown.subscribe());
        self.tasks.lock().extend([monitor_task, probe_task]);

        info!(
            probe_interval_ms = saturating_millis(self.config.probe_interval),
            claim_timeout_ms = saturating_millis(self.config.claim_timeout),
            "Security manager started"
        );
        true
    }

    /// Stop the background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                debug!(error = %err, "Background task ended abnormally");
            }
        }
        info!("Security manager stopped");
    }

    /// Sender for advertisements from the external signal source.
    pub fn monitor_handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// Track an endpoint found by external discovery. Idempotent.
    ///
    /// The application is reported once it answers a probe.
    pub fn watch_application(&self, endpoint: impl Into<EndpointName>) {
        let endpoint = endpoint.into();
        if endpoint.is_blank() {
            return;
        }
        self.liveness.watch(&endpoint);
    }

    /// Run one probe round now instead of waiting for the next tick.
    pub async fn probe_now(&self) -> usize {
        self.liveness.run_probe_round().await
    }

    /// Number of claims currently holding a lease.
    pub fn claims_in_progress(&self) -> usize {
        self.arbitrator.leases().active_count()
    }
}

impl Drop for SecurityManager {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl SecurityManagerApi for SecurityManager {
    async fn claim_application(
        &self,
        target: &ApplicationIdentity,
        input: AdminInput,
    ) -> ClaimResult<SecurityInfo> {
        self.arbitrator.claim(target, input).await
    }

    fn get_applications(&self) -> Vec<SecurityInfo> {
        self.monitor.get_applications()
    }

    fn get_application_by_key(&self, key: &PublicKey) -> Option<SecurityInfo> {
        self.monitor.find_by_public_key(key)
    }

    fn get_application_by_endpoint(&self, endpoint: &EndpointName) -> Option<SecurityInfo> {
        self.monitor.get_application(endpoint)
    }

    fn register_listener(&self, listener: Arc<dyn SecurityInfoListener>) {
        if !self.monitor.register_listener(&listener) {
            debug!("Listener already registered");
        }
    }

    fn unregister_listener(&self, listener: &Arc<dyn SecurityInfoListener>) {
        if !self.monitor.unregister_listener(listener) {
            debug!("Listener was not registered");
        }
    }
}
