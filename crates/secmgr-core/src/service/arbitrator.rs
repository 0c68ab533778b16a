//! # Claim Arbitrator
//!
//! Drives one claim attempt from validation to commit.
//!
//! 1. Validate the public key; look the target up by key (the endpoint the
//!    caller supplied may be stale).
//! 2. Take the lease for the key. Contention fails fast with
//!    `ClaimInProgress` and no remote traffic.
//! 3. Provision over one management session, bounded by `claim_timeout`.
//! 4. Commit through the monitor, or observe and record the device state
//!    after a failure. A timeout counts as a failure at the last step the
//!    attempt reached; it gets a short grace period to observe the device.
//!
//! The lease is an RAII guard held for the whole attempt, so every return
//! path (including timeout cancellation) releases it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{
    saturating_millis, AdminInput, ApplicationIdentity, ApplicationState, ClaimPayload,
    ClaimPhase, ClaimProgress, EndpointName, IdentityAssembler, LeaseKey, LeaseTable, PublicKey,
    SecurityInfo,
};
use crate::error::{ClaimError, ClaimResult};
use crate::ports::{CertificateAuthority, PermissionManagement, SessionHandle, SessionTransport};
use crate::service::monitor::ApplicationMonitor;

/// Claim behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub claim_timeout: Duration,
    pub reset_on_failed_claim: bool,
    pub warn_on_endpoint_mismatch: bool,
}

/// Time allowed to observe the device after a claim has timed out.
const TIMEOUT_OBSERVATION_GRACE: Duration = Duration::from_millis(500);

/// Provisioning step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
enum Step {
    #[default]
    OpenSession,
    AboutData,
    Issuance,
    Assembly,
    Claim,
    InstallPolicy,
}

#[derive(Debug)]
struct ProvisioningFailure {
    step: Step,
    error: ClaimError,
}

impl ProvisioningFailure {
    fn at(step: Step) -> impl FnOnce(ClaimError) -> Self {
        move |error| Self { step, error }
    }

    /// The device may already hold a root of trust from this attempt.
    fn claim_may_have_applied(&self) -> bool {
        self.step >= Step::Claim
    }

    /// State to record when the device cannot be observed afterwards.
    ///
    /// A rejected or unanswered `claim` keeps the prior state. A `claim`
    /// that was cut off by the deadline, or any later failure, may have
    /// left our root of trust on the device.
    fn unobserved_state(&self) -> Option<ApplicationState> {
        let timed_out = matches!(self.error, ClaimError::Timeout { .. });
        let claim_sent =
            self.step == Step::InstallPolicy || (timed_out && self.claim_may_have_applied());
        claim_sent.then_some(ApplicationState::NeedUpdate)
    }
}

/// Last step a provisioning attempt started. Outlives the attempt so a
/// timed out attempt can still be attributed.
#[derive(Debug, Default)]
struct StepMarker(Mutex<Step>);

impl StepMarker {
    fn reach(&self, step: Step) {
        *self.0.lock() = step;
    }

    fn get(&self) -> Step {
        *self.0.lock()
    }
}

/// Serializes and executes claim attempts.
pub struct ClaimArbitrator {
    monitor: Arc<ApplicationMonitor>,
    leases: Arc<LeaseTable>,
    transport: Arc<dyn SessionTransport>,
    stub: Arc<dyn PermissionManagement>,
    authority: Arc<dyn CertificateAuthority>,
    policy: ClaimPolicy,
}

impl ClaimArbitrator {
    pub fn new(
        monitor: Arc<ApplicationMonitor>,
        transport: Arc<dyn SessionTransport>,
        stub: Arc<dyn PermissionManagement>,
        authority: Arc<dyn CertificateAuthority>,
        policy: ClaimPolicy,
    ) -> Self {
        Self {
            monitor,
            leases: LeaseTable::new(),
            transport,
            stub,
            authority,
            policy,
        }
    }

    /// Live leases.
    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    /// Claim `target` with `input`.
    ///
    /// # Returns
    /// * The committed record (state `Claimed`)
    ///
    /// # Errors
    /// * `InvalidArgument` - malformed public key
    /// * `PeerUnreachable` - target not tracked, or gone before commit
    /// * `AlreadyClaimed` - target already claimed
    /// * `ClaimInProgress` - another claim holds the lease
    /// * `Timeout` - provisioning exceeded `claim_timeout`
    /// * provisioning errors (`NetworkError`, `RemoteRejected`,
    ///   `IncompleteIdentity`, `CertificateIssuance`)
    pub async fn claim(
        &self,
        target: &ApplicationIdentity,
        input: AdminInput,
    ) -> ClaimResult<SecurityInfo> {
        let mut progress = ClaimProgress::new();
        enter(&mut progress, ClaimPhase::Validating);

        let result = self.run(&mut progress, target, &input).await;
        if let Err(err) = &result {
            let phase = progress.phase();
            progress.abort();
            debug!(
                endpoint = %target.endpoint,
                phase = ?phase,
                error = %err,
                "Claim aborted"
            );
        }
        result
    }

    async fn run(
        &self,
        progress: &mut ClaimProgress,
        target: &ApplicationIdentity,
        input: &AdminInput,
    ) -> ClaimResult<SecurityInfo> {
        let key = PublicKey::from_bytes(&target.public_key)?;
        let info = self.check_claimable(&key)?;

        if info.endpoint != target.endpoint {
            if self.policy.warn_on_endpoint_mismatch {
                warn!(
                    requested = %target.endpoint,
                    resolved = %info.endpoint,
                    key = %key.fingerprint(),
                    "Claim target endpoint is stale, using the tracked one"
                );
            } else {
                debug!(
                    requested = %target.endpoint,
                    resolved = %info.endpoint,
                    "Re-resolved claim target endpoint"
                );
            }
        }

        let _lease = self
            .leases
            .try_acquire(LeaseKey::from(&key))
            .map_err(|_| ClaimError::ClaimInProgress)?;
        enter(progress, ClaimPhase::LeaseAcquired);

        // A racing claimer may have committed between the check and the lease
        let info = self.check_claimable(&key)?;
        let endpoint = info.endpoint;

        enter(progress, ClaimPhase::Provisioning);
        let started = Instant::now();
        let deadline = started + self.policy.claim_timeout;

        let reached = StepMarker::default();
        let attempt = self.provision(&endpoint, &key, input, &reached);
        // A cancelled attempt is dropped here, closing its session
        let outcome = tokio::time::timeout_at(deadline, attempt).await;
        match outcome {
            Err(_) => {
                let failure = ProvisioningFailure {
                    step: reached.get(),
                    error: ClaimError::Timeout {
                        elapsed_ms: saturating_millis(started.elapsed()),
                    },
                };
                warn!(
                    endpoint = %endpoint,
                    step = ?failure.step,
                    error = %failure.error,
                    "Claim timed out"
                );
                let grace = Instant::now() + TIMEOUT_OBSERVATION_GRACE;
                self.record_failure(&endpoint, &key, &failure, grace).await;
                Err(failure.error)
            }
            Ok(Err(failure)) => {
                warn!(
                    endpoint = %endpoint,
                    step = ?failure.step,
                    error = %failure.error,
                    "Claim provisioning failed"
                );
                self.record_failure(&endpoint, &key, &failure, deadline).await;
                Err(failure.error)
            }
            Ok(Ok(())) => {
                // Gone while provisioning: never report success for it
                let committed = self
                    .monitor
                    .record_claim_committed(&endpoint, &key)
                    .ok_or(ClaimError::PeerUnreachable)?;
                enter(progress, ClaimPhase::Committed);
                info!(
                    endpoint = %endpoint,
                    key = %key.fingerprint(),
                    elapsed_ms = saturating_millis(started.elapsed()),
                    "Application claimed"
                );
                Ok(committed)
            }
        }
    }

    fn check_claimable(&self, key: &PublicKey) -> ClaimResult<SecurityInfo> {
        let info = self
            .monitor
            .find_by_public_key(key)
            .ok_or(ClaimError::PeerUnreachable)?;
        if info.application_state.is_claimed() {
            return Err(ClaimError::AlreadyClaimed {
                endpoint: info.endpoint.to_string(),
            });
        }
        Ok(info)
    }

    async fn provision(
        &self,
        endpoint: &EndpointName,
        key: &PublicKey,
        input: &AdminInput,
        reached: &StepMarker,
    ) -> Result<(), ProvisioningFailure> {
        reached.reach(Step::OpenSession);
        let session = self
            .transport
            .open_management_session(endpoint)
            .await
            .map_err(ClaimError::from)
            .map_err(ProvisioningFailure::at(Step::OpenSession))?;
        let session = SessionGuard::new(Arc::clone(&self.transport), session);

        let result = self
            .provision_over(session.handle(), key, input, reached)
            .await;
        session.close().await;
        result
    }

    async fn provision_over(
        &self,
        session: &SessionHandle,
        key: &PublicKey,
        input: &AdminInput,
        reached: &StepMarker,
    ) -> Result<(), ProvisioningFailure> {
        reached.reach(Step::AboutData);
        let about_data = self
            .stub
            .get_about_data(session)
            .await
            .map_err(|err| ClaimError::from_remote("get_about_data", err))
            .map_err(ProvisioningFailure::at(Step::AboutData))?;

        reached.reach(Step::Issuance);
        let certificate = self
            .authority
            .issue_identity_certificate(key, &input.user_input)
            .map_err(ClaimError::from)
            .map_err(ProvisioningFailure::at(Step::Issuance))?;

        reached.reach(Step::Assembly);
        let identity = IdentityAssembler::assemble(
            key,
            Some(certificate),
            Some(about_data),
            input.user_input.clone(),
            input.claim_data.clone(),
        )
        .map_err(ClaimError::from)
        .map_err(ProvisioningFailure::at(Step::Assembly))?;

        let payload = ClaimPayload::new(self.authority.authority_key(), input, &identity);
        reached.reach(Step::Claim);
        self.stub
            .claim(session, &payload)
            .await
            .map_err(|err| ClaimError::from_remote("claim", err))
            .map_err(ProvisioningFailure::at(Step::Claim))?;

        reached.reach(Step::InstallPolicy);
        self.stub
            .install_policy(session, &input.policy)
            .await
            .map_err(|err| ClaimError::from_remote("install_policy", err))
            .map_err(ProvisioningFailure::at(Step::InstallPolicy))?;

        Ok(())
    }

    /// Observe the device after a failed step and record what it reports.
    ///
    /// Bounded by `deadline`. Without an observation the prior state is
    /// kept unless the claim may have applied (`NeedUpdate`).
    async fn record_failure(
        &self,
        endpoint: &EndpointName,
        key: &PublicKey,
        failure: &ProvisioningFailure,
        deadline: Instant,
    ) {
        let reset = self.policy.reset_on_failed_claim && failure.claim_may_have_applied();
        let observed = tokio::time::timeout_at(deadline, self.observe(endpoint, reset))
            .await
            .ok()
            .flatten();

        let state = match observed.or_else(|| failure.unobserved_state()) {
            Some(state) => state,
            None => {
                debug!(endpoint = %endpoint, "Device state unobservable, keeping prior state");
                return;
            }
        };

        if let Some(info) = self.monitor.record_claim_failure(endpoint, key, state) {
            debug!(
                endpoint = %endpoint,
                state = %info.application_state,
                "Recorded device state after failed claim"
            );
        }
    }

    async fn observe(&self, endpoint: &EndpointName, reset: bool) -> Option<ApplicationState> {
        let session = match self.transport.open_management_session(endpoint).await {
            Ok(session) => session,
            Err(err) => {
                debug!(endpoint = %endpoint, error = %err, "Could not reopen session");
                return None;
            }
        };

        let session = SessionGuard::new(Arc::clone(&self.transport), session);

        if reset {
            match self.stub.reset(session.handle()).await {
                Ok(()) => info!(endpoint = %endpoint, "Device reset after failed claim"),
                Err(err) => warn!(endpoint = %endpoint, error = %err, "Device reset failed"),
            }
        }

        let state = self.stub.get_application_state(session.handle()).await.ok();
        session.close().await;
        state
    }
}

/// Open management session that is closed even if the future using it is
/// dropped (timeout).
struct SessionGuard {
    transport: Arc<dyn SessionTransport>,
    session: SessionHandle,
    closed: bool,
}

impl SessionGuard {
    fn new(transport: Arc<dyn SessionTransport>, session: SessionHandle) -> Self {
        Self {
            transport,
            session,
            closed: false,
        }
    }

    fn handle(&self) -> &SessionHandle {
        &self.session
    }

    async fn close(mut self) {
        self.closed = true;
        self.transport.close_session(self.session.clone()).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            let session = self.session.clone();
            runtime.spawn(async move { transport.close_session(session).await });
        }
    }
}

fn enter(progress: &mut ClaimProgress, phase: ClaimPhase) {
    if let Err(err) = progress.advance(phase) {
        tracing::error!(error = %err, "Claim lifecycle violated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SecurityAdvertisement, UserInput};
    use crate::service::liveness::LivenessTracker;
    use crate::service::monitor::MonitorEvent;
    use crate::testing::{
        admin_group, key_bytes, FixedTimeSource, MockFabric, Operation, StaticCertificateAuthority,
    };
    use tokio::sync::mpsc;

    struct Harness {
        fabric: Arc<MockFabric>,
        authority: Arc<StaticCertificateAuthority>,
        liveness: Arc<LivenessTracker>,
        monitor: Arc<ApplicationMonitor>,
        arbitrator: ClaimArbitrator,
        _events: mpsc::Receiver<MonitorEvent>,
    }

    fn harness(policy: ClaimPolicy) -> Harness {
        let fabric = MockFabric::new();
        let authority = Arc::new(StaticCertificateAuthority::new(200));
        let (tx, rx) = mpsc::channel(64);
        let liveness = Arc::new(LivenessTracker::new(fabric.clone(), tx.clone(), 3));
        let monitor = Arc::new(ApplicationMonitor::new(
            Arc::clone(&liveness),
            fabric.clone(),
            fabric.clone(),
            Arc::new(FixedTimeSource::new(10)),
            tx,
        ));
        let arbitrator = ClaimArbitrator::new(
            Arc::clone(&monitor),
            fabric.clone(),
            fabric.clone(),
            authority.clone(),
            policy,
        );
        Harness {
            fabric,
            authority,
            liveness,
            monitor,
            arbitrator,
            _events: rx,
        }
    }

    fn policy() -> ClaimPolicy {
        ClaimPolicy {
            claim_timeout: Duration::from_secs(5),
            reset_on_failed_claim: false,
            warn_on_endpoint_mismatch: false,
        }
    }

    fn advertise(h: &Harness, endpoint: &str) {
        let advertisement: SecurityAdvertisement = h.fabric.advertisement(endpoint).unwrap();
        h.monitor.handle_event(MonitorEvent::Advertisement(advertisement));
    }

    fn input() -> AdminInput {
        AdminInput::new(admin_group(50)).with_user_input(UserInput::named("Kitchen"))
    }

    #[tokio::test]
    async fn test_successful_claim_commits() {
        let h = harness(policy());
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");

        let info = h
            .arbitrator
            .claim(&ApplicationIdentity::new(":1.1", key_bytes(1)), input())
            .await
            .unwrap();

        assert_eq!(info.application_state, ApplicationState::Claimed);
        assert_eq!(h.fabric.device_state(":1.1"), Some(ApplicationState::Claimed));
        assert_eq!(
            h.fabric.root_of_trust(":1.1"),
            Some(h.authority.authority_key())
        );
        assert_eq!(h.authority.issued(), 1);
        assert_eq!(h.fabric.open_sessions(), 0);
        assert_eq!(h.arbitrator.leases().active_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_claim_records_observed_state() {
        let h = harness(policy());
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");
        h.fabric.inject_fault(
            ":1.1",
            Operation::InstallPolicy,
            crate::testing::Fault::Reject("POLICY_INVALID".into()),
        );

        let err = h
            .arbitrator
            .claim(&ApplicationIdentity::new(":1.1", key_bytes(1)), input())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClaimError::RemoteRejected {
                operation: "install_policy",
                ..
            }
        ));
        // Device reports Claimed; locally that is NeedUpdate
        let info = h.monitor.get_application(&":1.1".into()).unwrap();
        assert_eq!(info.application_state, ApplicationState::NeedUpdate);
    }

    #[tokio::test]
    async fn test_reset_on_failed_claim() {
        let h = harness(ClaimPolicy {
            reset_on_failed_claim: true,
            ..policy()
        });
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");
        h.fabric.inject_fault(
            ":1.1",
            Operation::InstallPolicy,
            crate::testing::Fault::DropSession,
        );

        let err = h
            .arbitrator
            .claim(&ApplicationIdentity::new(":1.1", key_bytes(1)), input())
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::NetworkError { .. }));
        assert_eq!(h.fabric.call_count(Operation::Reset), 1);
        assert_eq!(h.fabric.device_state(":1.1"), Some(ApplicationState::Claimable));
        assert_eq!(
            h.monitor
                .get_application(&":1.1".into())
                .unwrap()
                .application_state,
            ApplicationState::Claimable
        );
    }

    #[tokio::test]
    async fn test_issuance_refused() {
        let h = harness(policy());
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");
        h.authority.refuse(Some("quota exceeded"));

        let err = h
            .arbitrator
            .claim(&ApplicationIdentity::new(":1.1", key_bytes(1)), input())
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::CertificateIssuance { .. }));
        assert_eq!(h.fabric.call_count(Operation::Claim), 0);
        assert_eq!(h.fabric.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_lease_contention_is_claim_in_progress() {
        let h = harness(policy());
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");

        let held = h
            .arbitrator
            .leases()
            .try_acquire(LeaseKey::from(&crate::testing::public_key(1)))
            .unwrap();
        let err = h
            .arbitrator
            .claim(&ApplicationIdentity::new(":1.1", key_bytes(1)), input())
            .await
            .unwrap_err();

        assert_eq!(err, ClaimError::ClaimInProgress);
        assert!(h.fabric.calls().is_empty());
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_claim_step_records_need_update() {
        let h = harness(policy());
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");
        h.fabric.set_delay(":1.1", Operation::InstallPolicy, Duration::from_secs(60));

        let err = h
            .arbitrator
            .claim(&ApplicationIdentity::new(":1.1", key_bytes(1)), input())
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::Timeout { .. }));
        // The device took our root of trust before the deadline hit
        assert_eq!(h.fabric.device_state(":1.1"), Some(ApplicationState::Claimed));
        let info = h.monitor.get_application(&":1.1".into()).unwrap();
        assert_eq!(info.application_state, ApplicationState::NeedUpdate);
        assert_eq!(h.arbitrator.leases().active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_claim_step_resets_when_enabled() {
        let h = harness(ClaimPolicy {
            reset_on_failed_claim: true,
            ..policy()
        });
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");
        h.fabric.set_delay(":1.1", Operation::InstallPolicy, Duration::from_secs(60));

        let err = h
            .arbitrator
            .claim(&ApplicationIdentity::new(":1.1", key_bytes(1)), input())
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::Timeout { .. }));
        assert_eq!(h.fabric.call_count(Operation::Reset), 1);
        assert_eq!(h.fabric.root_of_trust(":1.1"), None);
        let info = h.monitor.get_application(&":1.1".into()).unwrap();
        assert_eq!(info.application_state, ApplicationState::Claimable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_unobservable_device_after_claim_step() {
        let h = harness(policy());
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");
        h.fabric.set_delay(":1.1", Operation::InstallPolicy, Duration::from_secs(60));
        h.fabric.set_delay(":1.1", Operation::GetApplicationState, Duration::from_secs(60));

        let err = h
            .arbitrator
            .claim(&ApplicationIdentity::new(":1.1", key_bytes(1)), input())
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::Timeout { .. }));
        let info = h.monitor.get_application(&":1.1".into()).unwrap();
        assert_eq!(info.application_state, ApplicationState::NeedUpdate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_before_claim_step_keeps_prior_state() {
        let h = harness(ClaimPolicy {
            reset_on_failed_claim: true,
            ..policy()
        });
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");
        h.fabric.set_delay(":1.1", Operation::GetAboutData, Duration::from_secs(60));

        let err = h
            .arbitrator
            .claim(&ApplicationIdentity::new(":1.1", key_bytes(1)), input())
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::Timeout { .. }));
        assert_eq!(h.fabric.call_count(Operation::Claim), 0);
        assert_eq!(h.fabric.call_count(Operation::Reset), 0);
        let info = h.monitor.get_application(&":1.1".into()).unwrap();
        assert_eq!(info.application_state, ApplicationState::Claimable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_lost_during_provisioning_is_unreachable() {
        let h = harness(policy());
        h.fabric.add_device(":1.1", 1, ApplicationState::Claimable);
        advertise(&h, ":1.1");
        h.fabric.set_delay(":1.1", Operation::Claim, Duration::from_millis(500));

        let target = ApplicationIdentity::new(":1.1", key_bytes(1));
        let lose = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let endpoint = EndpointName::new(":1.1");
            h.liveness.unwatch(&endpoint);
            h.monitor.handle_event(MonitorEvent::Lost(endpoint));
        };
        let (result, ()) = tokio::join!(h.arbitrator.claim(&target, input()), lose);

        assert_eq!(result.unwrap_err(), ClaimError::PeerUnreachable);
        assert!(h.monitor.get_application(&":1.1".into()).is_none());
        assert_eq!(h.arbitrator.leases().active_count(), 0);
        assert_eq!(h.fabric.open_sessions(), 0);
    }
}
