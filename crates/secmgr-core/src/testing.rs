//! Test doubles for the security manager ports.
//!
//! Only available with the `test-utils` feature (or inside this crate's own
//! tests).
//!
//! `MockFabric` simulates a bus with devices on it and implements every
//! device-facing port: `PingProbe`, `SessionTransport` and
//! `PermissionManagement`. Devices enforce a single claim window, so two
//! security managers sharing one fabric race exactly like real ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::{
    AboutData, AdminGroup, ApplicationState, ClaimCapabilities, ClaimPayload, EndpointName,
    IdentityCertificate, PermissionPolicy, PublicKey, SecurityAdvertisement, SecurityInfo,
    Timestamp, UserInput,
};
use crate::ports::{
    CertificateAuthority, IssuanceError, PermissionManagement, PingProbe, ProbeError,
    RemoteCallError, SecurityInfoListener, SessionHandle, SessionTransport, TimeSource,
    TransportError,
};

// =============================================================================
// KEYS & TIME
// =============================================================================

/// Deterministic signing key derived from `seed`.
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Public key of `signing_key(seed)`.
pub fn public_key(seed: u8) -> PublicKey {
    PublicKey::from_verifying_key(&signing_key(seed).verifying_key())
}

/// Raw bytes of `public_key(seed)`.
pub fn key_bytes(seed: u8) -> Vec<u8> {
    public_key(seed).as_bytes().to_vec()
}

/// Admin group with a deterministic id and authority key.
pub fn admin_group(seed: u8) -> AdminGroup {
    AdminGroup {
        id: Uuid::from_u128(u128::from(seed)),
        authority: public_key(seed),
    }
}

/// Settable clock.
#[derive(Debug, Default)]
pub struct FixedTimeSource(AtomicU64);

impl FixedTimeSource {
    pub fn new(secs: u64) -> Self {
        Self(AtomicU64::new(secs))
    }

    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl TimeSource for FixedTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.0.load(Ordering::SeqCst))
    }
}

// =============================================================================
// MOCK FABRIC
// =============================================================================

/// Remote operations the fabric can fail or delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    OpenSession,
    GetPublicKey,
    GetApplicationState,
    GetClaimCapabilities,
    GetAboutData,
    Claim,
    InstallPolicy,
    Reset,
}

/// Injected failure for one operation on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The device answers with a non-success status
    Reject(String),
    /// The session drops before the device acts
    DropSession,
    /// The device acts, then the reply is lost
    LoseReply,
    /// The transport reports the peer gone (session opening only)
    Unreachable,
}

/// One remote call as seen by the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub endpoint: EndpointName,
    pub operation: Operation,
}

#[derive(Debug, Clone)]
struct Device {
    signing_key: SigningKey,
    state: ApplicationState,
    capabilities: ClaimCapabilities,
    about: AboutData,
    reachable: bool,
    root_of_trust: Option<PublicKey>,
    policy: Option<PermissionPolicy>,
    claims_accepted: u32,
}

/// Simulated bus with devices.
#[derive(Default)]
pub struct MockFabric {
    devices: Mutex<HashMap<EndpointName, Device>>,
    sessions: Mutex<HashMap<u32, EndpointName>>,
    next_session: AtomicU32,
    faults: Mutex<HashMap<(EndpointName, Operation), Fault>>,
    delays: Mutex<HashMap<(EndpointName, Operation), Duration>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl MockFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put a reachable device with key `public_key(seed)` on the bus.
    pub fn add_device(&self, endpoint: &str, seed: u8, state: ApplicationState) {
        let signing_key = signing_key(seed);
        let about = AboutData {
            app_id: Uuid::from_u128(u128::from(seed) << 64),
            app_name: format!("app-{seed}"),
            device_name: format!("device-{seed}"),
            manufacturer: "Acme".into(),
            model_number: "M1".into(),
            ..AboutData::default()
        };
        self.devices.lock().insert(
            EndpointName::new(endpoint),
            Device {
                signing_key,
                state,
                capabilities: ClaimCapabilities::ECDHE_NULL | ClaimCapabilities::ECDHE_PSK,
                about,
                reachable: true,
                root_of_trust: None,
                policy: None,
                claims_accepted: 0,
            },
        );
    }

    /// Take a device off the bus.
    pub fn remove_device(&self, endpoint: &str) -> bool {
        self.devices.lock().remove(&EndpointName::new(endpoint)).is_some()
    }

    /// Restart a device under a new endpoint name, keeping its key and state.
    pub fn move_device(&self, from: &str, to: &str) -> bool {
        let mut devices = self.devices.lock();
        match devices.remove(&EndpointName::new(from)) {
            Some(device) => {
                devices.insert(EndpointName::new(to), device);
                true
            }
            None => false,
        }
    }

    /// Make a device stop (or resume) answering pings and sessions.
    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        if let Some(device) = self.devices.lock().get_mut(&EndpointName::new(endpoint)) {
            device.reachable = reachable;
        }
    }

    /// Device-side state.
    pub fn device_state(&self, endpoint: &str) -> Option<ApplicationState> {
        self.devices
            .lock()
            .get(&EndpointName::new(endpoint))
            .map(|device| device.state)
    }

    /// Root of trust installed on the device.
    pub fn root_of_trust(&self, endpoint: &str) -> Option<PublicKey> {
        self.devices
            .lock()
            .get(&EndpointName::new(endpoint))
            .and_then(|device| device.root_of_trust)
    }

    /// Number of claims the device accepted.
    pub fn claims_accepted(&self, endpoint: &str) -> u32 {
        self.devices
            .lock()
            .get(&EndpointName::new(endpoint))
            .map_or(0, |device| device.claims_accepted)
    }

    /// Current advertisement of a device.
    pub fn advertisement(&self, endpoint: &str) -> Option<SecurityAdvertisement> {
        self.devices
            .lock()
            .get(&EndpointName::new(endpoint))
            .map(|device| SecurityAdvertisement {
                endpoint: endpoint.to_string(),
                public_key: device.signing_key.verifying_key().to_bytes().to_vec(),
                state_code: device.state.code().unwrap_or(0),
                claim_capabilities: device.capabilities.bits(),
            })
    }

    /// Fail `operation` on `endpoint` until cleared.
    pub fn inject_fault(&self, endpoint: &str, operation: Operation, fault: Fault) {
        self.faults
            .lock()
            .insert((EndpointName::new(endpoint), operation), fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Delay `operation` on `endpoint` before the device acts.
    pub fn set_delay(&self, endpoint: &str, operation: Operation, delay: Duration) {
        self.delays
            .lock()
            .insert((EndpointName::new(endpoint), operation), delay);
    }

    /// Every remote call made so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Number of calls of `operation`.
    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// Sessions opened and not closed.
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    async fn enter(&self, endpoint: &EndpointName, operation: Operation) -> Option<Fault> {
        self.calls.lock().push(RemoteCall {
            endpoint: endpoint.clone(),
            operation,
        });
        let delay = self
            .delays
            .lock()
            .get(&(endpoint.clone(), operation))
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.faults
            .lock()
            .get(&(endpoint.clone(), operation))
            .cloned()
    }

    fn session_endpoint(&self, session: &SessionHandle) -> Result<EndpointName, RemoteCallError> {
        self.sessions
            .lock()
            .get(&session.id)
            .cloned()
            .ok_or(RemoteCallError::SessionLost)
    }

    /// Run `operation` against the device behind `session`.
    ///
    /// `act` runs under the device lock and is skipped for faults that
    /// strike before the device acts.
    async fn call<T>(
        &self,
        session: &SessionHandle,
        operation: Operation,
        act: impl FnOnce(&mut Device) -> Result<T, RemoteCallError>,
    ) -> Result<T, RemoteCallError> {
        let endpoint = self.session_endpoint(session)?;
        let fault = self.enter(&endpoint, operation).await;

        match fault {
            Some(Fault::Reject(status)) => return Err(RemoteCallError::Rejected { status }),
            Some(Fault::DropSession) | Some(Fault::Unreachable) => {
                return Err(RemoteCallError::SessionLost)
            }
            Some(Fault::LoseReply) | None => {}
        }

        let result = {
            let mut devices = self.devices.lock();
            let device = devices
                .get_mut(&endpoint)
                .filter(|device| device.reachable)
                .ok_or(RemoteCallError::SessionLost)?;
            act(device)
        };

        match fault {
            Some(Fault::LoseReply) => Err(RemoteCallError::SessionLost),
            _ => result,
        }
    }
}

#[async_trait]
impl PingProbe for MockFabric {
    async fn ping(&self, endpoint: &EndpointName) -> Result<(), ProbeError> {
        match self.devices.lock().get(endpoint) {
            Some(device) if device.reachable => Ok(()),
            Some(_) => Err(ProbeError::Timeout),
            None => Err(ProbeError::UnknownEndpoint),
        }
    }
}

#[async_trait]
impl SessionTransport for MockFabric {
    async fn open_management_session(
        &self,
        endpoint: &EndpointName,
    ) -> Result<SessionHandle, TransportError> {
        match self.enter(endpoint, Operation::OpenSession).await {
            Some(Fault::Unreachable) => return Err(TransportError::PeerUnreachable),
            Some(Fault::Reject(reason)) => return Err(TransportError::SessionRefused { reason }),
            Some(Fault::DropSession) | Some(Fault::LoseReply) => {
                return Err(TransportError::Io {
                    reason: "connection reset".into(),
                })
            }
            None => {}
        }

        let reachable = self
            .devices
            .lock()
            .get(endpoint)
            .is_some_and(|device| device.reachable);
        if !reachable {
            return Err(TransportError::PeerUnreachable);
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.lock().insert(id, endpoint.clone());
        Ok(SessionHandle {
            id,
            endpoint: endpoint.clone(),
        })
    }

    async fn close_session(&self, session: SessionHandle) {
        self.sessions.lock().remove(&session.id);
    }
}

#[async_trait]
impl PermissionManagement for MockFabric {
    async fn get_public_key(&self, session: &SessionHandle) -> Result<Vec<u8>, RemoteCallError> {
        self.call(session, Operation::GetPublicKey, |device| {
            Ok(device.signing_key.verifying_key().to_bytes().to_vec())
        })
        .await
    }

    async fn get_application_state(
        &self,
        session: &SessionHandle,
    ) -> Result<ApplicationState, RemoteCallError> {
        self.call(session, Operation::GetApplicationState, |device| Ok(device.state))
            .await
    }

    async fn get_claim_capabilities(
        &self,
        session: &SessionHandle,
    ) -> Result<ClaimCapabilities, RemoteCallError> {
        self.call(session, Operation::GetClaimCapabilities, |device| {
            Ok(device.capabilities)
        })
        .await
    }

    async fn get_about_data(&self, session: &SessionHandle) -> Result<AboutData, RemoteCallError> {
        self.call(session, Operation::GetAboutData, |device| {
            Ok(device.about.clone())
        })
        .await
    }

    async fn claim(
        &self,
        session: &SessionHandle,
        payload: &ClaimPayload,
    ) -> Result<(), RemoteCallError> {
        self.call(session, Operation::Claim, |device| {
            // Single claim window: the first claim closes it
            if device.state != ApplicationState::Claimable {
                return Err(RemoteCallError::Rejected {
                    status: format!("{}", device.state),
                });
            }
            let own_key = PublicKey::from_verifying_key(&device.signing_key.verifying_key());
            let leaf_matches = payload
                .identity_certificate_chain
                .first()
                .is_some_and(|certificate| certificate.subject == own_key);
            if !leaf_matches {
                return Err(RemoteCallError::Rejected {
                    status: "INVALID_CERTIFICATE".into(),
                });
            }
            device.state = ApplicationState::Claimed;
            device.root_of_trust = Some(payload.certificate_authority);
            device.claims_accepted += 1;
            Ok(())
        })
        .await
    }

    async fn install_policy(
        &self,
        session: &SessionHandle,
        policy: &PermissionPolicy,
    ) -> Result<(), RemoteCallError> {
        self.call(session, Operation::InstallPolicy, |device| {
            if !device.state.is_claimed() {
                return Err(RemoteCallError::Rejected {
                    status: "NOT_CLAIMED".into(),
                });
            }
            device.policy = Some(policy.clone());
            Ok(())
        })
        .await
    }

    async fn reset(&self, session: &SessionHandle) -> Result<(), RemoteCallError> {
        self.call(session, Operation::Reset, |device| {
            device.state = ApplicationState::Claimable;
            device.root_of_trust = None;
            device.policy = None;
            Ok(())
        })
        .await
    }
}

// =============================================================================
// CERTIFICATE AUTHORITY
// =============================================================================

/// Certificate authority backed by a fixed Ed25519 key.
pub struct StaticCertificateAuthority {
    signing_key: SigningKey,
    next_serial: AtomicU64,
    refuse: Mutex<Option<String>>,
}

impl StaticCertificateAuthority {
    pub fn new(seed: u8) -> Self {
        Self {
            signing_key: signing_key(seed),
            next_serial: AtomicU64::new(0),
            refuse: Mutex::new(None),
        }
    }

    /// Refuse every issuance with `reason` (or stop refusing with `None`).
    pub fn refuse(&self, reason: Option<&str>) {
        *self.refuse.lock() = reason.map(str::to_string);
    }

    /// Certificates issued so far.
    pub fn issued(&self) -> u64 {
        self.next_serial.load(Ordering::SeqCst)
    }
}

impl CertificateAuthority for StaticCertificateAuthority {
    fn authority_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(&self.signing_key.verifying_key())
    }

    fn issue_identity_certificate(
        &self,
        subject: &PublicKey,
        user_input: &UserInput,
    ) -> Result<IdentityCertificate, IssuanceError> {
        if let Some(reason) = self.refuse.lock().clone() {
            return Err(IssuanceError::Refused { reason });
        }
        let serial_number = self.next_serial.fetch_add(1, Ordering::SeqCst) + 1;

        let mut to_be_signed = serial_number.to_be_bytes().to_vec();
        to_be_signed.extend_from_slice(subject.as_bytes());
        to_be_signed.extend_from_slice(user_input.friendly_name.as_bytes());
        let signature = self.signing_key.sign(&to_be_signed);

        let mut encoded = to_be_signed;
        encoded.extend_from_slice(&signature.to_bytes());
        Ok(IdentityCertificate {
            serial_number,
            subject: *subject,
            issuer: self.authority_key(),
            encoded,
        })
    }
}

// =============================================================================
// RECORDING LISTENER
// =============================================================================

/// Notification as received by `RecordingListener`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Added(SecurityInfo),
    StateChanged { old: SecurityInfo, new: SecurityInfo },
    Removed(SecurityInfo),
}

impl Notification {
    pub fn endpoint(&self) -> &EndpointName {
        match self {
            Self::Added(info) | Self::Removed(info) => &info.endpoint,
            Self::StateChanged { new, .. } => &new.endpoint,
        }
    }

    /// Short label such as `added :1.1`.
    pub fn label(&self) -> String {
        match self {
            Self::Added(info) => format!("added {}", info.endpoint),
            Self::StateChanged { new, .. } => {
                format!("changed {} {}", new.endpoint, new.application_state)
            }
            Self::Removed(info) => format!("removed {}", info.endpoint),
        }
    }
}

/// Listener that records every notification.
pub struct RecordingListener {
    seen: Mutex<Vec<Notification>>,
    tx: mpsc::UnboundedSender<Notification>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Notification>>,
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingListener {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            seen: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Everything received so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    /// Labels of everything received so far.
    pub fn labels(&self) -> Vec<String> {
        self.seen.lock().iter().map(Notification::label).collect()
    }

    /// Next notification not yet returned by this method, waiting up to
    /// `timeout`.
    pub async fn next_within(&self, timeout: Duration) -> Option<Notification> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    fn record(&self, notification: Notification) {
        self.seen.lock().push(notification.clone());
        let _ = self.tx.send(notification);
    }
}

impl SecurityInfoListener for RecordingListener {
    fn on_application_added(&self, info: &SecurityInfo) {
        self.record(Notification::Added(info.clone()));
    }

    fn on_application_state_changed(&self, old: &SecurityInfo, new: &SecurityInfo) {
        self.record(Notification::StateChanged {
            old: old.clone(),
            new: new.clone(),
        });
    }

    fn on_application_removed(&self, info: &SecurityInfo) {
        self.record(Notification::Removed(info.clone()));
    }
}
