//! Shared fixture for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use secmgr_core::testing::{
    admin_group, key_bytes, FixedTimeSource, MockFabric, RecordingListener,
    StaticCertificateAuthority,
};
use secmgr_core::ports::CertificateAuthority;
use secmgr_core::{
    AdminInput, ApplicationIdentity, ApplicationState, EndpointName, PublicKey, SecurityContext,
    SecurityManager, SecurityManagerApi, SecurityManagerConfig, UserInput,
};

pub struct Fixture {
    pub fabric: Arc<MockFabric>,
    pub authority: Arc<StaticCertificateAuthority>,
    pub manager: Arc<SecurityManager>,
    pub listener: Arc<RecordingListener>,
}

/// Started manager with test config on a fresh fabric.
pub fn fixture() -> Fixture {
    fixture_on(MockFabric::new(), SecurityManagerConfig::for_testing())
}

/// Started manager on `fabric`. Must be called inside a runtime.
pub fn fixture_on(fabric: Arc<MockFabric>, config: SecurityManagerConfig) -> Fixture {
    let authority = Arc::new(StaticCertificateAuthority::new(200));
    let context = SecurityContext::new(
        fabric.clone(),
        fabric.clone(),
        fabric.clone(),
        authority.clone(),
    )
    .with_time_source(Arc::new(FixedTimeSource::new(1_700_000_000)));
    let manager = Arc::new(SecurityManager::new(config, context).expect("valid config"));
    manager.start();

    let listener = Arc::new(RecordingListener::new());
    manager.register_listener(listener.clone());

    Fixture {
        fabric,
        authority,
        manager,
        listener,
    }
}

impl Fixture {
    /// Deliver the device's current advertisement and wait until applied.
    pub async fn advertise(&self, endpoint: &str) {
        let advertisement = self.fabric.advertisement(endpoint).expect("device exists");
        let handle = self.manager.monitor_handle();
        assert!(handle.submit_advertisement(advertisement).await);
        assert!(handle.flush().await);
    }

    /// Run one probe round and wait until its events are applied.
    pub async fn probe(&self) {
        self.manager.probe_now().await;
        assert!(self.manager.monitor_handle().flush().await);
    }

    /// Local view of `endpoint`.
    pub fn state(&self, endpoint: &str) -> Option<ApplicationState> {
        self.manager
            .get_application_by_endpoint(&EndpointName::new(endpoint))
            .map(|info| info.application_state)
    }

    /// Root of trust this manager installs.
    pub fn authority_key(&self) -> PublicKey {
        self.authority.authority_key()
    }

    /// Wait for a notification with `label`, skipping others.
    pub async fn wait_for(&self, label: &str) -> bool {
        while let Some(notification) = self.listener.next_within(Duration::from_secs(30)).await {
            if notification.label() == label {
                return true;
            }
        }
        false
    }
}

pub fn target(endpoint: &str, seed: u8) -> ApplicationIdentity {
    ApplicationIdentity::new(endpoint, key_bytes(seed))
}

pub fn admin_input() -> AdminInput {
    AdminInput::new(admin_group(42)).with_user_input(UserInput::named("Front door"))
}
