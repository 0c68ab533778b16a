//! Security Manager configuration.
//!
//! Loaded from defaults, from `SECMGR_*` environment variables, or from a
//! TOML document:
//!
//! ```toml
//! [claim]
//! timeout_ms = 30000
//! reset_on_failure = false
//! warn_on_endpoint_mismatch = false
//!
//! [liveness]
//! probe_interval_ms = 5000
//! max_missed_probes = 3
//!
//! [monitor]
//! event_queue_capacity = 1024
//! ```

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Runtime configuration for one security manager instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityManagerConfig {
    /// Upper bound on the remote provisioning exchange of one claim
    pub claim_timeout: Duration,
    /// Interval between liveness probe rounds
    pub probe_interval: Duration,
    /// Consecutive missed probes before an application is reported lost
    pub max_missed_probes: u32,
    /// Capacity of the monitor event queue
    pub event_queue_capacity: usize,
    /// Ask the device to reset after a claim fails mid-provisioning
    pub reset_on_failed_claim: bool,
    /// Log a warning when a claim names a stale endpoint
    pub warn_on_endpoint_mismatch: bool,
}

impl Default for SecurityManagerConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_secs(5),
            max_missed_probes: 3,
            event_queue_capacity: 1024,
            reset_on_failed_claim: false,
            warn_on_endpoint_mismatch: false,
        }
    }
}

impl SecurityManagerConfig {
    /// Short intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            claim_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_millis(50),
            max_missed_probes: 2,
            event_queue_capacity: 64,
            reset_on_failed_claim: false,
            warn_on_endpoint_mismatch: true,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SECMGR_CLAIM_TIMEOUT_MS`: Claim timeout (default: 30000)
    /// - `SECMGR_PROBE_INTERVAL_MS`: Probe interval (default: 5000)
    /// - `SECMGR_MAX_MISSED_PROBES`: Missed probes before lost (default: 3)
    /// - `SECMGR_EVENT_QUEUE_CAPACITY`: Monitor queue capacity (default: 1024)
    /// - `SECMGR_RESET_ON_FAILED_CLAIM`: Reset device after failed claim (default: false)
    /// - `SECMGR_WARN_ON_ENDPOINT_MISMATCH`: Warn on stale endpoints (default: false)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            claim_timeout: env_millis("SECMGR_CLAIM_TIMEOUT_MS").unwrap_or(defaults.claim_timeout),
            probe_interval: env_millis("SECMGR_PROBE_INTERVAL_MS")
                .unwrap_or(defaults.probe_interval),
            max_missed_probes: env::var("SECMGR_MAX_MISSED_PROBES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_missed_probes),
            event_queue_capacity: env::var("SECMGR_EVENT_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.event_queue_capacity),
            reset_on_failed_claim: env::var("SECMGR_RESET_ON_FAILED_CLAIM")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.reset_on_failed_claim),
            warn_on_endpoint_mismatch: env::var("SECMGR_WARN_ON_ENDPOINT_MISMATCH")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.warn_on_endpoint_mismatch),
        }
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(source)?;
        let mut config = Self::default();

        if let Some(ms) = file.claim.timeout_ms {
            config.claim_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = file.claim.reset_on_failure {
            config.reset_on_failed_claim = flag;
        }
        if let Some(flag) = file.claim.warn_on_endpoint_mismatch {
            config.warn_on_endpoint_mismatch = flag;
        }
        if let Some(ms) = file.liveness.probe_interval_ms {
            config.probe_interval = Duration::from_millis(ms);
        }
        if let Some(max) = file.liveness.max_missed_probes {
            config.max_missed_probes = max;
        }
        if let Some(capacity) = file.monitor.event_queue_capacity {
            config.event_queue_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_timeout.is_zero() {
            return Err(invalid("claim_timeout", "must be greater than zero"));
        }
        if self.probe_interval.is_zero() {
            return Err(invalid("probe_interval", "must be greater than zero"));
        }
        if self.max_missed_probes == 0 {
            return Err(invalid("max_missed_probes", "must be at least 1"));
        }
        if self.event_queue_capacity == 0 {
            return Err(invalid("event_queue_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.to_string(),
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    claim: ClaimSection,
    #[serde(default)]
    liveness: LivenessSection,
    #[serde(default)]
    monitor: MonitorSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClaimSection {
    timeout_ms: Option<u64>,
    reset_on_failure: Option<bool>,
    warn_on_endpoint_mismatch: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LivenessSection {
    probe_interval_ms: Option<u64>,
    max_missed_probes: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MonitorSection {
    event_queue_capacity: Option<usize>,
}
