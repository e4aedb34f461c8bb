//! Error taxonomy for provisioning jobs.
//!
//! Every variant's display string is safe to store as a job's failure
//! reason: callers pass free-form text through [`redact`](super::redact)
//! before constructing a variant.

use std::time::Duration;

use thiserror::Error;

use super::models::{DeviceClass, JobStatus};

/// Stage whose device-side script reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStage {
    Install,
    Verify,
}

impl std::fmt::Display for ScriptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Install => f.write_str("install"),
            Self::Verify => f.write_str("verify"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid customer: {0}")]
    InvalidCustomer(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid VPN profile {profile_id} for customer {customer_id}")]
    InvalidVpnProfile {
        customer_id: String,
        profile_id: String,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("boot event for {mac} on {interface_id} matched {candidates} pending jobs")]
    CorrelationAmbiguity {
        mac: String,
        interface_id: String,
        candidates: usize,
    },

    #[error("tunnel establish failed: {0}")]
    TunnelEstablishFailed(String),

    #[error("device name sequence exhausted for {customer_id}/{device_class} (ceiling {ceiling})")]
    SequenceExhausted {
        customer_id: String,
        device_class: DeviceClass,
        ceiling: u32,
    },

    #[error("{stage} script failed: {detail}")]
    ScriptFailure { stage: ScriptStage, detail: String },

    #[error("no progress in {status} within {}s", .dwell.as_secs_f64())]
    Timeout { status: JobStatus, dwell: Duration },

    #[error("boot service hand-off failed: {0}")]
    BootHandoff(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id} is {actual}, expected {expected}")]
    InvalidState {
        job_id: String,
        actual: JobStatus,
        expected: JobStatus,
    },

    #[error("job registry unavailable: {0:#}")]
    Registry(anyhow::Error),
}

impl ProvisionError {
    /// Rejections raised before any resource is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidCustomer(_)
                | Self::InvalidImage(_)
                | Self::InvalidVpnProfile { .. }
                | Self::Validation(_)
        )
    }
}

impl From<anyhow::Error> for ProvisionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Registry(err)
    }
}
