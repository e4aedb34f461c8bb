use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hardware class a device is provisioned as. Part of every device name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceClass {
    Pc,
    Nb,
    Tab,
    Mac,
    Srv,
    Div,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pc => "PC",
            Self::Nb => "NB",
            Self::Tab => "TAB",
            Self::Mac => "MAC",
            Self::Srv => "SRV",
            Self::Div => "DIV",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PC" => Ok(Self::Pc),
            "NB" => Ok(Self::Nb),
            "TAB" => Ok(Self::Tab),
            "MAC" => Ok(Self::Mac),
            "SRV" => Ok(Self::Srv),
            "DIV" => Ok(Self::Div),
            other => Err(format!("unknown device class: {}", other)),
        }
    }
}

/// Lifecycle of a provisioning job.
///
/// `Preparing` is initial; `Done`, `Failed` and `Cancelled` are terminal and
/// never left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Preparing,
    PxeSelection,
    Imaging,
    Installing,
    Verifying,
    Ready,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "PREPARING",
            Self::PxeSelection => "PXE_SELECTION",
            Self::Imaging => "IMAGING",
            Self::Installing => "INSTALLING",
            Self::Verifying => "VERIFYING",
            Self::Ready => "READY",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub const TERMINAL: [JobStatus; 3] = [Self::Done, Self::Failed, Self::Cancelled];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARING" => Ok(Self::Preparing),
            "PXE_SELECTION" => Ok(Self::PxeSelection),
            "IMAGING" => Ok(Self::Imaging),
            "INSTALLING" => Ok(Self::Installing),
            "VERIFYING" => Ok(Self::Verifying),
            "READY" => Ok(Self::Ready),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// One end-to-end provisioning attempt for a single device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub customer_id: String,
    pub device_class: DeviceClass,
    pub image_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_profile_id: Option<String>,
    pub interface_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub sequence_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// True once the sequence number is permanently retired for this device.
    pub naming_committed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Bumped on every persisted transition; stale writers are rejected.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusEntry {
    pub status: String,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWithHistory {
    #[serde(flatten)]
    pub job: Job,
    pub history: Vec<JobStatusEntry>,
}

/// Request accepted by job creation. References are resolved against the
/// customer/image catalog before anything is reserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJobRequest {
    pub customer_id: String,
    pub device_class: DeviceClass,
    pub image_ref: String,
    #[serde(default)]
    pub vpn_profile_id: Option<String>,
    pub interface_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreated {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Bound,
    Imaged,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bound => "bound",
            Self::Imaged => "imaged",
        }
    }
}

impl FromStr for DeviceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bound" => Ok(Self::Bound),
            "imaged" => Ok(Self::Imaged),
            other => Err(format!("unknown device state: {}", other)),
        }
    }
}

/// A physical machine known by its MAC. The name is assigned once and never
/// changes, even when the device is provisioned again later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub mac_address: String,
    pub customer_id: String,
    pub device_class: DeviceClass,
    pub sequence_number: u32,
    pub name: String,
    pub state: DeviceState,
    pub job_id: String,
    pub bound_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imaged_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_class_parses_case_insensitively() {
        assert_eq!("nb".parse::<DeviceClass>().unwrap(), DeviceClass::Nb);
        assert_eq!("SRV".parse::<DeviceClass>().unwrap(), DeviceClass::Srv);
        assert!("laptop".parse::<DeviceClass>().is_err());
    }

    #[test]
    fn job_status_round_trips_through_str() {
        for status in [
            JobStatus::Preparing,
            JobStatus::PxeSelection,
            JobStatus::Imaging,
            JobStatus::Installing,
            JobStatus::Verifying,
            JobStatus::Ready,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn job_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&JobStatus::PxeSelection).unwrap();
        assert_eq!(json, "\"PXE_SELECTION\"");
    }

    #[test]
    fn only_done_failed_cancelled_are_terminal() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
        assert!(!JobStatus::Preparing.is_terminal());
    }
}
