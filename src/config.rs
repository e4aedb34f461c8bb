use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::models::JobStatus;
use crate::core::vpn::ProfileKind;

const SYSTEM_CONFIG: &str = "/etc/provd/config.toml";
const LOCAL_CONFIG: &str = "provd.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub rpc_bind: SocketAddr,
    pub http_bind: SocketAddr,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    /// Move READY jobs to DONE without waiting for an operator ack.
    pub auto_finalize: bool,
    /// Highest sequence number handed out per customer and device class.
    pub naming_ceiling: u32,
    /// Where rendered tunnel configs live while a tunnel is up.
    pub runtime_dir: PathBuf,
    pub timeouts: TimeoutConfig,
    pub boot_service: BootServiceConfig,
    pub notifications: NotificationConfig,
    pub customers: Vec<CustomerConfig>,
    pub images: Vec<ImageConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/provd/provd.db"),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 7421)),
            simulation: false,
            verbose: false,
            json_logs: false,
            auto_finalize: false,
            naming_ceiling: 999,
            runtime_dir: PathBuf::from("/run/provd"),
            timeouts: TimeoutConfig::default(),
            boot_service: BootServiceConfig::default(),
            notifications: NotificationConfig::default(),
            customers: Vec::new(),
            images: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the system and local config files, then `PROVD_*`
    /// environment variables, then whatever the command line set.
    pub fn new<T: Serialize>(cli: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG))
            .merge(Toml::file(LOCAL_CONFIG))
            .merge(Env::prefixed("PROVD_").split("__"));

        if let Some(args) = cli {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment.extract().context("Failed to load configuration")
    }

    /// Defaults overlaid with a TOML document.
    pub fn from_toml(toml: &str) -> Result<Self> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .context("Failed to parse configuration")
    }
}

/// Maximum dwell per non-terminal state. Values are seconds; fractions are
/// allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "secs")]
    pub preparing: Duration,
    #[serde(with = "secs")]
    pub pxe_selection: Duration,
    #[serde(with = "secs")]
    pub imaging: Duration,
    #[serde(with = "secs")]
    pub installing: Duration,
    #[serde(with = "secs")]
    pub verifying: Duration,
    #[serde(with = "secs")]
    pub ready: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            preparing: Duration::from_secs(30 * 60),
            pxe_selection: Duration::from_secs(15 * 60),
            imaging: Duration::from_secs(60 * 60),
            installing: Duration::from_secs(2 * 60 * 60),
            verifying: Duration::from_secs(30 * 60),
            ready: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl TimeoutConfig {
    pub fn dwell(&self, status: JobStatus) -> Option<Duration> {
        match status {
            JobStatus::Preparing => Some(self.preparing),
            JobStatus::PxeSelection => Some(self.pxe_selection),
            JobStatus::Imaging => Some(self.imaging),
            JobStatus::Installing => Some(self.installing),
            JobStatus::Verifying => Some(self.verifying),
            JobStatus::Ready => Some(self.ready),
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled => None,
        }
    }

    /// Every state gets the same dwell. Handy for tests.
    pub fn uniform(dwell: Duration) -> Self {
        Self {
            preparing: dwell,
            pxe_selection: dwell,
            imaging: dwell,
            installing: dwell,
            verifying: dwell,
            ready: dwell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootServiceConfig {
    /// Base URL of the boot service's hand-off API. Unset outside simulation
    /// means the daemon refuses to start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
}

impl Default for BootServiceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_webhook: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Slack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerConfig {
    pub id: String,
    pub short_code: String,
    /// Provisioning interfaces this customer's devices may boot on. Empty
    /// means any.
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub vpn_profiles: BTreeMap<String, ProfileKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// `Duration` as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = AppConfig::default();
        assert_eq!(config.naming_ceiling, 999);
        assert!(!config.auto_finalize);
        assert_eq!(
            config.timeouts.dwell(JobStatus::Preparing),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(config.timeouts.dwell(JobStatus::Done), None);
    }

    #[test]
    fn parses_customers_profiles_and_fractional_timeouts() {
        let config = AppConfig::from_toml(
            r#"
            auto_finalize = true

            [timeouts]
            preparing = 0.25
            installing = 600

            [[customers]]
            id = "exc"
            short_code = "EXC"
            interfaces = ["eth1"]

            [customers.vpn_profiles.office]
            type = "wireguard"
            private_key_ref = "env:EXC_WG_KEY"
            public_key = "cHVi"
            endpoint = "203.0.113.7:51820"
            address = "10.20.0.2/32"
            allowed_ips = ["10.20.0.0/16"]

            [customers.vpn_profiles.lan]
            type = "local"

            [[images]]
            id = "win11-23h2"
            "#,
        )
        .unwrap();

        assert!(config.auto_finalize);
        assert_eq!(config.timeouts.preparing, Duration::from_millis(250));
        assert_eq!(config.timeouts.installing, Duration::from_secs(600));
        assert_eq!(config.timeouts.verifying, Duration::from_secs(1800));

        let exc = &config.customers[0];
        assert_eq!(exc.short_code, "EXC");
        assert!(matches!(exc.vpn_profiles["office"], ProfileKind::Wireguard(_)));
        assert_eq!(exc.vpn_profiles["lan"], ProfileKind::Local);
        assert_eq!(config.images[0].id, "win11-23h2");
    }

    #[test]
    fn rejects_negative_timeouts() {
        assert!(AppConfig::from_toml("[timeouts]\npreparing = -1").is_err());
    }
}
