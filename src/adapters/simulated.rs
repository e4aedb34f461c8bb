use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::info;

use crate::core::boot::BootService;
use crate::core::gateway::{BootEventGateway, GatewayError};

/// Boot service stand-in that remembers what was staged.
#[derive(Default)]
pub struct SimulatedBootService {
    staged: Mutex<HashMap<String, String>>,
    stage_calls: Mutex<Vec<String>>,
    cleared: Mutex<Vec<String>>,
    fail_staging: Mutex<bool>,
}

impl SimulatedBootService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image currently staged for `mac`.
    pub fn staged(&self, mac: &str) -> Option<String> {
        self.staged.lock().unwrap_or_else(|p| p.into_inner()).get(mac).cloned()
    }

    /// MACs passed to `stage_image`, in call order.
    pub fn stage_calls(&self) -> Vec<String> {
        self.stage_calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn cleared(&self) -> Vec<String> {
        self.cleared.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_fail_staging(&self, fail: bool) {
        *self.fail_staging.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }
}

#[async_trait]
impl BootService for SimulatedBootService {
    async fn stage_image(&self, mac: &str, image_ref: &str, job_id: &str) -> Result<()> {
        self.stage_calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(mac.to_string());

        if *self.fail_staging.lock().unwrap_or_else(|p| p.into_inner()) {
            bail!("simulated boot service refused {}", mac);
        }

        info!(mac, image_ref, job_id, "(Simulated) Boot image staged");
        self.staged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(mac.to_string(), image_ref.to_string());
        Ok(())
    }

    async fn clear(&self, mac: &str) -> Result<()> {
        self.staged.lock().unwrap_or_else(|p| p.into_inner()).remove(mac);
        self.cleared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(mac.to_string());
        Ok(())
    }
}

/// One line of simulator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedCommand {
    Discover { mac: String, interface_id: String },
    Lease { mac: String, ip: String },
    Image { mac: String },
    InstallStart { mac: String },
    Install { mac: String, success: bool, detail: Option<String> },
    Verify { mac: String, success: bool, detail: Option<String> },
}

pub const USAGE: &str = "discover <mac> <iface> | lease <mac> <ip> | image <mac> | \
install-start <mac> | install <mac> ok|fail [detail] | verify <mac> ok|fail [detail]";

impl SimulatedCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let detail = || (parts.len() > 3).then(|| parts[3..].join(" "));
        let outcome = |word: &str| match word {
            "ok" => Some(true),
            "fail" => Some(false),
            _ => None,
        };

        match parts.as_slice() {
            ["discover", mac, iface] => Some(Self::Discover {
                mac: mac.to_string(),
                interface_id: iface.to_string(),
            }),
            ["lease", mac, ip] => Some(Self::Lease {
                mac: mac.to_string(),
                ip: ip.to_string(),
            }),
            ["image", mac] => Some(Self::Image { mac: mac.to_string() }),
            ["install-start", mac] => Some(Self::InstallStart { mac: mac.to_string() }),
            ["install", mac, result, ..] => Some(Self::Install {
                mac: mac.to_string(),
                success: outcome(*result)?,
                detail: detail(),
            }),
            ["verify", mac, result, ..] => Some(Self::Verify {
                mac: mac.to_string(),
                success: outcome(*result)?,
                detail: detail(),
            }),
            _ => None,
        }
    }

    pub async fn send(self, gateway: &BootEventGateway) -> Result<(), GatewayError> {
        match self {
            Self::Discover { mac, interface_id } => gateway.on_discover(&mac, &interface_id).await,
            Self::Lease { mac, ip } => gateway.on_lease_assigned(&mac, &ip, None).await,
            Self::Image { mac } => gateway.on_image_delivered(&mac).await,
            Self::InstallStart { mac } => gateway.on_install_started(&mac).await,
            Self::Install { mac, success, detail } => {
                gateway.on_install_result(&mac, success, detail).await
            }
            Self::Verify { mac, success, detail } => {
                gateway.on_verify_result(&mac, success, detail).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simulator_commands() {
        assert_eq!(
            SimulatedCommand::parse("discover aa:bb:cc:dd:ee:01 eth1"),
            Some(SimulatedCommand::Discover {
                mac: "aa:bb:cc:dd:ee:01".into(),
                interface_id: "eth1".into()
            })
        );
        assert_eq!(
            SimulatedCommand::parse("install aa:bb:cc:dd:ee:01 fail disk not found"),
            Some(SimulatedCommand::Install {
                mac: "aa:bb:cc:dd:ee:01".into(),
                success: false,
                detail: Some("disk not found".into())
            })
        );
        assert_eq!(
            SimulatedCommand::parse("verify aa:bb:cc:dd:ee:01 ok"),
            Some(SimulatedCommand::Verify {
                mac: "aa:bb:cc:dd:ee:01".into(),
                success: true,
                detail: None
            })
        );
        assert_eq!(SimulatedCommand::parse("install aa:bb maybe"), None);
        assert_eq!(SimulatedCommand::parse("reboot"), None);
    }

    #[tokio::test]
    async fn remembers_staged_images() {
        let boot = SimulatedBootService::new();
        boot.stage_image("aa:bb:cc:dd:ee:01", "win11", "job-1").await.unwrap();
        assert_eq!(boot.staged("aa:bb:cc:dd:ee:01").as_deref(), Some("win11"));

        boot.clear("aa:bb:cc:dd:ee:01").await.unwrap();
        assert!(boot.staged("aa:bb:cc:dd:ee:01").is_none());
        assert_eq!(boot.cleared(), vec!["aa:bb:cc:dd:ee:01"]);

        boot.set_fail_staging(true);
        assert!(boot.stage_image("aa:bb:cc:dd:ee:02", "win11", "job-2").await.is_err());
        assert_eq!(boot.stage_calls().len(), 2);
    }
}
