//! Translation layer between boot-service/agent callbacks and the
//! orchestrator's event queue.
//!
//! Holds no state and does not deduplicate: callbacks are at-least-once and
//! the job state machine treats them idempotently.

use std::net::IpAddr;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use super::boot::{AgentEvent, BootEvent, ProvisioningEvent};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    #[error("interface id must not be empty")]
    MissingInterface,

    #[error("orchestrator is not accepting events")]
    Closed,
}

/// Normalize a MAC to lower-case colon-separated hex.
///
/// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff` and
/// `aabbccddeeff`.
pub fn normalize_mac(raw: &str) -> Result<String, GatewayError> {
    let hex: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(GatewayError::InvalidMac(raw.to_string()));
    }

    let hex = hex.to_ascii_lowercase();
    let octets: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
    Ok(octets.join(":"))
}

#[derive(Clone)]
pub struct BootEventGateway {
    tx: mpsc::Sender<ProvisioningEvent>,
}

impl BootEventGateway {
    pub fn new(tx: mpsc::Sender<ProvisioningEvent>) -> Self {
        Self { tx }
    }

    async fn deliver(&self, event: ProvisioningEvent) -> Result<(), GatewayError> {
        trace!(?event, "Boot callback");
        self.tx.send(event).await.map_err(|_| GatewayError::Closed)
    }

    pub async fn on_discover(&self, mac: &str, interface_id: &str) -> Result<(), GatewayError> {
        let interface_id = interface_id.trim();
        if interface_id.is_empty() {
            return Err(GatewayError::MissingInterface);
        }
        self.deliver(
            BootEvent::DiscoverReceived {
                mac: normalize_mac(mac)?,
                interface_id: interface_id.to_string(),
            }
            .into(),
        )
        .await
    }

    pub async fn on_lease_assigned(
        &self,
        mac: &str,
        ip: &str,
        interface_id: Option<&str>,
    ) -> Result<(), GatewayError> {
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| GatewayError::InvalidIp(ip.to_string()))?;
        self.deliver(
            BootEvent::LeaseAssigned {
                mac: normalize_mac(mac)?,
                ip: ip.to_string(),
                interface_id: interface_id
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            }
            .into(),
        )
        .await
    }

    pub async fn on_image_delivered(&self, mac: &str) -> Result<(), GatewayError> {
        self.deliver(
            BootEvent::BootImageDelivered {
                mac: normalize_mac(mac)?,
            }
            .into(),
        )
        .await
    }

    pub async fn on_install_started(&self, mac: &str) -> Result<(), GatewayError> {
        self.deliver(
            AgentEvent::InstallStarted {
                mac: normalize_mac(mac)?,
            }
            .into(),
        )
        .await
    }

    pub async fn on_install_result(
        &self,
        mac: &str,
        success: bool,
        detail: Option<String>,
    ) -> Result<(), GatewayError> {
        self.deliver(
            AgentEvent::InstallResult {
                mac: normalize_mac(mac)?,
                success,
                detail,
            }
            .into(),
        )
        .await
    }

    pub async fn on_verify_result(
        &self,
        mac: &str,
        success: bool,
        detail: Option<String>,
    ) -> Result<(), GatewayError> {
        self.deliver(
            AgentEvent::VerifyResult {
                mac: normalize_mac(mac)?,
                success,
                detail,
            }
            .into(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_mac_spellings() {
        for raw in [
            "AA:BB:CC:DD:EE:0F",
            "aa-bb-cc-dd-ee-0f",
            "aabb.ccdd.ee0f",
            "AABBCCDDEE0F",
            " aa:bb:cc:dd:ee:0f\n",
        ] {
            assert_eq!(normalize_mac(raw).unwrap(), "aa:bb:cc:dd:ee:0f", "input {:?}", raw);
        }
    }

    #[test]
    fn rejects_malformed_macs() {
        assert!(normalize_mac("aa:bb:cc").is_err());
        assert!(normalize_mac("zz:bb:cc:dd:ee:ff").is_err());
        assert!(normalize_mac("").is_err());
    }

    #[tokio::test]
    async fn forwards_normalized_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let gateway = BootEventGateway::new(tx);

        gateway.on_discover("AA-BB-CC-DD-EE-01", "eth1").await.unwrap();
        gateway
            .on_lease_assigned("aabbccddee01", "10.0.0.20", None)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ProvisioningEvent::Boot(BootEvent::DiscoverReceived {
                mac: "aa:bb:cc:dd:ee:01".into(),
                interface_id: "eth1".into(),
            })
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ProvisioningEvent::Boot(BootEvent::LeaseAssigned {
                mac: "aa:bb:cc:dd:ee:01".into(),
                ip: "10.0.0.20".into(),
                interface_id: None,
            })
        );
    }

    #[tokio::test]
    async fn rejects_bad_input_without_delivering() {
        let (tx, mut rx) = mpsc::channel(8);
        let gateway = BootEventGateway::new(tx);

        assert!(matches!(
            gateway.on_discover("aa:bb:cc:dd:ee:01", "  ").await,
            Err(GatewayError::MissingInterface)
        ));
        assert!(matches!(
            gateway.on_lease_assigned("aa:bb:cc:dd:ee:01", "10.0.0.999", None).await,
            Err(GatewayError::InvalidIp(_))
        ));
        drop(gateway);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reports_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let gateway = BootEventGateway::new(tx);
        assert!(matches!(
            gateway.on_image_delivered("aa:bb:cc:dd:ee:01").await,
            Err(GatewayError::Closed)
        ));
    }
}
