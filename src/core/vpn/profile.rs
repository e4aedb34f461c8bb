use serde::{Deserialize, Serialize};

use super::VpnError;
use crate::core::redact::Secret;

/// VPN profile descriptor as configured in customer settings.
///
/// Secrets are referenced (`secret_ref`, `private_key_ref`) and only resolved
/// by the driver at connect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProfileKind {
    /// Target network is reachable without a tunnel.
    Local,
    Client(ClientProfile),
    Wireguard(WireGuardProfile),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientProtocol {
    Cisco,
    Openconnect,
    Fortinet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub protocol: ClientProtocol,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub secret_ref: String,
    /// openconnect `--protocol` override (`gp`, `nc`, `pulse`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openconnect_protocol: Option<String>,
    /// Pinned server certificate fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cert: Option<String>,
}

fn default_port() -> u16 {
    443
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireGuardProfile {
    pub private_key_ref: String,
    pub public_key: String,
    pub endpoint: String,
    /// Tunnel address of the provisioning host, e.g. `10.20.0.2/32`.
    pub address: String,
    pub allowed_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnProfile {
    pub id: String,
    #[serde(flatten)]
    pub kind: ProfileKind,
}

impl VpnProfile {
    pub fn new(id: impl Into<String>, kind: ProfileKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, ProfileKind::Local)
    }

    pub fn protocol_name(&self) -> &'static str {
        match &self.kind {
            ProfileKind::Local => "local",
            ProfileKind::Client(c) => match c.protocol {
                ClientProtocol::Cisco => "cisco",
                ClientProtocol::Openconnect => "openconnect",
                ClientProtocol::Fortinet => "fortinet",
            },
            ProfileKind::Wireguard(_) => "wireguard",
        }
    }
}

/// Resolve a secret reference: `env:NAME`, `file:/path`, or a literal value.
pub fn resolve_secret(reference: &str) -> Result<Secret, VpnError> {
    if let Some(name) = reference.strip_prefix("env:") {
        return std::env::var(name)
            .map(Secret::new)
            .map_err(|_| VpnError::SecretUnavailable(reference.to_string()));
    }

    if let Some(path) = reference.strip_prefix("file:") {
        return std::fs::read_to_string(path)
            .map(|s| Secret::new(s.trim_end()))
            .map_err(|_| VpnError::SecretUnavailable(reference.to_string()));
    }

    if reference.is_empty() {
        return Err(VpnError::SecretUnavailable("<empty>".to_string()));
    }

    Ok(Secret::new(reference))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_profile_descriptor() {
        let json = r#"{
            "id": "office",
            "type": "client",
            "protocol": "fortinet",
            "hostname": "vpn.exc.example",
            "username": "provision",
            "secret_ref": "env:EXC_VPN_PASSWORD"
        }"#;
        let profile: VpnProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.id, "office");
        match profile.kind {
            ProfileKind::Client(c) => {
                assert_eq!(c.protocol, ClientProtocol::Fortinet);
                assert_eq!(c.port, 443);
            }
            other => panic!("expected client profile, got {:?}", other),
        }
    }

    #[test]
    fn parses_wireguard_and_local_descriptors() {
        let wg: ProfileKind = serde_json::from_str(
            r#"{"type":"wireguard","private_key_ref":"file:/etc/provd/wg.key",
                "public_key":"pub=","endpoint":"203.0.113.7:51820","address":"10.20.0.2/32",
                "allowed_ips":["10.20.0.0/16"],"persistent_keepalive":25}"#,
        )
        .unwrap();
        assert!(matches!(wg, ProfileKind::Wireguard(_)));

        let local: ProfileKind = serde_json::from_str(r#"{"type":"local"}"#).unwrap();
        assert_eq!(local, ProfileKind::Local);
    }

    #[test]
    fn resolves_literal_and_missing_env_secrets() {
        assert_eq!(resolve_secret("plain").unwrap().expose(), "plain");
        let err = resolve_secret("env:PROVD_TEST_SURELY_UNSET_VARIABLE").unwrap_err();
        assert!(matches!(err, VpnError::SecretUnavailable(_)));
    }

    #[test]
    fn resolves_file_secret_without_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, "c2VjcmV0\n").unwrap();
        let secret = resolve_secret(&format!("file:{}", path.display())).unwrap();
        assert_eq!(secret.expose(), "c2VjcmV0");
    }
}
