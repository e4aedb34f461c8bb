//! Connect/disconnect actions per VPN protocol.

use std::fmt;
use std::path::{Path, PathBuf};

use super::VpnError;
use super::profile::{
    ClientProfile, ClientProtocol, ProfileKind, VpnProfile, WireGuardProfile, resolve_secret,
};
use crate::core::redact::{Secret, redact_with};

/// A subprocess invocation. Secret arguments stay inside the struct; only the
/// redacted rendering is ever shown.
#[derive(Clone)]
pub struct TunnelCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, then stdin is closed.
    pub stdin: Option<Secret>,
    secrets: Vec<Secret>,
}

impl TunnelCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            secrets: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn secret_arg(mut self, secret: &Secret) -> Self {
        self.args.push(secret.expose().to_string());
        self.secrets.push(secret.clone());
        self
    }

    pub fn stdin_secret(mut self, secret: &Secret) -> Self {
        self.stdin = Some(secret.clone());
        self.secrets.push(secret.clone());
        self
    }

    /// Mask every secret this command carries in `text` (e.g. stderr).
    pub fn redact(&self, text: &str) -> String {
        let secrets: Vec<&Secret> = self.secrets.iter().collect();
        redact_with(text, &secrets)
    }

    pub fn display(&self) -> String {
        self.redact(&format!("{} {}", self.program, self.args.join(" ")))
    }
}

impl fmt::Debug for TunnelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// How the tunnel is brought up.
#[derive(Debug, Clone)]
pub enum ConnectAction {
    /// Run to completion; exit 0 means the tunnel is up.
    Run(TunnelCommand),
    /// Long-running client; up once it survives the settle period.
    Spawn(TunnelCommand),
}

/// How the tunnel is torn down.
#[derive(Debug, Clone)]
pub enum DisconnectAction {
    Run(TunnelCommand),
    /// Terminate the process started by [`ConnectAction::Spawn`].
    KillSpawned,
}

/// File the connect action depends on. Removed after disconnect.
#[derive(Clone)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub contents: Secret,
}

impl fmt::Debug for RenderedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RenderedFile({})", self.path.display())
    }
}

#[derive(Debug, Clone)]
pub struct TunnelPlan {
    pub connect: ConnectAction,
    pub disconnect: DisconnectAction,
    pub files: Vec<RenderedFile>,
}

pub const WIREGUARD_CONFIG: &str = "provd-wg.conf";

/// Build the connect/disconnect plan. Local profiles have no plan.
pub fn plan(profile: &VpnProfile, runtime_dir: &Path) -> Result<Option<TunnelPlan>, VpnError> {
    match &profile.kind {
        ProfileKind::Local => Ok(None),
        ProfileKind::Client(client) => client_plan(client).map(Some),
        ProfileKind::Wireguard(wg) => wireguard_plan(wg, runtime_dir).map(Some),
    }
}

fn client_plan(client: &ClientProfile) -> Result<TunnelPlan, VpnError> {
    let password = resolve_secret(&client.secret_ref)?;
    let target = format!("{}:{}", client.hostname, client.port);

    let command = match client.protocol {
        ClientProtocol::Cisco | ClientProtocol::Openconnect => {
            let protocol = match client.protocol {
                ClientProtocol::Cisco => "anyconnect".to_string(),
                _ => client
                    .openconnect_protocol
                    .clone()
                    .unwrap_or_else(|| "anyconnect".to_string()),
            };
            let mut cmd = TunnelCommand::new("openconnect")
                .arg(format!("--protocol={}", protocol))
                .arg("--user")
                .arg(&client.username)
                .arg("--passwd-on-stdin")
                .arg("--non-inter");
            if let Some(cert) = &client.server_cert {
                cmd = cmd.arg(format!("--servercert={}", cert));
            }
            cmd.arg(target).stdin_secret(&password)
        }
        ClientProtocol::Fortinet => {
            let mut cmd = TunnelCommand::new("openfortivpn")
                .arg(target)
                .arg("-u")
                .arg(&client.username)
                .arg("-p")
                .secret_arg(&password);
            if let Some(cert) = &client.server_cert {
                cmd = cmd.arg(format!("--trusted-cert={}", cert));
            }
            cmd
        }
    };

    Ok(TunnelPlan {
        connect: ConnectAction::Spawn(command),
        disconnect: DisconnectAction::KillSpawned,
        files: Vec::new(),
    })
}

fn wireguard_plan(wg: &WireGuardProfile, runtime_dir: &Path) -> Result<TunnelPlan, VpnError> {
    let private_key = resolve_secret(&wg.private_key_ref)?;
    let path = runtime_dir.join(WIREGUARD_CONFIG);
    let conf_path = path.display().to_string();

    let contents = Secret::new(render_wireguard_config(wg, &private_key));

    Ok(TunnelPlan {
        connect: ConnectAction::Run(TunnelCommand::new("wg-quick").arg("up").arg(&conf_path)),
        disconnect: DisconnectAction::Run(
            TunnelCommand::new("wg-quick").arg("down").arg(&conf_path),
        ),
        files: vec![RenderedFile { path, contents }],
    })
}

fn render_wireguard_config(wg: &WireGuardProfile, private_key: &Secret) -> String {
    let mut conf = String::new();
    conf.push_str("[Interface]\n");
    conf.push_str(&format!("PrivateKey = {}\n", private_key.expose()));
    conf.push_str(&format!("Address = {}\n", wg.address));
    conf.push_str("\n[Peer]\n");
    conf.push_str(&format!("PublicKey = {}\n", wg.public_key));
    conf.push_str(&format!("Endpoint = {}\n", wg.endpoint));
    conf.push_str(&format!("AllowedIPs = {}\n", wg.allowed_ips.join(", ")));
    if let Some(keepalive) = wg.persistent_keepalive {
        conf.push_str(&format!("PersistentKeepalive = {}\n", keepalive));
    }
    conf
}
