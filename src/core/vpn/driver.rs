use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::VpnError;
use super::command::{ConnectAction, DisconnectAction, TunnelCommand, TunnelPlan, plan};
use super::profile::VpnProfile;

/// Brings the host's single egress tunnel up and down.
///
/// Implementations may assume calls are serialized by the
/// [`TunnelManager`](super::TunnelManager): at most one tunnel exists at a time.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    async fn connect(&self, profile: &VpnProfile) -> Result<(), VpnError>;

    async fn disconnect(&self, profile: &VpnProfile) -> Result<(), VpnError>;
}

/// Lines of client stderr kept for the error of a failed connect.
const STDERR_TAIL: usize = 20;

/// A long-running VPN client past its settle period.
struct Supervised {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<(), VpnError>>,
}

/// Drives real VPN clients (`openconnect`, `openfortivpn`, `wg-quick`).
pub struct CommandDriver {
    runtime_dir: PathBuf,
    settle: Duration,
    spawned: Mutex<Option<Supervised>>,
}

impl CommandDriver {
    pub fn new(runtime_dir: PathBuf) -> Self {
        Self {
            runtime_dir,
            settle: Duration::from_secs(5),
            spawned: Mutex::new(None),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn plan(&self, profile: &VpnProfile) -> Result<Option<TunnelPlan>, VpnError> {
        plan(profile, &self.runtime_dir)
    }

    async fn write_files(&self, plan: &TunnelPlan) -> Result<(), VpnError> {
        for file in &plan.files {
            if let Some(parent) = file.path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    VpnError::EstablishFailed(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
            write_private(&file.path, file.contents.expose()).await.map_err(|e| {
                VpnError::EstablishFailed(format!("cannot write {}: {}", file.path.display(), e))
            })?;
        }
        Ok(())
    }

    async fn remove_files(&self, plan: &TunnelPlan) {
        for file in &plan.files {
            if let Err(e) = tokio::fs::remove_file(&file.path).await {
                debug!(path = %file.path.display(), error = %e, "Failed to remove tunnel file");
            }
        }
    }

    /// Tear down whatever a previous daemon left behind for this plan: a
    /// rendered config still on disk means its interface may still be up.
    async fn sweep_stale(&self, plan: &TunnelPlan) {
        let DisconnectAction::Run(cmd) = &plan.disconnect else {
            return;
        };
        let mut stale = false;
        for file in &plan.files {
            stale |= tokio::fs::try_exists(&file.path).await.unwrap_or(false);
        }
        if !stale {
            return;
        }

        info!(command = %cmd.display(), "Stale tunnel config found, tearing down first");
        if let Err(e) = run(cmd).await {
            debug!(error = %e, "Stale tunnel teardown failed");
        }
    }

    async fn spawn_client(&self, cmd: &TunnelCommand) -> Result<(), VpnError> {
        let mut child = command_for(cmd)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VpnError::EstablishFailed(format!("failed to spawn {}: {}", cmd.program, e)))?;

        // Drained from the start so a chatty client never blocks on a full pipe.
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(drain_stderr(stderr, cmd.clone())));

        feed_stdin(&mut child, cmd).await?;

        // A client that dies during the settle period never came up.
        let settled = tokio::time::timeout(self.settle, child.wait()).await;
        match settled {
            Ok(Ok(status)) => {
                let tail = match stderr {
                    Some(drain) => tokio::time::timeout(Duration::from_secs(1), drain)
                        .await
                        .ok()
                        .and_then(Result::ok)
                        .unwrap_or_default(),
                    None => String::new(),
                };
                Err(VpnError::EstablishFailed(cmd.redact(&format!(
                    "{} exited with {}: {}",
                    cmd.program,
                    status,
                    tail.trim()
                ))))
            }
            Ok(Err(e)) => Err(VpnError::EstablishFailed(format!(
                "failed to wait for {}: {}",
                cmd.program, e
            ))),
            Err(_) => {
                let (stop, stopped) = oneshot::channel();
                let task = tokio::spawn(supervise(child, stopped, cmd.program.clone()));
                *self.spawned.lock().await = Some(Supervised { stop, task });
                Ok(())
            }
        }
    }

    async fn kill_spawned(&self) -> Result<(), VpnError> {
        let supervised = self.spawned.lock().await.take();
        let Some(Supervised { stop, task }) = supervised else {
            return Ok(());
        };

        // Err means the client already exited on its own.
        let _ = stop.send(());
        match task.await {
            Ok(result) => result,
            Err(e) => Err(VpnError::TeardownFailed(format!("VPN client supervisor failed: {}", e))),
        }
    }
}

/// Own a settled client until it is told to stop or exits by itself.
async fn supervise(
    mut child: Child,
    stop: oneshot::Receiver<()>,
    program: String,
) -> Result<(), VpnError> {
    tokio::select! {
        _ = stop => {
            child
                .kill()
                .await
                .map_err(|e| VpnError::TeardownFailed(format!("failed to stop {}: {}", program, e)))?;
            debug!(program = %program, "VPN client stopped");
            Ok(())
        }
        status = child.wait() => {
            match status {
                Ok(status) => warn!(program = %program, status = %status, "VPN client exited unexpectedly"),
                Err(e) => warn!(program = %program, error = %e, "Lost track of VPN client"),
            }
            Ok(())
        }
    }
}

/// Log every stderr line (redacted) until EOF and return the last few.
async fn drain_stderr<R>(stderr: R, cmd: TunnelCommand) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = cmd.redact(String::from_utf8_lossy(&buf).trim_end());
                debug!(program = %cmd.program, "{}", line);
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                debug!(program = %cmd.program, error = %e, "Stopped reading VPN client stderr");
                break;
            }
        }
    }

    Vec::from(tail).join("\n")
}

#[async_trait]
impl TunnelDriver for CommandDriver {
    async fn connect(&self, profile: &VpnProfile) -> Result<(), VpnError> {
        let Some(plan) = self.plan(profile)? else {
            return Ok(());
        };

        self.sweep_stale(&plan).await;
        self.write_files(&plan).await?;

        let result = match &plan.connect {
            ConnectAction::Run(cmd) => {
                info!(profile = %profile.id, command = %cmd.display(), "Connecting tunnel");
                run(cmd).await.map_err(VpnError::EstablishFailed)
            }
            ConnectAction::Spawn(cmd) => {
                info!(profile = %profile.id, command = %cmd.display(), "Starting VPN client");
                self.spawn_client(cmd).await
            }
        };

        if result.is_err() {
            self.remove_files(&plan).await;
        }
        result
    }

    async fn disconnect(&self, profile: &VpnProfile) -> Result<(), VpnError> {
        let Some(plan) = self.plan(profile)? else {
            return Ok(());
        };

        let result = match &plan.disconnect {
            DisconnectAction::Run(cmd) => {
                info!(profile = %profile.id, command = %cmd.display(), "Disconnecting tunnel");
                run(cmd).await.map_err(VpnError::TeardownFailed)
            }
            DisconnectAction::KillSpawned => {
                info!(profile = %profile.id, "Stopping VPN client");
                self.kill_spawned().await
            }
        };

        self.remove_files(&plan).await;
        if let Err(e) = &result {
            warn!(profile = %profile.id, error = %e, "Tunnel teardown reported an error");
        }
        result
    }
}

fn command_for(cmd: &TunnelCommand) -> Command {
    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    command
}

async fn feed_stdin(child: &mut Child, cmd: &TunnelCommand) -> Result<(), VpnError> {
    if let (Some(secret), Some(mut stdin)) = (&cmd.stdin, child.stdin.take()) {
        stdin
            .write_all(format!("{}\n", secret.expose()).as_bytes())
            .await
            .map_err(|e| VpnError::EstablishFailed(format!("failed to pass credentials: {}", e)))?;
    }
    Ok(())
}

/// Run to completion; the error string is already redacted.
async fn run(cmd: &TunnelCommand) -> Result<(), String> {
    let mut child = command_for(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", cmd.program, e))?;

    feed_stdin(&mut child, cmd).await.map_err(|e| e.to_string())?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("failed to wait for {}: {}", cmd.program, e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(cmd.redact(&format!(
            "{} failed with {}: {}",
            cmd.display(),
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(unix)]
async fn write_private(path: &std::path::Path, contents: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await
}

#[cfg(not(unix))]
async fn write_private(path: &std::path::Path, contents: &str) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await
}
