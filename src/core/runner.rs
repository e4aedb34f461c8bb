//! Per-job state machine task.
//!
//! A runner is the only writer of its job's status. It waits on, in
//! priority order: cancellation, the VPN acquire, the next routed input, and
//! the dwell deadline of the current state. Every transition is persisted
//! with a version check before it becomes visible.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::boot::{AgentEvent, BootEvent, ProvisioningEvent};
use super::error::{ProvisionError, ScriptStage};
use super::models::{Device, DeviceState, Job, JobStatus};
use super::naming::{NamingKey, format_name};
use super::notifications::JobEvent;
use super::orchestrator::Shared;
use super::redact::redact;
use super::vpn::{Acquired, VpnError, VpnProfile};
use crate::db::jobs::{self, DeviceWrite};
use crate::db::devices;

/// Dwell used for states without a configured limit.
const UNBOUNDED_DWELL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;

type AcquireFuture = Pin<Box<dyn Future<Output = Result<Acquired, VpnError>> + Send>>;

pub(crate) enum JobInput {
    Event(ProvisioningEvent),
    Finalize(oneshot::Sender<Result<Job, ProvisionError>>),
}

pub(crate) struct JobRunner {
    shared: Arc<Shared>,
    job: Job,
    key: NamingKey,
    short_code: String,
    profile: Option<VpnProfile>,
    vpn_ready: bool,
    staged: bool,
    status_tx: watch::Sender<JobStatus>,
}

async fn poll_acquire(pending: &mut Option<AcquireFuture>) -> Result<Acquired, VpnError> {
    match pending {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

impl JobRunner {
    pub(crate) fn new(
        shared: Arc<Shared>,
        job: Job,
        short_code: String,
        profile: Option<VpnProfile>,
        status_tx: watch::Sender<JobStatus>,
    ) -> Self {
        Self {
            key: NamingKey::new(&job.customer_id, job.device_class),
            shared,
            job,
            short_code,
            profile,
            vpn_ready: false,
            staged: false,
            status_tx,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<JobInput>,
        cancel: CancellationToken,
        init_error: Option<ProvisionError>,
    ) {
        if let Some(err) = init_error {
            self.fail(err).await;
            self.shared.finish(&self.job.id);
            return;
        }

        let mut acquiring: Option<AcquireFuture> = self.profile.clone().map(|profile| {
            let tunnels = self.shared.ctx.tunnels.clone();
            let job_id = self.job.id.clone();
            Box::pin(async move { tunnels.acquire(&job_id, &profile).await }) as AcquireFuture
        });
        if acquiring.is_none() {
            self.vpn_ready = true;
            // Resumed in PXE_SELECTION: hand the device to the boot service again.
            self.stage_if_due().await;
        }

        while !self.job.status.is_terminal() {
            let deadline = self.deadline();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.end(JobStatus::Cancelled, None).await;
                }
                _ = self.shared.shutdown.cancelled() => {
                    debug!(job_id = %self.job.id, status = %self.job.status, "Parking job for shutdown");
                    break;
                }
                result = poll_acquire(&mut acquiring) => {
                    acquiring = None;
                    self.on_tunnel(result).await;
                }
                input = rx.recv() => match input {
                    Some(JobInput::Event(event)) => self.apply(event).await,
                    Some(JobInput::Finalize(reply)) => {
                        let result = self.finalize().await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.on_timeout().await;
                }
            }
        }

        drop(acquiring);
        self.shared.finish(&self.job.id);
    }

    fn deadline(&self) -> Instant {
        let dwell = self
            .shared
            .ctx
            .config
            .timeouts
            .dwell(self.job.status)
            .unwrap_or(UNBOUNDED_DWELL);
        let elapsed = (Utc::now() - self.job.status_changed_at)
            .to_std()
            .unwrap_or_default();
        Instant::now() + dwell.saturating_sub(elapsed)
    }

    async fn apply(&mut self, event: ProvisioningEvent) {
        let kind = event.kind();
        let status = self.job.status;

        match event {
            ProvisioningEvent::Boot(BootEvent::DiscoverReceived { mac, .. })
                if status == JobStatus::Preparing && self.job.mac_address.is_none() =>
            {
                self.bind(mac).await;
            }
            ProvisioningEvent::Boot(BootEvent::LeaseAssigned { ip, .. })
                if status == JobStatus::PxeSelection =>
            {
                self.record_ip(ip).await;
            }
            ProvisioningEvent::Boot(BootEvent::BootImageDelivered { .. })
                if status == JobStatus::PxeSelection =>
            {
                self.advance(JobStatus::Imaging, "Boot image delivered").await;
            }
            ProvisioningEvent::Agent(AgentEvent::InstallStarted { .. })
                if status == JobStatus::Imaging =>
            {
                self.advance(JobStatus::Installing, "Install script started").await;
            }
            ProvisioningEvent::Agent(AgentEvent::InstallResult {
                success, detail, ..
            }) if status == JobStatus::Installing => {
                if success {
                    self.advance(JobStatus::Verifying, "Install script succeeded").await;
                } else {
                    self.fail(script_failure(ScriptStage::Install, detail)).await;
                }
            }
            ProvisioningEvent::Agent(AgentEvent::VerifyResult {
                success, detail, ..
            }) if status == JobStatus::Verifying => {
                if !success {
                    self.fail(script_failure(ScriptStage::Verify, detail)).await;
                } else if self.advance(JobStatus::Ready, "Verify script succeeded").await
                    && self.shared.ctx.config.auto_finalize
                {
                    self.end(JobStatus::Done, None).await;
                }
            }
            _ => {
                // Re-delivery of an event this job is already past, or one
                // that does not apply in the current state.
                debug!(job_id = %self.job.id, kind = ?kind, status = %status, "Ignoring event");
            }
        }
    }

    async fn bind(&mut self, mac: String) {
        let db = &self.shared.ctx.db;

        let existing = match devices::get_by_mac(db, mac.clone()).await {
            Ok(existing) => existing,
            Err(e) => {
                error!(job_id = %self.job.id, mac = %mac, error = %e, "Device lookup failed, discover not applied");
                self.shared.unclaim(&self.job);
                return;
            }
        };

        let (sequence_number, name, adopted) = match existing {
            Some(device)
                if device.customer_id == self.job.customer_id
                    && device.device_class == self.job.device_class =>
            {
                (device.sequence_number, device.name, true)
            }
            Some(device) => {
                warn!(
                    job_id = %self.job.id,
                    mac = %mac,
                    device_name = %device.name,
                    owner = %device.customer_id,
                    device_class = %device.device_class,
                    "Device is registered to another customer or class, ignoring discover"
                );
                self.shared.unclaim(&self.job);
                return;
            }
            None => (
                self.job.sequence_number,
                format_name(&self.short_code, self.job.device_class, self.job.sequence_number),
                false,
            ),
        };

        let reserved = self.job.sequence_number;
        let mut next = self.next(JobStatus::PxeSelection);
        next.mac_address = Some(mac.clone());
        next.sequence_number = sequence_number;
        next.name = Some(name.clone());
        next.naming_committed = true;

        let device = if adopted {
            DeviceWrite::Adopt { mac: mac.clone() }
        } else {
            DeviceWrite::Bind(Device {
                mac_address: mac.clone(),
                customer_id: self.job.customer_id.clone(),
                device_class: self.job.device_class,
                sequence_number,
                name: name.clone(),
                state: DeviceState::Bound,
                job_id: self.job.id.clone(),
                bound_at: next.status_changed_at,
                imaged_at: None,
            })
        };

        let description = format!("Device {} bound as {}", mac, name);
        if !self.persist(next, Some(description), device).await {
            self.shared.unclaim(&self.job);
            return;
        }

        let naming = &self.shared.ctx.naming;
        if adopted {
            // The device keeps its name; our reservation goes back.
            naming.release(&self.key, reserved);
            info!(job_id = %self.job.id, mac = %mac, device_name = %name, "Re-provisioning known device");
        } else {
            naming.commit(&self.key, sequence_number);
        }

        self.shared.notify(JobEvent::DeviceBound {
            job_id: self.job.id.clone(),
            customer_id: self.job.customer_id.clone(),
            device_name: name,
            mac_address: mac,
        });

        self.stage_if_due().await;
    }

    async fn record_ip(&mut self, ip: String) {
        if self.job.ip_address.as_deref() == Some(ip.as_str()) {
            return;
        }
        match jobs::record_ip(&self.shared.ctx.db, self.job.id.clone(), ip.clone()).await {
            Ok(()) => {
                debug!(job_id = %self.job.id, ip = %ip, "Lease recorded");
                self.job.ip_address = Some(ip);
            }
            Err(e) => warn!(job_id = %self.job.id, error = %e, "Failed to record lease"),
        }
    }

    async fn on_tunnel(&mut self, result: Result<Acquired, VpnError>) {
        match result {
            Ok(Acquired::PassThrough) => {
                self.vpn_ready = true;
            }
            Ok(Acquired::Tunnel(session)) => {
                info!(
                    job_id = %self.job.id,
                    profile = ?session.active_profile_id,
                    holders = session.holder_job_ids.len(),
                    "VPN session held"
                );
                self.vpn_ready = true;
            }
            Err(e) => {
                let reason = redact(&e.to_string()).into_owned();
                self.fail(ProvisionError::TunnelEstablishFailed(reason)).await;
                return;
            }
        }
        self.stage_if_due().await;
    }

    /// Hand the bound device to the boot service once the tunnel is up.
    async fn stage_if_due(&mut self) {
        if self.job.status != JobStatus::PxeSelection || self.staged || !self.vpn_ready {
            return;
        }
        let Some(mac) = self.job.mac_address.clone() else {
            return;
        };

        match self
            .shared
            .ctx
            .boot
            .stage_image(&mac, &self.job.image_ref, &self.job.id)
            .await
        {
            Ok(()) => {
                self.staged = true;
                info!(job_id = %self.job.id, mac = %mac, image_ref = %self.job.image_ref, "Boot image staged");
            }
            Err(e) => {
                let reason = redact(&format!("{:#}", e)).into_owned();
                self.fail(ProvisionError::BootHandoff(reason)).await;
            }
        }
    }

    async fn on_timeout(&mut self) {
        let status = self.job.status;
        let dwell = self
            .shared
            .ctx
            .config
            .timeouts
            .dwell(status)
            .unwrap_or(UNBOUNDED_DWELL);
        self.fail(ProvisionError::Timeout { status, dwell }).await;
    }

    async fn finalize(&mut self) -> Result<Job, ProvisionError> {
        match self.job.status {
            JobStatus::Ready => {
                self.end(JobStatus::Done, None).await;
                Ok(self.job.clone())
            }
            JobStatus::Done => Ok(self.job.clone()),
            actual => Err(ProvisionError::InvalidState {
                job_id: self.job.id.clone(),
                actual,
                expected: JobStatus::Ready,
            }),
        }
    }

    fn next(&self, status: JobStatus) -> Job {
        let now = Utc::now();
        let mut next = self.job.clone();
        next.status = status;
        next.version += 1;
        next.status_changed_at = now;
        if status.is_terminal() {
            next.completed_at = Some(now);
        }
        next
    }

    async fn advance(&mut self, status: JobStatus, description: &str) -> bool {
        let next = self.next(status);
        self.persist(next, Some(description.to_string()), DeviceWrite::None)
            .await
    }

    /// Store `next` and adopt it. Returns whether the transition happened.
    async fn persist(&mut self, next: Job, description: Option<String>, device: DeviceWrite) -> bool {
        let from = self.job.status;
        let db = &self.shared.ctx.db;

        match jobs::transition(db, next.clone(), self.job.version, description, device).await {
            Ok(true) => {
                info!(job_id = %next.id, from = %from, to = %next.status, version = next.version, "Job transition");
                self.job = next;
                // Terminal status is published by `end` once resources are released.
                if !self.job.status.is_terminal() {
                    self.status_tx.send_replace(self.job.status);
                }
                true
            }
            Ok(false) => {
                warn!(job_id = %self.job.id, version = self.job.version, "Stale job version, reloading");
                if let Ok(Some(stored)) = jobs::get(db, self.job.id.clone()).await {
                    self.job = stored;
                }
                false
            }
            Err(e) => {
                error!(job_id = %self.job.id, from = %from, to = %next.status, error = %e, "Failed to persist transition");
                false
            }
        }
    }

    async fn fail(&mut self, err: ProvisionError) {
        self.end(JobStatus::Failed, Some(err)).await;
    }

    /// Move to a terminal state and release everything the job holds.
    /// Runs at most once per job.
    async fn end(&mut self, status: JobStatus, err: Option<ProvisionError>) {
        if self.job.status.is_terminal() {
            return;
        }

        let from = self.job.status;
        let reason = err.map(|e| redact(&e.to_string()).into_owned());
        let mut next = self.next(status);
        next.failure_reason = reason.clone();

        let unbind = status != JobStatus::Done && self.owns_unimaged_binding().await;
        let device = match (&next.mac_address, status) {
            (Some(mac), JobStatus::Done) => DeviceWrite::MarkImaged {
                mac: mac.clone(),
                at: next.status_changed_at,
            },
            (Some(mac), _) if unbind => DeviceWrite::Unbind { mac: mac.clone() },
            _ => DeviceWrite::None,
        };
        if unbind {
            next.naming_committed = false;
        }
        let description = reason.clone().unwrap_or_else(|| match status {
            JobStatus::Done => "Provisioning complete".to_string(),
            JobStatus::Cancelled => "Cancelled by operator".to_string(),
            _ => "Failed".to_string(),
        });

        let mut persisted = false;
        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            next.version = self.job.version + 1;
            if self
                .persist(next.clone(), Some(description.clone()), device.clone())
                .await
            {
                persisted = true;
                break;
            }
            if self.job.status.is_terminal() {
                self.status_tx.send_replace(self.job.status);
                return;
            }
            if attempt < TERMINAL_WRITE_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
        }
        if !persisted {
            // Resources are released regardless; the stored row is
            // reconciled by its dwell timeout after a restart.
            error!(job_id = %self.job.id, to = %status, "Terminal transition not persisted");
            self.job = next;
        }

        match status {
            JobStatus::Failed => {
                warn!(job_id = %self.job.id, stage = %from, reason = ?reason, "Job failed")
            }
            JobStatus::Cancelled => info!(job_id = %self.job.id, stage = %from, "Job cancelled"),
            _ => info!(job_id = %self.job.id, device_name = ?self.job.name, "Job done"),
        }

        self.release_resources(unbind && persisted).await;
        self.status_tx.send_replace(self.job.status);

        let event = match status {
            JobStatus::Done => JobEvent::Completed {
                job_id: self.job.id.clone(),
                customer_id: self.job.customer_id.clone(),
                device_name: self.job.name.clone().unwrap_or_default(),
                duration_secs: (Utc::now() - self.job.created_at).num_seconds().max(0) as u64,
            },
            _ => JobEvent::Ended {
                job_id: self.job.id.clone(),
                customer_id: self.job.customer_id.clone(),
                device_name: self.job.name.clone(),
                status: status.to_string(),
                reason,
            },
        };
        self.shared.notify(event);
    }

    /// Whether the device bound by this job got its name from this job and
    /// has not been imaged yet.
    async fn owns_unimaged_binding(&self) -> bool {
        let Some(mac) = self.job.mac_address.clone() else {
            return false;
        };
        match devices::get_by_mac(&self.shared.ctx.db, mac).await {
            Ok(Some(device)) => device.job_id == self.job.id && device.state == DeviceState::Bound,
            Ok(None) => false,
            Err(e) => {
                warn!(job_id = %self.job.id, error = %e, "Device lookup failed, keeping name retired");
                false
            }
        }
    }

    async fn release_resources(&mut self, retract_name: bool) {
        let ctx = &self.shared.ctx;

        if self.profile.is_some() && ctx.tunnels.release(&self.job.id).await {
            debug!(job_id = %self.job.id, "VPN hold released");
        }

        let seq = self.job.sequence_number;
        if retract_name {
            if ctx.naming.retract(&self.key, seq) {
                debug!(job_id = %self.job.id, seq, "Unimaged device name released");
            }
        } else if !self.job.naming_committed && ctx.naming.release(&self.key, seq) {
            debug!(job_id = %self.job.id, seq, "Naming reservation released");
        }

        self.shared.forget(&self.job.id);

        if let Some(mac) = &self.job.mac_address {
            if let Err(e) = ctx.boot.clear(mac).await {
                warn!(job_id = %self.job.id, mac = %mac, error = %e, "Failed to clear boot staging");
            }
        }
    }
}

fn script_failure(stage: ScriptStage, detail: Option<String>) -> ProvisionError {
    let detail = detail
        .map(|d| redact(d.trim()).into_owned())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "no detail reported".to_string());
    ProvisionError::ScriptFailure { stage, detail }
}
