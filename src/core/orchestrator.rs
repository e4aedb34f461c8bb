//! Job orchestration.
//!
//! One task per job drives its state machine (see [`runner`](super::runner)).
//! A single dispatcher task consumes gateway events in arrival order and
//! routes each to its job: by MAC once a device is bound, or through the
//! correlation table for a first discover.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::boot::{BootEvent, ProvisioningEvent};
use super::catalog::Customer;
use super::correlation::{CorrelationTable, Resolution};
use super::error::ProvisionError;
use super::gateway::BootEventGateway;
use super::models::{Job, JobCreated, JobStatus, JobWithHistory, NewJobRequest};
use super::naming::NamingKey;
use super::notifications::JobEvent;
use super::runner::{JobInput, JobRunner};
use super::vpn::{VpnProfile, VpnSession};
use crate::context::AppContext;
use crate::db::{devices, jobs};
use crate::logging::LogThrottle;

const EVENT_QUEUE_DEPTH: usize = 256;

struct JobHandle {
    tx: mpsc::UnboundedSender<JobInput>,
    cancel: CancellationToken,
    status: watch::Receiver<JobStatus>,
}

#[derive(Default)]
struct Routing {
    correlation: CorrelationTable,
    /// Bound MAC -> live job.
    macs: HashMap<String, String>,
}

pub(crate) struct Shared {
    pub(crate) ctx: AppContext,
    pub(crate) shutdown: CancellationToken,
    jobs: Mutex<HashMap<String, JobHandle>>,
    routing: Mutex<Routing>,
    events_tx: mpsc::Sender<ProvisioningEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ProvisioningEvent>>>,
    unknown_mac_log: LogThrottle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn spawn_job(
        self: &Arc<Self>,
        job: Job,
        short_code: String,
        profile: Option<VpnProfile>,
        init_error: Option<ProvisionError>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(job.status);

        // Routable only once the handle exists, or a discover could claim
        // the job and find nothing to deliver to.
        lock(&self.jobs).insert(
            job.id.clone(),
            JobHandle {
                tx,
                cancel: cancel.clone(),
                status: status_rx,
            },
        );

        if init_error.is_none() {
            let mut routing = lock(&self.routing);
            match &job.mac_address {
                Some(mac) => {
                    routing.macs.insert(mac.clone(), job.id.clone());
                }
                None if job.status == JobStatus::Preparing => {
                    routing
                        .correlation
                        .insert(&job.interface_id, &job.customer_id, &job.id);
                }
                None => {}
            }
        }

        let runner = JobRunner::new(self.clone(), job, short_code, profile, status_tx);
        tokio::spawn(runner.run(rx, cancel, init_error));
    }

    fn route(&self, event: ProvisioningEvent) {
        let mac = event.mac().to_string();

        let target = {
            let mut routing = lock(&self.routing);
            if let Some(job_id) = routing.macs.get(&mac) {
                Some(job_id.clone())
            } else if let ProvisioningEvent::Boot(BootEvent::DiscoverReceived { interface_id, .. }) =
                &event
            {
                match routing.correlation.claim(interface_id) {
                    Resolution::Matched(job_id) => {
                        routing.macs.insert(mac.clone(), job_id.clone());
                        Some(job_id)
                    }
                    Resolution::Ambiguous(candidates) if candidates.is_empty() => {
                        if let Some(suppressed) = self.unknown_mac_log.admit() {
                            warn!(mac = %mac, interface_id = %interface_id, suppressed, "Discover matched no pending job, dropping");
                        }
                        None
                    }
                    Resolution::Ambiguous(candidates) => {
                        let err = ProvisionError::CorrelationAmbiguity {
                            mac: mac.clone(),
                            interface_id: interface_id.clone(),
                            candidates: candidates.len(),
                        };
                        warn!(mac = %mac, interface_id = %interface_id, candidates = ?candidates, "{}", err);
                        None
                    }
                }
            } else {
                if let Some(suppressed) = self.unknown_mac_log.admit() {
                    info!(mac = %mac, kind = ?event.kind(), suppressed, "Event for unknown MAC, dropping");
                }
                None
            }
        };

        let Some(job_id) = target else {
            return;
        };

        let delivered = lock(&self.jobs)
            .get(&job_id)
            .is_some_and(|h| h.tx.send(JobInput::Event(event)).is_ok());
        if !delivered {
            debug!(job_id = %job_id, mac = %mac, "Job no longer running, event dropped");
        }
    }

    /// Put a job back in the correlation table after it turned a discover down.
    pub(crate) fn unclaim(&self, job: &Job) {
        let mut routing = lock(&self.routing);
        routing.macs.retain(|_, id| id != &job.id);
        routing
            .correlation
            .insert(&job.interface_id, &job.customer_id, &job.id);
    }

    /// Drop every route to a job that reached a terminal state.
    pub(crate) fn forget(&self, job_id: &str) {
        let mut routing = lock(&self.routing);
        routing.correlation.remove(job_id);
        routing.macs.retain(|_, id| id != job_id);
    }

    pub(crate) fn finish(&self, job_id: &str) {
        lock(&self.jobs).remove(job_id);
    }

    pub(crate) fn notify(&self, event: JobEvent) {
        if let Some(notifier) = &self.ctx.notifier {
            let notifier = notifier.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(event).await {
                    warn!(error = %e, "Failed to send notification");
                }
            });
        }
    }

    async fn validate(
        &self,
        req: &NewJobRequest,
    ) -> Result<(Customer, Option<VpnProfile>), ProvisionError> {
        if req.interface_id.trim().is_empty() {
            return Err(ProvisionError::Validation(
                "interface_id must not be empty".to_string(),
            ));
        }

        let customer = self
            .ctx
            .catalog
            .customer(&req.customer_id)
            .await
            .map_err(|e| ProvisionError::Registry(e.context("customer catalog unavailable")))?
            .ok_or_else(|| ProvisionError::InvalidCustomer(req.customer_id.clone()))?;

        self.ctx
            .catalog
            .image(&req.image_ref)
            .await
            .map_err(|e| ProvisionError::Registry(e.context("image catalog unavailable")))?
            .ok_or_else(|| ProvisionError::InvalidImage(req.image_ref.clone()))?;

        let profile = match &req.vpn_profile_id {
            Some(profile_id) => Some(customer.profile(profile_id).cloned().ok_or_else(|| {
                ProvisionError::InvalidVpnProfile {
                    customer_id: customer.id.clone(),
                    profile_id: profile_id.clone(),
                }
            })?),
            None => None,
        };

        if !customer.allows_interface(&req.interface_id) {
            return Err(ProvisionError::Validation(format!(
                "interface {} is not enabled for customer {}",
                req.interface_id, customer.id
            )));
        }

        Ok((customer, profile))
    }

    /// Customer and profile of a job loaded from the registry.
    async fn resolve_resumed(
        &self,
        job: &Job,
    ) -> Result<(Customer, Option<VpnProfile>), ProvisionError> {
        let customer = self
            .ctx
            .catalog
            .customer(&job.customer_id)
            .await?
            .ok_or_else(|| ProvisionError::InvalidCustomer(job.customer_id.clone()))?;

        let profile = match &job.vpn_profile_id {
            Some(profile_id) => Some(customer.profile(profile_id).cloned().ok_or_else(|| {
                ProvisionError::InvalidVpnProfile {
                    customer_id: customer.id.clone(),
                    profile_id: profile_id.clone(),
                }
            })?),
            None => None,
        };

        Ok((customer, profile))
    }
}

/// Handle to the running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            shared: Arc::new(Shared {
                ctx,
                shutdown: CancellationToken::new(),
                jobs: Mutex::new(HashMap::new()),
                routing: Mutex::new(Routing::default()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                unknown_mac_log: LogThrottle::new(Duration::from_secs(10)),
            }),
        }
    }

    pub fn ctx(&self) -> &AppContext {
        &self.shared.ctx
    }

    /// Entry point for boot-service and agent callbacks.
    pub fn gateway(&self) -> BootEventGateway {
        BootEventGateway::new(self.shared.events_tx.clone())
    }

    /// Resume persisted jobs, then start routing events.
    pub async fn start(&self) -> anyhow::Result<()> {
        let resumed = self.recover().await?;
        info!(resumed, "Orchestrator started");

        let rx = lock(&self.shared.events_rx)
            .take()
            .ok_or_else(|| anyhow::anyhow!("orchestrator already started"))?;

        let shared = self.shared.clone();
        tokio::spawn(async move {
            dispatch(shared, rx).await;
        });
        Ok(())
    }

    /// Stop routing events and park job tasks. Jobs stay in their persisted
    /// state and resume on the next start.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Rebuild naming counters, routes, tunnels and timers from the registry.
    pub async fn recover(&self) -> Result<usize, ProvisionError> {
        let ctx = &self.shared.ctx;

        for device in devices::list(&ctx.db).await? {
            ctx.naming.restore_committed(
                &NamingKey::new(&device.customer_id, device.device_class),
                device.sequence_number,
            );
        }

        let active = jobs::list_active(&ctx.db).await?;
        let count = active.len();

        for job in active {
            let key = NamingKey::new(&job.customer_id, job.device_class);
            if job.naming_committed {
                ctx.naming.restore_committed(&key, job.sequence_number);
            } else {
                ctx.naming.restore_reservation(&key, job.sequence_number);
            }

            info!(job_id = %job.id, status = %job.status, mac = ?job.mac_address, "Resuming job");
            match self.shared.resolve_resumed(&job).await {
                Ok((customer, profile)) => {
                    self.shared.spawn_job(job, customer.short_code, profile, None)
                }
                Err(e) => self.shared.spawn_job(job, String::new(), None, Some(e)),
            }
        }

        Ok(count)
    }

    pub async fn create_job(&self, req: NewJobRequest) -> Result<JobCreated, ProvisionError> {
        let ctx = &self.shared.ctx;
        let (customer, profile) = self.shared.validate(&req).await?;

        let key = NamingKey::new(&req.customer_id, req.device_class);
        let sequence_number = ctx.naming.reserve(&key)?;

        let now = Utc::now();
        let job = Job {
            id: Uuid::now_v7().to_string(),
            customer_id: req.customer_id,
            device_class: req.device_class,
            image_ref: req.image_ref,
            vpn_profile_id: req.vpn_profile_id,
            interface_id: req.interface_id.trim().to_string(),
            status: JobStatus::Preparing,
            mac_address: None,
            ip_address: None,
            sequence_number,
            name: None,
            naming_committed: false,
            failure_reason: None,
            version: 0,
            created_at: now,
            status_changed_at: now,
            completed_at: None,
        };

        if let Err(e) = jobs::create(&ctx.db, job.clone()).await {
            ctx.naming.release(&key, sequence_number);
            return Err(ProvisionError::Registry(e));
        }

        info!(
            job_id = %job.id,
            customer_id = %job.customer_id,
            device_class = %job.device_class,
            interface_id = %job.interface_id,
            sequence_number,
            vpn_profile = ?job.vpn_profile_id,
            "Job created"
        );

        let created = JobCreated {
            job_id: job.id.clone(),
            status: job.status,
        };
        self.shared.spawn_job(job, customer.short_code, profile, None);
        Ok(created)
    }

    pub async fn job(&self, job_id: &str) -> Result<Job, ProvisionError> {
        jobs::get(&self.shared.ctx.db, job_id.to_string())
            .await?
            .ok_or_else(|| ProvisionError::JobNotFound(job_id.to_string()))
    }

    pub async fn job_history(&self, job_id: &str) -> Result<JobWithHistory, ProvisionError> {
        jobs::get_with_history(&self.shared.ctx.db, job_id.to_string())
            .await?
            .ok_or_else(|| ProvisionError::JobNotFound(job_id.to_string()))
    }

    pub async fn list_jobs(
        &self,
        limit: u32,
        offset: u32,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, ProvisionError> {
        Ok(jobs::list(&self.shared.ctx.db, limit, offset, status).await?)
    }

    /// Cancel a job and wait until it has released everything it held.
    /// Cancelling a terminal job is a no-op.
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job, ProvisionError> {
        let watcher = lock(&self.shared.jobs).get(job_id).map(|h| {
            h.cancel.cancel();
            h.status.clone()
        });

        if let Some(mut status) = watcher {
            // Err means the task already exited; the registry has the outcome.
            let _ = status.wait_for(|s| s.is_terminal()).await;
        }

        self.job(job_id).await
    }

    /// Operator ack for a READY job.
    pub async fn finalize_job(&self, job_id: &str) -> Result<Job, ProvisionError> {
        let tx = lock(&self.shared.jobs).get(job_id).map(|h| h.tx.clone());

        if let Some(tx) = tx {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(JobInput::Finalize(reply_tx)).is_ok() {
                if let Ok(result) = reply_rx.await {
                    return result;
                }
            }
        }

        let job = self.job(job_id).await?;
        match job.status {
            JobStatus::Done => Ok(job),
            actual => Err(ProvisionError::InvalidState {
                job_id: job.id,
                actual,
                expected: JobStatus::Ready,
            }),
        }
    }

    /// Status updates for a live job. `None` once the job task has exited.
    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<JobStatus>> {
        lock(&self.shared.jobs).get(job_id).map(|h| h.status.clone())
    }

    pub fn vpn_session(&self) -> VpnSession {
        self.shared.ctx.tunnels.session()
    }

    pub fn active_jobs(&self) -> usize {
        lock(&self.shared.jobs).len()
    }

    pub fn pending_correlations(&self) -> usize {
        lock(&self.shared.routing).correlation.len()
    }
}

async fn dispatch(shared: Arc<Shared>, mut rx: mpsc::Receiver<ProvisioningEvent>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => shared.route(event),
                None => break,
            },
        }
    }
    debug!("Event dispatcher stopped");
}
