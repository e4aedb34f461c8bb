//! Single egress tunnel shared by all jobs on this host.
//!
//! The tunnel manipulates one network interface, so only one profile can be
//! up at a time. Jobs on the same profile share the session (refcounted);
//! jobs on a different profile queue in request order until the last holder
//! releases and the tunnel is down again.
//!
//! Invariants:
//! - at most one session is `Up`, and `connect` is never called while another
//!   tunnel is up or coming up;
//! - a failed connect always ends `Down` (the driver is asked to tear down
//!   whatever it half-built);
//! - dropping a pending `acquire` removes its queue entry, so cancelling a job
//!   or timing it out unblocks the waiters behind it.

mod command;
mod driver;
mod profile;
mod simulated;

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub use command::{ConnectAction, DisconnectAction, TunnelCommand, TunnelPlan, plan};
pub use driver::{CommandDriver, TunnelDriver};
pub use profile::{
    ClientProfile, ClientProtocol, ProfileKind, VpnProfile, WireGuardProfile, resolve_secret,
};
pub use simulated::SimulatedDriver;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VpnError {
    #[error("{0}")]
    EstablishFailed(String),

    #[error("tunnel teardown failed: {0}")]
    TeardownFailed(String),

    #[error("secret reference {0} could not be resolved")]
    SecretUnavailable(String),

    #[error("tunnel came up after its job released it")]
    Abandoned,

    #[error("tunnel manager is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Down,
    Up,
}

/// Snapshot of the host's VPN session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnSession {
    pub state: SessionState,
    pub active_profile_id: Option<String>,
    pub holder_job_ids: Vec<String>,
    pub queued_job_ids: Vec<String>,
}

/// Outcome of a successful [`TunnelManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    /// Local profile: nothing to bring up.
    PassThrough,
    Tunnel(VpnSession),
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    job_id: String,
    profile_id: String,
}

#[derive(Debug)]
enum Phase {
    Down,
    Connecting {
        job_id: String,
        profile: VpnProfile,
        abandoned: bool,
    },
    Up {
        profile: VpnProfile,
        holders: BTreeSet<String>,
    },
    Disconnecting {
        profile_id: String,
    },
}

#[derive(Debug)]
struct State {
    phase: Phase,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
    closed: bool,
}

impl State {
    fn snapshot(&self) -> VpnSession {
        let queued_job_ids = self.queue.iter().map(|w| w.job_id.clone()).collect();
        match &self.phase {
            Phase::Up { profile, holders } => VpnSession {
                state: SessionState::Up,
                active_profile_id: Some(profile.id.clone()),
                holder_job_ids: holders.iter().cloned().collect(),
                queued_job_ids,
            },
            Phase::Connecting { profile, .. } => VpnSession {
                state: SessionState::Down,
                active_profile_id: Some(profile.id.clone()),
                holder_job_ids: Vec::new(),
                queued_job_ids,
            },
            Phase::Disconnecting { profile_id } => VpnSession {
                state: SessionState::Down,
                active_profile_id: Some(profile_id.clone()),
                holder_job_ids: Vec::new(),
                queued_job_ids,
            },
            Phase::Down => VpnSession {
                state: SessionState::Down,
                active_profile_id: None,
                holder_job_ids: Vec::new(),
                queued_job_ids,
            },
        }
    }

    /// True if a waiter for another profile asked before `ticket` (or at all,
    /// when the caller is not queued yet).
    fn other_profile_ahead(&self, profile_id: &str, ticket: Option<u64>) -> bool {
        self.queue
            .iter()
            .filter(|w| ticket.is_none_or(|t| w.ticket < t))
            .any(|w| w.profile_id != profile_id)
    }

    fn dequeue(&mut self, ticket: u64) {
        self.queue.retain(|w| w.ticket != ticket);
    }
}

enum Decision {
    Joined(VpnSession),
    Connect,
    Wait,
    Closed,
}

struct Shared {
    driver: Arc<dyn TunnelDriver>,
    state: Mutex<State>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn decide(&self, job_id: &str, profile: &VpnProfile, ticket: &mut Option<u64>) -> Decision {
        let mut state = self.lock();
        if state.closed {
            return Decision::Closed;
        }

        if let Phase::Up {
            profile: active,
            holders,
        } = &state.phase
        {
            if holders.contains(job_id) {
                return Decision::Joined(state.snapshot());
            }
            if active.id == profile.id && !state.other_profile_ahead(&profile.id, *ticket) {
                if let Some(t) = ticket.take() {
                    state.dequeue(t);
                }
                if let Phase::Up { holders, .. } = &mut state.phase {
                    holders.insert(job_id.to_string());
                }
                debug!(job_id, profile = %profile.id, "Joined existing tunnel session");
                return Decision::Joined(state.snapshot());
            }
        }

        if matches!(state.phase, Phase::Down) {
            let at_front = match (*ticket, state.queue.front()) {
                (_, None) => true,
                (Some(t), Some(front)) => front.ticket == t,
                (None, Some(_)) => false,
            };
            if at_front {
                if let Some(t) = ticket.take() {
                    state.dequeue(t);
                }
                state.phase = Phase::Connecting {
                    job_id: job_id.to_string(),
                    profile: profile.clone(),
                    abandoned: false,
                };
                return Decision::Connect;
            }
        }

        if ticket.is_none() {
            let t = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(Waiter {
                ticket: t,
                job_id: job_id.to_string(),
                profile_id: profile.id.clone(),
            });
            *ticket = Some(t);
            debug!(job_id, profile = %profile.id, ticket = t, "Queued for tunnel");
        }
        Decision::Wait
    }

    async fn connect(
        self: Arc<Self>,
        job_id: String,
        profile: VpnProfile,
    ) -> Result<VpnSession, VpnError> {
        info!(job_id = %job_id, profile = %profile.id, protocol = profile.protocol_name(), "Establishing tunnel");
        let result = self.driver.connect(&profile).await;

        match result {
            Ok(()) => {
                let abandoned = {
                    let mut state = self.lock();
                    let abandoned = matches!(state.phase, Phase::Connecting { abandoned: true, .. });
                    if abandoned {
                        state.phase = Phase::Disconnecting {
                            profile_id: profile.id.clone(),
                        };
                    } else {
                        state.phase = Phase::Up {
                            profile: profile.clone(),
                            holders: BTreeSet::from([job_id.clone()]),
                        };
                    }
                    abandoned
                };

                if abandoned {
                    info!(job_id = %job_id, profile = %profile.id, "Tunnel no longer needed, tearing down");
                    if let Err(e) = self.driver.disconnect(&profile).await {
                        warn!(profile = %profile.id, error = %e, "Teardown of abandoned tunnel failed");
                    }
                    self.lock().phase = Phase::Down;
                    self.changed.notify_waiters();
                    return Err(VpnError::Abandoned);
                }

                info!(job_id = %job_id, profile = %profile.id, "Tunnel up");
                let snapshot = self.lock().snapshot();
                self.changed.notify_waiters();
                Ok(snapshot)
            }
            Err(e) => {
                warn!(job_id = %job_id, profile = %profile.id, error = %e, "Tunnel establish failed");
                // Never leave a half-built tunnel behind.
                if let Err(teardown) = self.driver.disconnect(&profile).await {
                    debug!(profile = %profile.id, error = %teardown, "Cleanup after failed connect");
                }
                self.lock().phase = Phase::Down;
                self.changed.notify_waiters();
                Err(match e {
                    VpnError::EstablishFailed(reason) => VpnError::EstablishFailed(reason),
                    other => VpnError::EstablishFailed(other.to_string()),
                })
            }
        }
    }
}

/// Removes a queued waiter when its `acquire` future is dropped.
struct QueueSlot<'a> {
    shared: &'a Shared,
    ticket: Option<u64>,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.shared.lock().dequeue(ticket);
            self.shared.changed.notify_waiters();
        }
    }
}

/// Process-wide owner of the VPN session. Cheap to clone.
#[derive(Clone)]
pub struct TunnelManager {
    shared: Arc<Shared>,
}

impl TunnelManager {
    pub fn new(driver: Arc<dyn TunnelDriver>) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                state: Mutex::new(State {
                    phase: Phase::Down,
                    queue: VecDeque::new(),
                    next_ticket: 0,
                    closed: false,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Hold the tunnel for `profile` on behalf of `job_id`.
    ///
    /// Suspends while another profile is up or ahead in the queue. Dropping
    /// the returned future gives up the place in the queue. Idempotent for a
    /// job that already holds the session.
    pub async fn acquire(&self, job_id: &str, profile: &VpnProfile) -> Result<Acquired, VpnError> {
        if profile.is_local() {
            return Ok(Acquired::PassThrough);
        }

        let mut slot = QueueSlot {
            shared: &self.shared,
            ticket: None,
        };

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.decide(job_id, profile, &mut slot.ticket) {
                Decision::Joined(session) => return Ok(Acquired::Tunnel(session)),
                Decision::Connect => {
                    // The connect runs detached so a cancelled acquirer cannot
                    // interrupt the driver halfway; release() marks it abandoned.
                    let task = tokio::spawn(
                        self.shared
                            .clone()
                            .connect(job_id.to_string(), profile.clone()),
                    );
                    return match task.await {
                        Ok(result) => result.map(Acquired::Tunnel),
                        Err(e) => Err(VpnError::EstablishFailed(format!("connect task aborted: {}", e))),
                    };
                }
                Decision::Wait => notified.await,
                Decision::Closed => return Err(VpnError::ShutDown),
            }
        }
    }

    /// Drop `job_id`'s stake in the session: its queue entry, its pending
    /// connect, or its hold. The tunnel goes down when the last holder leaves.
    /// Returns whether the job had any stake.
    pub async fn release(&self, job_id: &str) -> bool {
        let (had_stake, teardown) = {
            let mut state = self.shared.lock();
            let queued_before = state.queue.len();
            state.queue.retain(|w| w.job_id != job_id);
            let mut had_stake = state.queue.len() != queued_before;
            let mut teardown = None;

            match &mut state.phase {
                Phase::Connecting {
                    job_id: connecting,
                    abandoned,
                    ..
                } if connecting.as_str() == job_id => {
                    *abandoned = true;
                    had_stake = true;
                }
                Phase::Up { profile, holders } => {
                    if holders.remove(job_id) {
                        had_stake = true;
                        if holders.is_empty() {
                            teardown = Some(profile.clone());
                        }
                    }
                }
                _ => {}
            }

            if let Some(profile) = &teardown {
                state.phase = Phase::Disconnecting {
                    profile_id: profile.id.clone(),
                };
            }
            (had_stake, teardown)
        };

        if let Some(profile) = teardown {
            info!(job_id, profile = %profile.id, "Last holder released, tearing down tunnel");
            if let Err(e) = self.shared.driver.disconnect(&profile).await {
                warn!(profile = %profile.id, error = %e, "Tunnel teardown failed");
            }
            self.shared.lock().phase = Phase::Down;
            info!(profile = %profile.id, "Tunnel down");
        }

        if had_stake {
            self.shared.changed.notify_waiters();
        }
        had_stake
    }

    /// Tear the tunnel down regardless of holders and refuse new acquires.
    /// Resumed jobs acquire again on the next start. A connect still in
    /// flight is marked abandoned and tears itself down.
    pub async fn shutdown(&self) {
        let teardown = {
            let mut state = self.shared.lock();
            state.closed = true;
            match &mut state.phase {
                Phase::Connecting { abandoned, .. } => {
                    *abandoned = true;
                    None
                }
                Phase::Up { profile, .. } => {
                    let profile = profile.clone();
                    state.phase = Phase::Disconnecting {
                        profile_id: profile.id.clone(),
                    };
                    Some(profile)
                }
                Phase::Down | Phase::Disconnecting { .. } => None,
            }
        };

        if let Some(profile) = teardown {
            info!(profile = %profile.id, "Shutting down tunnel");
            if let Err(e) = self.shared.driver.disconnect(&profile).await {
                warn!(profile = %profile.id, error = %e, "Tunnel teardown failed");
            }
            self.shared.lock().phase = Phase::Down;
        }
        self.shared.changed.notify_waiters();
    }

    pub fn session(&self) -> VpnSession {
        self.shared.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn wireguard(id: &str) -> VpnProfile {
        VpnProfile::new(
            id,
            ProfileKind::Wireguard(WireGuardProfile {
                private_key_ref: "a2V5".to_string(),
                public_key: "cHVi".to_string(),
                endpoint: "203.0.113.1:51820".to_string(),
                address: "10.9.0.2/32".to_string(),
                allowed_ips: vec!["10.9.0.0/16".to_string()],
                persistent_keepalive: None,
            }),
        )
    }

    fn openconnect(id: &str) -> VpnProfile {
        VpnProfile::new(
            id,
            ProfileKind::Client(ClientProfile {
                protocol: ClientProtocol::Openconnect,
                hostname: "vpn.example.net".to_string(),
                port: 443,
                username: "prov".to_string(),
                secret_ref: "pw".to_string(),
                openconnect_protocol: None,
                server_cert: None,
            }),
        )
    }

    fn manager() -> (TunnelManager, Arc<SimulatedDriver>) {
        let driver = Arc::new(SimulatedDriver::new());
        (TunnelManager::new(driver.clone()), driver)
    }

    #[tokio::test]
    async fn local_profile_never_touches_the_tunnel() {
        let (mgr, driver) = manager();
        let local = VpnProfile::new("lan", ProfileKind::Local);
        assert_eq!(mgr.acquire("job-1", &local).await.unwrap(), Acquired::PassThrough);
        assert_eq!(driver.connects(), 0);
        assert_eq!(mgr.session().state, SessionState::Down);
        assert!(!mgr.release("job-1").await);
    }

    #[tokio::test]
    async fn same_profile_shares_the_session() {
        let (mgr, driver) = manager();
        let wg = wireguard("wg-exc");

        mgr.acquire("job-1", &wg).await.unwrap();
        let Acquired::Tunnel(session) = mgr.acquire("job-2", &wg).await.unwrap() else {
            panic!("expected tunnel session");
        };
        assert_eq!(session.state, SessionState::Up);
        assert_eq!(session.holder_job_ids, vec!["job-1", "job-2"]);
        assert_eq!(driver.connects(), 1);

        assert!(mgr.release("job-1").await);
        assert_eq!(mgr.session().state, SessionState::Up);
        assert!(mgr.release("job-2").await);
        assert_eq!(mgr.session().state, SessionState::Down);
        assert_eq!(driver.disconnects(), 1);
    }

    #[tokio::test]
    async fn shutdown_tears_down_held_tunnel() {
        let (mgr, driver) = manager();
        let wg = wireguard("wg-exc");
        mgr.acquire("job-1", &wg).await.unwrap();
        mgr.acquire("job-2", &wg).await.unwrap();

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire("job-oc", &openconnect("oc-acme")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        mgr.shutdown().await;
        assert_eq!(driver.disconnects(), 1);
        assert_eq!(driver.currently_up(), 0);
        assert_eq!(mgr.session().state, SessionState::Down);

        let queued = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(queued, Err(VpnError::ShutDown)));
        assert_eq!(driver.connects(), 1);
        assert!(matches!(mgr.acquire("job-3", &wg).await, Err(VpnError::ShutDown)));
    }

    #[tokio::test]
    async fn reacquire_by_holder_is_idempotent() {
        let (mgr, driver) = manager();
        let wg = wireguard("wg-exc");
        mgr.acquire("job-1", &wg).await.unwrap();
        mgr.acquire("job-1", &wg).await.unwrap();
        assert_eq!(mgr.session().holder_job_ids, vec!["job-1"]);
        assert!(mgr.release("job-1").await);
        assert!(!mgr.release("job-1").await);
        assert_eq!(driver.disconnects(), 1);
    }

    #[tokio::test]
    async fn different_profile_waits_for_last_release() {
        let (mgr, driver) = manager();
        mgr.acquire("job-wg", &wireguard("wg-exc")).await.unwrap();

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire("job-oc", &openconnect("oc-acme")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(mgr.session().queued_job_ids, vec!["job-oc"]);

        mgr.release("job-wg").await;
        let acquired = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should proceed after release")
            .unwrap()
            .unwrap();
        let Acquired::Tunnel(session) = acquired else {
            panic!("expected tunnel");
        };
        assert_eq!(session.active_profile_id.as_deref(), Some("oc-acme"));
        assert_eq!(driver.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn failed_connect_leaves_session_down() {
        let (mgr, driver) = manager();
        driver.fail_next_connect("handshake rejected password=hunter2");

        let err = mgr.acquire("job-1", &wireguard("wg")).await.unwrap_err();
        assert!(matches!(err, VpnError::EstablishFailed(_)));
        assert_eq!(mgr.session().state, SessionState::Down);
        assert_eq!(driver.currently_up(), 0);

        // The next request is not blocked by the failure.
        mgr.acquire("job-2", &wireguard("wg")).await.unwrap();
        assert_eq!(mgr.session().holder_job_ids, vec!["job-2"]);
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_the_queue() {
        let (mgr, _driver) = manager();
        mgr.acquire("job-1", &wireguard("wg")).await.unwrap();

        let attempt = timeout(
            Duration::from_millis(50),
            mgr.acquire("job-2", &openconnect("oc")),
        )
        .await;
        assert!(attempt.is_err(), "acquire should still be waiting");
        assert!(mgr.session().queued_job_ids.is_empty());
    }

    #[tokio::test]
    async fn queue_is_served_in_request_order() {
        let (mgr, _driver) = manager();
        mgr.acquire("holder", &wireguard("wg-a")).await.unwrap();

        let first = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire("first", &openconnect("oc-b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire("second", &wireguard("wg-c")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Same profile as the holder, but two other profiles asked first.
        let late = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire("late", &wireguard("wg-a")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.session().queued_job_ids, vec!["first", "second", "late"]);

        mgr.release("holder").await;
        timeout(Duration::from_secs(1), first).await.unwrap().unwrap().unwrap();
        assert!(!second.is_finished());
        assert_eq!(mgr.session().active_profile_id.as_deref(), Some("oc-b"));

        mgr.release("first").await;
        timeout(Duration::from_secs(1), second).await.unwrap().unwrap().unwrap();
        assert_eq!(mgr.session().active_profile_id.as_deref(), Some("wg-c"));

        mgr.release("second").await;
        timeout(Duration::from_secs(1), late).await.unwrap().unwrap().unwrap();
        assert_eq!(mgr.session().active_profile_id.as_deref(), Some("wg-a"));
    }

    #[tokio::test]
    async fn release_during_connect_tears_the_tunnel_down() {
        let (mgr, driver) = manager();
        driver.set_connect_delay(Duration::from_millis(100));

        let pending = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire("job-1", &wireguard("wg")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mgr.release("job-1").await);

        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert_eq!(result, Err(VpnError::Abandoned));
        assert_eq!(mgr.session().state, SessionState::Down);
        assert_eq!(driver.currently_up(), 0);
    }

    #[tokio::test]
    async fn at_most_one_session_up_under_contention() {
        let (mgr, driver) = manager();
        driver.set_connect_delay(Duration::from_millis(5));

        let profiles = ["wg-a", "wg-b", "wg-c"];
        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let mgr = mgr.clone();
                let profile = wireguard(profiles[i % profiles.len()]);
                tokio::spawn(async move {
                    let job = format!("job-{}", i);
                    mgr.acquire(&job, &profile).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    mgr.release(&job).await;
                })
            })
            .collect();

        for task in tasks {
            timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        }
        assert_eq!(driver.max_concurrent(), 1);
        assert_eq!(mgr.session().state, SessionState::Down);
    }
}
