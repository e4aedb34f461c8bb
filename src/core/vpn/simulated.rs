use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::VpnError;
use super::driver::TunnelDriver;
use super::profile::VpnProfile;

/// In-memory driver for `--simulation` runs and tests.
///
/// Tracks how many tunnels are up at once so callers can check that the
/// manager never overlaps sessions.
#[derive(Default)]
pub struct SimulatedDriver {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    up: AtomicUsize,
    max_up: AtomicUsize,
    fail_next: Mutex<Option<String>>,
    connect_delay: Mutex<Duration>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `connect` fail with `reason`.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason.into());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn currently_up(&self) -> usize {
        self.up.load(Ordering::SeqCst)
    }

    /// Highest number of tunnels observed up at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_up.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelDriver for SimulatedDriver {
    async fn connect(&self, profile: &VpnProfile) -> Result<(), VpnError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock().unwrap_or_else(|p| p.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.fail_next.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(reason) = failure {
            return Err(VpnError::EstablishFailed(reason));
        }

        let up = self.up.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_up.fetch_max(up, Ordering::SeqCst);
        info!(profile = %profile.id, protocol = profile.protocol_name(), "Simulated tunnel up");
        Ok(())
    }

    async fn disconnect(&self, profile: &VpnProfile) -> Result<(), VpnError> {
        // Cleanup after a failed connect arrives with nothing up.
        let was_up = self
            .up
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if was_up {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            info!(profile = %profile.id, "Simulated tunnel down");
        }
        Ok(())
    }
}
