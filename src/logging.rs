//! Tracing setup for the daemon.
//!
//! Job-scoped events carry `job_id` as a field. In JSON mode fields are
//! flattened to the top level so log shippers can index on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

#[derive(Debug, Default, Clone, Copy)]
pub struct LogConfig {
    pub json: bool,
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    fn default_directive(&self) -> &'static str {
        if self.verbose { "provd=debug" } else { "provd=info" }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().flatten_event(true).with_target(true))
            .init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

/// Admits one log line per interval and counts what it held back.
///
/// Boot services retry discover for every NIC on a segment, so drops of
/// unmatched traffic go through one of these.
pub struct LogThrottle {
    interval_ms: u64,
    last_ms: AtomicU64,
    suppressed: AtomicU64,
    start: Instant,
}

const NEVER: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(NEVER),
            suppressed: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// `Some(n)` when the caller should log, where `n` lines were held back
    /// since the previous one. `None` means stay quiet.
    pub fn admit(&self) -> Option<u64> {
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);

        let due = last == NEVER || now.saturating_sub(last) >= self.interval_ms;
        if due
            && self
                .last_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }

        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }
}
