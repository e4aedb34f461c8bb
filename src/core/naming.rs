//! Device name allocation.
//!
//! Every `(customer, device class)` pair owns a ticket dispenser. A job holds a
//! reservation from creation until it binds a device (commit) or ends without
//! one (release). Reservations always take the smallest free number, so
//! numbers released by failed jobs are handed out again before the counter
//! grows. Committed numbers are retired for good: a labelled device is never
//! renumbered.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::error::ProvisionError;
use super::models::DeviceClass;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamingKey {
    pub customer_id: String,
    pub device_class: DeviceClass,
}

impl NamingKey {
    pub fn new(customer_id: impl Into<String>, device_class: DeviceClass) -> Self {
        Self {
            customer_id: customer_id.into(),
            device_class,
        }
    }
}

#[derive(Debug, Default)]
struct Dispenser {
    reserved: BTreeSet<u32>,
    committed: BTreeSet<u32>,
}

impl Dispenser {
    fn is_taken(&self, seq: u32) -> bool {
        self.reserved.contains(&seq) || self.committed.contains(&seq)
    }

    /// Smallest positive number in neither set (compaction of released slots).
    fn next_free(&self) -> u32 {
        let mut candidate = 1;
        while self.is_taken(candidate) {
            candidate += 1;
        }
        candidate
    }
}

/// Format a device name, e.g. `EXC-NB-007`.
pub fn format_name(short_code: &str, device_class: DeviceClass, sequence_number: u32) -> String {
    format!("{}-{}-{:03}", short_code, device_class, sequence_number)
}

/// Per-key ticket dispensers behind per-key locks.
///
/// The outer map lock is only held long enough to find or create a key's
/// dispenser; all numbering for a key happens under that key's own lock.
pub struct NamingAllocator {
    ceiling: u32,
    dispensers: Mutex<HashMap<NamingKey, Arc<Mutex<Dispenser>>>>,
}

impl NamingAllocator {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            dispensers: Mutex::new(HashMap::new()),
        }
    }

    fn dispenser(&self, key: &NamingKey) -> Arc<Mutex<Dispenser>> {
        let mut map = lock(&self.dispensers);
        map.entry(key.clone()).or_default().clone()
    }

    /// Reserve the smallest free sequence number for `key`.
    pub fn reserve(&self, key: &NamingKey) -> Result<u32, ProvisionError> {
        let dispenser = self.dispenser(key);
        let mut dispenser = lock(&dispenser);

        let seq = dispenser.next_free();
        if seq > self.ceiling {
            return Err(ProvisionError::SequenceExhausted {
                customer_id: key.customer_id.clone(),
                device_class: key.device_class,
                ceiling: self.ceiling,
            });
        }

        dispenser.reserved.insert(seq);
        debug!(customer_id = %key.customer_id, device_class = %key.device_class, seq, "Reserved naming slot");
        Ok(seq)
    }

    /// Return an uncommitted reservation to the pool. Committed numbers are
    /// never released. Returns whether a reservation was actually freed.
    pub fn release(&self, key: &NamingKey, seq: u32) -> bool {
        let dispenser = self.dispenser(key);
        let mut dispenser = lock(&dispenser);
        let released = dispenser.reserved.remove(&seq);
        if released {
            debug!(customer_id = %key.customer_id, device_class = %key.device_class, seq, "Released naming slot");
        }
        released
    }

    /// Retire `seq` permanently for `key`.
    pub fn commit(&self, key: &NamingKey, seq: u32) {
        let dispenser = self.dispenser(key);
        let mut dispenser = lock(&dispenser);
        dispenser.reserved.remove(&seq);
        dispenser.committed.insert(seq);
        debug!(customer_id = %key.customer_id, device_class = %key.device_class, seq, "Committed naming slot");
    }

    /// Give back a committed number whose device never finished imaging.
    pub fn retract(&self, key: &NamingKey, seq: u32) -> bool {
        let dispenser = self.dispenser(key);
        let mut dispenser = lock(&dispenser);
        let retracted = dispenser.committed.remove(&seq);
        if retracted {
            debug!(customer_id = %key.customer_id, device_class = %key.device_class, seq, "Retracted naming slot");
        }
        retracted
    }

    /// Re-register a reservation held by a job that survived a restart.
    pub fn restore_reservation(&self, key: &NamingKey, seq: u32) {
        let dispenser = self.dispenser(key);
        let mut dispenser = lock(&dispenser);
        if !dispenser.committed.contains(&seq) {
            dispenser.reserved.insert(seq);
        }
    }

    /// Re-register a committed number loaded from the device registry.
    pub fn restore_committed(&self, key: &NamingKey, seq: u32) {
        self.commit(key, seq);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding a naming lock cannot leave the sets half-written.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
