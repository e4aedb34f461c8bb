//! Pending-job lookup for anonymous boot events.
//!
//! A PREPARING job without a MAC waits here under `(interface, customer)`.
//! A discover on an interface resolves only when exactly one job is waiting
//! on that interface across all customers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Matched(String),
    /// Zero or several candidates; never guessed.
    Ambiguous(Vec<String>),
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: BTreeMap<(String, String), BTreeSet<String>>,
    keys: HashMap<String, (String, String)>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, interface_id: &str, customer_id: &str, job_id: &str) {
        let key = (interface_id.to_string(), customer_id.to_string());
        self.remove(job_id);
        self.pending
            .entry(key.clone())
            .or_default()
            .insert(job_id.to_string());
        self.keys.insert(job_id.to_string(), key);
    }

    /// Returns whether the job was pending.
    pub fn remove(&mut self, job_id: &str) -> bool {
        let Some(key) = self.keys.remove(job_id) else {
            return false;
        };
        if let Some(jobs) = self.pending.get_mut(&key) {
            jobs.remove(job_id);
            if jobs.is_empty() {
                self.pending.remove(&key);
            }
        }
        true
    }

    pub fn candidates(&self, interface_id: &str) -> Vec<String> {
        self.pending
            .range((interface_id.to_string(), String::new())..)
            .take_while(|((iface, _), _)| iface == interface_id)
            .flat_map(|(_, jobs)| jobs.iter().cloned())
            .collect()
    }

    /// Resolve and, on a unique match, clear the job's entry.
    pub fn claim(&mut self, interface_id: &str) -> Resolution {
        let mut candidates = self.candidates(interface_id);
        if candidates.len() == 1 {
            let job_id = candidates.remove(0);
            self.remove(&job_id);
            Resolution::Matched(job_id)
        } else {
            Resolution::Ambiguous(candidates)
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.keys.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_candidate_is_claimed_once() {
        let mut table = CorrelationTable::new();
        table.insert("eth1", "exc", "job-1");

        assert_eq!(table.claim("eth1"), Resolution::Matched("job-1".into()));
        assert!(!table.contains("job-1"));
        assert_eq!(table.claim("eth1"), Resolution::Ambiguous(vec![]));
    }

    #[test]
    fn two_jobs_on_one_interface_are_ambiguous() {
        let mut table = CorrelationTable::new();
        table.insert("eth1", "exc", "job-1");
        table.insert("eth1", "acme", "job-2");

        match table.claim("eth1") {
            Resolution::Ambiguous(c) => assert_eq!(c.len(), 2),
            other => panic!("expected ambiguity, got {:?}", other),
        }
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn interfaces_do_not_overlap() {
        let mut table = CorrelationTable::new();
        table.insert("eth1", "exc", "job-1");
        table.insert("eth10", "exc", "job-2");
        table.insert("eth2", "acme", "job-3");

        assert_eq!(table.candidates("eth1"), vec!["job-1".to_string()]);
        assert_eq!(table.claim("eth2"), Resolution::Matched("job-3".into()));
    }

    #[test]
    fn removal_clears_empty_keys() {
        let mut table = CorrelationTable::new();
        table.insert("eth1", "exc", "job-1");
        assert!(table.remove("job-1"));
        assert!(!table.remove("job-1"));
        assert!(table.is_empty());
        assert!(table.candidates("eth1").is_empty());
    }
}
