// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-object lease: a monotonically extendable deadline plus the set of
// client operations currently reading the object's blobs. The object may
// not be freed while the set is non-empty — until the deadline passes,
// at which point liveness wins.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::types::{monotonic_ms, OperateId};

#[derive(Default, Debug)]
struct LeaseState {
    /// Deadline on the monotonic-ms timeline; never moves backwards.
    deadline_ms: u64,
    /// Outstanding readers, keyed by packed operate id.
    readers: HashSet<u64>,
}

/// Reader tracking for one object.
#[derive(Default, Debug)]
pub struct LeaseManager {
    state: Mutex<LeaseState>,
    cv: Condvar,
}

impl LeaseManager {
    pub fn new() -> LeaseManager {
        LeaseManager::default()
    }

    /// Register a reader and extend the deadline by `ttl_ms`.
    pub fn add(&self, op: OperateId, ttl_ms: u64) {
        let mut st = self.state.lock().unwrap();
        st.deadline_ms = st.deadline_ms.max(monotonic_ms() + ttl_ms);
        st.readers.insert(op.0);
        debug!("lease add rank {} seq {}", op.rank(), op.seq());
    }

    /// Drop a reader; wakes anyone waiting for the set to empty.
    pub fn remove(&self, op: OperateId) {
        let mut st = self.state.lock().unwrap();
        st.readers.remove(&op.0);
        self.cv.notify_all();
    }

    /// Extend the deadline without registering a reader.
    pub fn extend(&self, ttl_ms: u64) {
        let mut st = self.state.lock().unwrap();
        st.deadline_ms = st.deadline_ms.max(monotonic_ms() + ttl_ms);
    }

    pub fn use_count(&self) -> usize {
        self.state.lock().unwrap().readers.len()
    }

    pub fn is_expired(&self) -> bool {
        self.state.lock().unwrap().deadline_ms < monotonic_ms()
    }

    /// Deadline value handed back to clients on alloc/get.
    pub fn deadline(&self) -> u64 {
        self.state.lock().unwrap().deadline_ms
    }

    /// Block until the reader set empties or the deadline passes,
    /// whichever comes first. Returns true if the set drained.
    pub fn wait(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.readers.is_empty() {
                return true;
            }
            let now = monotonic_ms();
            if st.deadline_ms <= now {
                warn!(
                    "lease expired with {} readers outstanding, freeing anyway",
                    st.readers.len()
                );
                return false;
            }
            let wait_ms = st.deadline_ms - now;
            let (next, timeout) = self
                .cv
                .wait_timeout(st, Duration::from_millis(wait_ms))
                .unwrap();
            st = next;
            if timeout.timed_out() && !st.readers.is_empty() {
                warn!(
                    "lease wait timed out with {} readers outstanding",
                    st.readers.len()
                );
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_returns_when_last_reader_leaves() {
        let lease = Arc::new(LeaseManager::new());
        let op = OperateId::new(1, 1);
        lease.add(op, 10_000);
        assert_eq!(lease.use_count(), 1);

        let l2 = Arc::clone(&lease);
        let h = std::thread::spawn(move || l2.wait());
        std::thread::sleep(Duration::from_millis(50));
        lease.remove(op);
        assert!(h.join().unwrap());
        assert_eq!(lease.use_count(), 0);
    }

    #[test]
    fn wait_gives_up_at_deadline() {
        let lease = LeaseManager::new();
        lease.add(OperateId::new(1, 2), 50);
        let start = std::time::Instant::now();
        assert!(!lease.wait());
        assert!(start.elapsed() >= Duration::from_millis(40));
        // Reader never left; the set still records it.
        assert_eq!(lease.use_count(), 1);
    }

    #[test]
    fn deadline_never_regresses() {
        let lease = LeaseManager::new();
        lease.extend(10_000);
        let d1 = lease.deadline();
        lease.extend(10);
        assert!(lease.deadline() >= d1);
    }
}
