//! Request admission gate
//!
//! A per-credential bounded counter of in-flight requests. Admission is a
//! CAS loop so the limit holds without a lock; the returned permit gives the
//! slot back when dropped, whether or not the caller reported an outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct AdmissionGate {
    in_flight: AtomicU32,
    limit: AtomicU32,
}

impl AdmissionGate {
    pub fn new(limit: u32) -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicU32::new(0),
            limit: AtomicU32::new(limit),
        })
    }

    /// Reserve a slot if fewer than `limit` requests are in flight.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let limit = self.limit.load(Ordering::SeqCst);
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                return None;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(AdmissionPermit {
                        gate: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.limit()
    }

    /// Change the limit. Requests already admitted above a lowered limit
    /// keep their slots.
    pub fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::SeqCst);
    }
}

/// One admitted request. Dropping it releases the slot exactly once.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let _ = self
            .gate
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }
}
