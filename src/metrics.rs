// src/metrics.rs
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, shared between the dispatcher and the workers.
#[derive(Default)]
pub struct Metrics {
    accepted: AtomicU64,
    served: AtomicU64,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub fn connection_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_served(&self) {
        self.served.fetch_add(1, Ordering::Relaxed);
    }

    /// (connections accepted, requests served)
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.accepted.load(Ordering::Relaxed),
            self.served.load(Ordering::Relaxed),
        )
    }
}
