use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Callback counters shared between every sink request handler.
///
/// `total` counts callbacks whose payload decoded, `failure` the subset
/// answered with an injected failure, and `error` callbacks whose body
/// could not be decoded at all. Each counter is an independent atomic, so
/// a snapshot taken mid-run is not guaranteed to be consistent across
/// fields; only the final summary is read.
#[derive(Debug, Default)]
pub struct Stat {
    total: AtomicU64,
    failure: AtomicU64,
    error: AtomicU64,
}

impl Stat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arrive_job(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fail(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_occurred(&self) {
        self.error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn failure(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn error(&self) -> u64 {
        self.error.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            total: self.total(),
            failure: self.failure(),
            error: self.error(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub total: u64,
    pub failure: u64,
    pub error: u64,
}

impl StatSnapshot {
    /// Decoded callbacks that were not failed on purpose.
    pub fn succeeded(&self) -> u64 {
        self.total.saturating_sub(self.failure)
    }
}
