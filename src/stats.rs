use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Per-engine counters. Cheap to bump from any thread.
pub struct EngineStats {
    started: Instant,
    init_ok: AtomicU64,
    init_failed: AtomicU64,
    accelerator_attempts: AtomicU64,
    generations_started: AtomicU64,
    generations_completed: AtomicU64,
    generations_cancelled: AtomicU64,
    generations_failed: AtomicU64,
    tokens_streamed: AtomicU64,
    releases: AtomicU64,
    releases_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub init_ok: u64,
    pub init_failed: u64,
    pub accelerator_attempts: u64,
    pub generations_started: u64,
    pub generations_completed: u64,
    pub generations_cancelled: u64,
    pub generations_failed: u64,
    pub tokens_streamed: u64,
    pub releases: u64,
    pub releases_rejected: u64,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            init_ok: AtomicU64::new(0),
            init_failed: AtomicU64::new(0),
            accelerator_attempts: AtomicU64::new(0),
            generations_started: AtomicU64::new(0),
            generations_completed: AtomicU64::new(0),
            generations_cancelled: AtomicU64::new(0),
            generations_failed: AtomicU64::new(0),
            tokens_streamed: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            releases_rejected: AtomicU64::new(0),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineStats {
    pub(crate) fn record_init(&self, success: bool) {
        if success {
            bump(&self.init_ok);
        } else {
            bump(&self.init_failed);
        }
    }

    pub(crate) fn inc_accelerator_attempt(&self) {
        bump(&self.accelerator_attempts);
    }

    pub(crate) fn inc_generation_started(&self) {
        bump(&self.generations_started);
    }

    pub(crate) fn inc_generation_completed(&self) {
        bump(&self.generations_completed);
    }

    pub(crate) fn inc_generation_cancelled(&self) {
        bump(&self.generations_cancelled);
    }

    pub(crate) fn inc_generation_failed(&self) {
        bump(&self.generations_failed);
    }

    pub(crate) fn inc_token(&self) {
        bump(&self.tokens_streamed);
    }

    pub(crate) fn inc_release(&self) {
        bump(&self.releases);
    }

    pub(crate) fn inc_release_rejected(&self) {
        bump(&self.releases_rejected);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            init_ok: load(&self.init_ok),
            init_failed: load(&self.init_failed),
            accelerator_attempts: load(&self.accelerator_attempts),
            generations_started: load(&self.generations_started),
            generations_completed: load(&self.generations_completed),
            generations_cancelled: load(&self.generations_cancelled),
            generations_failed: load(&self.generations_failed),
            tokens_streamed: load(&self.tokens_streamed),
            releases: load(&self.releases),
            releases_rejected: load(&self.releases_rejected),
        }
    }
}
