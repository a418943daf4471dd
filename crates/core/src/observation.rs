//! Per-job observation retry budget.
//!
//! A monitor records a *miss* whenever it fails to learn a job's state
//! (the backend no longer lists it and no side-channel answers). Once a
//! job exhausts its budget it should be marked UNKNOWN; the verdict says
//! whether this is the first exhaustion so the caller logs it once
//! rather than on every poll.

use std::collections::HashMap;

use crate::types::JobId;

/// What the caller should do after recording a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissVerdict {
    /// Budget not exhausted yet; keep observing.
    Retry { misses: u32 },
    /// Budget exhausted. `first` is `true` exactly once per streak.
    Exhausted { first: bool },
}

#[derive(Debug, Default)]
struct MissState {
    misses: u32,
    reported: bool,
}

/// Tracks consecutive misses per job.
#[derive(Debug)]
pub struct MissTracker {
    budget: u32,
    jobs: HashMap<JobId, MissState>,
}

impl MissTracker {
    /// `budget` is clamped to at least one miss.
    pub fn new(budget: u32) -> Self {
        Self {
            budget: budget.max(1),
            jobs: HashMap::new(),
        }
    }

    /// Record one failed observation of `job_id`.
    pub fn record_miss(&mut self, job_id: JobId) -> MissVerdict {
        let state = self.jobs.entry(job_id).or_default();
        state.misses = state.misses.saturating_add(1);
        if state.misses < self.budget {
            return MissVerdict::Retry {
                misses: state.misses,
            };
        }
        let first = !state.reported;
        state.reported = true;
        MissVerdict::Exhausted { first }
    }

    /// The job was observed; its streak ends.
    pub fn record_seen(&mut self, job_id: JobId) {
        self.jobs.remove(&job_id);
    }

    /// Drop all bookkeeping for a job (e.g. it became terminal).
    pub fn forget(&mut self, job_id: JobId) {
        self.jobs.remove(&job_id);
    }

    /// Current miss count, `0` when unknown.
    pub fn misses(&self, job_id: JobId) -> u32 {
        self.jobs.get(&job_id).map_or(0, |s| s.misses)
    }
}
