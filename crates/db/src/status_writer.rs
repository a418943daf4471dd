//! The single path through which job statuses change.
//!
//! Monitors and `stop()` report *observed* statuses; the writer checks
//! them against the canonical state machine, writes with a conditional
//! update, and keeps the outstanding-job cache in step. A terminal
//! status is therefore never overwritten, whichever monitor or caller
//! reports last.

use std::sync::Arc;

use jobctl_core::status::JobStatus;
use jobctl_core::types::JobId;

use crate::cache::JobCache;
use crate::store::{JobStore, StoreError, UpdateOutcome};

/// What happened to one observed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The record moved from `from` to `to`.
    Applied { from: JobStatus, to: JobStatus },
    /// The record already had the observed status.
    Unchanged,
    /// The edge is not allowed by the state machine; nothing was written.
    Rejected { current: JobStatus, observed: JobStatus },
    /// No record with this id.
    Missing,
    /// The record kept changing underneath us; nothing was written.
    Conflict,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Applies observed statuses to the store.
#[derive(Clone)]
pub struct StatusWriter {
    store: Arc<dyn JobStore>,
    cache: JobCache,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn JobStore>, cache: JobCache) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn cache(&self) -> &JobCache {
        &self.cache
    }

    /// Apply an observed status to a job.
    ///
    /// A conditional-update conflict means someone else wrote first; the
    /// record is re-read and the edge re-checked once before giving up.
    pub async fn apply(
        &self,
        job_id: JobId,
        observed: JobStatus,
    ) -> Result<TransitionOutcome, StoreError> {
        for _ in 0..2 {
            let Some(job) = self.store.get(job_id).await? else {
                self.cache.remove(job_id).await;
                return Ok(TransitionOutcome::Missing);
            };
            let current = job.status;

            if current == observed {
                if current.is_terminal() {
                    self.cache.remove(job_id).await;
                }
                return Ok(TransitionOutcome::Unchanged);
            }

            if !current.can_transition_to(observed) {
                tracing::debug!(
                    job_id = %job_id,
                    current = %current,
                    observed = %observed,
                    "Ignoring status transition not allowed by the state machine",
                );
                if current.is_terminal() {
                    self.cache.remove(job_id).await;
                }
                return Ok(TransitionOutcome::Rejected { current, observed });
            }

            match self.store.update_status(job_id, observed, current).await? {
                UpdateOutcome::Updated => {
                    if observed.is_terminal() {
                        self.cache.remove(job_id).await;
                        tracing::info!(
                            job_id = %job_id,
                            backend = %job.backend,
                            from = %current,
                            status = %observed,
                            "Job finished",
                        );
                    } else {
                        self.cache.set_status(job_id, observed).await;
                        tracing::debug!(
                            job_id = %job_id,
                            from = %current,
                            status = %observed,
                            "Job status updated",
                        );
                    }
                    return Ok(TransitionOutcome::Applied {
                        from: current,
                        to: observed,
                    });
                }
                UpdateOutcome::Conflict => {
                    tracing::debug!(
                        job_id = %job_id,
                        expected = %current,
                        "Status changed concurrently, re-reading",
                    );
                }
            }
        }

        tracing::warn!(
            job_id = %job_id,
            observed = %observed,
            "Giving up on status update after repeated conflicts",
        );
        Ok(TransitionOutcome::Conflict)
    }
}
