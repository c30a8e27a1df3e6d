//! Retention enforcement.
//!
//! The sweep purges terminal job records past their retention deadline first,
//! releasing the artifact references they held, and only then considers
//! artifacts for physical deletion. That ordering is what guarantees an
//! artifact referenced by any not-yet-purged job is never deleted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::dedup::DedupIndex;
use crate::registry::JobRegistry;
use crate::services::pins::PinIndex;
use crate::services::storage::ObjectStore;

/// What one sweep pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub purged_jobs: u64,
    pub purged_artifacts: u64,
    pub reclaimed_bytes: u64,
}

pub struct LifecycleManager {
    registry: Arc<JobRegistry>,
    index: Arc<DedupIndex>,
    store: Arc<dyn ObjectStore>,
    pins: Arc<dyn PinIndex>,
    artifact_ttl: chrono::Duration,
    sweeping: AtomicBool,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<JobRegistry>,
        index: Arc<DedupIndex>,
        store: Arc<dyn ObjectStore>,
        pins: Arc<dyn PinIndex>,
        artifact_ttl: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            index,
            store,
            pins,
            artifact_ttl,
            sweeping: AtomicBool::new(false),
        }
    }

    /// Run one retention pass. Concurrent invocations are collapsed: a sweep
    /// arriving while another runs returns an empty report immediately, so
    /// nothing is double-counted or double-deleted.
    pub async fn sweep(&self) -> SweepReport {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            tracing::debug!("sweep already in progress, skipping");
            return SweepReport::default();
        }
        let guard = SweepGate(&self.sweeping);
        let report = self.sweep_inner().await;
        drop(guard);
        report
    }

    async fn sweep_inner(&self) -> SweepReport {
        let now = Utc::now();

        // Phase 1: purge expired terminal jobs and release their references
        // before any artifact is considered for deletion.
        let purged_jobs = self.registry.purge_expired(now);
        for job in &purged_jobs {
            for item in &job.items {
                if let Some(artifact) = item.outcome.artifact() {
                    self.index.release(artifact.fingerprint).await;
                }
            }
            tracing::debug!(job_id = %job.id, "purged expired job record");
        }

        // Phase 2: physically delete unreferenced, expired, unpinned artifacts.
        let mut purged_artifacts = 0u64;
        let mut reclaimed_bytes = 0u64;
        for fp in self.index.fingerprints() {
            let Some(guard) = self.index.begin_retire(fp).await else {
                continue;
            };
            let artifact = guard.artifact();
            if artifact.ref_count > 0 {
                continue;
            }
            if now - artifact.created_at < self.artifact_ttl {
                continue;
            }
            if self.pins.is_pinned(&artifact.storage_ref).await {
                tracing::debug!(fingerprint = %fp, "artifact pinned, keeping");
                continue;
            }

            match self.store.delete(&artifact.storage_ref).await {
                Ok(()) => {
                    let removed = guard.commit();
                    purged_artifacts += 1;
                    reclaimed_bytes += removed.byte_size;
                    tracing::info!(
                        fingerprint = %fp,
                        storage_ref = %removed.storage_ref,
                        byte_size = removed.byte_size,
                        "deleted expired artifact"
                    );
                }
                Err(e) => {
                    // Entry stays indexed; the next sweep retries.
                    tracing::warn!(fingerprint = %fp, error = %e, "store deletion failed, keeping entry");
                }
            }
        }

        let report = SweepReport {
            purged_jobs: purged_jobs.len() as u64,
            purged_artifacts,
            reclaimed_bytes,
        };

        metrics::counter!("sweep_purged_jobs_total").increment(report.purged_jobs);
        metrics::counter!("sweep_purged_artifacts_total").increment(report.purged_artifacts);
        metrics::counter!("sweep_reclaimed_bytes_total").increment(report.reclaimed_bytes);
        tracing::info!(
            purged_jobs = report.purged_jobs,
            purged_artifacts = report.purged_artifacts,
            reclaimed_bytes = report.reclaimed_bytes,
            "sweep complete"
        );
        report
    }

    /// Spawn a background task sweeping on a fixed interval.
    pub fn run_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so "every N" means N.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep().await;
            }
        })
    }
}

/// Clears the sweep-in-progress flag even if the sweep future is dropped.
struct SweepGate<'a>(&'a AtomicBool);

impl Drop for SweepGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
