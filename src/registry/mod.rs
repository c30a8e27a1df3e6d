//! Job records and their state machine.
//!
//! The registry is the only owner of job state. Workers and the lifecycle
//! manager mutate jobs exclusively through the operations here, each of which
//! holds a map shard lock for an O(1) critical section.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::job::{
    InputDescriptor, ItemResult, JobFilter, JobSnapshot, JobStatus,
};
use crate::models::options::ConversionOptions;

/// Mutable job record, private to the registry.
#[derive(Debug, Clone)]
struct JobRecord {
    snapshot: JobSnapshot,
    options: ConversionOptions,
    seq: u64,
    cancel_requested: bool,
}

/// Terminal outcome a worker reports when a job finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Partial,
}

impl From<JobOutcome> for JobStatus {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed => JobStatus::Failed,
            JobOutcome::Partial => JobStatus::Partial,
        }
    }
}

pub struct JobRegistry {
    jobs: DashMap<Uuid, JobRecord>,
    seq: AtomicU64,
    retention: chrono::Duration,
}

impl JobRegistry {
    pub fn new(retention: chrono::Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            seq: AtomicU64::new(0),
            retention,
        }
    }

    /// Allocate a new QUEUED record and return its id.
    pub fn create(
        &self,
        input: InputDescriptor,
        options: ConversionOptions,
    ) -> Result<Uuid, RegistryError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let retention = options
            .retention_override_secs
            .map(|s| chrono::Duration::seconds(s as i64))
            .unwrap_or(self.retention);

        let record = JobRecord {
            snapshot: JobSnapshot {
                id,
                status: JobStatus::Queued,
                input,
                submitted_at: now,
                updated_at: now,
                retention_deadline: now + retention,
                items: Vec::new(),
                progress: 0,
                error: None,
            },
            options,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            cancel_requested: false,
        };

        match self.jobs.entry(id) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(id)
            }
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // A v4 collision means the id space is effectively exhausted.
                tracing::error!(job_id = %id, "duplicate job id generated");
                Err(RegistryError::IdExhausted)
            }
        }
    }

    /// Transition QUEUED -> PROCESSING. Exactly one caller wins a claim.
    pub fn claim(&self, id: Uuid) -> Result<(InputDescriptor, ConversionOptions), RegistryError> {
        let mut record = self.jobs.get_mut(&id).ok_or(RegistryError::NotFound)?;
        if record.snapshot.status != JobStatus::Queued {
            return Err(RegistryError::AlreadyClaimed);
        }
        record.snapshot.status = JobStatus::Processing;
        record.snapshot.updated_at = Utc::now();
        Ok((record.snapshot.input.clone(), record.options.clone()))
    }

    /// Clamp progress to `max(current, percent)` and append an item result.
    /// No-op once the job is terminal.
    pub fn report_progress(&self, id: Uuid, percent: u8, item: Option<ItemResult>) {
        let Some(mut record) = self.jobs.get_mut(&id) else {
            return;
        };
        if record.snapshot.status.is_terminal() {
            return;
        }
        record.snapshot.progress = record.snapshot.progress.max(percent.min(100));
        if let Some(item) = item {
            record.snapshot.items.push(item);
        }
        record.snapshot.updated_at = Utc::now();
    }

    /// Transition PROCESSING -> terminal. A second finalize is rejected so a
    /// late timeout signal cannot clobber a completed job.
    pub fn finalize(
        &self,
        id: Uuid,
        outcome: JobOutcome,
        error: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut record = self.jobs.get_mut(&id).ok_or(RegistryError::NotFound)?;
        if record.snapshot.status.is_terminal() {
            return Err(RegistryError::AlreadyTerminal);
        }
        record.snapshot.status = outcome.into();
        record.snapshot.error = error;
        record.snapshot.updated_at = Utc::now();
        Ok(())
    }

    /// Cancel a job. From QUEUED this is immediate; from PROCESSING it only
    /// sets the cooperative flag the worker consults between items.
    pub fn cancel(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut record = self.jobs.get_mut(&id).ok_or(RegistryError::NotFound)?;
        match record.snapshot.status {
            JobStatus::Queued => {
                record.snapshot.status = JobStatus::Cancelled;
                record.snapshot.updated_at = Utc::now();
                Ok(())
            }
            JobStatus::Processing => {
                record.cancel_requested = true;
                Ok(())
            }
            _ => Err(RegistryError::AlreadyTerminal),
        }
    }

    /// Whether a cooperative cancel has been requested for a running job.
    pub fn cancel_requested(&self, id: Uuid) -> bool {
        self.jobs
            .get(&id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false)
    }

    pub fn get(&self, id: Uuid) -> Result<JobSnapshot, RegistryError> {
        self.jobs
            .get(&id)
            .map(|r| r.snapshot.clone())
            .ok_or(RegistryError::NotFound)
    }

    /// Snapshots in submission order, optionally filtered.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        let mut records: Vec<(u64, JobSnapshot)> = self
            .jobs
            .iter()
            .filter(|r| filter.status.map_or(true, |s| r.snapshot.status == s))
            .map(|r| (r.seq, r.snapshot.clone()))
            .collect();
        records.sort_by_key(|(seq, _)| *seq);
        let mut snapshots: Vec<JobSnapshot> =
            records.into_iter().map(|(_, snap)| snap).collect();
        if let Some(limit) = filter.limit {
            snapshots.truncate(limit);
        }
        snapshots
    }

    /// Remove terminal records past their retention deadline, returning them
    /// so the caller can release the artifact references they held.
    pub fn purge_expired(&self, now: chrono::DateTime<Utc>) -> Vec<JobSnapshot> {
        let expired: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|r| r.snapshot.status.is_terminal() && r.snapshot.retention_deadline <= now)
            .map(|r| r.snapshot.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.jobs.remove(&id).map(|(_, record)| record.snapshot))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job not found")]
    NotFound,

    #[error("job already claimed by another worker")]
    AlreadyClaimed,

    #[error("job is already in a terminal state")]
    AlreadyTerminal,

    #[error("job id space exhausted")]
    IdExhausted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{InputKind, ItemOutcome};

    fn registry() -> JobRegistry {
        JobRegistry::new(chrono::Duration::hours(24))
    }

    fn descriptor() -> InputDescriptor {
        InputDescriptor::new("art.psd", 2048, InputKind::SingleAsset)
    }

    fn create(reg: &JobRegistry) -> Uuid {
        reg.create(descriptor(), ConversionOptions::default()).unwrap()
    }

    #[test]
    fn create_then_get_is_queued() {
        let reg = registry();
        let id = create(&reg);
        let snap = reg.get(id).unwrap();
        assert_eq!(snap.status, JobStatus::Queued);
        assert_eq!(snap.progress, 0);
        assert!(snap.items.is_empty());
        assert!(snap.retention_deadline > snap.submitted_at);
    }

    #[test]
    fn claim_is_exclusive() {
        let reg = registry();
        let id = create(&reg);
        assert!(reg.claim(id).is_ok());
        assert_eq!(reg.claim(id), Err(RegistryError::AlreadyClaimed));
        assert_eq!(reg.get(id).unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn progress_is_monotone() {
        let reg = registry();
        let id = create(&reg);
        reg.claim(id).unwrap();
        reg.report_progress(id, 60, None);
        reg.report_progress(id, 30, None);
        assert_eq!(reg.get(id).unwrap().progress, 60);
        reg.report_progress(id, 100, None);
        assert_eq!(reg.get(id).unwrap().progress, 100);
    }

    #[test]
    fn progress_after_finalize_is_noop() {
        let reg = registry();
        let id = create(&reg);
        reg.claim(id).unwrap();
        reg.report_progress(id, 40, None);
        reg.finalize(id, JobOutcome::Failed, Some("timed out".into()))
            .unwrap();
        reg.report_progress(
            id,
            90,
            Some(ItemResult {
                name: "late.png".into(),
                outcome: ItemOutcome::Error {
                    detail: "late".into(),
                },
            }),
        );
        let snap = reg.get(id).unwrap();
        assert_eq!(snap.progress, 40);
        assert!(snap.items.is_empty());
    }

    #[test]
    fn finalize_is_idempotent() {
        let reg = registry();
        let id = create(&reg);
        reg.claim(id).unwrap();
        reg.finalize(id, JobOutcome::Completed, None).unwrap();
        assert_eq!(
            reg.finalize(id, JobOutcome::Failed, None),
            Err(RegistryError::AlreadyTerminal)
        );
        assert_eq!(reg.get(id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn cancel_before_claim_is_terminal() {
        let reg = registry();
        let id = create(&reg);
        reg.cancel(id).unwrap();
        assert_eq!(reg.get(id).unwrap().status, JobStatus::Cancelled);
        // A worker arriving later cannot claim the cancelled job.
        assert_eq!(reg.claim(id), Err(RegistryError::AlreadyClaimed));
        // A second cancel is rejected.
        assert_eq!(reg.cancel(id), Err(RegistryError::AlreadyTerminal));
    }

    #[test]
    fn cancel_after_claim_sets_flag_only() {
        let reg = registry();
        let id = create(&reg);
        reg.claim(id).unwrap();
        assert!(!reg.cancel_requested(id));
        reg.cancel(id).unwrap();
        assert!(reg.cancel_requested(id));
        assert_eq!(reg.get(id).unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn list_preserves_submission_order() {
        let reg = registry();
        let ids: Vec<Uuid> = (0..5).map(|_| create(&reg)).collect();
        let listed: Vec<Uuid> = reg
            .list(&JobFilter::default())
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(listed, ids);

        let limited = reg.list(&JobFilter {
            status: None,
            limit: Some(2),
        });
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, ids[0]);
    }

    #[test]
    fn list_filters_by_status() {
        let reg = registry();
        let a = create(&reg);
        let _b = create(&reg);
        reg.claim(a).unwrap();
        let processing = reg.list(&JobFilter {
            status: Some(JobStatus::Processing),
            limit: None,
        });
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, a);
    }

    #[test]
    fn purge_removes_only_expired_terminal_jobs() {
        let reg = JobRegistry::new(chrono::Duration::seconds(0));
        let done = create(&reg);
        let running = create(&reg);
        reg.claim(done).unwrap();
        reg.finalize(done, JobOutcome::Completed, None).unwrap();
        reg.claim(running).unwrap();

        let purged = reg.purge_expired(Utc::now());
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, done);
        assert_eq!(reg.get(done), Err(RegistryError::NotFound));
        assert!(reg.get(running).is_ok());
    }

    #[test]
    fn retention_override_shortens_deadline() {
        let reg = registry();
        let id = reg
            .create(
                descriptor(),
                ConversionOptions {
                    retention_override_secs: Some(60),
                    ..Default::default()
                },
            )
            .unwrap();
        let snap = reg.get(id).unwrap();
        let window = snap.retention_deadline - snap.submitted_at;
        assert_eq!(window, chrono::Duration::seconds(60));
    }
}
