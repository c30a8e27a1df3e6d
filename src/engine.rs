//! Public entry point composing the registry, scheduler, dedup index and
//! lifecycle manager.

use std::sync::Arc;
use std::time::Duration;

use garde::Validate;
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dedup::{DedupIndex, IndexStats};
use crate::lifecycle::{LifecycleManager, SweepReport};
use crate::models::job::{InputDescriptor, InputKind, JobFilter, JobSnapshot, JobStatus};
use crate::models::options::ConversionOptions;
use crate::registry::{JobRegistry, RegistryError};
use crate::scheduler::{WorkerContext, WorkerScheduler};
use crate::services::archive::ALLOWED_IMAGE_EXTENSIONS;
use crate::services::codec::{ImageCodec, LayerDecoder, RasterEncoder};
use crate::services::pins::{NoPins, PinIndex};
use crate::services::storage::ObjectStore;

/// Counts of jobs by status plus index activity, for operational surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    pub jobs_total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub partial: usize,
    pub cancelled: usize,
    pub index: IndexStats,
}

/// The conversion job engine.
///
/// Must be constructed inside a tokio runtime; `new` spawns the worker pool.
/// Submission and queries are non-blocking and safe to call concurrently
/// with any number of in-flight conversions.
pub struct ConversionEngine {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    index: Arc<DedupIndex>,
    lifecycle: Arc<LifecycleManager>,
    scheduler: WorkerScheduler,
}

impl ConversionEngine {
    pub fn new(
        config: EngineConfig,
        decoder: Arc<dyn LayerDecoder>,
        encoder: Arc<dyn RasterEncoder>,
        store: Arc<dyn ObjectStore>,
        pins: Arc<dyn PinIndex>,
    ) -> Self {
        describe_metrics();

        let registry = Arc::new(JobRegistry::new(config.retention()));
        let index = Arc::new(DedupIndex::new(config.dedup_policy, config.phash_threshold));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            index.clone(),
            store.clone(),
            pins,
            config.artifact_ttl(),
        ));
        let scheduler = WorkerScheduler::start(WorkerContext {
            registry: registry.clone(),
            index: index.clone(),
            decoder,
            encoder,
            store,
            config: config.clone(),
        });

        tracing::info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            dedup_policy = %config.dedup_policy,
            "conversion engine started"
        );

        Self {
            config,
            registry,
            index,
            lifecycle,
            scheduler,
        }
    }

    /// Engine with the bundled `image`-crate codec and no pinning layer.
    pub fn with_default_codec(config: EngineConfig, store: Arc<dyn ObjectStore>) -> Self {
        let codec = Arc::new(ImageCodec::new());
        Self::new(config, codec.clone(), codec, store, Arc::new(NoPins))
    }

    /// Validate and enqueue a submission. Returns the new job id, or fails
    /// fast with `QueueFull` without creating any record.
    pub fn submit(
        &self,
        bytes: Vec<u8>,
        input: InputDescriptor,
        options: ConversionOptions,
    ) -> Result<Uuid, SubmitError> {
        validate_submission(&bytes, &input, &options)?;

        // Reserve the queue slot before creating the record so a full queue
        // never leaves an orphaned QUEUED job behind.
        let permit = self.scheduler.try_reserve().map_err(|_| {
            metrics::counter!("conversion_jobs_rejected_total").increment(1);
            SubmitError::QueueFull
        })?;

        let id = self.registry.create(input, options)?;
        permit.send(id, bytes);
        metrics::counter!("conversion_jobs_submitted_total").increment(1);
        tracing::info!(job_id = %id, "job queued");
        Ok(id)
    }

    pub fn get_job(&self, id: Uuid) -> Result<JobSnapshot, RegistryError> {
        self.registry.get(id)
    }

    /// Snapshots in submission order.
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.registry.list(filter)
    }

    /// Cancel a job: immediate while queued, cooperative once processing.
    pub fn cancel_job(&self, id: Uuid) -> Result<(), RegistryError> {
        self.registry.cancel(id)
    }

    /// Run a retention sweep now, in addition to any periodic schedule.
    pub async fn run_cleanup(&self) -> SweepReport {
        self.lifecycle.sweep().await
    }

    /// Sweep on a fixed interval until the returned handle is aborted.
    pub fn start_periodic_cleanup(&self, interval: Duration) -> JoinHandle<()> {
        self.lifecycle.run_periodic(interval)
    }

    pub fn metrics_snapshot(&self) -> EngineMetrics {
        let jobs = self.registry.list(&JobFilter::default());
        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
        EngineMetrics {
            jobs_total: jobs.len(),
            queued: count(JobStatus::Queued),
            processing: count(JobStatus::Processing),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            partial: count(JobStatus::Partial),
            cancelled: count(JobStatus::Cancelled),
            index: self.index.stats(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop accepting work and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        tracing::info!("conversion engine shutting down");
        self.scheduler.shutdown().await;
    }
}

fn validate_submission(
    bytes: &[u8],
    input: &InputDescriptor,
    options: &ConversionOptions,
) -> Result<(), ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::EmptyInput);
    }
    if input.declared_size != bytes.len() as u64 {
        return Err(ValidationError::SizeMismatch {
            declared: input.declared_size,
            actual: bytes.len() as u64,
        });
    }

    let ext = input
        .extension()
        .ok_or(ValidationError::MissingExtension)?;
    let ext_ok = match input.kind {
        InputKind::Archive => ext == "zip",
        InputKind::SingleAsset => ALLOWED_IMAGE_EXTENSIONS.contains(&ext.as_str()),
    };
    if !ext_ok {
        return Err(ValidationError::UnsupportedExtension { extension: ext });
    }

    options.validate()?;
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "conversion_jobs_submitted_total",
        "Conversion jobs accepted into the queue"
    );
    metrics::describe_counter!(
        "conversion_jobs_rejected_total",
        "Submissions rejected with queue backpressure"
    );
    metrics::describe_counter!(
        "conversion_jobs_completed_total",
        "Jobs finalized with every item converted"
    );
    metrics::describe_counter!(
        "conversion_jobs_partial_total",
        "Jobs finalized with a mix of converted and failed items"
    );
    metrics::describe_counter!(
        "conversion_jobs_failed_total",
        "Jobs finalized without a single converted item"
    );
    metrics::describe_counter!(
        "conversion_jobs_timed_out_total",
        "Jobs aborted by the per-job wall-clock deadline"
    );
    metrics::describe_counter!("dedup_hits_total", "Items that matched an existing artifact");
    metrics::describe_counter!("artifacts_stored_total", "Artifacts physically stored");
    metrics::describe_counter!("sweep_purged_jobs_total", "Job records purged by sweeps");
    metrics::describe_counter!(
        "sweep_purged_artifacts_total",
        "Artifacts physically deleted by sweeps"
    );
    metrics::describe_counter!(
        "sweep_reclaimed_bytes_total",
        "Bytes reclaimed from the object store by sweeps"
    );
    metrics::describe_gauge!(
        "conversion_queue_depth",
        "Work items currently waiting in the submission queue"
    );
}

/// Rejected before a job record exists.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("empty input payload")]
    EmptyInput,

    #[error("declared size {declared} does not match payload size {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("filename has no extension")]
    MissingExtension,

    #[error("unsupported input extension: .{extension}")]
    UnsupportedExtension { extension: String },

    #[error("invalid options: {0}")]
    InvalidOptions(#[from] garde::Report),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Backpressure: the caller should retry later.
    #[error("submission queue is at capacity")]
    QueueFull,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(filename: &str, size: u64, kind: InputKind) -> InputDescriptor {
        InputDescriptor::new(filename, size, kind)
    }

    #[test]
    fn validation_rejects_empty_payload() {
        let err = validate_submission(
            &[],
            &descriptor("a.png", 0, InputKind::SingleAsset),
            &ConversionOptions::default(),
        );
        assert!(matches!(err, Err(ValidationError::EmptyInput)));
    }

    #[test]
    fn validation_rejects_size_mismatch() {
        let err = validate_submission(
            &[1, 2, 3],
            &descriptor("a.png", 5, InputKind::SingleAsset),
            &ConversionOptions::default(),
        );
        assert!(matches!(
            err,
            Err(ValidationError::SizeMismatch {
                declared: 5,
                actual: 3
            })
        ));
    }

    #[test]
    fn validation_checks_extension_against_kind() {
        let err = validate_submission(
            &[1, 2, 3],
            &descriptor("a.png", 3, InputKind::Archive),
            &ConversionOptions::default(),
        );
        assert!(matches!(
            err,
            Err(ValidationError::UnsupportedExtension { .. })
        ));

        let ok = validate_submission(
            &[1, 2, 3],
            &descriptor("batch.zip", 3, InputKind::Archive),
            &ConversionOptions::default(),
        );
        assert!(ok.is_ok());

        let err = validate_submission(
            &[1, 2, 3],
            &descriptor("document.pdf", 3, InputKind::SingleAsset),
            &ConversionOptions::default(),
        );
        assert!(matches!(
            err,
            Err(ValidationError::UnsupportedExtension { .. })
        ));
    }

    #[test]
    fn validation_runs_option_checks() {
        let err = validate_submission(
            &[1, 2, 3],
            &descriptor("a.png", 3, InputKind::SingleAsset),
            &ConversionOptions {
                quality: 0,
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(ValidationError::InvalidOptions(_))));
    }
}
