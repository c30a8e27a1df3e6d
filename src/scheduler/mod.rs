//! Bounded worker pool draining the submission queue.
//!
//! A fixed number of workers share one bounded mpsc queue. Submission never
//! blocks: callers reserve a queue slot up front and get `QueueFull` back
//! immediately when the queue is at capacity. Each worker owns a job from
//! claim to finalize; the per-job wall-clock timeout wraps the whole
//! processing future, so the guarantee is total job time, not per item.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dedup::{opaque_fingerprint, DedupIndex};
use crate::models::artifact::Artifact;
use crate::models::job::{InputDescriptor, InputKind, ItemOutcome, ItemResult};
use crate::models::options::ConversionOptions;
use crate::registry::{JobOutcome, JobRegistry, RegistryError};
use crate::services::archive::{self, ArchiveError, ArchiveItem};
use crate::services::codec::{EncodeSpec, LayerDecoder, RasterEncoder};
use crate::services::storage::{ObjectStore, StoreError};

/// Everything a worker needs to process jobs.
pub(crate) struct WorkerContext {
    pub registry: Arc<JobRegistry>,
    pub index: Arc<DedupIndex>,
    pub decoder: Arc<dyn LayerDecoder>,
    pub encoder: Arc<dyn RasterEncoder>,
    pub store: Arc<dyn ObjectStore>,
    pub config: EngineConfig,
}

struct WorkItem {
    job_id: Uuid,
    bytes: Vec<u8>,
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

pub struct WorkerScheduler {
    tx: mpsc::Sender<WorkItem>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerScheduler {
    pub(crate) fn start(ctx: WorkerContext) -> Self {
        let (tx, rx) = mpsc::channel(ctx.config.queue_capacity.max(1));
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));
        let ctx = Arc::new(ctx);

        let handles = (0..ctx.config.worker_count.max(1))
            .map(|worker_id| {
                let ctx = ctx.clone();
                let rx = rx.clone();
                tokio::spawn(worker_loop(worker_id, ctx, rx))
            })
            .collect();

        Self { tx, handles }
    }

    /// Reserve a queue slot, failing fast when the queue is at capacity.
    pub fn try_reserve(&self) -> Result<SubmitPermit<'_>, QueueFull> {
        self.tx
            .try_reserve()
            .map(SubmitPermit)
            .map_err(|_| QueueFull)
    }

    /// Close the queue and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// A reserved queue slot. Sending through it cannot fail, so callers can
/// create the job record between reservation and enqueue without risking an
/// orphaned record on a full queue.
pub struct SubmitPermit<'a>(mpsc::Permit<'a, WorkItem>);

impl SubmitPermit<'_> {
    pub(crate) fn send(self, job_id: Uuid, bytes: Vec<u8>) {
        metrics::gauge!("conversion_queue_depth").increment(1.0);
        self.0.send(WorkItem { job_id, bytes });
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("submission queue is at capacity")]
pub struct QueueFull;

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>, rx: SharedReceiver) {
    tracing::debug!(worker_id, "conversion worker started");
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else {
            break;
        };
        metrics::gauge!("conversion_queue_depth").decrement(1.0);
        process(&ctx, item).await;
    }
    tracing::debug!(worker_id, "conversion worker stopped");
}

/// Claim, convert with a deadline, finalize. Exactly one terminal transition
/// happens here; a timeout racing a normal completion loses to the finalize
/// idempotency guard and becomes a no-op.
async fn process(ctx: &WorkerContext, item: WorkItem) {
    let job_id = item.job_id;
    let (input, options) = match ctx.registry.claim(job_id) {
        Ok(claimed) => claimed,
        Err(e) => {
            // Typically a job cancelled while still queued.
            tracing::debug!(job_id = %job_id, error = %e, "skipping unclaimable job");
            return;
        }
    };

    tracing::info!(
        job_id = %job_id,
        filename = %input.filename,
        declared_size = input.declared_size,
        "processing conversion job"
    );

    let deadline = ctx.config.job_timeout();
    match tokio::time::timeout(
        deadline,
        convert_job(ctx, job_id, &input, &options, item.bytes),
    )
    .await
    {
        Ok((outcome, summary)) => match ctx.registry.finalize(job_id, outcome, summary) {
            Ok(()) => {
                record_outcome_metrics(outcome);
                tracing::info!(job_id = %job_id, outcome = %crate::models::job::JobStatus::from(outcome), "job finalized");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "finalize rejected; invariant violation");
            }
        },
        Err(_) => {
            let summary = format!("timed out after {}s", deadline.as_secs());
            match ctx
                .registry
                .finalize(job_id, JobOutcome::Failed, Some(summary))
            {
                Ok(()) => {
                    record_outcome_metrics(JobOutcome::Failed);
                    metrics::counter!("conversion_jobs_timed_out_total").increment(1);
                    tracing::warn!(job_id = %job_id, timeout_secs = deadline.as_secs(), "job timed out");
                }
                Err(RegistryError::AlreadyTerminal) => {
                    tracing::debug!(job_id = %job_id, "timeout signal after finalize, ignoring");
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "timeout finalize failed");
                }
            }
        }
    }
}

fn record_outcome_metrics(outcome: JobOutcome) {
    match outcome {
        JobOutcome::Completed => metrics::counter!("conversion_jobs_completed_total").increment(1),
        JobOutcome::Partial => metrics::counter!("conversion_jobs_partial_total").increment(1),
        JobOutcome::Failed => metrics::counter!("conversion_jobs_failed_total").increment(1),
    }
}

/// Convert every item in the submission, appending results in processing
/// order. Item failures never abort siblings; only expansion failure or the
/// outer timeout fails the job wholesale.
async fn convert_job(
    ctx: &WorkerContext,
    job_id: Uuid,
    input: &InputDescriptor,
    options: &ConversionOptions,
    bytes: Vec<u8>,
) -> (JobOutcome, Option<String>) {
    let items = match expand_items(ctx, input, bytes) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "input expansion failed");
            return (JobOutcome::Failed, Some(e.to_string()));
        }
    };

    let total = items.len();
    let spec = EncodeSpec::from(options);
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    let mut next = 0usize;
    while next < total {
        // Cooperative cancellation, consulted between items only; an item
        // already in flight runs to completion.
        if ctx.registry.cancel_requested(job_id) {
            break;
        }

        let item = &items[next];
        let outcome = process_item(ctx, job_id, next, item, options, &spec).await;
        if outcome.is_success() {
            succeeded += 1;
        } else {
            failed += 1;
        }

        let percent = ((next + 1) * 100 / total) as u8;
        ctx.registry.report_progress(
            job_id,
            percent,
            Some(ItemResult {
                name: item.name.clone(),
                outcome,
            }),
        );
        next += 1;
    }

    let cancelled = next < total;
    if cancelled {
        // Account for every skipped item so the result list stays complete
        // and progress still reaches 100.
        for (skipped_at, item) in items.iter().enumerate().skip(next) {
            failed += 1;
            let percent = ((skipped_at + 1) * 100 / total) as u8;
            ctx.registry.report_progress(
                job_id,
                percent,
                Some(ItemResult {
                    name: item.name.clone(),
                    outcome: ItemOutcome::Error {
                        detail: "skipped: cancellation requested".to_string(),
                    },
                }),
            );
        }
    }

    let outcome = if failed == 0 {
        JobOutcome::Completed
    } else if succeeded == 0 {
        JobOutcome::Failed
    } else {
        JobOutcome::Partial
    };

    let summary = if cancelled {
        Some("cancelled by request; remaining items skipped".to_string())
    } else if outcome == JobOutcome::Failed {
        Some(format!("all {total} items failed"))
    } else {
        None
    };

    (outcome, summary)
}

fn expand_items(
    ctx: &WorkerContext,
    input: &InputDescriptor,
    bytes: Vec<u8>,
) -> Result<Vec<ArchiveItem>, ArchiveError> {
    match input.kind {
        InputKind::Archive => {
            archive::expand_archive(&bytes, ctx.config.max_items_per_archive)
        }
        InputKind::SingleAsset => Ok(vec![ArchiveItem {
            name: input.filename.clone(),
            bytes,
        }]),
    }
}

/// decode -> fingerprint -> dedup lookup -> encode + store on a miss.
async fn process_item(
    ctx: &WorkerContext,
    job_id: Uuid,
    index: usize,
    item: &ArchiveItem,
    options: &ConversionOptions,
    spec: &EncodeSpec,
) -> ItemOutcome {
    let pixels = match ctx.decoder.decode(&item.bytes, &item.name).await {
        Ok(pixels) => pixels,
        Err(e) => {
            tracing::warn!(job_id = %job_id, item = %item.name, error = %e, "item decode failed");
            return ItemOutcome::Error {
                detail: e.to_string(),
            };
        }
    };

    let probe = if options.dedup_enabled {
        ctx.index.fingerprint(&pixels)
    } else {
        opaque_fingerprint(job_id, index)
    };

    let pixels = &pixels;
    let built: Result<(Artifact, bool), ItemError> = ctx
        .index
        .lookup_or_insert(probe, |canonical| async move {
            let encoded = ctx
                .encoder
                .encode(pixels, spec)
                .await
                .map_err(ItemError::Encode)?;
            let key = format!("artifacts/{}.{}", canonical, spec.format.extension());
            let storage_ref = put_with_retry(
                ctx.store.as_ref(),
                ctx.config.store_retry_attempts,
                ctx.config.store_retry_base(),
                &encoded,
                &key,
                spec.format.content_type(),
            )
            .await
            .map_err(ItemError::Store)?;

            Ok(Artifact {
                fingerprint: canonical,
                format: spec.format,
                quality: spec.quality,
                byte_size: encoded.len() as u64,
                storage_ref,
                created_at: Utc::now(),
                ref_count: 1,
            })
        })
        .await;

    match built {
        Ok((artifact, true)) => ItemOutcome::Duplicate {
            artifact: artifact.weak_ref(),
        },
        Ok((artifact, false)) => {
            tracing::debug!(
                job_id = %job_id,
                item = %item.name,
                storage_ref = %artifact.storage_ref,
                byte_size = artifact.byte_size,
                "stored new artifact"
            );
            ItemOutcome::Converted {
                artifact: artifact.weak_ref(),
            }
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, item = %item.name, error = %e, "item conversion failed");
            ItemOutcome::Error {
                detail: e.to_string(),
            }
        }
    }
}

/// Bounded exponential backoff around the store capability.
async fn put_with_retry(
    store: &dyn ObjectStore,
    attempts: u32,
    base_delay: Duration,
    bytes: &[u8],
    key: &str,
    content_type: &str,
) -> Result<String, StoreError> {
    let attempts = attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match store.put(bytes, key, content_type).await {
            Ok(storage_ref) => return Ok(storage_ref),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(e);
                }
                let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                tracing::warn!(
                    key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "store put failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ItemError {
    #[error(transparent)]
    Encode(crate::services::codec::EncodeError),

    #[error(transparent)]
    Store(StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails the first `fail_times` puts.
    struct FlakyStore {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(
            &self,
            _bytes: &[u8],
            key: &str,
            _content_type: &str,
        ) -> Result<String, StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(StoreError::Config("transient".to_string()))
            } else {
                Ok(key.to_string())
            }
        }

        async fn delete(&self, _storage_ref: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn put_retry_recovers_within_attempts() {
        let store = FlakyStore {
            fail_times: 2,
            calls: AtomicU32::new(0),
        };
        let r = put_with_retry(
            &store,
            3,
            Duration::from_millis(100),
            b"x",
            "artifacts/k.jpg",
            "image/jpeg",
        )
        .await
        .unwrap();
        assert_eq!(r, "artifacts/k.jpg");
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn put_retry_surfaces_after_attempts_exhausted() {
        let store = FlakyStore {
            fail_times: 10,
            calls: AtomicU32::new(0),
        };
        let err = put_with_retry(
            &store,
            3,
            Duration::from_millis(10),
            b"x",
            "artifacts/k.jpg",
            "image/jpeg",
        )
        .await;
        assert!(err.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }
}
