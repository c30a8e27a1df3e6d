//! Content-fingerprint index mapping canonical pixel data to stored artifacts.
//!
//! The index guarantees at most one stored artifact per fingerprint. Racing
//! workers serialize on a per-fingerprint mutex, never on the whole map, so
//! unrelated content converts in parallel while identical content is stored
//! exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::DedupPolicy;
use crate::models::artifact::{Artifact, Fingerprint};
use crate::models::pixel::PixelBuffer;

/// State guarded by the per-fingerprint mutex.
///
/// `retired` marks a slot whose map entry has been removed while a waiter
/// still held the Arc; waiters observing it re-enter the map for a fresh slot.
#[derive(Debug, Default)]
struct Slot {
    artifact: Option<Artifact>,
    retired: bool,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    duplicates: AtomicU64,
    unique: AtomicU64,
}

/// Point-in-time view of index activity.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexStats {
    pub processed: u64,
    pub duplicates: u64,
    pub unique: u64,
    pub entries: usize,
}

pub struct DedupIndex {
    slots: DashMap<u64, Arc<Mutex<Slot>>>,
    policy: DedupPolicy,
    phash_threshold: u32,
    counters: Counters,
}

impl DedupIndex {
    pub fn new(policy: DedupPolicy, phash_threshold: u32) -> Self {
        Self {
            slots: DashMap::new(),
            policy,
            phash_threshold,
            counters: Counters::default(),
        }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    /// Fingerprint canonical pixel data under the configured policy.
    pub fn fingerprint(&self, pixels: &PixelBuffer) -> Fingerprint {
        match self.policy {
            DedupPolicy::Exact => exact_fingerprint(pixels),
            DedupPolicy::Perceptual => dhash_fingerprint(pixels),
        }
    }

    /// Atomically look up the fingerprint or insert a new artifact.
    ///
    /// If the fingerprint (or, under the perceptual policy, a near enough
    /// neighbor) is present, its reference count is incremented and
    /// `(artifact, true)` returns. Otherwise `factory` runs under the slot
    /// lock, so a concurrent worker with the same fingerprint waits here and
    /// then observes the winner's artifact instead of storing a second copy.
    pub async fn lookup_or_insert<F, Fut, E>(
        &self,
        probe: Fingerprint,
        factory: F,
    ) -> Result<(Artifact, bool), E>
    where
        F: FnOnce(Fingerprint) -> Fut,
        Fut: Future<Output = Result<Artifact, E>>,
    {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let canonical = self.resolve(probe);
        let mut factory = Some(factory);

        loop {
            let slot = Arc::clone(&self.slots.entry(canonical.0).or_default());
            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }

            match guard.artifact.as_mut() {
                Some(artifact) => {
                    artifact.ref_count += 1;
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("dedup_hits_total").increment(1);
                    tracing::debug!(
                        fingerprint = %canonical,
                        ref_count = artifact.ref_count,
                        "duplicate content, reusing stored artifact"
                    );
                    return Ok((artifact.clone(), true));
                }
                None => {
                    let build = factory.take().expect("factory consumed once");
                    match build(canonical).await {
                        Ok(mut artifact) => {
                            artifact.fingerprint = canonical;
                            artifact.ref_count = 1;
                            guard.artifact = Some(artifact.clone());
                            self.counters.unique.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("artifacts_stored_total").increment(1);
                            return Ok((artifact, false));
                        }
                        Err(e) => {
                            // Drop the empty slot so the next attempt starts clean.
                            guard.retired = true;
                            drop(guard);
                            self.slots.remove(&canonical.0);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Decrement the reference count. Never deletes; physical removal is the
    /// lifecycle manager's job.
    pub async fn release(&self, fp: Fingerprint) {
        let Some(slot) = self.slots.get(&fp.0).map(|s| Arc::clone(&s)) else {
            tracing::warn!(fingerprint = %fp, "release for unknown fingerprint");
            return;
        };
        let mut guard = slot.lock().await;
        if let Some(artifact) = guard.artifact.as_mut() {
            artifact.ref_count = artifact.ref_count.saturating_sub(1);
        }
    }

    /// Snapshot of all fingerprints currently indexed.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.slots.iter().map(|e| Fingerprint(*e.key())).collect()
    }

    /// Take the slot lock for `fp` in preparation for physical removal.
    ///
    /// Returns `None` when the entry is gone or already being retired. The
    /// caller inspects the artifact, performs the store deletion, and then
    /// either `commit`s (removing the entry) or drops the guard to leave the
    /// entry untouched.
    pub async fn begin_retire(&self, fp: Fingerprint) -> Option<RetireGuard<'_>> {
        let slot = self.slots.get(&fp.0).map(|s| Arc::clone(&s))?;
        let guard = slot.lock_owned().await;
        if guard.retired || guard.artifact.is_none() {
            return None;
        }
        Some(RetireGuard {
            index: self,
            fp,
            guard,
        })
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            unique: self.counters.unique.load(Ordering::Relaxed),
            entries: self.slots.len(),
        }
    }

    /// Map a probe fingerprint onto its canonical index key.
    ///
    /// Exact policy: identity. Perceptual policy: the nearest existing
    /// fingerprint within the Hamming threshold, or the probe itself.
    fn resolve(&self, probe: Fingerprint) -> Fingerprint {
        match self.policy {
            DedupPolicy::Exact => probe,
            DedupPolicy::Perceptual => {
                if self.slots.contains_key(&probe.0) {
                    return probe;
                }
                self.slots
                    .iter()
                    .map(|e| Fingerprint(*e.key()))
                    .map(|fp| (probe.hamming_distance(fp), fp))
                    .filter(|(d, _)| *d <= self.phash_threshold)
                    .min_by_key(|(d, _)| *d)
                    .map(|(_, fp)| fp)
                    .unwrap_or(probe)
            }
        }
    }
}

/// Exclusive handle over one index entry during retirement.
pub struct RetireGuard<'a> {
    index: &'a DedupIndex,
    fp: Fingerprint,
    guard: tokio::sync::OwnedMutexGuard<Slot>,
}

impl RetireGuard<'_> {
    pub fn artifact(&self) -> &Artifact {
        self.guard
            .artifact
            .as_ref()
            .expect("begin_retire checked presence")
    }

    /// Remove the entry. Waiters holding the old slot observe `retired` and
    /// re-enter the map, so a racing lookup re-creates the content rather
    /// than resurrecting a deleted artifact.
    pub fn commit(mut self) -> Artifact {
        self.guard.retired = true;
        let artifact = self
            .guard
            .artifact
            .take()
            .expect("begin_retire checked presence");
        self.index.slots.remove(&self.fp.0);
        artifact
    }
}

/// Truncated SHA-256 over dimensions and canonical RGBA bytes.
pub fn exact_fingerprint(pixels: &PixelBuffer) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(pixels.width.to_be_bytes());
    hasher.update(pixels.height.to_be_bytes());
    hasher.update(&pixels.data);
    let digest = hasher.finalize();
    Fingerprint(u64::from_be_bytes(digest[..8].try_into().expect("8 bytes")))
}

/// 64-bit difference hash: box-average luma onto a 9x8 grid, then compare
/// horizontal neighbors.
pub fn dhash_fingerprint(pixels: &PixelBuffer) -> Fingerprint {
    const COLS: u32 = 9;
    const ROWS: u32 = 8;

    let mut grid = [[0u32; COLS as usize]; ROWS as usize];
    for row in 0..ROWS {
        for col in 0..COLS {
            grid[row as usize][col as usize] = cell_luma(pixels, col, row, COLS, ROWS);
        }
    }

    let mut bits = 0u64;
    for row in 0..ROWS as usize {
        for col in 0..(COLS - 1) as usize {
            bits <<= 1;
            if grid[row][col] > grid[row][col + 1] {
                bits |= 1;
            }
        }
    }
    Fingerprint(bits)
}

fn cell_luma(pixels: &PixelBuffer, col: u32, row: u32, cols: u32, rows: u32) -> u32 {
    let x0 = col * pixels.width / cols;
    let x1 = ((col + 1) * pixels.width / cols).max(x0 + 1).min(pixels.width.max(1));
    let y0 = row * pixels.height / rows;
    let y1 = ((row + 1) * pixels.height / rows).max(y0 + 1).min(pixels.height.max(1));

    let mut sum = 0u64;
    let mut count = 0u64;
    for y in y0..y1.min(pixels.height) {
        for x in x0..x1.min(pixels.width) {
            sum += pixels.luma(x, y) as u64;
            count += 1;
        }
    }
    if count == 0 {
        0
    } else {
        (sum / count) as u32
    }
}

/// Fingerprint that can never collide with content hashes, used when a job
/// opts out of deduplication but its artifacts must still be tracked for
/// lifecycle reclamation.
pub fn opaque_fingerprint(job_id: Uuid, item_index: usize) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update((item_index as u64).to_be_bytes());
    let digest = hasher.finalize();
    Fingerprint(u64::from_be_bytes(digest[..8].try_into().expect("8 bytes")))
}
