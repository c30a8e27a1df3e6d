use std::time::Duration;

use serde::Deserialize;

/// How the deduplication index decides that two items are the same content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::EnumString, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DedupPolicy {
    /// Truncated SHA-256 of canonical pixel data; byte-identical content only.
    Exact,
    /// 64-bit difference hash matched within a Hamming-distance threshold.
    Perceptual,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent conversion workers.
    pub worker_count: usize,

    /// Bounded submission queue capacity; submits beyond this fail fast.
    pub queue_capacity: usize,

    /// Per-job wall-clock timeout in seconds.
    pub job_timeout_secs: u64,

    /// How long terminal job records are kept before the sweep purges them.
    pub retention_secs: u64,

    /// Minimum artifact age before an unreferenced artifact may be deleted.
    pub artifact_ttl_secs: u64,

    /// Fingerprint equality policy for the deduplication index.
    pub dedup_policy: DedupPolicy,

    /// Hamming-distance threshold for the perceptual policy (0-64).
    pub phash_threshold: u32,

    /// Attempts per object-store call before surfacing an item failure.
    pub store_retry_attempts: u32,

    /// Base delay for exponential store retry backoff, in milliseconds.
    pub store_retry_base_ms: u64,

    /// Upper bound on convertible entries accepted from one archive.
    pub max_items_per_archive: usize,
}

fn default_config() -> EngineConfig {
    EngineConfig {
        worker_count: 4,
        queue_capacity: 100,
        job_timeout_secs: 300,
        retention_secs: 86_400,
        artifact_ttl_secs: 86_400,
        dedup_policy: DedupPolicy::Exact,
        phash_threshold: 5,
        store_retry_attempts: 3,
        store_retry_base_ms: 200,
        max_items_per_archive: 50,
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        default_config()
    }
}

impl EngineConfig {
    /// Load configuration from `LAYERPRESS_`-prefixed environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed("LAYERPRESS_").from_env()
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    pub fn artifact_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.artifact_ttl_secs as i64)
    }

    pub fn store_retry_base(&self) -> Duration {
        Duration::from_millis(self.store_retry_base_ms)
    }
}
