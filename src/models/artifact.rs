use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raster format an artifact is encoded in.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::WebP => "image/webp",
        }
    }
}

/// 64-bit content fingerprint of canonical decoded pixel data.
///
/// Under the exact policy this is a truncated SHA-256 digest; under the
/// perceptual policy it is a difference hash compared by Hamming distance.
/// Either way the fingerprint is computed before encoding, so identical
/// visual content with different compression settings maps to one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Number of differing bits between two fingerprints.
    pub fn hamming_distance(self, other: Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One physically stored conversion output, owned by the deduplication index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub fingerprint: Fingerprint,
    pub format: OutputFormat,
    pub quality: u8,
    pub byte_size: u64,
    /// Opaque handle returned by the object store capability.
    pub storage_ref: String,
    pub created_at: DateTime<Utc>,
    /// Number of jobs currently pointing at this artifact.
    pub ref_count: u32,
}

impl Artifact {
    /// Weak, lookup-only reference for embedding in job item results.
    pub fn weak_ref(&self) -> ArtifactRef {
        ArtifactRef {
            fingerprint: self.fingerprint,
            storage_ref: self.storage_ref.clone(),
            format: self.format,
            byte_size: self.byte_size,
        }
    }
}

/// Weak reference held by a job's item result. Jobs never delete through
/// these; only the lifecycle manager removes artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub fingerprint: Fingerprint,
    pub storage_ref: String,
    pub format: OutputFormat,
    pub byte_size: u64,
}
