use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::artifact::OutputFormat;

/// Per-job conversion options with documented defaults.
///
/// Field ranges mirror what the public upload surface accepts; validation
/// runs before a job is queued so a worker never sees malformed options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConversionOptions {
    #[garde(skip)]
    pub format: OutputFormat,

    /// Compression quality, 1-100.
    #[garde(range(min = 1, max = 100))]
    pub quality: u8,

    /// Maximum output width in pixels.
    #[garde(inner(range(min = 100, max = 16000)))]
    pub max_width: Option<u32>,

    /// Maximum output height in pixels.
    #[garde(inner(range(min = 100, max = 16000)))]
    pub max_height: Option<u32>,

    /// Drop EXIF and other source metadata from outputs.
    #[garde(skip)]
    pub strip_metadata: bool,

    /// Fingerprint items and skip storing content the index already holds.
    #[garde(skip)]
    pub dedup_enabled: bool,

    /// Overrides the engine-wide retention window for this job, in seconds.
    #[garde(inner(range(min = 1)))]
    pub retention_override_secs: Option<u64>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jpeg,
            quality: 75,
            max_width: None,
            max_height: None,
            strip_metadata: true,
            dedup_enabled: true,
            retention_override_secs: None,
        }
    }
}

impl ConversionOptions {
    /// Resolution cap as (width, height), if either axis is limited.
    /// A missing axis falls back to a generous bound to preserve aspect ratio.
    pub fn max_dimensions(&self) -> Option<(u32, u32)> {
        match (self.max_width, self.max_height) {
            (None, None) => None,
            (w, h) => Some((w.unwrap_or(16000), h.unwrap_or(16000))),
        }
    }
}
