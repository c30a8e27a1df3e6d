use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::artifact::ArtifactRef;

/// Status of a conversion job in the async queue.
///
/// Transitions are monotonic: `Queued -> Processing -> {Completed, Failed,
/// Partial}`, plus `Queued -> Cancelled` for jobs cancelled before a worker
/// claims them. There is no transition out of a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Processing)
    }
}

/// Declared shape of a submission: one asset, or a ZIP batch of assets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    SingleAsset,
    Archive,
}

/// What the caller told us about the uploaded payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputDescriptor {
    pub filename: String,
    pub declared_size: u64,
    pub kind: InputKind,
}

impl InputDescriptor {
    pub fn new(filename: impl Into<String>, declared_size: u64, kind: InputKind) -> Self {
        Self {
            filename: filename.into(),
            declared_size,
            kind,
        }
    }

    /// Lowercased extension of the declared filename, if any.
    pub fn extension(&self) -> Option<String> {
        self.filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }
}

/// Outcome of converting one item inside a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// A new artifact was encoded and stored.
    Converted { artifact: ArtifactRef },
    /// Content matched an existing artifact; nothing new was stored.
    Duplicate { artifact: ArtifactRef },
    /// The item could not be converted; siblings are unaffected.
    Error { detail: String },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, ItemOutcome::Error { .. })
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        match self {
            ItemOutcome::Converted { artifact } | ItemOutcome::Duplicate { artifact } => {
                Some(artifact)
            }
            ItemOutcome::Error { .. } => None,
        }
    }
}

/// Per-item result, appended in processing order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Immutable copy of a job record, safe to hand to any caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub status: JobStatus,
    pub input: InputDescriptor,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retention_deadline: DateTime<Utc>,
    pub items: Vec<ItemResult>,
    /// Aggregate progress, 0-100, monotonically non-decreasing.
    pub progress: u8,
    pub error: Option<String>,
}

/// Filter for listing jobs. Results are always in submission order.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}
