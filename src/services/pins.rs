//! Pin lookup capability.
//!
//! An external metadata layer may persist artifacts beyond the engine's
//! retention rules; the lifecycle sweep consults this before deleting.

use async_trait::async_trait;
use dashmap::DashSet;

#[async_trait]
pub trait PinIndex: Send + Sync {
    async fn is_pinned(&self, storage_ref: &str) -> bool;
}

/// Default pin index: nothing is ever pinned.
#[derive(Debug, Default)]
pub struct NoPins;

#[async_trait]
impl PinIndex for NoPins {
    async fn is_pinned(&self, _storage_ref: &str) -> bool {
        false
    }
}

/// In-process pin set for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryPinSet {
    pinned: DashSet<String>,
}

impl MemoryPinSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, storage_ref: impl Into<String>) {
        self.pinned.insert(storage_ref.into());
    }

    pub fn unpin(&self, storage_ref: &str) {
        self.pinned.remove(storage_ref);
    }
}

#[async_trait]
impl PinIndex for MemoryPinSet {
    async fn is_pinned(&self, storage_ref: &str) -> bool {
        self.pinned.contains(storage_ref)
    }
}
