//! Object store capability and its bundled adapters.

use async_trait::async_trait;
use dashmap::DashMap;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::sync::atomic::{AtomicU64, Ordering};

/// Remote store the engine pushes encoded artifacts into. `put` returns an
/// opaque storage reference that is the only handle ever used afterwards.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        bytes: &[u8],
        key: &str,
        content_type: &str,
    ) -> Result<String, StoreError>;

    async fn delete(&self, storage_ref: &str) -> Result<(), StoreError>;
}

/// Connection settings for an S3-compatible bucket, loaded from
/// `LAYERPRESS_R2_`-prefixed environment variables.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct R2Config {
    pub bucket: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

impl R2Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed("LAYERPRESS_R2_").from_env()
    }
}

/// Client for Cloudflare R2 or any other S3-compatible object storage.
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn from_config(config: &R2Config) -> Result<Self, StoreError> {
        Self::new(
            &config.bucket,
            &config.endpoint,
            &config.access_key,
            &config.secret_key,
        )
    }

    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StoreError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StoreError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl ObjectStore for R2Client {
    async fn put(
        &self,
        bytes: &[u8],
        key: &str,
        content_type: &str,
    ) -> Result<String, StoreError> {
        self.bucket
            .put_object_with_content_type(key, bytes, content_type)
            .await
            .map_err(StoreError::S3)?;
        Ok(key.to_string())
    }

    async fn delete(&self, storage_ref: &str) -> Result<(), StoreError> {
        self.bucket
            .delete_object(storage_ref)
            .await
            .map_err(StoreError::S3)?;
        Ok(())
    }
}

/// In-process store for tests and embedded use. Counts `put` calls so dedup
/// behavior can be asserted exactly.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, Vec<u8>>,
    put_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, storage_ref: &str) -> bool {
        self.objects.contains_key(storage_ref)
    }

    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> u64 {
        self.objects.iter().map(|e| e.value().len() as u64).sum()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        bytes: &[u8],
        key: &str,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.objects.insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }

    async fn delete(&self, storage_ref: &str) -> Result<(), StoreError> {
        self.objects
            .remove(storage_ref)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(storage_ref.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("no stored object for reference {0}")]
    NotFound(String),
}
