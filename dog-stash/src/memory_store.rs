use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::{BlobKey, BlobRead, BlobStore};
use crate::{ByteSource, StashError, StashResult};

/// In-memory blob store for testing and development
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<BlobKey, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// All stored keys, rendered as `owner/name`
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().keys().map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    /// Sum of all stored blob lengths
    pub fn total_bytes(&self) -> u64 {
        self.blobs.read().values().map(|b| b.len() as u64).sum()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(&self, key: &BlobKey, source: &mut (dyn ByteSource + '_)) -> StashResult<u64> {
        key.relative_path()?;
        if self.blobs.read().contains_key(key) {
            return Err(StashError::DuplicateId { id: key.to_string() });
        }

        // Buffer fully before publishing so a failed write is never visible.
        let mut buf = BytesMut::new();
        while let Some(chunk) = source.next().await? {
            buf.extend_from_slice(&chunk);
        }

        let mut blobs = self.blobs.write();
        if blobs.contains_key(key) {
            return Err(StashError::DuplicateId { id: key.to_string() });
        }
        let written = buf.len() as u64;
        blobs.insert(key.clone(), buf.freeze());
        Ok(written)
    }

    async fn read(&self, key: &BlobKey) -> StashResult<BlobRead> {
        let data = self
            .blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StashError::not_found(key.to_string()))?;
        let size_bytes = data.len() as u64;
        let stream = futures::stream::once(async move { Ok(data) });
        Ok(BlobRead {
            stream: Box::pin(stream),
            size_bytes,
        })
    }

    async fn delete(&self, key: &BlobKey) -> StashResult<bool> {
        Ok(self.blobs.write().remove(key).is_some())
    }

    async fn exists(&self, key: &BlobKey) -> StashResult<bool> {
        Ok(self.blobs.read().contains_key(key))
    }
}
