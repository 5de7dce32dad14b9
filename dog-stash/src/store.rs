use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::{AccountId, ByteSource, ByteStream, FileId, StashError, StashResult, UploadId};

/// Core blob storage operations - must be implemented by all storage backends.
///
/// A write either publishes the whole file or leaves nothing behind; readers
/// never observe a truncated blob.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob from a source, returning the number of bytes written.
    ///
    /// Fails with `DuplicateId` if the key is already taken.
    async fn write(&self, key: &BlobKey, source: &mut (dyn ByteSource + '_)) -> StashResult<u64>;

    /// Get a blob as a stream together with its length
    async fn read(&self, key: &BlobKey) -> StashResult<BlobRead>;

    /// Delete a blob; `false` if there was nothing to delete
    async fn delete(&self, key: &BlobKey) -> StashResult<bool>;

    /// Check if a blob exists
    async fn exists(&self, key: &BlobKey) -> StashResult<bool>;
}

/// Result of a read
pub struct BlobRead {
    pub stream: ByteStream,
    pub size_bytes: u64,
}

/// Where a blob lives: owner namespace plus name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    owner: String,
    name: String,
}

impl BlobKey {
    /// Key of a committed file
    pub fn file(owner: &AccountId, id: &FileId) -> Self {
        Self {
            owner: owner.as_str().to_string(),
            name: id.as_str().to_string(),
        }
    }

    /// Key of one staged chunk of a resumable upload
    pub fn staged(owner: &AccountId, upload_id: &UploadId, index: u32) -> Self {
        Self {
            owner: owner.as_str().to_string(),
            name: format!("__uploads/{}/part-{:06}", upload_id.as_str(), index),
        }
    }

    /// Relative path `owner/name`, refusing anything that could leave the root
    pub fn relative_path(&self) -> StashResult<PathBuf> {
        let path = Path::new(&self.owner).join(&self.name);
        let safe = !self.owner.is_empty()
            && !self.owner.contains(|c: char| c == '/' || c == '\\')
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StashError::invalid(format!("unsafe blob key: {self}")));
        }
        Ok(path)
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}
