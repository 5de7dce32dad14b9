//! Local filesystem blob store.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::store::{BlobKey, BlobRead, BlobStore};
use crate::{ByteSource, StashError, StashResult};

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Files under `root/<owner>/<file id>`.
///
/// Writes go to a hidden sibling temp file and are renamed into place once
/// complete, so a failed write never leaves a visible partial file.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create the store, creating `root` if needed
    pub async fn new(root: impl AsRef<Path>) -> StashResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &BlobKey) -> StashResult<PathBuf> {
        Ok(self.root.join(key.relative_path()?))
    }

    async fn write_temp(
        temp: &Path,
        source: &mut (dyn ByteSource + '_),
    ) -> StashResult<u64> {
        let mut file = fs::File::create(temp).await?;
        let mut written = 0u64;
        while let Some(chunk) = source.next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(skip(self, source), fields(backend = "filesystem"))]
    async fn write(&self, key: &BlobKey, source: &mut (dyn ByteSource + '_)) -> StashResult<u64> {
        let path = self.path_for(key)?;
        if fs::try_exists(&path).await? {
            return Err(StashError::DuplicateId { id: key.to_string() });
        }
        let parent = path
            .parent()
            .ok_or_else(|| StashError::invalid(format!("blob key has no parent: {key}")))?;
        fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{}.{}.part", file_name, Uuid::new_v4().simple()));

        let published = match Self::write_temp(&temp, source).await {
            Ok(written) => {
                if fs::try_exists(&path).await? {
                    Err(StashError::DuplicateId { id: key.to_string() })
                } else {
                    fs::rename(&temp, &path).await.map(|_| written).map_err(StashError::from)
                }
            }
            Err(e) => Err(e),
        };

        if published.is_err() {
            if let Err(e) = fs::remove_file(&temp).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!(temp = %temp.display(), error = %e, "failed to remove partial blob");
                }
            }
        } else {
            debug!(%key, "blob published");
        }
        published
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read(&self, key: &BlobKey) -> StashResult<BlobRead> {
        let path = self.path_for(key)?;
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StashError::not_found(key.to_string())
            } else {
                StashError::from(e)
            }
        })?;
        let size_bytes = file.metadata().await?.len();
        Ok(BlobRead {
            stream: Box::pin(ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE)),
            size_bytes,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &BlobKey) -> StashResult<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &BlobKey) -> StashResult<bool> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }
}
