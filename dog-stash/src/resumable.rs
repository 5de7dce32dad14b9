//! Offset-addressed uploads spread over many requests.
//!
//! Chunks are staged as separate blobs under the owner's namespace until the
//! declared total has arrived; completion then streams the staged parts
//! through an ordinary ingest session and removes them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::shared::StashCore;
use crate::ingest::IngestSession;
use crate::source::{BufferedSource, StreamSource};
use crate::store::{BlobKey, BlobStore};
use crate::{AccountId, ByteStream, FileRef, StashError, StashResult, UploadId};

/// One request's worth of a resumable upload
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: UploadId,
    pub offset: u64,
    pub data: Bytes,
    pub declared_total: Option<u64>,
    pub filename: Option<String>,
}

impl ChunkRequest {
    pub fn new<B: Into<Bytes>>(upload_id: UploadId, offset: u64, data: B) -> Self {
        Self {
            upload_id,
            offset,
            data: data.into(),
            declared_total: None,
            filename: None,
        }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.declared_total = Some(total);
        self
    }

    pub fn with_filename<S: Into<String>>(mut self, filename: S) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Progress after an accepted chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub upload_id: UploadId,
    pub next_offset: u64,
    pub total: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// Chunk stored, more expected
    Ack(ChunkAck),
    /// Final chunk arrived and the file is committed
    Complete(FileRef),
}

struct UploadState {
    name: String,
    next_offset: u64,
    total: Option<u64>,
    parts: u32,
    updated_at: DateTime<Utc>,
    closed: bool,
}

type SessionKey = (AccountId, UploadId);

/// Open resumable uploads, each behind its own async lock so concurrent
/// requests for the same upload are applied one at a time
#[derive(Default)]
pub(crate) struct ResumableUploads {
    sessions: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<UploadState>>>>,
}

impl ResumableUploads {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) async fn accept(
        &self,
        core: &Arc<StashCore>,
        account: &AccountId,
        chunk: ChunkRequest,
    ) -> StashResult<ChunkOutcome> {
        let key = (account.clone(), chunk.upload_id.clone());
        let entry = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&key) {
                Some(entry) => entry.clone(),
                None if chunk.offset != 0 => {
                    return Err(StashError::ConflictingOffset {
                        expected: 0,
                        got: chunk.offset,
                    })
                }
                None => {
                    let open = sessions.keys().filter(|(owner, _)| owner == account).count();
                    let max = core.config.max_open_uploads;
                    if open >= max {
                        debug!(account = %account, open, max, "resumable upload refused");
                        return Err(StashError::TooManyUploads { open, max });
                    }
                    let entry = Arc::new(tokio::sync::Mutex::new(UploadState {
                        name: chunk.filename.clone().unwrap_or_else(|| "unknown".to_string()),
                        next_offset: 0,
                        total: None,
                        parts: 0,
                        updated_at: Utc::now(),
                        closed: false,
                    }));
                    sessions.insert(key.clone(), entry.clone());
                    debug!(account = %account, upload_id = %chunk.upload_id, "resumable upload opened");
                    entry
                }
            }
        };

        let mut state = entry.lock().await;
        if state.closed {
            return Err(StashError::upload_not_found(chunk.upload_id.as_str()));
        }
        if chunk.offset != state.next_offset {
            return Err(StashError::ConflictingOffset {
                expected: state.next_offset,
                got: chunk.offset,
            });
        }

        let max_file = core.config.max_file_bytes;
        match (state.total, chunk.declared_total) {
            (Some(known), Some(declared)) if known != declared => {
                return Err(StashError::invalid(format!(
                    "declared total changed from {known} to {declared}"
                )));
            }
            (None, Some(declared)) => {
                let admission = core.ledger.admit(account, declared).await?.into_result();
                if let Err(e) = admission {
                    self.close(core, &key, &mut state).await;
                    return Err(e);
                }
                state.total = Some(declared);
            }
            _ => {}
        }

        let len = chunk.data.len() as u64;
        let end = state.next_offset + len;
        if let Some(total) = state.total {
            if end > total {
                return Err(StashError::IntegrityFailure {
                    expected: total,
                    actual: end,
                });
            }
        }
        if end > max_file {
            self.close(core, &key, &mut state).await;
            return Err(StashError::PayloadTooLarge {
                size: end,
                max: max_file,
            });
        }

        if len > 0 {
            let part = BlobKey::staged(account, &chunk.upload_id, state.parts + 1);
            core.store
                .write(&part, &mut BufferedSource::new(chunk.data))
                .await?;
            state.parts += 1;
            state.next_offset = end;
        }
        state.updated_at = Utc::now();

        match state.total {
            Some(total) if state.next_offset == total => {
                let file = self.complete(core, &key, &mut state, total).await?;
                Ok(ChunkOutcome::Complete(file))
            }
            total => Ok(ChunkOutcome::Ack(ChunkAck {
                upload_id: chunk.upload_id,
                next_offset: state.next_offset,
                total,
            })),
        }
    }

    /// Where the next chunk of an open upload must start
    pub(crate) async fn progress(
        &self,
        account: &AccountId,
        upload_id: &UploadId,
    ) -> StashResult<ChunkAck> {
        let entry = self.entry(account, upload_id)?;
        let state = entry.lock().await;
        if state.closed {
            return Err(StashError::upload_not_found(upload_id.as_str()));
        }
        Ok(ChunkAck {
            upload_id: upload_id.clone(),
            next_offset: state.next_offset,
            total: state.total,
        })
    }

    pub(crate) async fn abort(
        &self,
        core: &Arc<StashCore>,
        account: &AccountId,
        upload_id: &UploadId,
    ) -> StashResult<()> {
        let entry = self.entry(account, upload_id)?;
        let mut state = entry.lock().await;
        if state.closed {
            return Err(StashError::upload_not_found(upload_id.as_str()));
        }
        self.close(core, &(account.clone(), upload_id.clone()), &mut state)
            .await;
        Ok(())
    }

    /// Drop uploads nobody has touched for `max_idle`
    pub(crate) async fn prune_idle(&self, core: &Arc<StashCore>, max_idle: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return 0;
        };
        let candidates: Vec<(SessionKey, Arc<tokio::sync::Mutex<UploadState>>)> = self
            .sessions
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut pruned = 0;
        for (key, entry) in candidates {
            // busy uploads are by definition not idle
            let Ok(mut state) = entry.try_lock() else {
                continue;
            };
            if !state.closed && state.updated_at < cutoff {
                self.close(core, &key, &mut state).await;
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "dropped idle resumable uploads");
        }
        pruned
    }

    fn entry(
        &self,
        account: &AccountId,
        upload_id: &UploadId,
    ) -> StashResult<Arc<tokio::sync::Mutex<UploadState>>> {
        self.sessions
            .lock()
            .get(&(account.clone(), upload_id.clone()))
            .cloned()
            .ok_or_else(|| StashError::upload_not_found(upload_id.as_str()))
    }

    async fn complete(
        &self,
        core: &Arc<StashCore>,
        key: &SessionKey,
        state: &mut UploadState,
        total: u64,
    ) -> StashResult<FileRef> {
        let (account, upload_id) = key;
        let parts = staged_keys(account, upload_id, state.parts);
        let mut source = StreamSource::from_storage(concat_parts(core.store.clone(), parts));
        let mut session = IngestSession::new(core.clone(), account.clone(), state.name.clone());
        let outcome = session.run(&mut source, Some(total)).await;
        self.close(core, key, state).await;
        outcome
    }

    /// Mark closed, forget the session and remove staged parts
    async fn close(&self, core: &Arc<StashCore>, key: &SessionKey, state: &mut UploadState) {
        state.closed = true;
        self.sessions.lock().remove(key);
        let (account, upload_id) = key;
        for part in staged_keys(account, upload_id, state.parts) {
            if let Err(e) = core.store.delete(&part).await {
                warn!(%part, error = %e, "failed to remove staged chunk");
            }
        }
    }
}

fn staged_keys(account: &AccountId, upload_id: &UploadId, parts: u32) -> Vec<BlobKey> {
    (1..=parts)
        .map(|p| BlobKey::staged(account, upload_id, p))
        .collect()
}

/// Concatenate staged parts into a single stream
fn concat_parts(store: Arc<dyn BlobStore>, parts: Vec<BlobKey>) -> ByteStream {
    let stream = async_stream::stream! {
        for key in parts {
            match store.read(&key).await {
                Ok(read) => {
                    let mut part_stream = read.stream;
                    while let Some(chunk) = part_stream.next().await {
                        yield chunk;
                    }
                }
                Err(e) => {
                    yield Err(std::io::Error::other(format!("failed to read part {key}: {e}")));
                    return;
                }
            }
        }
    };
    Box::pin(stream)
}
