use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheKey, Cached, TtlCache};
use crate::shared::StashCore;
use crate::ingest::IngestSession;
use crate::resumable::ResumableUploads;
use crate::socket::ingest_frames;
use crate::store::{BlobKey, BlobStore};
use crate::{
    AccountId, AccountLocks, AccountStore, AccountSummary, BoxStream, BufferedSource, ByteSource,
    ByteStream, ChunkAck, ChunkOutcome, ChunkRequest, ExpiryReaper, FileId, FileLookup,
    FileRecord, FileRef, FsBlobStore, MemoryAccountStore, MemoryBlobStore,
    MemoryCatalog, ReapReport, RecordCatalog, SocketChannel, StashConfig, StashError,
    StashResult, StreamSource, UploadId, UsageKind, UsageLedger,
};

/// Per-account file storage with quotas. This is what services embed.
///
/// Cheap to clone; clones share the same stores, ledger, cache and locks.
#[derive(Clone)]
pub struct StashAdapter {
    core: Arc<StashCore>,
    uploads: Arc<ResumableUploads>,
    reaper: ExpiryReaper,
}

impl StashAdapter {
    /// Create an adapter over `store` with in-memory records and accounts
    pub fn new<S: BlobStore + 'static>(store: S, config: StashConfig) -> Self {
        Self::with_persistence(
            store,
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryAccountStore::new()),
            config,
        )
    }

    /// Create with caller-supplied record and account persistence
    pub fn with_persistence<S: BlobStore + 'static>(
        store: S,
        catalog: Arc<dyn RecordCatalog>,
        accounts: Arc<dyn AccountStore>,
        config: StashConfig,
    ) -> Self {
        let core = Arc::new(StashCore {
            ledger: UsageLedger::new(accounts, catalog.clone(), &config),
            store: Arc::new(store),
            catalog,
            cache: TtlCache::new(config.cache_ttl),
            locks: AccountLocks::new(),
            config,
        });
        Self {
            reaper: ExpiryReaper::new(core.clone()),
            uploads: Arc::new(ResumableUploads::new()),
            core,
        }
    }

    /// Everything in memory; for tests and throwaway instances
    pub fn in_memory(config: StashConfig) -> Self {
        Self::new(MemoryBlobStore::new(), config)
    }

    /// Blobs on disk under `config.storage_root`
    pub async fn on_disk(config: StashConfig) -> StashResult<Self> {
        let store = FsBlobStore::new(&config.storage_root).await?;
        Ok(Self::new(store, config))
    }

    pub fn config(&self) -> &StashConfig {
        &self.core.config
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.core.ledger
    }

    /// Handle for batch deletion and the periodic sweep
    pub fn reaper(&self) -> ExpiryReaper {
        self.reaper.clone()
    }

    /// Store one fully buffered file
    #[instrument(skip_all, fields(account = %account, size = data.len()))]
    pub async fn upload_one(
        &self,
        account: &AccountId,
        name: &str,
        data: Bytes,
    ) -> StashResult<FileRef> {
        self.upload_source(account, name, &mut BufferedSource::new(data))
            .await
    }

    /// Store one file of unknown length, e.g. a chunked request body
    #[instrument(skip_all, fields(account = %account))]
    pub async fn upload_stream(
        &self,
        account: &AccountId,
        name: &str,
        body: ByteStream,
    ) -> StashResult<FileRef> {
        self.upload_source(account, name, &mut StreamSource::new(body))
            .await
    }

    /// Store one file from any transport
    pub async fn upload_source(
        &self,
        account: &AccountId,
        name: &str,
        source: &mut (dyn ByteSource + '_),
    ) -> StashResult<FileRef> {
        let mut session = IngestSession::new(self.core.clone(), account.clone(), name.to_string());
        session.run(source, None).await
    }

    /// Ingest every file sent over a persistent channel.
    ///
    /// Yields one result per announced file and ends when the peer disconnects.
    pub fn upload_via_socket<C: SocketChannel + 'static>(
        &self,
        account: &AccountId,
        channel: C,
    ) -> BoxStream<StashResult<FileRef>> {
        ingest_frames(self.core.clone(), account.clone(), channel)
    }

    /// Accept one chunk of a resumable upload
    #[instrument(skip_all, fields(account = %account, upload_id = %chunk.upload_id, offset = chunk.offset))]
    pub async fn upload_chunk(
        &self,
        account: &AccountId,
        chunk: ChunkRequest,
    ) -> StashResult<ChunkOutcome> {
        self.uploads.accept(&self.core, account, chunk).await
    }

    /// Where an interrupted resumable upload should continue
    pub async fn upload_progress(
        &self,
        account: &AccountId,
        upload_id: &UploadId,
    ) -> StashResult<ChunkAck> {
        self.uploads.progress(account, upload_id).await
    }

    /// Abandon a resumable upload and drop its staged chunks
    pub async fn abort_upload(&self, account: &AccountId, upload_id: &UploadId) -> StashResult<()> {
        self.uploads.abort(&self.core, account, upload_id).await
    }

    /// Drop resumable uploads idle for longer than `max_idle`, returning how many
    pub async fn prune_idle_uploads(&self, max_idle: Duration) -> usize {
        self.uploads.prune_idle(&self.core, max_idle).await
    }

    /// Number of resumable uploads still open
    pub fn open_uploads(&self) -> usize {
        self.uploads.open_count()
    }

    /// Metadata only; does not count as a download
    pub async fn file_info(&self, lookup: &FileLookup, file_id: &FileId) -> StashResult<FileRecord> {
        self.locate(lookup, file_id).await
    }

    /// Stream a file's content and count the download
    #[instrument(skip_all, fields(file_id = %file_id))]
    pub async fn open_file(
        &self,
        lookup: &FileLookup,
        file_id: &FileId,
    ) -> StashResult<(ByteStream, FileRecord)> {
        let record = self.locate(lookup, file_id).await?;
        let core = &self.core;
        let _guard = core.locks.acquire(&record.owner).await;

        let read = match core.store.read(&BlobKey::file(&record.owner, &record.id)).await {
            Ok(read) => read,
            Err(StashError::NotFound { .. }) => {
                warn!(file_id = %file_id, owner = %record.owner, "record has no blob");
                return Err(StashError::not_found(file_id.as_str()));
            }
            Err(e) => return Err(e),
        };
        let record = core.catalog.increment_download(&record.id, Utc::now()).await?;
        core.ledger
            .commit(&record.owner, record.size, UsageKind::Download)
            .await?;
        core.invalidate(&record.owner);
        Ok((read.stream, record))
    }

    /// Read a whole file into memory and count the download
    pub async fn get_file(
        &self,
        lookup: &FileLookup,
        file_id: &FileId,
    ) -> StashResult<(Bytes, FileRecord)> {
        let (stream, record) = self.open_file(lookup, file_id).await?;
        let data = crate::source::collect(&mut StreamSource::from_storage(stream)).await?;
        Ok((data, record))
    }

    /// The account's files, newest first
    pub async fn list_files(&self, account: &AccountId) -> StashResult<Vec<FileRecord>> {
        let key = CacheKey::listing(account);
        if let Some(Cached::Listing(files)) = self.core.cache.get(&key) {
            return Ok(files);
        }
        // a miss fills under the owner lock so no commit can land between read and set
        let _guard = self.core.locks.acquire(account).await;
        if let Some(Cached::Listing(files)) = self.core.cache.get(&key) {
            return Ok(files);
        }
        let files = self.core.catalog.list_by_owner(account).await?;
        self.core.cache.set(key, Cached::Listing(files.clone()));
        Ok(files)
    }

    /// Remove one file. `false` when the account has no such file.
    #[instrument(skip_all, fields(account = %account, file_id = %file_id))]
    pub async fn delete_file(&self, account: &AccountId, file_id: &FileId) -> StashResult<bool> {
        let core = &self.core;
        let _guard = core.locks.acquire(account).await;

        let record = match core.catalog.get(file_id).await {
            Ok(record) if &record.owner == account => record,
            Ok(_) | Err(StashError::NotFound { .. }) => {
                debug!("nothing to delete");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        core.store.delete(&BlobKey::file(account, file_id)).await?;
        let removed = core.catalog.delete(file_id).await;
        core.invalidate(account);
        removed?;
        core.ledger
            .commit(account, record.size, UsageKind::Delete)
            .await?;
        Ok(true)
    }

    /// Remove every file the account owns
    pub async fn delete_all(&self, account: &AccountId) -> StashResult<ReapReport> {
        self.reaper.delete_all(account).await
    }

    /// Remove the account's files uploaded longer than `window` ago
    pub async fn delete_expired(
        &self,
        account: &AccountId,
        window: Duration,
    ) -> StashResult<ReapReport> {
        self.reaper.delete_expired(account, window).await
    }

    /// Counters and remaining space, without the token
    pub async fn account_summary(&self, account: &AccountId) -> StashResult<AccountSummary> {
        let key = CacheKey::summary(account);
        if let Some(Cached::Summary(summary)) = self.core.cache.get(&key) {
            return Ok(summary);
        }
        let _guard = self.core.locks.acquire(account).await;
        if let Some(Cached::Summary(summary)) = self.core.cache.get(&key) {
            return Ok(summary);
        }
        let row = self.core.ledger.account(account).await?;
        let summary = AccountSummary::from_account(&row, self.core.config.max_account_bytes);
        self.core.cache.set(key, Cached::Summary(summary.clone()));
        Ok(summary)
    }

    /// Issue a new credential token and return it
    pub async fn rotate_token(&self, account: &AccountId) -> StashResult<String> {
        let _guard = self.core.locks.acquire(account).await;
        let row = self.core.ledger.rotate_token(account).await?;
        self.core.cache.invalidate(&CacheKey::summary(account));
        Ok(row.token)
    }

    /// Resolve a credential token to its account
    pub async fn account_by_token(&self, token: &str) -> StashResult<Option<AccountId>> {
        Ok(self.core.ledger.find_by_token(token).await?.map(|row| row.id))
    }

    async fn locate(&self, lookup: &FileLookup, file_id: &FileId) -> StashResult<FileRecord> {
        match self.core.catalog.get(file_id).await {
            Ok(record) if lookup.admits(&record) => Ok(record),
            // someone else's file looks exactly like a missing one
            Ok(_) => Err(StashError::not_found(file_id.as_str())),
            Err(e) => Err(e),
        }
    }
}
