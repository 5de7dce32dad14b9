#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use dog_stash::{
    Account, AccountId, AccountStore, BlobKey, BlobRead, BlobStore, ByteSource, FileId, FileRecord, MemoryAccountStore,
    MemoryBlobStore, MemoryCatalog, RecordCatalog, SocketChannel, SocketFrame, StashAdapter,
    StashConfig, StashError, StashResult,
};

pub fn small_config(max_file: u64, max_account: u64) -> StashConfig {
    StashConfig::default()
        .with_max_file_bytes(max_file)
        .with_max_account_bytes(max_account)
        .with_base_url("https://stash.test")
}

pub fn account(id: &str) -> AccountId {
    AccountId::from(id)
}

/// Adapter plus handles on its in-memory backends
pub struct Harness {
    pub stash: StashAdapter,
    pub store: FlakyStore,
    pub catalog: FlakyCatalog,
    pub accounts: FlakyAccounts,
}

pub fn harness(max_file: u64, max_account: u64) -> Harness {
    let store = FlakyStore::new();
    let catalog = FlakyCatalog::new();
    let accounts = FlakyAccounts::new();
    let stash = StashAdapter::with_persistence(
        store.clone(),
        Arc::new(catalog.clone()),
        Arc::new(accounts.clone()),
        small_config(max_file, max_account),
    );
    Harness {
        stash,
        store,
        catalog,
        accounts,
    }
}

impl Harness {
    /// Every blob has a record and every record has a blob
    pub async fn assert_orphan_free(&self, owner: &AccountId) {
        let records = self.catalog.list_by_owner(owner).await.unwrap();
        let file_keys: Vec<String> = self
            .store
            .inner
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(&format!("{owner}/")) && !k.contains("__uploads"))
            .collect();
        assert_eq!(records.len(), file_keys.len(), "records {records:?} vs blobs {file_keys:?}");
        for record in records {
            let key = BlobKey::file(&record.owner, &record.id);
            assert!(self.store.exists(&key).await.unwrap(), "no blob for {}", record.id);
        }
    }

    /// Usage counter matches the catalog
    pub async fn assert_usage_conserved(&self, owner: &AccountId) {
        let used = self.stash.account_summary(owner).await.unwrap().bytes_used;
        let actual = self.catalog.total_size(owner).await.unwrap();
        assert_eq!(used, actual);
    }
}

/// Memory store whose writes can be made to die mid-stream
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryBlobStore,
    fail_writes: Arc<AtomicBool>,
    fail_deletes: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    async fn write(&self, key: &BlobKey, source: &mut (dyn ByteSource + '_)) -> StashResult<u64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            // consume a little so the failure lands mid-write
            source.next().await?;
            return Err(std::io::Error::other("disk full").into());
        }
        self.inner.write(key, source).await
    }

    async fn read(&self, key: &BlobKey) -> StashResult<BlobRead> {
        self.inner.read(key).await
    }

    async fn delete(&self, key: &BlobKey) -> StashResult<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("read-only filesystem").into());
        }
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &BlobKey) -> StashResult<bool> {
        self.inner.exists(key).await
    }
}

/// Memory catalog whose inserts can be refused and whose listings can be
/// parked between the read and the return
#[derive(Clone, Default)]
pub struct FlakyCatalog {
    pub inner: MemoryCatalog,
    fail_creates: Arc<AtomicBool>,
    hold_listings: Arc<AtomicBool>,
    listing_read: Arc<Notify>,
    listing_release: Arc<Notify>,
}

impl FlakyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates(&self, on: bool) {
        self.fail_creates.store(on, Ordering::SeqCst);
    }

    pub fn hold_listings(&self, on: bool) {
        self.hold_listings.store(on, Ordering::SeqCst);
    }

    /// Resolves once a held listing has read the catalog
    pub async fn listing_parked(&self) {
        self.listing_read.notified().await;
    }

    pub fn release_listing(&self) {
        self.listing_release.notify_one();
    }
}

#[async_trait]
impl RecordCatalog for FlakyCatalog {
    async fn create(&self, record: FileRecord) -> StashResult<()> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("catalog unavailable").into());
        }
        self.inner.create(record).await
    }

    async fn get(&self, id: &FileId) -> StashResult<FileRecord> {
        self.inner.get(id).await
    }

    async fn contains(&self, id: &FileId) -> StashResult<bool> {
        self.inner.contains(id).await
    }

    async fn list_by_owner(&self, owner: &AccountId) -> StashResult<Vec<FileRecord>> {
        let records = self.inner.list_by_owner(owner).await?;
        if self.hold_listings.load(Ordering::SeqCst) {
            self.listing_read.notify_one();
            self.listing_release.notified().await;
        }
        Ok(records)
    }

    async fn list_uploaded_before(
        &self,
        owner: &AccountId,
        cutoff: DateTime<Utc>,
    ) -> StashResult<Vec<FileRecord>> {
        self.inner.list_uploaded_before(owner, cutoff).await
    }

    async fn total_size(&self, owner: &AccountId) -> StashResult<u64> {
        self.inner.total_size(owner).await
    }

    async fn delete(&self, id: &FileId) -> StashResult<FileRecord> {
        self.inner.delete(id).await
    }

    async fn increment_download(&self, id: &FileId, at: DateTime<Utc>) -> StashResult<FileRecord> {
        self.inner.increment_download(id, at).await
    }
}

/// Memory account store whose saves can be refused
#[derive(Clone, Default)]
pub struct FlakyAccounts {
    pub inner: MemoryAccountStore,
    fail_saves: Arc<AtomicBool>,
}

impl FlakyAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, on: bool) {
        self.fail_saves.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountStore for FlakyAccounts {
    async fn get_or_create(&self, id: &AccountId) -> StashResult<Account> {
        self.inner.get_or_create(id).await
    }

    async fn get(&self, id: &AccountId) -> StashResult<Option<Account>> {
        self.inner.get(id).await
    }

    async fn save(&self, account: Account) -> StashResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("db down").into());
        }
        self.inner.save(account).await
    }

    async fn find_by_token(&self, token: &str) -> StashResult<Option<Account>> {
        self.inner.find_by_token(token).await
    }

    async fn list_ids(&self) -> StashResult<Vec<AccountId>> {
        self.inner.list_ids().await
    }
}

/// Scripted peer; disconnects once the script runs out
pub struct ScriptedChannel {
    frames: VecDeque<SocketFrame>,
}

impl ScriptedChannel {
    pub fn new(frames: Vec<SocketFrame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

#[async_trait]
impl SocketChannel for ScriptedChannel {
    async fn recv(&mut self) -> Option<SocketFrame> {
        self.frames.pop_front()
    }
}

pub fn name(n: &str) -> SocketFrame {
    SocketFrame::Name(n.to_string())
}

pub fn binary(data: &'static [u8]) -> SocketFrame {
    SocketFrame::Binary(Bytes::from_static(data))
}

pub fn is_rejection(e: &StashError) -> bool {
    matches!(e, StashError::PayloadTooLarge { .. } | StashError::QuotaExceeded { .. })
}
