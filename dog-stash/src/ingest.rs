//! The per-upload state machine every transport feeds.
//!
//! ```text
//! Validating -> Admitted -> Writing -> Recorded -> Committed
//!      \           \           \           \
//!       `-----------`-> Rejected `-> Failed `-> Failed
//! ```
//!
//! `Rejected` exits leave nothing behind. `Failed` exits undo whatever was
//! already written before the error is returned, so the account's files and
//! counters look exactly as they did before the attempt.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::shared::StashCore;
use crate::source::{MeteredSource, StreamSource};
use crate::store::BlobKey;
use crate::{
    AccountId, ByteSource, FileId, FileRecord, FileRef, StashError, StashResult, UsageKind,
};

/// Where a session stopped; reported with every failed upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IngestState {
    Validating,
    Admitted,
    Writing,
    Recorded,
    Committed,
    Rejected,
    Failed,
}

/// One logical file on its way in
pub(crate) struct IngestSession {
    core: Arc<StashCore>,
    account: AccountId,
    name: String,
    state: IngestState,
}

impl IngestSession {
    pub(crate) fn new(core: Arc<StashCore>, account: AccountId, name: String) -> Self {
        Self {
            core,
            account,
            name,
            state: IngestState::Validating,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> IngestState {
        self.state
    }

    /// Drive the session to `Committed` or a terminal failure.
    ///
    /// `expected` is the size the transport promised, if any; a source's own
    /// size hint is used otherwise. Without either, size is only known after
    /// the write and both ceilings are checked again at that point.
    pub(crate) async fn run(
        &mut self,
        source: &mut (dyn ByteSource + '_),
        expected: Option<u64>,
    ) -> StashResult<FileRef> {
        let _guard = self.core.locks.acquire(&self.account).await;
        let result = self.run_locked(source, expected).await;
        match &result {
            Ok(file) => info!(
                account = %self.account,
                file_id = %file.file_id,
                size = file.size,
                "upload committed"
            ),
            Err(e) if e.is_expected() => debug!(
                account = %self.account,
                state = ?self.state,
                error = %e,
                "upload not accepted"
            ),
            Err(e) => warn!(
                account = %self.account,
                state = ?self.state,
                error = %e,
                "upload failed"
            ),
        }
        result
    }

    async fn run_locked(
        &mut self,
        source: &mut (dyn ByteSource + '_),
        expected: Option<u64>,
    ) -> StashResult<FileRef> {
        let core = self.core.clone();
        let max_file = core.config.max_file_bytes;
        let declared = expected.or_else(|| source.size_hint());

        // Validating
        if let Some(size) = declared {
            if size > max_file {
                return self.reject(StashError::PayloadTooLarge { size, max: max_file });
            }
        }

        // Admitted
        let admission = core.ledger.admit(&self.account, declared.unwrap_or(0)).await?;
        if let Err(e) = admission.into_result() {
            return self.reject(e);
        }
        self.state = IngestState::Admitted;

        // Writing
        self.state = IngestState::Writing;
        let (mut file_id, written) = match self.write_new_blob(source, max_file).await {
            Ok(done) => done,
            Err(e) if e.is_rejection() => return self.reject(e),
            Err(e) => return self.fail(e),
        };
        let key = BlobKey::file(&self.account, &file_id);

        if let Some(size) = declared {
            if written != size {
                core.discard_blob(&key).await;
                return self.fail(StashError::IntegrityFailure {
                    expected: size,
                    actual: written,
                });
            }
        } else {
            let recheck = match core.ledger.admit(&self.account, written).await {
                Ok(admission) => admission.into_result(),
                Err(e) => Err(e),
            };
            if let Err(e) = recheck {
                core.discard_blob(&key).await;
                return if e.is_rejection() { self.reject(e) } else { self.fail(e) };
            }
        }

        // Recorded
        let mut attempts = core.config.id_attempts;
        loop {
            let record = FileRecord::new(
                file_id.clone(),
                self.account.clone(),
                self.name.clone(),
                written,
            );
            match core.catalog.create(record).await {
                Ok(()) => break,
                Err(StashError::DuplicateId { .. }) if attempts > 1 => {
                    attempts -= 1;
                    debug!(file_id = %file_id, "id taken at record time, relocating blob");
                    file_id = match self.relocate(&file_id).await {
                        Ok(fresh) => fresh,
                        Err(e) => return self.fail(e),
                    };
                }
                Err(e) => {
                    core.discard_blob(&BlobKey::file(&self.account, &file_id)).await;
                    return self.fail(e);
                }
            }
        }
        self.state = IngestState::Recorded;

        // Committed
        let account = match core.ledger.commit(&self.account, written, UsageKind::Upload).await {
            Ok(account) => account,
            Err(e) => {
                self.unwind_record(&file_id).await;
                return self.fail(e);
            }
        };
        core.invalidate(&self.account);
        self.state = IngestState::Committed;

        let record = FileRecord::new(file_id, self.account.clone(), self.name.clone(), written);
        Ok(core.file_ref(&record, &account))
    }

    /// Generate an unused id and stream the source into it
    async fn write_new_blob(
        &self,
        source: &mut (dyn ByteSource + '_),
        max_file: u64,
    ) -> StashResult<(FileId, u64)> {
        let core = &self.core;
        let mut metered = MeteredSource::new(source, max_file);
        for _ in 0..core.config.id_attempts {
            let id = FileId::generate(core.config.short_id_length, &mut rand::thread_rng());
            if core.catalog.contains(&id).await? {
                debug!(file_id = %id, "generated id already in use, retrying");
                continue;
            }
            let key = BlobKey::file(&self.account, &id);
            match core.store.write(&key, &mut metered).await {
                Ok(written) => return Ok((id, written)),
                // refused before anything was consumed, so another id can still be tried
                Err(StashError::DuplicateId { .. }) if metered.received() == 0 => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StashError::invalid("could not allocate a unique file id"))
    }

    /// Move a written blob to a fresh id after losing an id race
    async fn relocate(&self, from: &FileId) -> StashResult<FileId> {
        let core = &self.core;
        let old_key = BlobKey::file(&self.account, from);
        let result: StashResult<FileId> = async {
            let read = core.store.read(&old_key).await?;
            let mut source = StreamSource::from_storage(read.stream);
            let (fresh, _) = self.write_new_blob(&mut source, u64::MAX).await?;
            Ok(fresh)
        }
        .await;
        core.discard_blob(&old_key).await;
        result
    }

    /// Undo a recorded but uncommitted file
    async fn unwind_record(&self, file_id: &FileId) {
        let core = &self.core;
        if let Err(e) = core.catalog.delete(file_id).await {
            warn!(file_id = %file_id, error = %e, "failed to remove record during cleanup");
        }
        core.discard_blob(&BlobKey::file(&self.account, file_id)).await;
        if let Err(e) = core.ledger.reconcile(&self.account).await {
            warn!(account = %self.account, error = %e, "reconcile after failed commit did not complete");
        }
    }

    fn reject(&mut self, e: StashError) -> StashResult<FileRef> {
        self.state = IngestState::Rejected;
        Err(e)
    }

    fn fail(&mut self, e: StashError) -> StashResult<FileRef> {
        self.state = IngestState::Failed;
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::source::BufferedSource;
    use crate::{
        AccountLocks, MemoryAccountStore, MemoryBlobStore, MemoryCatalog, StashConfig,
        UsageLedger,
    };
    use bytes::Bytes;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn core(store: &MemoryBlobStore, catalog: &MemoryCatalog) -> Arc<StashCore> {
        let config = StashConfig::default()
            .with_max_file_bytes(10)
            .with_max_account_bytes(15);
        let catalog_arc: Arc<dyn crate::RecordCatalog> = Arc::new(catalog.clone());
        Arc::new(StashCore {
            ledger: UsageLedger::new(
                Arc::new(MemoryAccountStore::new()),
                catalog_arc.clone(),
                &config,
            ),
            store: Arc::new(store.clone()),
            catalog: catalog_arc,
            cache: TtlCache::new(Duration::from_secs(60)),
            locks: AccountLocks::new(),
            config,
        })
    }

    fn chunked(parts: &[&'static [u8]]) -> StreamSource {
        let items: Vec<Result<Bytes, std::io::Error>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        StreamSource::new(Box::pin(futures::stream::iter(items)))
    }

    #[tokio::test]
    async fn buffered_upload_reaches_committed() {
        let (store, catalog) = (MemoryBlobStore::new(), MemoryCatalog::new());
        let core = core(&store, &catalog);
        let mut session = IngestSession::new(core, AccountId::from("alice"), "a.txt".into());

        let file = session
            .run(&mut BufferedSource::new(Bytes::from_static(b"hello")), None)
            .await
            .unwrap();
        assert_eq!(session.state(), IngestState::Committed);
        assert_eq!(file.size, 5);
        assert_eq!(file.available_bytes, 10);
        assert_eq!(store.len(), 1);
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test]
    async fn oversize_known_length_is_rejected_before_writing() {
        let (store, catalog) = (MemoryBlobStore::new(), MemoryCatalog::new());
        let core = core(&store, &catalog);
        let mut session = IngestSession::new(core, AccountId::from("alice"), "big".into());

        let err = session
            .run(&mut BufferedSource::new(vec![0u8; 11]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::PayloadTooLarge { size: 11, max: 10 }));
        assert_eq!(session.state(), IngestState::Rejected);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn chunked_upload_over_quota_is_removed_after_write() {
        let (store, catalog) = (MemoryBlobStore::new(), MemoryCatalog::new());
        let core = core(&store, &catalog);
        let alice = AccountId::from("alice");

        IngestSession::new(core.clone(), alice.clone(), "first".into())
            .run(&mut chunked(&[b"12345", b"6789"]), None)
            .await
            .unwrap();

        let mut second = IngestSession::new(core.clone(), alice.clone(), "second".into());
        let err = second
            .run(&mut chunked(&[b"abc", b"def", b"g"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::QuotaExceeded { used: 9, incoming: 7, .. }));
        assert_eq!(second.state(), IngestState::Rejected);
        assert_eq!(store.len(), 1);
        assert_eq!(core.ledger.account(&alice).await.unwrap().bytes_used, 9);
    }

    #[tokio::test]
    async fn declared_length_mismatch_fails_and_cleans_up() {
        let (store, catalog) = (MemoryBlobStore::new(), MemoryCatalog::new());
        let core = core(&store, &catalog);
        let mut session = IngestSession::new(core, AccountId::from("alice"), "short".into());

        let err = session
            .run(&mut chunked(&[b"abc"]), Some(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::IntegrityFailure { expected: 5, actual: 3 }));
        assert_eq!(session.state(), IngestState::Failed);
        assert!(store.is_empty());
        assert!(catalog.is_empty());
    }

    #[traced_test]
    #[tokio::test]
    async fn rejections_log_quietly_and_commits_loudly() {
        let (store, catalog) = (MemoryBlobStore::new(), MemoryCatalog::new());
        let core = core(&store, &catalog);
        let alice = AccountId::from("alice");

        IngestSession::new(core.clone(), alice.clone(), "ok".into())
            .run(&mut BufferedSource::new(Bytes::from_static(b"fine")), None)
            .await
            .unwrap();
        IngestSession::new(core, alice, "big".into())
            .run(&mut BufferedSource::new(vec![0u8; 20]), None)
            .await
            .unwrap_err();

        assert!(logs_contain("upload committed"));
        assert!(logs_contain("upload not accepted"));
        assert!(!logs_contain("upload failed"));
    }
}
