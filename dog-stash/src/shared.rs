use std::sync::Arc;
use tracing::error;

use crate::cache::{CacheKey, Cached, TtlCache};
use crate::store::{BlobKey, BlobStore};
use crate::{
    Account, AccountId, AccountLocks, FileRecord, FileRef, RecordCatalog, StashConfig, UsageLedger,
};

/// Process-scoped services shared by the adapter, ingest sessions, resumable
/// uploads and the reaper. Built once and handed around behind an `Arc`.
pub(crate) struct StashCore {
    pub(crate) config: StashConfig,
    pub(crate) ledger: UsageLedger,
    pub(crate) store: Arc<dyn BlobStore>,
    pub(crate) catalog: Arc<dyn RecordCatalog>,
    pub(crate) cache: TtlCache<CacheKey, Cached>,
    pub(crate) locks: AccountLocks,
}

impl StashCore {
    /// Drop everything cached about an account
    pub(crate) fn invalidate(&self, account: &AccountId) {
        for key in CacheKey::all_for(account) {
            self.cache.invalidate(&key);
        }
    }

    pub(crate) fn file_ref(&self, record: &FileRecord, account: &Account) -> FileRef {
        FileRef {
            file_id: record.id.clone(),
            url: format!("{}/s/{}", self.config.base_url, record.id),
            name: record.name.clone(),
            size: record.size,
            available_bytes: self
                .config
                .max_account_bytes
                .saturating_sub(account.bytes_used),
        }
    }

    /// Compensating delete; failures are logged, not propagated
    pub(crate) async fn discard_blob(&self, key: &BlobKey) {
        if let Err(e) = self.store.delete(key).await {
            error!(%key, error = %e, "failed to remove blob during cleanup");
        }
    }
}
