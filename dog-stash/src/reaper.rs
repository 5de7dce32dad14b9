use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::shared::StashCore;
use crate::store::BlobKey;
use crate::{AccountId, FileRecord, StashResult};

/// Result of one batch deletion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub deleted: usize,
    pub failures: Vec<ReapFailure>,
}

impl ReapReport {
    fn merge(&mut self, other: ReapReport) {
        self.deleted += other.deleted;
        self.failures.extend(other.failures);
    }
}

/// A file the batch could not remove; it stays listed and counted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapFailure {
    pub file_id: String,
    pub error: String,
}

/// Bulk deletion of an account's files, on demand or on a timer.
///
/// Files in a batch are removed concurrently and the usage counter is
/// recomputed once at the end instead of once per file.
#[derive(Clone)]
pub struct ExpiryReaper {
    core: Arc<StashCore>,
}

impl ExpiryReaper {
    pub(crate) fn new(core: Arc<StashCore>) -> Self {
        Self { core }
    }

    /// Remove every file the account owns
    pub async fn delete_all(&self, account: &AccountId) -> StashResult<ReapReport> {
        let _guard = self.core.locks.acquire(account).await;
        let records = self.core.catalog.list_by_owner(account).await?;
        self.delete_batch(account, records).await
    }

    /// Remove the account's files uploaded more than `retention` ago
    pub async fn delete_expired(
        &self,
        account: &AccountId,
        retention: Duration,
    ) -> StashResult<ReapReport> {
        // windows beyond chrono's range expire nothing
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return Ok(ReapReport::default());
        };
        let _guard = self.core.locks.acquire(account).await;
        let records = self.core.catalog.list_uploaded_before(account, cutoff).await?;
        self.delete_batch(account, records).await
    }

    /// Apply `delete_expired` to every known account
    pub async fn sweep(&self, retention: Duration) -> StashResult<ReapReport> {
        let mut report = ReapReport::default();
        for account in self.core.ledger.account_ids().await? {
            match self.delete_expired(&account, retention).await {
                Ok(done) => report.merge(done),
                Err(e) => warn!(account = %account, error = %e, "expiry sweep skipped account"),
            }
        }
        self.core.locks.prune();
        Ok(report)
    }

    /// Run `sweep` every `every` with the configured retention window. Never returns.
    pub async fn start(self, every: Duration) {
        let retention = self.core.config.retention;
        let mut ticker = interval(every);
        info!(?every, ?retention, "starting expiry reaper");

        loop {
            ticker.tick().await;
            match self.sweep(retention).await {
                Ok(report) if report.deleted > 0 || !report.failures.is_empty() => info!(
                    deleted = report.deleted,
                    failed = report.failures.len(),
                    "expired files removed"
                ),
                Ok(_) => debug!("no expired files found"),
                Err(e) => warn!(error = %e, "expiry sweep failed"),
            }
        }
    }

    async fn delete_batch(
        &self,
        account: &AccountId,
        records: Vec<FileRecord>,
    ) -> StashResult<ReapReport> {
        if records.is_empty() {
            return Ok(ReapReport::default());
        }
        let core = &self.core;
        let outcomes = join_all(records.into_iter().map(|record| async move {
            let key = BlobKey::file(&record.owner, &record.id);
            // the record only goes once its blob is gone
            let removed = match core.store.delete(&key).await {
                Ok(_) => core.catalog.delete(&record.id).await.map(|_| ()),
                Err(e) => Err(e),
            };
            removed.map_err(|e| ReapFailure {
                file_id: record.id.to_string(),
                error: e.to_string(),
            })
        }))
        .await;

        let mut report = ReapReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(()) => report.deleted += 1,
                Err(failure) => {
                    warn!(account = %account, file_id = %failure.file_id, error = %failure.error, "file not removed");
                    report.failures.push(failure);
                }
            }
        }

        core.invalidate(account);
        core.ledger.reconcile(account).await?;
        info!(account = %account, deleted = report.deleted, failed = report.failures.len(), "batch delete finished");
        Ok(report)
    }
}
