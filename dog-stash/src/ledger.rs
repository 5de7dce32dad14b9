use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Account, AccountId, AccountStore, RecordCatalog, StashConfig, StashError, StashResult};

/// What a ledger commit records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Upload,
    Download,
    Delete,
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The item alone is over the per-file ceiling
    ItemTooLarge { size: u64, max: u64 },
    /// The item would push the account over its total ceiling
    QuotaExceeded { used: u64, incoming: u64, max: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn into_result(self) -> StashResult<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Rejected(RejectReason::ItemTooLarge { size, max }) => {
                Err(StashError::PayloadTooLarge { size, max })
            }
            Self::Rejected(RejectReason::QuotaExceeded { used, incoming, max }) => {
                Err(StashError::QuotaExceeded { used, incoming, max })
            }
        }
    }
}

/// Authoritative per-account counters and the only writer of account rows.
///
/// `bytes_used` is never trusted incrementally: every upload or delete commit
/// recomputes it from the catalog. Callers hold the account's
/// [`crate::AccountGuard`] across `admit` and `commit`.
pub struct UsageLedger {
    accounts: Arc<dyn AccountStore>,
    catalog: Arc<dyn RecordCatalog>,
    max_file_bytes: u64,
    max_account_bytes: u64,
}

impl UsageLedger {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        catalog: Arc<dyn RecordCatalog>,
        config: &StashConfig,
    ) -> Self {
        Self {
            accounts,
            catalog,
            max_file_bytes: config.max_file_bytes,
            max_account_bytes: config.max_account_bytes,
        }
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    pub fn max_account_bytes(&self) -> u64 {
        self.max_account_bytes
    }

    /// Current account row, created on first reference
    pub async fn account(&self, id: &AccountId) -> StashResult<Account> {
        self.accounts.get_or_create(id).await
    }

    /// Check `incoming` bytes against both ceilings using usage before the write
    pub async fn admit(&self, id: &AccountId, incoming: u64) -> StashResult<Admission> {
        if incoming > self.max_file_bytes {
            return Ok(Admission::Rejected(RejectReason::ItemTooLarge {
                size: incoming,
                max: self.max_file_bytes,
            }));
        }
        let account = self.accounts.get_or_create(id).await?;
        if account.bytes_used.saturating_add(incoming) > self.max_account_bytes {
            return Ok(Admission::Rejected(RejectReason::QuotaExceeded {
                used: account.bytes_used,
                incoming,
                max: self.max_account_bytes,
            }));
        }
        Ok(Admission::Allowed)
    }

    /// Apply one mutation to the counters
    pub async fn commit(&self, id: &AccountId, bytes: u64, kind: UsageKind) -> StashResult<Account> {
        let mut account = self.accounts.get_or_create(id).await?;
        let now = Utc::now();
        match kind {
            UsageKind::Upload => {
                account.upload_count += 1;
                account.upload_bytes_total += bytes;
                account.last_upload_at = Some(now);
                account.bytes_used = account.bytes_used.saturating_add(bytes);
            }
            UsageKind::Download => {
                account.download_count += 1;
                account.download_bytes_total += bytes;
                account.last_download_at = Some(now);
            }
            UsageKind::Delete => {
                account.bytes_used = account.bytes_used.saturating_sub(bytes);
            }
        }
        if kind != UsageKind::Download {
            self.heal(&mut account).await?;
        }
        self.accounts.save(account.clone()).await?;
        debug!(account = %id, ?kind, bytes, bytes_used = account.bytes_used, "usage committed");
        Ok(account)
    }

    /// Recompute `bytes_used` from the catalog and persist it
    pub async fn reconcile(&self, id: &AccountId) -> StashResult<Account> {
        let mut account = self.accounts.get_or_create(id).await?;
        self.heal(&mut account).await?;
        self.accounts.save(account.clone()).await?;
        Ok(account)
    }

    async fn heal(&self, account: &mut Account) -> StashResult<()> {
        let actual = self.catalog.total_size(&account.id).await?;
        if actual != account.bytes_used {
            warn!(
                account = %account.id,
                counted = account.bytes_used,
                actual,
                "usage counter drifted from catalog"
            );
        }
        account.bytes_used = actual;
        Ok(())
    }

    /// Issue a fresh credential token
    pub async fn rotate_token(&self, id: &AccountId) -> StashResult<Account> {
        let mut account = self.accounts.get_or_create(id).await?;
        account.token = Uuid::new_v4().to_string();
        self.accounts.save(account.clone()).await?;
        Ok(account)
    }

    /// Resolve a credential token to its account
    pub async fn find_by_token(&self, token: &str) -> StashResult<Option<Account>> {
        self.accounts.find_by_token(token).await
    }

    /// Every account the ledger knows about
    pub async fn account_ids(&self) -> StashResult<Vec<AccountId>> {
        self.accounts.list_ids().await
    }
}
