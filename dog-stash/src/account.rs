use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Account, AccountId, StashResult};

/// Persistence of account rows.
///
/// Only [`crate::UsageLedger`] writes through this trait.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Load an account, creating it on first reference
    async fn get_or_create(&self, id: &AccountId) -> StashResult<Account>;

    /// Load an account if it exists
    async fn get(&self, id: &AccountId) -> StashResult<Option<Account>>;

    /// Replace the stored row
    async fn save(&self, account: Account) -> StashResult<()>;

    /// Keyed lookup by credential token
    async fn find_by_token(&self, token: &str) -> StashResult<Option<Account>>;

    /// Every known account id
    async fn list_ids(&self) -> StashResult<Vec<AccountId>>;
}

#[derive(Default)]
struct AccountTable {
    rows: HashMap<AccountId, Account>,
    by_token: HashMap<String, AccountId>,
}

/// In-memory account store for testing and development
#[derive(Clone, Default)]
pub struct MemoryAccountStore {
    table: Arc<RwLock<AccountTable>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get_or_create(&self, id: &AccountId) -> StashResult<Account> {
        if let Some(account) = self.table.read().rows.get(id) {
            return Ok(account.clone());
        }
        let mut table = self.table.write();
        if let Some(account) = table.rows.get(id) {
            return Ok(account.clone());
        }
        let account = Account::new(id.clone());
        table.by_token.insert(account.token.clone(), id.clone());
        table.rows.insert(id.clone(), account.clone());
        Ok(account)
    }

    async fn get(&self, id: &AccountId) -> StashResult<Option<Account>> {
        Ok(self.table.read().rows.get(id).cloned())
    }

    async fn save(&self, account: Account) -> StashResult<()> {
        let mut table = self.table.write();
        let previous_token = table.rows.get(&account.id).map(|a| a.token.clone());
        if let Some(previous) = previous_token {
            if previous != account.token {
                table.by_token.remove(&previous);
            }
        }
        table.by_token.insert(account.token.clone(), account.id.clone());
        table.rows.insert(account.id.clone(), account);
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> StashResult<Option<Account>> {
        let table = self.table.read();
        Ok(table
            .by_token
            .get(token)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn list_ids(&self) -> StashResult<Vec<AccountId>> {
        let mut ids: Vec<AccountId> = self.table.read().rows.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
