use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::{AccountId, AccountSummary, FileRecord};

/// Short-TTL memo for read-mostly queries.
///
/// Expired entries are dropped when next touched; there is no sweeper.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let stale = match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => return Some(value.clone()),
            Some(_) => true,
            None => false,
        };
        if stale {
            entries.remove(key);
        }
        None
    }

    pub fn set(&self, key: K, value: V) {
        self.entries.lock().insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Operation name plus the account it was asked for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub op: &'static str,
    pub account: AccountId,
}

impl CacheKey {
    pub fn summary(account: &AccountId) -> Self {
        Self {
            op: "account_summary",
            account: account.clone(),
        }
    }

    pub fn listing(account: &AccountId) -> Self {
        Self {
            op: "list_files",
            account: account.clone(),
        }
    }

    /// Every key that depends on an account's files or counters
    pub fn all_for(account: &AccountId) -> [Self; 2] {
        [Self::summary(account), Self::listing(account)]
    }
}

#[derive(Debug, Clone)]
pub enum Cached {
    Summary(AccountSummary),
    Listing(Vec<FileRecord>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_then_invalidate() {
        let cache: TtlCache<CacheKey, u32> = TtlCache::new(Duration::from_secs(60));
        let key = CacheKey::listing(&AccountId::from("alice"));
        assert!(cache.get(&key).is_none());

        cache.set(key.clone(), 7);
        assert_eq!(cache.get(&key), Some(7));
        assert!(cache.get(&CacheKey::summary(&AccountId::from("alice"))).is_none());

        cache.invalidate(&key);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(10));
        cache.set("k", 1);
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&"k").is_none());
        assert!(cache.is_empty());
    }
}
