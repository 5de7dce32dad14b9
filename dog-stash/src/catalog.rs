use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{AccountId, FileId, FileRecord, StashError, StashResult};

/// Persistence of file metadata, keyed by file id with an owner index
#[async_trait]
pub trait RecordCatalog: Send + Sync {
    /// Insert a new record; `DuplicateId` if the id is taken by anyone
    async fn create(&self, record: FileRecord) -> StashResult<()>;

    /// Look up a record by id
    async fn get(&self, id: &FileId) -> StashResult<FileRecord>;

    /// Whether an id is in use
    async fn contains(&self, id: &FileId) -> StashResult<bool>;

    /// An owner's records, newest first
    async fn list_by_owner(&self, owner: &AccountId) -> StashResult<Vec<FileRecord>>;

    /// An owner's records uploaded strictly before `cutoff`, newest first
    async fn list_uploaded_before(
        &self,
        owner: &AccountId,
        cutoff: DateTime<Utc>,
    ) -> StashResult<Vec<FileRecord>>;

    /// Sum of record sizes for an owner
    async fn total_size(&self, owner: &AccountId) -> StashResult<u64>;

    /// Remove a record, returning what was removed
    async fn delete(&self, id: &FileId) -> StashResult<FileRecord>;

    /// Count one download
    async fn increment_download(&self, id: &FileId, at: DateTime<Utc>) -> StashResult<FileRecord>;
}

#[derive(Default)]
struct CatalogState {
    records: HashMap<FileId, (u64, FileRecord)>,
    by_owner: HashMap<AccountId, HashSet<FileId>>,
    next_seq: u64,
}

impl CatalogState {
    fn owned(&self, owner: &AccountId) -> Vec<FileRecord> {
        let mut rows: Vec<&(u64, FileRecord)> = self
            .by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
            .collect();
        // newest first; insertion order breaks timestamp ties
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            b.uploaded_at.cmp(&a.uploaded_at).then(seq_b.cmp(seq_a))
        });
        rows.into_iter().map(|(_, r)| r.clone()).collect()
    }
}

/// In-memory catalog for testing and development
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<RwLock<CatalogState>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all owners
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Move a record's upload time (test helper)
    pub fn backdate(&self, id: &FileId, uploaded_at: DateTime<Utc>) -> StashResult<()> {
        let mut state = self.state.write();
        let (_, record) = state
            .records
            .get_mut(id)
            .ok_or_else(|| StashError::not_found(id.as_str()))?;
        record.uploaded_at = uploaded_at;
        Ok(())
    }
}

#[async_trait]
impl RecordCatalog for MemoryCatalog {
    async fn create(&self, record: FileRecord) -> StashResult<()> {
        let mut state = self.state.write();
        if state.records.contains_key(&record.id) {
            return Err(StashError::DuplicateId {
                id: record.id.to_string(),
            });
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .by_owner
            .entry(record.owner.clone())
            .or_default()
            .insert(record.id.clone());
        state.records.insert(record.id.clone(), (seq, record));
        Ok(())
    }

    async fn get(&self, id: &FileId) -> StashResult<FileRecord> {
        self.state
            .read()
            .records
            .get(id)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| StashError::not_found(id.as_str()))
    }

    async fn contains(&self, id: &FileId) -> StashResult<bool> {
        Ok(self.state.read().records.contains_key(id))
    }

    async fn list_by_owner(&self, owner: &AccountId) -> StashResult<Vec<FileRecord>> {
        Ok(self.state.read().owned(owner))
    }

    async fn list_uploaded_before(
        &self,
        owner: &AccountId,
        cutoff: DateTime<Utc>,
    ) -> StashResult<Vec<FileRecord>> {
        let mut rows = self.state.read().owned(owner);
        rows.retain(|r| r.uploaded_at < cutoff);
        Ok(rows)
    }

    async fn total_size(&self, owner: &AccountId) -> StashResult<u64> {
        let state = self.state.read();
        Ok(state
            .by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|id| state.records.get(id))
            .map(|(_, r)| r.size)
            .sum())
    }

    async fn delete(&self, id: &FileId) -> StashResult<FileRecord> {
        let mut state = self.state.write();
        let (_, record) = state
            .records
            .remove(id)
            .ok_or_else(|| StashError::not_found(id.as_str()))?;
        if let Some(ids) = state.by_owner.get_mut(&record.owner) {
            ids.remove(id);
            if ids.is_empty() {
                state.by_owner.remove(&record.owner);
            }
        }
        Ok(record)
    }

    async fn increment_download(&self, id: &FileId, at: DateTime<Utc>) -> StashResult<FileRecord> {
        let mut state = self.state.write();
        let (_, record) = state
            .records
            .get_mut(id)
            .ok_or_else(|| StashError::not_found(id.as_str()))?;
        record.download_count += 1;
        record.last_download_at = Some(at);
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, owner: &str, size: u64) -> FileRecord {
        FileRecord::new(FileId::from(id), AccountId::from(owner), format!("{id}.bin"), size)
    }

    #[tokio::test]
    async fn duplicate_ids_are_global() {
        let catalog = MemoryCatalog::new();
        catalog.create(record("a", "alice", 1)).await.unwrap();
        let err = catalog.create(record("a", "bob", 1)).await.unwrap_err();
        assert!(matches!(err, StashError::DuplicateId { .. }));
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_per_owner() {
        let catalog = MemoryCatalog::new();
        catalog.create(record("a", "alice", 1)).await.unwrap();
        catalog.create(record("b", "alice", 2)).await.unwrap();
        catalog.create(record("c", "bob", 4)).await.unwrap();
        catalog.create(record("d", "alice", 8)).await.unwrap();
        catalog
            .backdate(&FileId::from("d"), Utc::now() - Duration::days(1))
            .unwrap();

        let ids: Vec<String> = catalog
            .list_by_owner(&AccountId::from("alice"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.0)
            .collect();
        assert_eq!(ids, vec!["b", "a", "d"]);
        assert_eq!(catalog.total_size(&AccountId::from("alice")).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn delete_and_download_counting() {
        let catalog = MemoryCatalog::new();
        catalog.create(record("a", "alice", 5)).await.unwrap();

        let now = Utc::now();
        let counted = catalog.increment_download(&FileId::from("a"), now).await.unwrap();
        assert_eq!(counted.download_count, 1);
        assert_eq!(counted.last_download_at, Some(now));

        let removed = catalog.delete(&FileId::from("a")).await.unwrap();
        assert_eq!(removed.size, 5);
        assert!(matches!(
            catalog.delete(&FileId::from("a")).await,
            Err(StashError::NotFound { .. })
        ));
        assert_eq!(catalog.total_size(&AccountId::from("alice")).await.unwrap(), 0);
    }
}
