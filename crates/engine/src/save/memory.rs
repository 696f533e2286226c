use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use super::storage::{DbId, Storage, StorageError, StoredRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub transactions_committed: usize,
    pub transactions_rolled_back: usize,
    pub records_inserted: usize,
    pub records_written: usize,
    pub records_deleted: usize,
}

#[derive(Debug, Clone)]
enum StagedOp {
    Write(StoredRecord),
    Delete(DbId),
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<DbId, StoredRecord>,
    staged: Option<Vec<StagedOp>>,
    next_id: u64,
    stats: StorageStats,
    failing_commits: u32,
    poisoned: HashSet<String>,
}

/// In-process storage. Clones share the same records, so a caller can hand
/// one handle to the world and keep another to inspect what was committed.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Rc<RefCell<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StorageStats {
        self.inner.borrow().stats
    }

    pub fn record(&self, id: DbId) -> Option<StoredRecord> {
        self.inner.borrow().records.get(&id).cloned()
    }

    pub fn record_named(&self, name: &str) -> Option<StoredRecord> {
        self.inner
            .borrow()
            .records
            .values()
            .find(|record| record.name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `count` commits fail, discarding their staged work.
    pub fn fail_next_commits(&self, count: u32) {
        self.inner.borrow_mut().failing_commits = count;
    }

    /// Makes any write or insert of a record with this name fail until
    /// `heal` is called.
    pub fn poison(&self, name: &str) {
        self.inner.borrow_mut().poisoned.insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.inner.borrow_mut().poisoned.remove(name);
    }

    fn check_poison(inner: &Inner, record: &StoredRecord) -> Result<(), StorageError> {
        if inner.poisoned.contains(&record.name) {
            return Err(StorageError::Backend(format!(
                "write rejected for '{}'",
                record.name
            )));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn begin(&mut self) -> Result<(), StorageError> {
        let mut inner = self.inner.borrow_mut();
        if inner.staged.is_some() {
            return Err(StorageError::TransactionActive);
        }
        inner.staged = Some(Vec::new());
        Ok(())
    }

    fn insert(&mut self, mut record: StoredRecord) -> Result<DbId, StorageError> {
        let mut inner = self.inner.borrow_mut();
        Self::check_poison(&inner, &record)?;
        if inner.staged.is_none() {
            return Err(StorageError::NoTransaction);
        }
        inner.next_id += 1;
        let id = DbId(inner.next_id);
        record.id = id;
        if let Some(staged) = inner.staged.as_mut() {
            staged.push(StagedOp::Write(record));
        }
        inner.stats.records_inserted += 1;
        Ok(id)
    }

    fn write(&mut self, record: StoredRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.borrow_mut();
        Self::check_poison(&inner, &record)?;
        let staged = inner.staged.as_mut().ok_or(StorageError::NoTransaction)?;
        staged.push(StagedOp::Write(record));
        inner.stats.records_written += 1;
        Ok(())
    }

    fn delete(&mut self, id: DbId) -> Result<(), StorageError> {
        let mut inner = self.inner.borrow_mut();
        let staged = inner.staged.as_mut().ok_or(StorageError::NoTransaction)?;
        staged.push(StagedOp::Delete(id));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let mut inner = self.inner.borrow_mut();
        let staged = inner.staged.take().ok_or(StorageError::NoTransaction)?;
        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            inner.stats.transactions_rolled_back += 1;
            return Err(StorageError::Backend("injected commit failure".to_string()));
        }
        for op in staged {
            match op {
                StagedOp::Write(record) => {
                    inner.records.insert(record.id, record);
                }
                StagedOp::Delete(id) => {
                    if inner.records.remove(&id).is_some() {
                        inner.stats.records_deleted += 1;
                    }
                }
            }
        }
        inner.stats.transactions_committed += 1;
        Ok(())
    }

    fn rollback(&mut self) {
        let mut inner = self.inner.borrow_mut();
        if inner.staged.take().is_some() {
            inner.stats.transactions_rolled_back += 1;
        }
    }

    fn load_all(&self) -> Result<Vec<StoredRecord>, StorageError> {
        Ok(self.inner.borrow().records.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::TransactionScope;
    use crate::world::EntityKind;

    fn record(name: &str) -> StoredRecord {
        StoredRecord {
            id: DbId(0),
            kind: EntityKind::Item,
            name: name.to_string(),
            attributes: BTreeMap::new(),
            parent: None,
            effects: Vec::new(),
        }
    }

    #[test]
    fn dropped_scope_rolls_back() {
        let mut storage = MemoryStorage::new();
        {
            let mut tx = TransactionScope::begin(&mut storage).expect("begin");
            tx.insert(record("sword")).expect("insert");
        }

        assert!(storage.is_empty());
        assert_eq!(storage.stats().transactions_rolled_back, 1);
        assert_eq!(storage.stats().transactions_committed, 0);
    }

    #[test]
    fn committed_insert_is_visible_with_assigned_id() {
        let mut storage = MemoryStorage::new();
        let mut tx = TransactionScope::begin(&mut storage).expect("begin");
        let id = tx.insert(record("sword")).expect("insert");
        tx.commit().expect("commit");

        assert_eq!(id, DbId(1));
        assert_eq!(storage.record(id).expect("stored").name, "sword");
    }

    #[test]
    fn ids_are_not_reused_after_rollback() {
        let mut storage = MemoryStorage::new();
        {
            let mut tx = TransactionScope::begin(&mut storage).expect("begin");
            tx.insert(record("a")).expect("insert");
        }
        let mut tx = TransactionScope::begin(&mut storage).expect("begin");
        let id = tx.insert(record("b")).expect("insert");
        tx.commit().expect("commit");

        assert_eq!(id, DbId(2));
    }

    #[test]
    fn nested_begin_is_rejected() {
        let mut storage = MemoryStorage::new();
        storage.begin().expect("begin");

        assert!(matches!(
            storage.begin(),
            Err(StorageError::TransactionActive)
        ));
    }

    #[test]
    fn injected_commit_failure_discards_staged_work() {
        let mut storage = MemoryStorage::new();
        storage.fail_next_commits(1);

        let mut tx = TransactionScope::begin(&mut storage).expect("begin");
        tx.insert(record("a")).expect("insert");
        assert!(tx.commit().is_err());

        assert!(storage.is_empty());
        let mut tx = TransactionScope::begin(&mut storage).expect("begin");
        tx.insert(record("b")).expect("insert");
        tx.commit().expect("second commit");
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn poisoned_records_reject_writes() {
        let mut storage = MemoryStorage::new();
        storage.poison("cursed");

        let mut tx = TransactionScope::begin(&mut storage).expect("begin");
        assert!(tx.insert(record("cursed")).is_err());
        drop(tx);

        storage.heal("cursed");
        let mut tx = TransactionScope::begin(&mut storage).expect("begin");
        assert!(tx.insert(record("cursed")).is_ok());
    }
}
