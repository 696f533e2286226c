use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::storage::{DbId, Storage, StorageError, TransactionScope};

pub const DEFAULT_SAVE_BATCH_SIZE: usize = 200;
pub const DEFAULT_MAX_FLUSH_PASSES: usize = 8;

/// Order in which first-time inserts happen. Containers go before the things
/// they contain so a child can reference its parent's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InitialisationPhase {
    First,
    Second,
    AfterFirstDatabaseHit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LazyLoadPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveConfig {
    pub batch_size: usize,
    pub max_flush_passes: usize,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SAVE_BATCH_SIZE,
            max_flush_passes: DEFAULT_MAX_FLUSH_PASSES,
        }
    }
}

/// What the manager needs from the items it persists.
pub trait SaveTarget<K> {
    fn is_changed(&self, key: K) -> bool;

    /// Writes the item and clears its changed flag. Leaving the flag set
    /// defers the item to the next flush.
    fn save(&mut self, key: K, tx: &mut TransactionScope<'_>) -> Result<(), StorageError>;

    /// Re-flags an item whose save was rolled back.
    fn restore_changed(&mut self, key: K);

    fn database_insert(
        &mut self,
        key: K,
        tx: &mut TransactionScope<'_>,
    ) -> Result<DbId, StorageError>;

    fn set_id_from_database(&mut self, key: K, id: DbId);

    /// Items that became dirty while saves were running and need queueing.
    fn take_newly_changed(&mut self) -> Vec<K> {
        Vec::new()
    }

    fn describe(&self, key: K) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRegistered<K> {
    pub key: K,
    pub id: DbId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport<K> {
    pub registered: Vec<IdRegistered<K>>,
    pub saved: usize,
    pub deleted: usize,
    pub deferred: usize,
    pub transactions: usize,
    pub passes: usize,
}

impl<K> Default for FlushReport<K> {
    fn default() -> Self {
        Self {
            registered: Vec::new(),
            saved: 0,
            deleted: 0,
            deferred: 0,
            transactions: 0,
            passes: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("initialisation of {items} items in phase {phase:?} failed: {source}")]
    Initialisation {
        phase: InitialisationPhase,
        items: usize,
        #[source]
        source: StorageError,
    },
    #[error("deleting {records} records failed: {source}")]
    Delete {
        records: usize,
        #[source]
        source: StorageError,
    },
    #[error("save batch of {items} items failed: {source}")]
    Batch {
        items: usize,
        #[source]
        source: StorageError,
    },
}

#[derive(Debug, Clone, Copy)]
struct PendingInitialisation<K> {
    key: K,
    phase: InitialisationPhase,
}

#[derive(Debug, Clone, Copy)]
struct PendingLazyLoad<K> {
    key: K,
    priority: LazyLoadPriority,
}

struct ChunkFailure<K> {
    attempted: Vec<K>,
    failed_on: Option<K>,
    source: StorageError,
}

/// Deferred persistence. Callers mark items as needing a save; `flush`
/// writes them in bounded transactions.
///
/// A flush borrows the manager mutably, so nothing can enqueue into it or
/// start a second flush while one is running.
#[derive(Debug)]
pub struct SaveManager<K> {
    config: SaveConfig,
    save_queue: VecDeque<K>,
    initialisation_queue: Vec<PendingInitialisation<K>>,
    delete_queue: Vec<DbId>,
    lazy_queue: VecDeque<PendingLazyLoad<K>>,
    bulk_loading: bool,
}

impl<K> Default for SaveManager<K> {
    fn default() -> Self {
        Self::new(SaveConfig::default())
    }
}

impl<K> SaveManager<K> {
    pub fn new(config: SaveConfig) -> Self {
        Self {
            config: SaveConfig {
                batch_size: config.batch_size.max(1),
                max_flush_passes: config.max_flush_passes.max(1),
            },
            save_queue: VecDeque::new(),
            initialisation_queue: Vec::new(),
            delete_queue: Vec::new(),
            lazy_queue: VecDeque::new(),
            bulk_loading: false,
        }
    }

    pub fn config(&self) -> SaveConfig {
        self.config
    }

    pub fn queued_len(&self) -> usize {
        self.save_queue.len()
    }

    pub fn initialisation_len(&self) -> usize {
        self.initialisation_queue.len()
    }

    pub fn pending_delete_len(&self) -> usize {
        self.delete_queue.len()
    }

    pub fn lazy_load_len(&self) -> usize {
        self.lazy_queue.len()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.save_queue.is_empty()
            || !self.initialisation_queue.is_empty()
            || !self.delete_queue.is_empty()
    }

    pub fn is_bulk_loading(&self) -> bool {
        self.bulk_loading
    }
}

impl<K> SaveManager<K>
where
    K: Copy + Eq + Hash + fmt::Display,
{
    /// Queues an item for the next flush. Duplicates are allowed; an item
    /// whose flag is already clear is skipped when its turn comes.
    pub fn add(&mut self, key: K) {
        self.save_queue.push_back(key);
    }

    pub fn add_initialisation(&mut self, key: K, phase: InitialisationPhase) {
        self.initialisation_queue
            .push(PendingInitialisation { key, phase });
    }

    pub fn add_lazy_load(&mut self, key: K, priority: LazyLoadPriority) {
        let item = PendingLazyLoad { key, priority };
        if self.bulk_loading {
            self.lazy_queue.push_back(item);
            return;
        }
        let position = self
            .lazy_queue
            .iter()
            .position(|queued| queued.priority < priority)
            .unwrap_or(self.lazy_queue.len());
        self.lazy_queue.insert(position, item);
    }

    /// Queues removal of a durable record. Deletes stay queued until a
    /// commit succeeds.
    pub fn add_delete(&mut self, id: DbId) {
        if !self.delete_queue.contains(&id) {
            self.delete_queue.push(id);
        }
    }

    /// Defers priority ordering of lazy loads until `end_bulk_load`.
    pub fn begin_bulk_load(&mut self) {
        self.bulk_loading = true;
    }

    pub fn end_bulk_load(&mut self) {
        if !self.bulk_loading {
            return;
        }
        self.bulk_loading = false;
        self.lazy_queue
            .make_contiguous()
            .sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Drops every pending operation for `key`.
    pub fn abort(&mut self, key: K) {
        self.save_queue.retain(|queued| *queued != key);
        self.initialisation_queue.retain(|item| item.key != key);
        self.lazy_queue.retain(|item| item.key != key);
    }

    /// True when `key` sits in any of the three queues.
    pub fn is_queued(&self, key: K) -> bool {
        self.is_save_queued(key)
            || self.is_pending_initialisation(key)
            || self.lazy_queue.iter().any(|item| item.key == key)
    }

    pub fn is_save_queued(&self, key: K) -> bool {
        self.save_queue.contains(&key)
    }

    pub fn is_pending_initialisation(&self, key: K) -> bool {
        self.initialisation_queue.iter().any(|item| item.key == key)
    }

    /// Runs lazy loads in priority order until the queue empties or
    /// `max_time` elapses. At least one item is loaded per call.
    pub fn flush_lazy_load(&mut self, max_time: Duration, mut load: impl FnMut(K)) -> usize {
        let started = Instant::now();
        let mut loaded = 0;
        while let Some(item) = self.lazy_queue.pop_front() {
            load(item.key);
            loaded += 1;
            if started.elapsed() >= max_time {
                break;
            }
        }
        if loaded > 0 {
            debug!(
                loaded,
                remaining = self.lazy_queue.len(),
                "lazy_load_flushed"
            );
        }
        loaded
    }

    /// Writes all pending initialisations, then pending deletes, then drains
    /// the save queue in chunks of at most `batch_size`, one transaction per
    /// chunk.
    ///
    /// A failed chunk is rolled back, its items are re-flagged and requeued,
    /// and the error is returned. Work committed before the failure stays
    /// committed.
    pub fn flush<T: SaveTarget<K>>(
        &mut self,
        target: &mut T,
        storage: &mut dyn Storage,
    ) -> Result<FlushReport<K>, SaveError> {
        let mut report = FlushReport::default();
        self.save_queue.extend(target.take_newly_changed());
        if !self.has_pending_work() {
            return Ok(report);
        }

        if let Err(error) = self.flush_initialisations(target, storage, &mut report) {
            // phases that did commit may have released waiters
            self.save_queue.extend(target.take_newly_changed());
            return Err(error);
        }
        let deleted = self.flush_deletes(storage)?;
        if deleted > 0 {
            report.transactions += 1;
            report.deleted = deleted;
        }
        self.flush_saves(target, storage, &mut report)?;

        if report.transactions > 0 {
            info!(
                registered = report.registered.len(),
                saved = report.saved,
                deleted = report.deleted,
                deferred = report.deferred,
                transactions = report.transactions,
                passes = report.passes,
                "flush_complete"
            );
        }
        Ok(report)
    }

    fn flush_initialisations<T: SaveTarget<K>>(
        &mut self,
        target: &mut T,
        storage: &mut dyn Storage,
        report: &mut FlushReport<K>,
    ) -> Result<(), SaveError> {
        while !self.initialisation_queue.is_empty() {
            let mut pending = std::mem::take(&mut self.initialisation_queue);
            pending.sort_by_key(|item| item.phase);

            let mut start = 0;
            while start < pending.len() {
                let phase = pending[start].phase;
                let end = start
                    + pending[start..]
                        .iter()
                        .take_while(|item| item.phase == phase)
                        .count();
                let group = &pending[start..end];

                match initialise_group(group, target, storage) {
                    Ok(registered) => {
                        report.transactions += 1;
                        report.registered.extend(registered);
                    }
                    Err(source) => {
                        error!(
                            phase = ?phase,
                            items = group.len(),
                            first = %target.describe(group[0].key),
                            error = %source,
                            "initialisation_failed"
                        );
                        let mut requeue = pending[start..].to_vec();
                        requeue.append(&mut self.initialisation_queue);
                        self.initialisation_queue = requeue;
                        return Err(SaveError::Initialisation {
                            phase,
                            items: group.len(),
                            source,
                        });
                    }
                }
                start = end;
            }
        }
        Ok(())
    }

    /// Commits every queued delete in one transaction. On failure the deletes
    /// stay queued for the next flush.
    pub fn flush_deletes(&mut self, storage: &mut dyn Storage) -> Result<usize, SaveError> {
        if self.delete_queue.is_empty() {
            return Ok(0);
        }
        let records = self.delete_queue.len();
        if let Err(source) = delete_records(&self.delete_queue, storage) {
            error!(records, error = %source, "delete_batch_failed");
            return Err(SaveError::Delete { records, source });
        }
        self.delete_queue.clear();
        Ok(records)
    }

    fn flush_saves<T: SaveTarget<K>>(
        &mut self,
        target: &mut T,
        storage: &mut dyn Storage,
        report: &mut FlushReport<K>,
    ) -> Result<(), SaveError> {
        let batch_size = self.config.batch_size;
        let mut deferred: Vec<K> = Vec::new();
        self.save_queue.extend(target.take_newly_changed());

        while !self.save_queue.is_empty() && report.passes < self.config.max_flush_passes {
            report.passes += 1;
            let pending: Vec<K> = self.save_queue.drain(..).collect();

            for (index, chunk) in pending.chunks(batch_size).enumerate() {
                match save_chunk(chunk, target, storage) {
                    Ok((saved, still_changed)) => {
                        report.transactions += 1;
                        report.saved += saved;
                        for key in &still_changed {
                            warn!(item = %target.describe(*key), "save_left_item_changed");
                        }
                        deferred.extend(still_changed);
                    }
                    Err(failure) => {
                        for key in &failure.attempted {
                            target.restore_changed(*key);
                        }
                        let culprit = failure
                            .failed_on
                            .map(|key| target.describe(key))
                            .unwrap_or_else(|| "commit".to_string());
                        error!(
                            items = chunk.len(),
                            culprit = %culprit,
                            queue_depth = pending.len() - index * batch_size,
                            error = %failure.source,
                            "save_batch_failed"
                        );

                        let mut requeue: VecDeque<K> =
                            pending[index * batch_size..].iter().copied().collect();
                        requeue.extend(deferred.drain(..));
                        requeue.extend(self.save_queue.drain(..));
                        self.save_queue = requeue;
                        return Err(SaveError::Batch {
                            items: chunk.len(),
                            source: failure.source,
                        });
                    }
                }
                self.save_queue.extend(target.take_newly_changed());
            }
        }

        if !self.save_queue.is_empty() {
            warn!(
                remaining = self.save_queue.len(),
                passes = report.passes,
                "flush_pass_limit_reached"
            );
        }

        report.deferred = deferred.len();
        for key in deferred.into_iter().rev() {
            self.save_queue.push_front(key);
        }
        Ok(())
    }
}

fn initialise_group<K: Copy, T: SaveTarget<K>>(
    group: &[PendingInitialisation<K>],
    target: &mut T,
    storage: &mut dyn Storage,
) -> Result<Vec<IdRegistered<K>>, StorageError> {
    let mut tx = TransactionScope::begin(storage)?;
    let mut registered = Vec::with_capacity(group.len());
    for item in group {
        let id = target.database_insert(item.key, &mut tx)?;
        registered.push(IdRegistered { key: item.key, id });
    }
    tx.commit()?;

    for item in &registered {
        target.set_id_from_database(item.key, item.id);
    }
    Ok(registered)
}

fn delete_records(ids: &[DbId], storage: &mut dyn Storage) -> Result<(), StorageError> {
    let mut tx = TransactionScope::begin(storage)?;
    for &id in ids {
        tx.delete(id)?;
    }
    tx.commit()
}

fn save_chunk<K: Copy, T: SaveTarget<K>>(
    chunk: &[K],
    target: &mut T,
    storage: &mut dyn Storage,
) -> Result<(usize, Vec<K>), ChunkFailure<K>> {
    let mut attempted = Vec::with_capacity(chunk.len());
    let mut tx = match TransactionScope::begin(storage) {
        Ok(tx) => tx,
        Err(source) => {
            return Err(ChunkFailure {
                attempted,
                failed_on: None,
                source,
            })
        }
    };

    for &key in chunk {
        if !target.is_changed(key) {
            continue;
        }
        attempted.push(key);
        if let Err(source) = target.save(key, &mut tx) {
            return Err(ChunkFailure {
                attempted,
                failed_on: Some(key),
                source,
            });
        }
    }

    if let Err(source) = tx.commit() {
        return Err(ChunkFailure {
            attempted,
            failed_on: None,
            source,
        });
    }

    let mut saved = 0;
    let mut still_changed = Vec::new();
    for key in attempted {
        if target.is_changed(key) {
            still_changed.push(key);
        } else {
            saved += 1;
        }
    }
    Ok((saved, still_changed))
}
