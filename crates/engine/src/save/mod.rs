//! Deferred persistence: the save queue and the storage it flushes into.

mod atomic_io;
mod file;
mod manager;
mod memory;
mod storage;

pub use file::FileStorage;
pub use manager::{
    FlushReport, IdRegistered, InitialisationPhase, LazyLoadPriority, SaveConfig, SaveError,
    SaveManager, SaveTarget, DEFAULT_MAX_FLUSH_PASSES, DEFAULT_SAVE_BATCH_SIZE,
};
pub use memory::{MemoryStorage, StorageStats};
pub use storage::{DbId, Storage, StorageError, StoredEffect, StoredRecord, TransactionScope};
