use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::world::EntityKind;

/// Durable identity, assigned by storage on first insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DbId(pub u64);

impl fmt::Display for DbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEffect {
    pub specific_type: String,
    pub definition: String,
    /// Time left when the owner was saved. Reloading schedules it again
    /// relative to the new clock rather than at an absolute instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: DbId,
    pub kind: EntityKind,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<DbId>,
    #[serde(default)]
    pub effects: Vec<StoredEffect>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("a transaction is already open")]
    TransactionActive,
    #[error("no transaction is open")]
    NoTransaction,
    #[error("record {id} does not exist")]
    MissingRecord { id: DbId },
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode record {id}: {source}")]
    Encode {
        id: DbId,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {path} at '{field}': {message}")]
    Decode {
        path: PathBuf,
        field: String,
        message: String,
    },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// The persistence-layer collaborator. Writes are staged between `begin` and
/// `commit`; `rollback` discards them.
pub trait Storage {
    fn begin(&mut self) -> Result<(), StorageError>;

    /// Stages a first-time insert, assigning and returning the new id. The id
    /// stays consumed even if the transaction rolls back.
    fn insert(&mut self, record: StoredRecord) -> Result<DbId, StorageError>;

    fn write(&mut self, record: StoredRecord) -> Result<(), StorageError>;

    fn delete(&mut self, id: DbId) -> Result<(), StorageError>;

    /// Applies staged work. On failure nothing is applied and the transaction
    /// is closed.
    fn commit(&mut self) -> Result<(), StorageError>;

    fn rollback(&mut self);

    fn load_all(&self) -> Result<Vec<StoredRecord>, StorageError>;
}

/// Open transaction that rolls back unless committed.
pub struct TransactionScope<'a> {
    storage: &'a mut dyn Storage,
    finished: bool,
}

impl<'a> TransactionScope<'a> {
    pub fn begin(storage: &'a mut dyn Storage) -> Result<Self, StorageError> {
        storage.begin()?;
        Ok(Self {
            storage,
            finished: false,
        })
    }

    pub fn insert(&mut self, record: StoredRecord) -> Result<DbId, StorageError> {
        self.storage.insert(record)
    }

    pub fn write(&mut self, record: StoredRecord) -> Result<(), StorageError> {
        self.storage.write(record)
    }

    pub fn delete(&mut self, id: DbId) -> Result<(), StorageError> {
        self.storage.delete(id)
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.storage.commit()
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.storage.rollback();
        }
    }
}
