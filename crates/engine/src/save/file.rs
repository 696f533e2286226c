use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::atomic_io::{remove_if_exists, write_text_atomic};
use super::storage::{DbId, Storage, StorageError, StoredRecord};

const RECORDS_DIR: &str = "records";
const NEXT_ID_FILE: &str = "next_id";

/// One JSON file per record under `<root>/records`, plus an id counter.
/// Commits apply each staged write through an atomic replace.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    next_id: u64,
    staged: Option<BTreeMap<DbId, Option<StoredRecord>>>,
}

impl FileStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let records = root.join(RECORDS_DIR);
        fs::create_dir_all(&records).map_err(|source| StorageError::Io {
            path: records.clone(),
            source,
        })?;
        let highest = highest_record_id(&records)?;
        let next_id = match read_next_id(&root.join(NEXT_ID_FILE))? {
            Some(counter) if counter >= highest => counter,
            None if highest == 0 => 0,
            counter => {
                warn!(
                    root = %root.display(),
                    counter = ?counter,
                    highest,
                    "next_id_behind_records"
                );
                highest
            }
        };
        debug!(root = %root.display(), next_id, "file_storage_opened");
        Ok(Self {
            root,
            next_id,
            staged: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: DbId) -> PathBuf {
        self.root.join(RECORDS_DIR).join(format!("{}.json", id.0))
    }

    fn staged_mut(&mut self) -> Result<&mut BTreeMap<DbId, Option<StoredRecord>>, StorageError> {
        self.staged.as_mut().ok_or(StorageError::NoTransaction)
    }

    fn persist_next_id(&self) -> Result<(), StorageError> {
        let path = self.root.join(NEXT_ID_FILE);
        write_text_atomic(&path, &self.next_id.to_string())
            .map_err(|source| StorageError::Io { path, source })
    }
}

impl Storage for FileStorage {
    fn begin(&mut self) -> Result<(), StorageError> {
        if self.staged.is_some() {
            return Err(StorageError::TransactionActive);
        }
        self.staged = Some(BTreeMap::new());
        Ok(())
    }

    fn insert(&mut self, mut record: StoredRecord) -> Result<DbId, StorageError> {
        if self.staged.is_none() {
            return Err(StorageError::NoTransaction);
        }
        self.next_id += 1;
        let id = DbId(self.next_id);
        record.id = id;
        self.staged_mut()?.insert(id, Some(record));
        Ok(id)
    }

    fn write(&mut self, record: StoredRecord) -> Result<(), StorageError> {
        self.staged_mut()?.insert(record.id, Some(record));
        Ok(())
    }

    fn delete(&mut self, id: DbId) -> Result<(), StorageError> {
        self.staged_mut()?.insert(id, None);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let staged = self.staged.take().ok_or(StorageError::NoTransaction)?;

        // Encode everything before touching disk so a bad record fails the
        // whole commit.
        let mut encoded = Vec::with_capacity(staged.len());
        for (id, record) in staged {
            let text = match record {
                Some(record) => Some(
                    serde_json::to_string_pretty(&record)
                        .map_err(|source| StorageError::Encode { id, source })?,
                ),
                None => None,
            };
            encoded.push((id, text));
        }

        self.persist_next_id()?;
        for (id, text) in encoded {
            let path = self.record_path(id);
            let result = match text {
                Some(text) => write_text_atomic(&path, &text),
                None => remove_if_exists(&path),
            };
            result.map_err(|source| StorageError::Io { path, source })?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.staged = None;
    }

    fn load_all(&self) -> Result<Vec<StoredRecord>, StorageError> {
        let dir = self.root.join(RECORDS_DIR);
        let entries = fs::read_dir(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
            records.push(parse_record(&path, &raw)?);
        }
        records.sort_by_key(|record| record.id);
        Ok(records)
    }
}

fn parse_record(path: &Path, raw: &str) -> Result<StoredRecord, StorageError> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    serde_path_to_error::deserialize::<_, StoredRecord>(&mut deserializer).map_err(|error| {
        let field = error.path().to_string();
        StorageError::Decode {
            path: path.to_path_buf(),
            field,
            message: error.into_inner().to_string(),
        }
    })
}

/// The stored id counter, or `None` when it is missing or unreadable.
fn read_next_id(path: &Path) -> Result<Option<u64>, StorageError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match raw.trim().parse::<u64>() {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            warn!(
                path = %path.display(),
                value = raw.trim(),
                error = %error,
                "next_id_unreadable"
            );
            Ok(None)
        }
    }
}

/// Largest id among `<id>.json` files, so a lost counter never hands out an
/// id that is already on disk.
fn highest_record_id(dir: &Path) -> Result<u64, StorageError> {
    let entries = fs::read_dir(dir).map_err(|source| StorageError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut highest = 0;
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok());
        if let Some(id) = id {
            highest = highest.max(id);
        }
    }
    Ok(highest)
}
