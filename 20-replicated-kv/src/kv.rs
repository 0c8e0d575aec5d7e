//! Key-value storage the committed log is applied to.
//!
//! Both stores keep a `BTreeMap` behind a `Mutex`; iteration order is
//! deterministic, which keeps snapshots and test output stable.
//! [`FileStore`] additionally rewrites its JSON file after every mutation.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::wal::{LogEntry, Op};

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key {0} not found")]
    NotFound(String),
    #[error("store i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Storage a replica applies committed entries to.
///
/// Implementations are internally synchronized; all methods take `&self`.
pub trait KeyValueStore: Send + Sync {
    fn write(&self, key: &str, value: &str) -> Result<(), KvError>;
    fn read(&self, key: &str) -> Result<String, KvError>;
    fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// Applies one committed entry and returns the value it leaves behind.
///
/// Deleting a key that is already gone counts as applied, so replaying a
/// commit after a lost acknowledgement is harmless.
pub fn apply(store: &dyn KeyValueStore, entry: &LogEntry) -> Result<String, KvError> {
    match entry.op {
        Some(Op::Create) | Some(Op::Update) => {
            store.write(&entry.operand, &entry.value1)?;
            Ok(entry.value1.clone())
        }
        Some(Op::Cas) => {
            store.write(&entry.operand, &entry.value2)?;
            Ok(entry.value2.clone())
        }
        Some(Op::Delete) => match store.delete(&entry.operand) {
            Ok(()) | Err(KvError::NotFound(_)) => Ok(String::new()),
            Err(err) => Err(err),
        },
        Some(Op::Read) | None => Ok(String::new()),
    }
}

fn locked(data: &Mutex<BTreeMap<String, String>>) -> MutexGuard<'_, BTreeMap<String, String>> {
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all key-value pairs.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        locked(&self.data).clone()
    }
}

impl KeyValueStore for MemoryStore {
    fn write(&self, key: &str, value: &str) -> Result<(), KvError> {
        locked(&self.data).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<String, KvError> {
        locked(&self.data)
            .get(key)
            .cloned()
            .ok_or_else(|| KvError::NotFound(key.to_owned()))
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        locked(&self.data)
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| KvError::NotFound(key.to_owned()))
    }
}

/// Map persisted as a single JSON document.
///
/// Each mutation writes a temporary file, fsyncs it and renames it over the
/// previous document, so a crash leaves either the old or the new map.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, KvError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let data = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        locked(&self.data).clone()
    }

    fn persist(&self, data: &BTreeMap<String, String>) -> Result<(), KvError> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec(data)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn write(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut data = locked(&self.data);
        let previous = data.insert(key.to_owned(), value.to_owned());
        if let Err(err) = self.persist(&data) {
            match previous {
                Some(old) => data.insert(key.to_owned(), old),
                None => data.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Result<String, KvError> {
        locked(&self.data)
            .get(key)
            .cloned()
            .ok_or_else(|| KvError::NotFound(key.to_owned()))
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut data = locked(&self.data);
        let Some(old) = data.remove(key) else {
            return Err(KvError::NotFound(key.to_owned()));
        };
        if let Err(err) = self.persist(&data) {
            data.insert(key.to_owned(), old);
            return Err(err);
        }
        Ok(())
    }
}
