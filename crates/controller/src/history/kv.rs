//! Small key-value store with numeric keys, used for ring snapshots,
//! history metadata and the reset logs.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::HistoryError;
use crate::pack::atomic;

pub const KEY_HOURLY: u16 = 0x6101;
pub const KEY_DAILY: u16 = 0x6102;
pub const KEY_MONTHLY: u16 = 0x6103;
pub const KEY_META: u16 = 0x6104;
pub const KEY_RESET_LOG_BASE: u16 = 0x6200;

pub trait KvStore: Send + Sync {
    /// `None` when the key was never written.
    fn read(&self, key: u16) -> Result<Option<Vec<u8>>, HistoryError>;
    fn write(&self, key: u16, value: &[u8]) -> Result<(), HistoryError>;
    fn delete(&self, key: u16) -> Result<(), HistoryError>;
}

/// One file per key, replaced atomically on write.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        atomic::sweep_tmp(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: u16) -> PathBuf {
        self.dir.join(format!("kv_{key:04x}.bin"))
    }
}

impl KvStore for FileKv {
    fn read(&self, key: u16) -> Result<Option<Vec<u8>>, HistoryError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: u16, value: &[u8]) -> Result<(), HistoryError> {
        atomic::write_bytes(&self.path(key), value)?;
        Ok(())
    }

    fn delete(&self, key: u16) -> Result<(), HistoryError> {
        atomic::remove_if_exists(&self.path(key))?;
        Ok(())
    }
}

/// Volatile store for tests and for running without persistence.
#[derive(Debug, Default)]
pub struct MemKv {
    map: Mutex<HashMap<u16, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<u16> {
        let mut keys: Vec<u16> = self
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        keys.sort_unstable();
        keys
    }
}

impl KvStore for MemKv {
    fn read(&self, key: u16) -> Result<Option<Vec<u8>>, HistoryError> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned())
    }

    fn write(&self, key: u16, value: &[u8]) -> Result<(), HistoryError> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value.to_vec());
        Ok(())
    }

    fn delete(&self, key: u16) -> Result<(), HistoryError> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        Ok(())
    }
}
