use fs2::FileExt;
use std::fs::File;
use std::path::PathBuf;
use threadlink_core::{Index, Result, ThreadlinkError};

mod json_file;
mod memory;
mod store;

pub use json_file::{JsonIndexFile, DEFAULT_LOCK_TIMEOUT};
pub use memory::MemoryPersistence;
pub use store::ThreadStore;

/// `save` replaces the stored document wholesale.
pub trait IndexPersistence {
    fn load(&self) -> Result<LoadOutcome>;
    fn save(&self, index: &Index) -> Result<()>;
    fn lock_exclusive(&self) -> Result<IndexLock>;
    fn lock_shared(&self) -> Result<IndexLock>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    pub backup_path: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub index: Index,
    /// Set when the stored document was unreadable and has just been backed up.
    pub recovered: Option<CorruptionReport>,
}

impl LoadOutcome {
    pub fn fresh(index: Index) -> Self {
        Self {
            index,
            recovered: None,
        }
    }

    pub fn recovered(report: CorruptionReport) -> Self {
        Self {
            index: Index::new(),
            recovered: Some(report),
        }
    }

    /// The index, or `CorruptIndex` if this load had to fall back to empty.
    pub fn into_index(self) -> Result<Index> {
        match self.recovered {
            None => Ok(self.index),
            Some(report) => Err(ThreadlinkError::CorruptIndex {
                backup_path: report.backup_path,
                reason: report.reason,
            }),
        }
    }
}

#[derive(Debug)]
pub struct IndexLock {
    file: Option<File>,
}

impl IndexLock {
    pub fn unlocked() -> Self {
        Self { file: None }
    }

    pub(crate) fn held(file: File) -> Self {
        Self { file: Some(file) }
    }

    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = FileExt::unlock(file);
        }
    }
}

pub(crate) fn encode_index(index: &Index) -> Result<Vec<u8>> {
    let mut payload = serde_json::to_vec_pretty(index)
        .map_err(|err| ThreadlinkError::io("failed to serialize index", err.into()))?;
    payload.push(b'\n');
    Ok(payload)
}

pub(crate) fn decode_index(bytes: &[u8]) -> std::result::Result<Index, String> {
    serde_json::from_slice::<Index>(bytes).map_err(|err| err.to_string())
}
