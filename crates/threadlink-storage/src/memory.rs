use crate::{decode_index, encode_index, CorruptionReport, IndexLock, IndexPersistence, LoadOutcome};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use threadlink_core::{Index, Result, ThreadlinkError};

/// In-memory stand-in for `JsonIndexFile`, same codec.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    document: Mutex<Option<Vec<u8>>>,
    backups: Mutex<Vec<Vec<u8>>>,
    failing_saves: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: impl Into<Vec<u8>>) -> Self {
        let persistence = Self::default();
        *lock(&persistence.document) = Some(document.into());
        persistence
    }

    /// Makes the next `count` saves fail with an I/O error.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    pub fn document(&self) -> Option<String> {
        lock(&self.document)
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn backups(&self) -> Vec<Vec<u8>> {
        lock(&self.backups).clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

impl IndexPersistence for MemoryPersistence {
    fn load(&self) -> Result<LoadOutcome> {
        let document = lock(&self.document);
        let Some(bytes) = document.as_ref() else {
            return Ok(LoadOutcome::fresh(Index::new()));
        };
        match decode_index(bytes) {
            Ok(index) => Ok(LoadOutcome::fresh(index)),
            Err(reason) => {
                let mut backups = lock(&self.backups);
                if backups.iter().any(|backup| backup == bytes) {
                    return Ok(LoadOutcome::fresh(Index::new()));
                }
                backups.push(bytes.clone());
                Ok(LoadOutcome::recovered(CorruptionReport {
                    backup_path: PathBuf::from(format!("memory://backups/{}", backups.len())),
                    reason,
                }))
            }
        }
    }

    fn save(&self, index: &Index) -> Result<()> {
        let pending_failures = self.failing_saves.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_saves.store(pending_failures - 1, Ordering::SeqCst);
            return Err(ThreadlinkError::io(
                "failed to save in-memory index",
                std::io::Error::other("injected save failure"),
            ));
        }
        let payload = encode_index(index)?;
        *lock(&self.document) = Some(payload);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn lock_exclusive(&self) -> Result<IndexLock> {
        Ok(IndexLock::unlocked())
    }

    fn lock_shared(&self) -> Result<IndexLock> {
        Ok(IndexLock::unlocked())
    }
}
