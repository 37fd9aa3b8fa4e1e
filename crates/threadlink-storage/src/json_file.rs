use crate::{decode_index, encode_index, CorruptionReport, IndexLock, IndexPersistence, LoadOutcome};
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use threadlink_core::{Index, Result, ThreadlinkError};
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const BACKUP_DIR: &str = "backups";

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
pub struct JsonIndexFile {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonIndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, ".lock")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir().join(BACKUP_DIR)
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "thread_index.json".to_string())
    }

    fn temp_path(&self) -> PathBuf {
        self.dir()
            .join(format!(".{}.{}.tmp", self.file_name(), std::process::id()))
    }

    fn acquire(&self, mode: LockMode) -> Result<IndexLock> {
        let dir = self.dir();
        if matches!(mode, LockMode::Shared) && !dir.is_dir() {
            // nothing to read and nothing to protect yet
            return Ok(IndexLock::unlocked());
        }
        ensure_private_dir(&dir)?;
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| {
                ThreadlinkError::io(format!("failed to open {}", lock_path.display()), err)
            })?;

        let start = Instant::now();
        let mut announced = false;
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => return Ok(IndexLock::held(file)),
                Err(err) if is_contended(&err) => {}
                Err(err) => {
                    return Err(ThreadlinkError::io(
                        format!("failed to lock {}", lock_path.display()),
                        err,
                    ))
                }
            }

            let waited = start.elapsed();
            if waited >= self.lock_timeout {
                return Err(ThreadlinkError::Locked {
                    path: lock_path,
                    waited_ms: waited.as_millis().min(u64::MAX as u128) as u64,
                });
            }
            if !announced {
                debug!(lock = %lock_path.display(), ?mode, "waiting for index lock");
                announced = true;
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(self.lock_timeout - waited));
        }
    }

    // the document itself stays until the next save renames over it
    fn back_up_corrupt(&self, bytes: &[u8], reason: String) -> Result<LoadOutcome> {
        if let Some(existing) = self.existing_backup(bytes)? {
            debug!(
                path = %self.path.display(),
                backup = %existing.display(),
                "corrupt index already backed up"
            );
            return Ok(LoadOutcome::fresh(Index::new()));
        }

        let backup_dir = self.backup_dir();
        ensure_private_dir(&backup_dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let mut backup_path = backup_dir.join(format!("{}.{stamp}.bak", self.file_name()));
        let mut counter = 1;
        while backup_path.exists() {
            backup_path = backup_dir.join(format!("{}.{stamp}-{counter}.bak", self.file_name()));
            counter += 1;
        }
        self.write_private(&backup_path, bytes).map_err(|err| {
            ThreadlinkError::io(
                format!("failed to back up corrupt index to {}", backup_path.display()),
                err,
            )
        })?;

        warn!(
            path = %self.path.display(),
            backup = %backup_path.display(),
            %reason,
            "index file was corrupt, copied to backup"
        );
        Ok(LoadOutcome::recovered(CorruptionReport {
            backup_path,
            reason,
        }))
    }

    fn existing_backup(&self, bytes: &[u8]) -> Result<Option<PathBuf>> {
        let backup_dir = self.backup_dir();
        let entries = match fs::read_dir(&backup_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ThreadlinkError::io(
                    format!("failed to list {}", backup_dir.display()),
                    err,
                ))
            }
        };
        let prefix = format!("{}.", self.file_name());
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || !name.ends_with(".bak") {
                continue;
            }
            let same_len = entry
                .metadata()
                .map(|meta| meta.len() == bytes.len() as u64)
                .unwrap_or(false);
            if same_len && fs::read(entry.path()).ok().as_deref() == Some(bytes) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    fn write_private(&self, path: &Path, payload: &[u8]) -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(payload)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

impl IndexPersistence for JsonIndexFile {
    fn load(&self) -> Result<LoadOutcome> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no index file yet");
                return Ok(LoadOutcome::fresh(Index::new()));
            }
            Err(err) => {
                return Err(ThreadlinkError::io(
                    format!("failed to read {}", self.path.display()),
                    err,
                ))
            }
        };

        match decode_index(&bytes) {
            Ok(index) => {
                debug!(path = %self.path.display(), threads = index.len(), "loaded index");
                Ok(LoadOutcome::fresh(index))
            }
            Err(reason) => self.back_up_corrupt(&bytes, reason),
        }
    }

    fn save(&self, index: &Index) -> Result<()> {
        ensure_private_dir(&self.dir())?;
        let payload = encode_index(index)?;
        let temp_path = self.temp_path();

        if let Err(err) = self.write_private(&temp_path, &payload) {
            let _ = fs::remove_file(&temp_path);
            return Err(ThreadlinkError::io(
                format!("failed to write {}", temp_path.display()),
                err,
            ));
        }
        if let Err(err) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(ThreadlinkError::io(
                format!("failed to replace {}", self.path.display()),
                err,
            ));
        }
        set_owner_only(&self.path)?;
        sync_dir(&self.dir());

        info!(path = %self.path.display(), threads = index.len(), "saved index");
        Ok(())
    }

    fn lock_exclusive(&self) -> Result<IndexLock> {
        self.acquire(LockMode::Exclusive)
    }

    fn lock_shared(&self) -> Result<IndexLock> {
        self.acquire(LockMode::Shared)
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)
        .map_err(|err| ThreadlinkError::io(format!("failed to create {}", dir.display()), err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(|err| {
            ThreadlinkError::io(format!("failed to restrict {}", dir.display()), err)
        })?;
    }
    Ok(())
}

fn set_owner_only(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|err| {
            ThreadlinkError::io(format!("failed to restrict {}", path.display()), err)
        })?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
