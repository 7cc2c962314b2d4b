//! Local filesystem backend
//!
//! Entities are nested directories under a root path, each holding a
//! `flow.state` record and, while locked, a `flow.lock` file guarded by an
//! advisory `flock`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{Backend, StateError, StateResult, StateStore};
use crate::key::{ChildKind, EntityKey, STATE_FILE};
use crate::lock::{EntityLock, LockInfo};

/// Directory-tree state store for development and single-machine use
pub struct LocalStore {
    backend: Backend,
    root: PathBuf,
}

impl LocalStore {
    /// Default root directory
    pub const DEFAULT_ROOT: &'static str = ".flow";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            backend: Backend::Local { path: root.clone() },
            root,
        }
    }

    /// Root directory of the namespace
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, key: &EntityKey) -> PathBuf {
        self.root.join(key.state_key())
    }

    fn entity_dir(&self, key: &EntityKey) -> PathBuf {
        self.root.join(key.path())
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ROOT)
    }
}

#[async_trait]
impl StateStore for LocalStore {
    fn backend(&self) -> &Backend {
        &self.backend
    }

    async fn read(&self, key: &EntityKey) -> StateResult<Option<Vec<u8>>> {
        match fs::read(self.state_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Io(format!("Failed to read {}: {}", key, e))),
        }
    }

    async fn write(
        &self,
        key: &EntityKey,
        body: Vec<u8>,
        _lock_id: Option<&str>,
    ) -> StateResult<()> {
        let path = self.state_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StateError::Io(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        // Write to a sibling file and rename so readers never see a torn record
        let tmp = path.with_extension("state.tmp");
        fs::write(&tmp, body)
            .map_err(|e| StateError::Io(format!("Failed to write {}: {}", key, e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| StateError::Io(format!("Failed to write {}: {}", key, e)))?;

        Ok(())
    }

    async fn delete(&self, key: &EntityKey, _lock_id: Option<&str>) -> StateResult<()> {
        match fs::remove_file(self.state_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StateError::Io(format!(
                    "Failed to delete {}: {}",
                    key, e
                )));
            }
        }
        // Left in place while a lock file is still present
        remove_empty_dir(&self.entity_dir(key));
        Ok(())
    }

    async fn list(&self, parent: &EntityKey, kind: ChildKind) -> StateResult<Vec<String>> {
        let dir = self.root.join(parent.children_prefix(kind));
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::Io(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )));
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::Io(e.to_string()))?;
            let path = entry.path();
            if !path.is_dir() || !path.join(STATE_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn entity_lock(&self, key: &EntityKey) -> Arc<dyn EntityLock> {
        Arc::new(LocalFileLock::new(
            key.clone(),
            self.root.join(key.lock_key()),
        ))
    }

    fn destination_uri(&self, key: &EntityKey) -> String {
        format!("file://{}", self.entity_dir(key).display())
    }

    async fn delete_environment(&self, key: &EntityKey, lock_id: &str) -> StateResult<()> {
        for kind in [ChildKind::Resources, ChildKind::Services] {
            for name in self.list(key, kind).await? {
                if let Some(child) = key.child(kind, &name) {
                    log::debug!("cascade delete {}", child);
                    self.delete(&child, Some(lock_id)).await?;
                }
            }
            if let Some(dir) = kind.directory() {
                remove_empty_dir(&self.entity_dir(key).join(dir));
            }
        }
        self.delete(key, Some(lock_id)).await
    }
}

fn remove_empty_dir(dir: &Path) {
    // remove_dir refuses non-empty directories, which is what we want
    let _ = fs::remove_dir(dir);
}

struct HeldLock {
    /// Keeps the flock alive until dropped
    file: File,
    lock_id: String,
}

/// Advisory file lock on `{entity}/flow.lock`
///
/// The lock record is written into the locked file itself, so readers can see
/// who holds it.
pub struct LocalFileLock {
    key: EntityKey,
    path: PathBuf,
    held: Mutex<Option<HeldLock>>,
}

impl LocalFileLock {
    /// Attempts before giving up when the lock file keeps being replaced under us
    const MAX_REOPEN_ATTEMPTS: usize = 5;

    pub fn new(key: EntityKey, path: PathBuf) -> Self {
        Self {
            key,
            path,
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_record(&self) -> StateResult<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Io(format!(
                    "Failed to read lock file: {}",
                    e
                )));
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::invalid_state(&self.key, e))
    }

    fn held(&self) -> std::sync::MutexGuard<'_, Option<HeldLock>> {
        // A poisoned mutex only means another thread panicked mid-update; the
        // Option inside is still coherent
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_lock_file(&self) -> StateResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StateError::Io(format!(
                    "Failed to remove lock file: {}",
                    e
                )));
            }
        }
        // The entity directory stays: a waiter may be about to open a new lock
        // file in it
        Ok(())
    }
}

#[async_trait]
impl EntityLock for LocalFileLock {
    async fn try_acquire(&self, info: &LockInfo) -> StateResult<String> {
        if self.held().is_some() {
            return Err(StateError::locked(&self.key, self.read_record()?.as_ref()));
        }

        for _ in 0..Self::MAX_REOPEN_ATTEMPTS {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| StateError::Io(format!("Failed to create lock dir: {}", e)))?;
            }

            let opened = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path);
            let mut file = match opened {
                Ok(file) => file,
                // The entity directory was removed between create_dir_all and open
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StateError::Io(format!("Failed to open lock file: {}", e)));
                }
            };

            let acquired = try_flock_exclusive(&file)
                .map_err(|e| StateError::Io(format!("Failed to lock {}: {}", self.key, e)))?;
            if !acquired {
                let holder = self.read_record().ok().flatten();
                return Err(StateError::locked(&self.key, holder.as_ref()));
            }

            // The previous holder may have unlinked the file between our open
            // and our flock; a lock on an orphaned inode protects nothing
            if !is_same_file(&file, &self.path)? {
                continue;
            }

            let content = serde_json::to_vec_pretty(info)
                .map_err(|e| StateError::Serialization(e.to_string()))?;
            file.set_len(0)
                .and_then(|_| file.write_all(&content))
                .and_then(|_| file.sync_all())
                .map_err(|e| StateError::Io(format!("Failed to write lock file: {}", e)))?;

            *self.held() = Some(HeldLock {
                file,
                lock_id: info.lock_id.clone(),
            });
            return Ok(info.lock_id.clone());
        }

        Err(StateError::locked(&self.key, None))
    }

    async fn release(&self, lock_id: &str) -> StateResult<()> {
        let mut held = self.held();
        let current = match held.as_ref() {
            Some(current) => current,
            None => return Err(StateError::LockNotFound(lock_id.to_string())),
        };
        if current.lock_id != lock_id {
            return Err(StateError::LockMismatch {
                expected: lock_id.to_string(),
                actual: current.lock_id.clone(),
            });
        }

        // Unlink before unlocking so waiters holding the old inode notice.
        // After a force-unlock the path may belong to a newer holder.
        if is_same_file(&current.file, &self.path)? {
            self.remove_lock_file()?;
        }
        held.take();
        Ok(())
    }

    async fn read_info(&self) -> StateResult<Option<LockInfo>> {
        self.read_record()
    }

    async fn force_release(&self) -> StateResult<()> {
        if !self.path.exists() {
            return Err(StateError::LockNotFound(self.key.to_string()));
        }
        self.remove_lock_file()?;
        self.held().take();
        Ok(())
    }
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if the file is
/// already locked through another open file description.
#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid descriptor owned by `file` for the duration of the call
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn is_same_file(file: &File, path: &Path) -> StateResult<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file
        .metadata()
        .map_err(|e| StateError::Io(format!("Failed to stat lock file: {}", e)))?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.ino() == current.ino() && held.dev() == current.dev()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StateError::Io(format!("Failed to stat lock file: {}", e))),
    }
}

#[cfg(not(unix))]
fn is_same_file(_file: &File, path: &Path) -> StateResult<bool> {
    Ok(path.exists())
}
