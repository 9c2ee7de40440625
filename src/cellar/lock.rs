//! Publish lock management.
//!
//! At most one builder may publish a given name/version key; the lock is an
//! fs2 exclusive file lock under `<cellar>/.locks`.

use super::CellarError;
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// How old a lock file can be before it's considered stale (2 hours)
const STALE_LOCK_AGE_SECS: u64 = 7200;

/// Check if a lock file is stale (older than STALE_LOCK_AGE_SECS)
fn is_stale_lock(lock_path: &Path) -> bool {
    if let Ok(metadata) = std::fs::metadata(lock_path)
        && let Ok(modified) = metadata.modified()
        && let Ok(age) = std::time::SystemTime::now().duration_since(modified)
    {
        return age.as_secs() > STALE_LOCK_AGE_SECS;
    }
    false
}

/// Acquire the exclusive publish lock for one name/version key.
/// Returns a guard that releases the lock when dropped.
pub(crate) fn acquire(root: &Path, name: &str, version: &str) -> Result<PublishLock, CellarError> {
    let locks_dir = root.join(".locks");
    std::fs::create_dir_all(&locks_dir)?;
    let lock_path = locks_dir.join(format!("{}-{}.lock", name, version));

    // Clean up a lock left behind by a long-dead builder
    if lock_path.exists() && is_stale_lock(&lock_path) {
        let _ = std::fs::remove_file(&lock_path);
    }

    let lock_file = File::create(&lock_path)?;

    if lock_file.try_lock_exclusive().is_err() {
        drop(lock_file);
        return Err(CellarError::Conflict {
            name: name.to_string(),
            version: version.to_string(),
        });
    }

    Ok(PublishLock {
        _file: lock_file,
        path: lock_path,
    })
}

/// RAII guard for the publish lock - releases and deletes the lock file
/// when dropped.
#[derive(Debug)]
pub(crate) struct PublishLock {
    _file: File,
    path: PathBuf,
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
