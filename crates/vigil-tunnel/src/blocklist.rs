//! On-device Blocklist Store
//!
//! Adapters that filter locally load a blocklist snapshot from disk. A
//! snapshot lives in `<root>/<timestamp>/` and is usable only when the
//! download left exactly the expected number of files behind.
//!
//! Every filesystem failure here is logged and absorbed: a broken
//! blocklist directory must never take the tunnel down with it.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::task;
use tracing::{debug, warn};

/// Number of files in a complete local blocklist download
pub const DEFAULT_BLOCKLIST_FILE_COUNT: usize = 9;

/// Directory-backed blocklist store
#[derive(Debug, Clone)]
pub struct BlocklistStore {
    /// Directory holding one subdirectory per downloaded snapshot
    root: PathBuf,
    /// Files a complete snapshot contains
    expected_files: usize,
}

impl BlocklistStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>, expected_files: usize) -> Self {
        Self {
            root: root.into(),
            expected_files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn expected_files(&self) -> usize {
        self.expected_files
    }

    /// Directory a snapshot is downloaded into
    ///
    /// `None` when `timestamp` is not a plain directory name.
    pub fn download_dir(&self, timestamp: &str) -> Option<PathBuf> {
        if !is_valid_timestamp(timestamp) {
            warn!("Rejecting blocklist timestamp {:?}", timestamp);
            return None;
        }
        Some(self.root.join(timestamp))
    }

    /// Check whether the snapshot for `timestamp` is complete
    ///
    /// Blocking; async callers use [`Self::check_download`].
    pub fn is_download_complete(&self, timestamp: &str) -> bool {
        let Some(dir) = self.download_dir(timestamp) else {
            return false;
        };
        let total = match count_entries(&dir) {
            Ok(total) => total,
            Err(e) => {
                warn!("Local blocklist validation failed for {}: {}", dir.display(), e);
                return false;
            }
        };

        let complete = total == self.expected_files;
        debug!(
            "Local blocklist {} complete: {} ({} of {} files)",
            timestamp, complete, total, self.expected_files
        );
        complete
    }

    /// Completeness check run on the blocking pool
    pub async fn check_download(&self, timestamp: &str) -> bool {
        let store = self.clone();
        let timestamp = timestamp.to_string();
        match task::spawn_blocking(move || store.is_download_complete(&timestamp)).await {
            Ok(complete) => complete,
            Err(e) => {
                warn!("Local blocklist check did not finish: {}", e);
                false
            }
        }
    }

    /// Remove every snapshot under the root, including the root itself
    pub fn delete_old_files(&self) {
        debug!("Deleting old blocklist files in {}", self.root.display());
        delete_recursive(&self.root);
    }

    /// Remove a single snapshot
    pub fn delete_snapshot(&self, timestamp: &str) {
        if let Some(dir) = self.download_dir(timestamp) {
            delete_recursive(&dir);
        }
    }
}

/// Is `timestamp` a single plain path component?
///
/// Anything else (separators, `..`, absolute paths) would resolve
/// outside the store root.
pub fn is_valid_timestamp(timestamp: &str) -> bool {
    let mut components = Path::new(timestamp).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name == OsStr::new(timestamp),
        _ => false,
    }
}

/// Entries directly under `dir`; a missing or non-directory path counts as empty
fn count_entries(dir: &Path) -> io::Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        entry?;
        total += 1;
    }
    Ok(total)
}

/// Delete a file or directory tree, logging failures
pub fn delete_recursive(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        Ok(())
    };

    match result {
        Ok(()) => debug!("Deleted {}", path.display()),
        Err(e) => warn!("File delete failed for {}: {}", path.display(), e),
    }
}
