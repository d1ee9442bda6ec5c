//! Per-project serialization of lifecycle operations
//!
//! Inside one process an async mutex per project orders operations. When a
//! lock directory is configured, an exclusive `flock` on
//! `<lock_dir>/<project_id>.lock` extends that to every process sharing the
//! deployment base directory (a CLI invocation next to a long-running
//! service, say).

use crate::model::validate_project_id;
use dashmap::DashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Exclusive access to one project; released on drop
#[derive(Debug)]
pub struct ProjectGuard {
    // Closing the file releases the flock
    _file: Option<File>,
    _guard: OwnedMutexGuard<()>,
}

/// One async mutex per project id, optionally backed by a lock file
///
/// Operations on different projects never wait on each other; operations on
/// the same project run one at a time in arrival order.
#[derive(Debug, Default, Clone)]
pub struct ProjectLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    lock_dir: Option<PathBuf>,
}

impl ProjectLocks {
    /// Locks that only serialize within this process
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks that also hold `<dir>/<project_id>.lock` while taken
    pub fn with_lock_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            locks: Arc::default(),
            lock_dir: Some(dir.into()),
        }
    }

    /// Wait for exclusive access to `project_id`
    pub async fn acquire(&self, project_id: &str) -> io::Result<ProjectGuard> {
        if !validate_project_id(project_id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid project id: {:?}", project_id),
            ));
        }

        // Clone the Arc out so the map shard is not held across the await
        let lock = self
            .locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        let file = match &self.lock_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.lock", project_id));
                let file = tokio::task::spawn_blocking(move || lock_file(&path))
                    .await
                    .map_err(io::Error::other)??;
                debug!(project = project_id, "Acquired project lock file");
                Some(file)
            }
            None => None,
        };

        Ok(ProjectGuard {
            _file: file,
            _guard: guard,
        })
    }

    /// Whether an operation on `project_id` is in progress in this process
    pub fn is_locked(&self, project_id: &str) -> bool {
        self.locks
            .get(project_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop the lock entry of a deleted project if nobody holds or waits on it.
    ///
    /// The lock file stays: unlinking it could hand two processes different
    /// files for the same project.
    pub fn remove(&self, project_id: &str) {
        self.locks
            .remove_if(project_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Open `path` and block until this process holds an exclusive lock on it
fn lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        loop {
            // SAFETY: the fd stays open for the duration of the call
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if ret == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    Ok(file)
}
